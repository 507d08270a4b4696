//! # Error Types
//!
//! Crate-wide error taxonomy. Inner layers return `BotError` with enough
//! context to be logged once by the worker or command bus; the runner and
//! file loaders use `anyhow` at the outermost edge.

use solana_client::client_error::ClientError;
use thiserror::Error;

use crate::bus::command::CommandKind;

pub type BotResult<T> = Result<T, BotError>;

#[derive(Error, Debug)]
pub enum BotError {
    /// A command or task failed its preconditions
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Timeout, connection reset, rate limit
    #[error("transient rpc error: {0}")]
    TransientRpc(String),

    /// DEX-level refusal (slippage exceeded, insufficient liquidity, ...)
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    NotFound(String),

    #[error("monitoring session already exists for token {0}")]
    SessionExists(String),

    #[error("monitoring session already started")]
    AlreadyStarted,

    #[error("no handler registered for command {0}")]
    NoHandler(CommandKind),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command {kind} failed: {source}")]
    Command {
        kind: CommandKind,
        #[source]
        source: Box<BotError>,
    },
}

impl BotError {
    /// Errors that are worth retrying or reporting without giving up
    pub fn is_transient(&self) -> bool {
        match self {
            BotError::TransientRpc(_) | BotError::Timeout { .. } => true,
            BotError::Command { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Expected during shutdown, not worth an error log line
    pub fn is_cancelled(&self) -> bool {
        match self {
            BotError::Cancelled => true,
            BotError::Command { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        BotError::Timeout {
            operation: operation.into(),
            seconds: duration.as_secs(),
        }
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            return BotError::TransientRpc(err.to_string());
        }
        match err.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                BotError::TransientRpc(err.to_string())
            }
            _ => BotError::Protocol(err.to_string()),
        }
    }
}

impl From<ClientError> for BotError {
    fn from(err: ClientError) -> Self {
        use solana_client::client_error::ClientErrorKind;

        match err.kind() {
            ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => {
                BotError::TransientRpc(err.to_string())
            }
            _ => BotError::Protocol(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BotError::TransientRpc("reset".into()).is_transient());
        assert!(BotError::timeout("price lookup", std::time::Duration::from_secs(10)).is_transient());
        assert!(!BotError::Protocol("slippage".into()).is_transient());

        let wrapped = BotError::Command {
            kind: CommandKind::SellPosition,
            source: Box::new(BotError::TransientRpc("429".into())),
        };
        assert!(wrapped.is_transient());
    }

    #[test]
    fn test_command_error_message_keeps_source() {
        let err = BotError::Command {
            kind: CommandKind::SellPosition,
            source: Box::new(BotError::NotFound("monitoring session not found for token X".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("sell_position"));
        assert!(msg.contains("monitoring session not found for token X"));
    }
}
