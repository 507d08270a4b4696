//! # Command Bus
//!
//! Single entry point for trading actions. Every command is validated before
//! it reaches its handler, and each command kind has exactly one handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{BotError, BotResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    ExecuteTask,
    SellPosition,
    RefreshData,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::ExecuteTask => "execute_task",
            CommandKind::SellPosition => "sell_position",
            CommandKind::RefreshData => "refresh_data",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Command {
    ExecuteTask {
        task_id: u64,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    SellPosition {
        token_mint: String,
        /// Share of the current balance, in (0, 100]
        percentage: f64,
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    RefreshData {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl Command {
    pub fn execute_task(task_id: u64, user_id: impl Into<String>) -> Self {
        Command::ExecuteTask { task_id, user_id: user_id.into(), timestamp: Utc::now() }
    }

    pub fn sell_position(token_mint: impl Into<String>, percentage: f64, user_id: impl Into<String>) -> Self {
        Command::SellPosition {
            token_mint: token_mint.into(),
            percentage,
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn refresh_data(user_id: impl Into<String>) -> Self {
        Command::RefreshData { user_id: user_id.into(), timestamp: Utc::now() }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::ExecuteTask { .. } => CommandKind::ExecuteTask,
            Command::SellPosition { .. } => CommandKind::SellPosition,
            Command::RefreshData { .. } => CommandKind::RefreshData,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Command::ExecuteTask { user_id, .. }
            | Command::SellPosition { user_id, .. }
            | Command::RefreshData { user_id, .. } => user_id,
        }
    }

    /// Preconditions checked before any handler runs:
    /// - `ExecuteTask`: task id is positive
    /// - `SellPosition`: mint is non-empty, percentage in (0, 100]
    /// - all commands: user id is non-empty
    pub fn validate(&self) -> BotResult<()> {
        if self.user_id().trim().is_empty() {
            return Err(BotError::Validation(format!("{}: user id is required", self.kind())));
        }

        match self {
            Command::ExecuteTask { task_id, .. } => {
                if *task_id == 0 {
                    return Err(BotError::Validation("execute_task: task id must be positive".to_string()));
                }
            }
            Command::SellPosition { token_mint, percentage, .. } => {
                if token_mint.trim().is_empty() {
                    return Err(BotError::Validation("sell_position: token mint is required".to_string()));
                }
                if !(*percentage > 0.0 && *percentage <= 100.0) {
                    return Err(BotError::Validation(format!(
                        "sell_position: percentage {} outside (0, 100]",
                        percentage
                    )));
                }
            }
            Command::RefreshData { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: &Command) -> BotResult<()>;
}

#[derive(Default)]
pub struct CommandBus {
    handlers: RwLock<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last registration for a kind wins
    pub fn register(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) {
        let replaced = self.handlers.write().insert(kind, handler).is_some();
        if replaced {
            debug!("replaced handler for {}", kind);
        } else {
            debug!("registered handler for {}", kind);
        }
    }

    pub fn has_handler(&self, kind: CommandKind) -> bool {
        self.handlers.read().contains_key(&kind)
    }

    /// Validate, route and run a command on the caller's task
    pub async fn send(&self, command: Command) -> BotResult<()> {
        let kind = command.kind();

        if let Err(e) = command.validate() {
            warn!("❌ rejected {} from {}: {}", kind, command.user_id(), e);
            return Err(e);
        }

        // clone out of the lock so the handler never runs under it
        let handler = self.handlers.read().get(&kind).cloned();
        let Some(handler) = handler else {
            warn!("❌ rejected {}: no handler registered", kind);
            return Err(BotError::NoHandler(kind));
        };

        info!("📨 accepted {} from {}", kind, command.user_id());
        handler.handle(&command).await.map_err(|e| BotError::Command {
            kind,
            source: Box::new(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self { calls: AtomicU32::new(0), fail })
        }
    }

    #[async_trait]
    impl CommandHandler for CountingHandler {
        async fn handle(&self, _command: &Command) -> BotResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BotError::Protocol("slippage exceeded".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_validation_rules() {
        assert!(Command::execute_task(0, "u1").validate().is_err());
        assert!(Command::execute_task(1, "").validate().is_err());
        assert!(Command::execute_task(1, "u1").validate().is_ok());

        assert!(Command::sell_position("M", 0.0, "u1").validate().is_err());
        assert!(Command::sell_position("M", 100.5, "u1").validate().is_err());
        assert!(Command::sell_position("M", f64::NAN, "u1").validate().is_err());
        assert!(Command::sell_position("", 50.0, "u1").validate().is_err());
        assert!(Command::sell_position("M", 100.0, "u1").validate().is_ok());

        assert!(Command::refresh_data("u1").validate().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_command_never_reaches_handler() {
        let bus = CommandBus::new();
        let handler = CountingHandler::new(false);
        bus.register(CommandKind::ExecuteTask, handler.clone());

        let result = bus.send(Command::execute_task(0, "u1")).await;
        assert!(matches!(result, Err(BotError::Validation(_))));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let bus = CommandBus::new();
        let result = bus.send(Command::refresh_data("u1")).await;
        assert!(matches!(result, Err(BotError::NoHandler(CommandKind::RefreshData))));
    }

    #[tokio::test]
    async fn test_repeated_registration_is_single_dispatch() {
        let bus = CommandBus::new();
        let handler = CountingHandler::new(false);
        bus.register(CommandKind::RefreshData, handler.clone());
        bus.register(CommandKind::RefreshData, handler.clone());

        bus.send(Command::refresh_data("u1")).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let bus = CommandBus::new();
        let first = CountingHandler::new(false);
        let second = CountingHandler::new(false);
        bus.register(CommandKind::RefreshData, first.clone());
        bus.register(CommandKind::RefreshData, second.clone());

        bus.send(Command::refresh_data("u1")).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_error_wrapped_with_kind() {
        let bus = CommandBus::new();
        bus.register(CommandKind::SellPosition, CountingHandler::new(true));

        let err = bus.send(Command::sell_position("M", 50.0, "u1")).await.unwrap_err();
        match err {
            BotError::Command { kind, source } => {
                assert_eq!(kind, CommandKind::SellPosition);
                assert!(matches!(*source, BotError::Protocol(_)));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
