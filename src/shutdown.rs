//! # Shutdown Coordinator
//!
//! Owns the root cancellation token. Shutdown starts on Ctrl+C, SIGTERM or a
//! programmatic [`ShutdownCoordinator::initiate_shutdown`], after which every
//! registered service is closed, last registered first, under a per-service
//! deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::BotResult;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Closer: Send + Sync {
    async fn close(&self) -> BotResult<()>;
}

/// Outcome of closing every registered service
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ShutdownReport {
    pub reason: String,
    pub closed: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub timed_out: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty()
    }
}

enum CloseOutcome {
    Closed,
    Failed(String),
    TimedOut,
}

pub struct ShutdownCoordinator {
    services: Mutex<Vec<(String, Arc<dyn Closer>)>>,
    timeout: Duration,
    token: CancellationToken,
    initiated: AtomicBool,
    closing: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            timeout,
            token: CancellationToken::new(),
            initiated: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    /// Root token every long-lived activity derives from
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn register(&self, name: impl Into<String>, closer: Arc<dyn Closer>) {
        let name = name.into();
        info!("registered {} for shutdown", name);
        self.services.lock().push((name, closer));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Start shutdown once; later calls are no-ops. Returns whether this
    /// call was the one that started it.
    pub fn initiate_shutdown(&self, reason: &str) -> bool {
        if self.initiated.swap(true, Ordering::SeqCst) {
            return false;
        }
        info!("🛑 shutdown initiated: {}", reason);
        *self.reason.lock() = Some(reason.to_string());
        self.token.cancel();
        true
    }

    /// Wait for a signal or a programmatic trigger, then close everything
    pub async fn handle_shutdown(&self) -> ShutdownReport {
        tokio::select! {
            reason = wait_for_signal() => {
                self.initiate_shutdown(reason);
            }
            _ = self.token.cancelled() => {}
        }
        self.close_all().await
    }

    /// Close registered services in reverse registration order, concurrently.
    /// Only the first call does any work.
    pub async fn close_all(&self) -> ShutdownReport {
        let mut report = ShutdownReport {
            reason: self.reason.lock().clone().unwrap_or_else(|| "unknown".to_string()),
            ..ShutdownReport::default()
        };
        if self.closing.swap(true, Ordering::SeqCst) {
            return report;
        }

        let services: Vec<(String, Arc<dyn Closer>)> = self.services.lock().iter().rev().cloned().collect();
        info!("closing {} service(s)", services.len());

        let budget = self.timeout;
        let outcomes = join_all(services.into_iter().map(|(name, closer)| async move {
            let outcome = match tokio::time::timeout(budget, closer.close()).await {
                Ok(Ok(())) => CloseOutcome::Closed,
                Ok(Err(e)) => CloseOutcome::Failed(e.to_string()),
                Err(_) => CloseOutcome::TimedOut,
            };
            (name, outcome)
        }))
        .await;

        for (name, outcome) in outcomes {
            match outcome {
                CloseOutcome::Closed => {
                    info!("✅ {} closed", name);
                    report.closed.push(name);
                }
                CloseOutcome::Failed(e) => {
                    error!("❌ {} failed to close: {}", name, e);
                    report.failed.push((name, e));
                }
                CloseOutcome::TimedOut => {
                    warn!("⏰ {} did not close within {:?}", name, budget);
                    report.timed_out.push(name);
                }
            }
        }

        info!("shutdown complete ({} closed, {} failed, {} timed out)",
              report.closed.len(), report.failed.len(), report.timed_out.len());
        report
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => tokio::select! {
                _ = interrupt() => "interrupt signal",
                _ = terminate.recv() => "terminate signal",
            },
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                interrupt().await;
                "interrupt signal"
            }
        }
    }

    #[cfg(not(unix))]
    {
        interrupt().await;
        "interrupt signal"
    }
}
