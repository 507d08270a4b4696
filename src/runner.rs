//! # Runner
//!
//! Top-level lifecycle: load configuration, wallets and tasks, wire the
//! services together, push every task through the worker pool and shut down
//! cleanly once the queue is drained or a signal arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{CommandBus, EventBus, LoggingSubscriber};
use crate::config::Config;
use crate::dex::jupiter::JupiterDexFactory;
use crate::dex::retry::RetryConfig;
use crate::dex::DexFactory;
use crate::history::{TradeHistory, TradeStatistics, DEFAULT_FLUSH_INTERVAL};
use crate::loader;
use crate::models::{TaskStore, WalletStore};
use crate::monitor::ui::InputLine;
use crate::monitor::{MonitorService, PriceRenderer};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::trading_service::TradingService;
use crate::worker_pool::{PoolReport, WorkerPool};

pub const CONFIG_DIR: &str = "configs";
pub const LOGS_DIR: &str = "logs";

/// What a finished run did
#[derive(Debug)]
pub struct RunSummary {
    pub pool: PoolReport,
    pub shutdown: ShutdownReport,
    pub statistics: TradeStatistics,
}

/// Everything a run needs, wired and ready
pub struct Services {
    pub coordinator: Arc<ShutdownCoordinator>,
    pub event_bus: Arc<EventBus>,
    pub commands: CommandBus,
    pub monitor: Arc<MonitorService>,
    pub history: Arc<TradeHistory>,
    pub pool: Arc<WorkerPool>,
}

pub struct Runner {
    config: Arc<Config>,
    wallets: Arc<WalletStore>,
    tasks: Arc<TaskStore>,
    logs_dir: PathBuf,
    renderer: Option<Arc<dyn PriceRenderer>>,
    input: Option<broadcast::Sender<InputLine>>,
}

impl Runner {
    pub fn new(config: Config, wallets: WalletStore, tasks: TaskStore, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            config: Arc::new(config),
            wallets: Arc::new(wallets),
            tasks: Arc::new(tasks),
            logs_dir: logs_dir.into(),
            renderer: None,
            input: None,
        }
    }

    /// Load wallets and tasks from `config_dir` to run under `config`
    pub fn load(config: Config, config_dir: &Path, logs_dir: impl Into<PathBuf>) -> Result<Self> {
        let wallets = loader::load_wallets(config_dir).context("failed to load wallets")?;
        let tasks = loader::load_tasks(config_dir).context("failed to load tasks")?;

        for task in tasks.all() {
            if wallets.get(&task.wallet).is_none() {
                warn!("⚠️ Task '{}' references unknown wallet '{}'", task.name, task.wallet);
            }
        }
        Ok(Self::new(config, wallets, tasks, logs_dir))
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PriceRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_input(mut self, input: broadcast::Sender<InputLine>) -> Self {
        self.input = Some(input);
        self
    }

    /// Run every task against Jupiter-routed adapters
    pub async fn run(self) -> Result<RunSummary> {
        let retry = RetryConfig::with_attempts(self.config.retries).with_initial_delay(self.config.rpc_delay());
        let factory = JupiterDexFactory::new(self.config.primary_rpc(), retry)
            .context("failed to create DEX factory")?;
        let services = self.assemble(Arc::new(factory))?;
        self.drive(services).await
    }

    pub fn assemble(&self, factory: Arc<dyn DexFactory>) -> Result<Services> {
        let config = &self.config;
        let coordinator = Arc::new(ShutdownCoordinator::new(DEFAULT_SHUTDOWN_TIMEOUT));
        let root = coordinator.token();

        let event_bus = Arc::new(EventBus::new());
        event_bus.subscribe(Arc::new(LoggingSubscriber));

        let history = Arc::new(
            TradeHistory::new(&self.logs_dir)
                .with_context(|| format!("failed to open trade history in {}", self.logs_dir.display()))?,
        );
        let monitor = Arc::new(MonitorService::new(Arc::clone(&event_bus), root));

        let trading = Arc::new(
            TradingService::new(
                Arc::clone(&event_bus),
                Arc::clone(&monitor),
                Arc::clone(&factory),
                Arc::clone(&self.wallets),
                Arc::clone(&self.tasks),
                Arc::clone(&history),
            )
            .with_polling_interval(config.price_delay()),
        );
        let commands = CommandBus::new();
        trading.register_handlers(&commands);

        let mut pool = WorkerPool::new(
            config.workers,
            factory,
            Arc::clone(&self.wallets),
            Arc::clone(&history),
            Arc::clone(&monitor),
            Arc::clone(&event_bus),
        )
        .with_polling_interval(config.price_delay())
        .with_balance_poll(config.monitor_delay());
        if let Some(renderer) = &self.renderer {
            pool = pool.with_renderer(Arc::clone(renderer));
        }
        if let Some(input) = &self.input {
            pool = pool.with_input(input.clone());
        }

        // the pool's close drains in-flight work, then closes the trade history
        let pool = Arc::new(pool);
        coordinator.register("worker_pool", pool.clone());
        coordinator.register("monitor_service", monitor.clone());

        Ok(Services {
            coordinator,
            event_bus,
            commands,
            monitor,
            history,
            pool,
        })
    }

    /// Feed the task queue and wait for the pool, then shut everything down
    pub async fn drive(&self, services: Services) -> Result<RunSummary> {
        let started = Instant::now();
        let root = services.coordinator.token();
        info!(
            "🏁 Starting {} task(s) on {} worker(s) via {}",
            self.tasks.len(),
            self.config.workers,
            self.config.primary_rpc()
        );

        let flusher = services.history.spawn_flusher(root.child_token(), DEFAULT_FLUSH_INTERVAL);
        let shutdown: JoinHandle<ShutdownReport> = {
            let coordinator = Arc::clone(&services.coordinator);
            tokio::spawn(async move { coordinator.handle_shutdown().await })
        };

        let (tx, rx) = mpsc::channel(self.tasks.len().max(1));
        for task in self.tasks.all() {
            tx.send(task).await.context("task queue closed early")?;
        }
        drop(tx);

        let pool = services.pool.run(rx, root).await;
        info!(
            "📊 Tasks done: {} completed, {} failed, {} skipped",
            pool.completed, pool.failed, pool.skipped
        );
        if self.config.tps_logging {
            let secs = started.elapsed().as_secs_f64().max(f64::EPSILON);
            info!("⏱️ {} task(s) in {:.1}s ({:.2} tasks/s)", pool.processed(), secs, pool.processed() as f64 / secs);
        }

        services.coordinator.initiate_shutdown("all tasks processed");
        let shutdown = shutdown.await.context("shutdown task panicked")?;
        if flusher.await.is_err() {
            warn!("history flusher ended abnormally");
        }

        let statistics = services.history.get_statistics();
        info!(
            "💰 {} trade(s), {:.1}% success, total PnL {} SOL",
            statistics.total_trades, statistics.success_rate, statistics.total_pnl
        );
        Ok(RunSummary { pool, shutdown, statistics })
    }
}
