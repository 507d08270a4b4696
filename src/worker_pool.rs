//! # Worker Pool
//!
//! N workers pull tasks from one bounded queue. Each task gets its own DEX
//! adapter; buys are followed by a monitor worker that lives until the
//! operator sells or leaves, sells are executed directly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Event, EventBus, EventPayload};
use crate::dex::retry::with_deadline;
use crate::dex::{ui_amount, Dex, DexFactory, DEFAULT_TOKEN_DECIMALS};
use crate::error::{BotError, BotResult};
use crate::history::TradeHistory;
use crate::models::{Task, Trade, TradeAction, Wallet, WalletStore};
use crate::monitor::service::SYSTEM_USER;
use crate::monitor::session::{SessionConfig, DEFAULT_POLLING_INTERVAL, PRICE_LOOKUP_BUDGET};
use crate::monitor::ui::InputLine;
use crate::monitor::{ConsoleRenderer, MonitorService, MonitorWorker, PriceRenderer, SellFn, WorkerOutcome};
use crate::shutdown::Closer;

pub const EXECUTE_BUDGET: Duration = Duration::from_secs(60);
pub const BALANCE_WAIT_BUDGET: Duration = Duration::from_secs(5);
const BALANCE_POLL_ATTEMPTS: u32 = 10;
const BALANCE_POLL_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Skipped,
}

/// Tally of what the pool did with the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PoolReport {
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.skipped
    }

    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Completed => self.completed += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: PoolReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

pub struct WorkerPool {
    workers: usize,
    factory: Arc<dyn DexFactory>,
    wallets: Arc<WalletStore>,
    history: Arc<TradeHistory>,
    monitor_service: Arc<MonitorService>,
    event_bus: Arc<EventBus>,
    polling_interval: Duration,
    balance_poll: Duration,
    renderer: Option<Arc<dyn PriceRenderer>>,
    input: Option<broadcast::Sender<InputLine>>,
    /// Number of `run` calls still in progress
    running: watch::Sender<usize>,
}

/// Marks one `run` as finished, even when it unwinds
struct RunGuard<'a>(&'a watch::Sender<usize>);

impl<'a> RunGuard<'a> {
    fn enter(running: &'a watch::Sender<usize>) -> Self {
        running.send_modify(|n| *n += 1);
        Self(running)
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl WorkerPool {
    pub fn new(
        workers: usize,
        factory: Arc<dyn DexFactory>,
        wallets: Arc<WalletStore>,
        history: Arc<TradeHistory>,
        monitor_service: Arc<MonitorService>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            factory,
            wallets,
            history,
            monitor_service,
            event_bus,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            balance_poll: BALANCE_POLL_DELAY,
            renderer: None,
            input: None,
            running: watch::Sender::new(0),
        }
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.polling_interval = interval;
        }
        self
    }

    /// Pause between balance reads while a fresh buy settles
    pub fn with_balance_poll(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.balance_poll = interval;
        }
        self
    }

    /// Render every position with `renderer` instead of the console
    pub fn with_renderer(mut self, renderer: Arc<dyn PriceRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Feed operator input from `input` instead of stdin
    pub fn with_input(mut self, input: broadcast::Sender<InputLine>) -> Self {
        self.input = Some(input);
        self
    }

    /// Process tasks until the queue is drained and closed, or `cancel` fires
    pub async fn run(self: &Arc<Self>, tasks: mpsc::Receiver<Arc<Task>>, cancel: CancellationToken) -> PoolReport {
        let _running = RunGuard::enter(&self.running);
        let queue = Arc::new(Mutex::new(tasks));
        let mut workers = JoinSet::new();

        info!("👷 starting {} worker(s)", self.workers);
        for id in 0..self.workers {
            let pool = Arc::clone(self);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            workers.spawn(async move { pool.worker_loop(id, queue, cancel).await });
        }

        let mut report = PoolReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => error!("worker aborted: {}", e),
            }
        }

        info!("👷 workers finished: {} completed, {} failed, {} skipped",
              report.completed, report.failed, report.skipped);
        report
    }

    async fn worker_loop(
        &self,
        id: usize,
        queue: Arc<Mutex<mpsc::Receiver<Arc<Task>>>>,
        cancel: CancellationToken,
    ) -> PoolReport {
        let mut report = PoolReport::default();
        loop {
            let next = {
                let mut queue = queue.lock().await;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    task = queue.recv() => task,
                }
            };
            let Some(task) = next else { break };

            debug!("worker {} picked task {}", id, task.id);
            let outcome = self.process_task(task, &cancel).await;
            report.record(outcome);
        }
        debug!("worker {} exiting", id);
        report
    }

    async fn process_task(&self, task: Arc<Task>, cancel: &CancellationToken) -> TaskOutcome {
        let Some(wallet) = self.wallets.get(&task.wallet) else {
            warn!("⚠️ task {} skipped: wallet '{}' not found", task.id, task.wallet);
            return TaskOutcome::Skipped;
        };

        let dex = match self.factory.create(task.module, Arc::clone(&wallet)) {
            Ok(dex) => dex,
            Err(e) => {
                warn!("⚠️ task {} skipped: cannot create {} adapter: {}", task.id, task.module, e);
                return TaskOutcome::Skipped;
            }
        };

        if task.operation.is_buy() {
            self.run_buy(task, wallet, dex, cancel).await
        } else {
            self.run_sell(task, wallet, dex).await
        }
    }

    fn record(&self, trade: Trade) {
        if let Err(e) = self.history.log_trade(trade) {
            warn!("failed to record trade: {}", e);
        }
    }

    fn publish_executed(&self, task: &Task, result: &BotResult<String>) {
        self.event_bus.publish(Event::new(SYSTEM_USER, EventPayload::TaskExecuted {
            task_id: task.id,
            token_mint: task.token_mint.clone(),
            operation: task.operation,
            success: result.is_ok(),
            tx_signature: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        }));
    }

    async fn run_buy(&self, task: Arc<Task>, wallet: Arc<Wallet>, dex: Arc<dyn Dex>, cancel: &CancellationToken) -> TaskOutcome {
        let mint = task.token_mint.clone();
        let owner = wallet.pubkey().to_string();
        info!("🚀 task {} '{}': {} {} SOL of {} via {}",
              task.id, task.name, task.operation, task.amount_sol, mint, dex.name());

        let result = with_deadline("execute", EXECUTE_BUDGET, dex.execute(&task)).await;
        self.publish_executed(&task, &result);

        if let Err(e) = &result {
            error!("❌ task {} failed: {}", task.id, e);
            self.record(
                Trade::new(TradeAction::Buy, task.id, &owner, &mint, dex.name())
                    .with_amounts(task.amount_sol, 0.0, 0.0)
                    .with_result(&result),
            );
            return TaskOutcome::Failed;
        }

        let balance = wait_for_balance(dex.as_ref(), &mint, self.balance_poll, cancel).await;
        let entry_price = with_deadline("price lookup", PRICE_LOOKUP_BUDGET, dex.get_token_price(&mint))
            .await
            .unwrap_or(0.0);
        let decimals = with_deadline("decimals lookup", PRICE_LOOKUP_BUDGET, dex.get_token_decimals(&mint))
            .await
            .unwrap_or(DEFAULT_TOKEN_DECIMALS);
        let tokens = ui_amount(balance, decimals);

        self.record(
            Trade::new(TradeAction::Buy, task.id, &owner, &mint, dex.name())
                .with_amounts(task.amount_sol, tokens, entry_price)
                .with_result(&result),
        );

        if balance == 0 {
            warn!("⚠️ task {}: no {} balance after buy, not monitoring", task.id, mint);
            return TaskOutcome::Completed;
        }

        self.event_bus.publish(Event::new(SYSTEM_USER, EventPayload::PositionCreated {
            task_id: task.id,
            token_mint: mint.clone(),
            wallet: task.wallet.clone(),
            amount_sol: task.amount_sol,
            token_amount: balance,
            entry_price,
        }));

        if cancel.is_cancelled() {
            return TaskOutcome::Completed;
        }

        let sell = self.sell_fn(Arc::clone(&task), owner, Arc::clone(&dex), entry_price, tokens);
        let config = SessionConfig::new(Arc::clone(&task), dex)
            .with_initial_price(entry_price)
            .with_token_balance(balance)
            .with_polling_interval(self.polling_interval);
        let renderer = match &self.renderer {
            Some(renderer) => Arc::clone(renderer),
            None => Arc::new(ConsoleRenderer::new(task.autosell_percent)),
        };

        let mut worker = MonitorWorker::new(config, sell, Arc::clone(&self.monitor_service), renderer, SYSTEM_USER);
        if let Some(input) = &self.input {
            worker = worker.with_input(input.subscribe());
        }

        match worker.run(cancel).await {
            Ok(WorkerOutcome::Sold(signature)) => {
                info!("💰 task {} sold: {}", task.id, signature);
                TaskOutcome::Completed
            }
            Ok(outcome) => {
                info!("task {} finished without selling ({:?})", task.id, outcome);
                TaskOutcome::Completed
            }
            Err(e) => {
                error!("❌ monitoring for task {} failed: {}", task.id, e);
                TaskOutcome::Failed
            }
        }
    }

    /// Sell closure handed to the monitor worker. It records the trade and
    /// publishes `SellCompleted` whatever the outcome.
    fn sell_fn(&self, task: Arc<Task>, owner: String, dex: Arc<dyn Dex>, entry_price: f64, tokens: f64) -> SellFn {
        let history = Arc::clone(&self.history);
        let event_bus = Arc::clone(&self.event_bus);
        let opened_at = Utc::now();

        Arc::new(move |percent: f64| {
            let task = Arc::clone(&task);
            let dex = Arc::clone(&dex);
            let history = Arc::clone(&history);
            let event_bus = Arc::clone(&event_bus);
            let owner = owner.clone();

            async move {
                let mint = task.token_mint.as_str();
                let result = dex
                    .sell_percent_tokens(mint, percent, task.slippage_percent, task.priority_fee, task.compute_units)
                    .await;

                let share = percent / 100.0;
                let pnl = dex.calculate_pnl(mint, tokens * share, task.amount_sol * share).await.ok();
                let exit_price = if tokens > 0.0 {
                    pnl.map(|p| p.theoretical_value / (tokens * share)).unwrap_or(0.0)
                } else {
                    0.0
                };

                let mut trade = Trade::new(TradeAction::Sell, task.id, &owner, mint, dex.name())
                    .with_amounts(pnl.map(|p| p.sell_estimate).unwrap_or(0.0), tokens * share, exit_price)
                    .with_hold_time(opened_at)
                    .with_result(&result);
                if let Some(pnl) = pnl {
                    trade = trade.with_exit(entry_price, exit_price, pnl.net_pnl, pnl.pnl_percent);
                }
                if let Err(e) = history.log_trade(trade) {
                    warn!("failed to record sell: {}", e);
                }

                event_bus.publish(Event::new(SYSTEM_USER, EventPayload::SellCompleted {
                    token_mint: mint.to_string(),
                    percentage: percent,
                    success: result.is_ok(),
                    tx_signature: result.as_ref().ok().cloned(),
                    error: result.as_ref().err().map(|e| e.to_string()),
                    pnl,
                }));
                result
            }
            .boxed()
        })
    }

    async fn run_sell(&self, task: Arc<Task>, wallet: Arc<Wallet>, dex: Arc<dyn Dex>) -> TaskOutcome {
        let mint = task.token_mint.clone();
        info!("🔻 task {} '{}': selling {}% of {} via {}",
              task.id, task.name, task.autosell_percent, mint, dex.name());

        let result = with_deadline("execute", EXECUTE_BUDGET, dex.execute(&task)).await;
        let price = match &result {
            Ok(_) => with_deadline("price lookup", PRICE_LOOKUP_BUDGET, dex.get_token_price(&mint))
                .await
                .unwrap_or(0.0),
            Err(_) => 0.0,
        };

        self.record(
            Trade::new(TradeAction::Sell, task.id, &wallet.pubkey().to_string(), &mint, dex.name())
                .with_amounts(0.0, 0.0, price)
                .with_result(&result),
        );
        self.publish_executed(&task, &result);

        match result {
            Ok(signature) => {
                info!("✅ task {} sold: {}", task.id, signature);
                TaskOutcome::Completed
            }
            Err(e) => {
                error!("❌ task {} failed: {}", task.id, e);
                TaskOutcome::Failed
            }
        }
    }

    /// Wait for every `run` to finish, then close the trade history. Runs
    /// stop taking tasks once their token is cancelled, but a sell already
    /// in flight still completes and records its trade first.
    pub async fn close(&self) -> BotResult<()> {
        let mut running = self.running.subscribe();
        let active = *running.borrow();
        if active > 0 {
            info!("⏳ waiting for {} pool run(s) to drain", active);
        }
        running
            .wait_for(|n| *n == 0)
            .await
            .map_err(|_| BotError::Internal("worker pool state dropped".to_string()))?;
        self.history.close()
    }
}

/// Poll the balance after a buy until it turns positive, within the budget
async fn wait_for_balance(dex: &dyn Dex, mint: &str, delay: Duration, cancel: &CancellationToken) -> u64 {
    let poll = async {
        for attempt in 1..=BALANCE_POLL_ATTEMPTS {
            match dex.get_token_balance(mint).await {
                Ok(balance) if balance > 0 => return balance,
                Ok(_) => debug!("{} balance still zero (attempt {})", mint, attempt),
                Err(e) => debug!("{} balance read failed (attempt {}): {}", mint, attempt, e),
            }
            tokio::time::sleep(delay).await;
        }
        0
    };

    tokio::select! {
        _ = cancel.cancelled() => 0,
        polled = tokio::time::timeout(BALANCE_WAIT_BUDGET, poll) => polled.unwrap_or(0),
    }
}

#[async_trait]
impl Closer for WorkerPool {
    async fn close(&self) -> BotResult<()> {
        WorkerPool::close(self).await
    }
}
