//! # Monitoring Session
//!
//! One long-lived price poller per open position. The session owns two output
//! channels (throttled price updates and errors) and closes both when it
//! terminates, whether it was stopped or gave up on its own.
//!
//! ```text
//! Created --start--> Running --stop / fatal error--> Stopping --> Terminated
//!    \________________________stop__________________________________/
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dex::retry::with_deadline;
use crate::dex::{ui_amount, Dex, PnLResult, DEFAULT_TOKEN_DECIMALS};
use crate::error::{BotError, BotResult};
use crate::models::{PriorityFee, Task};
use crate::monitor::throttler::{PriceThrottler, ThrottleStats};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(1);
pub const PRICE_LOOKUP_BUDGET: Duration = Duration::from_secs(10);
const RESOLVE_ATTEMPTS: u32 = 10;
const RESOLVE_DELAY: Duration = Duration::from_millis(500);
const ERROR_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceUpdate {
    /// SOL per whole token
    pub current_price: f64,
    pub initial_price: f64,
    pub percent_change: f64,
    /// Holdings in whole tokens
    pub tokens: f64,
    pub pnl: Option<PnLResult>,
}

#[derive(Clone)]
pub struct SessionConfig {
    pub task: Arc<Task>,
    /// 0 means unknown, resolved on start
    pub initial_price: f64,
    /// Raw units, 0 means unknown, resolved on start
    pub token_balance: u64,
    pub dex: Arc<dyn Dex>,
    pub polling_interval: Duration,
    pub throttle_interval: Duration,
    pub slippage_percent: f64,
    pub priority_fee: PriorityFee,
    pub compute_units: u32,
    /// Consecutive failed price reads tolerated before the session gives up; 0 disables
    pub max_consecutive_failures: u32,
    pub update_buffer: usize,
}

impl SessionConfig {
    pub fn new(task: Arc<Task>, dex: Arc<dyn Dex>) -> Self {
        Self {
            slippage_percent: task.slippage_percent,
            priority_fee: task.priority_fee,
            compute_units: task.compute_units,
            task,
            initial_price: 0.0,
            token_balance: 0,
            dex,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            throttle_interval: DEFAULT_POLLING_INTERVAL / 2,
            max_consecutive_failures: 30,
            update_buffer: 1,
        }
    }

    pub fn with_initial_price(mut self, price: f64) -> Self {
        self.initial_price = price;
        self
    }

    pub fn with_token_balance(mut self, balance: u64) -> Self {
        self.token_balance = balance;
        self
    }

    /// Zero keeps the default interval
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.polling_interval = interval;
            self.throttle_interval = interval / 2;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Created,
    Running,
    Stopping,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Snapshot {
    initial_price: f64,
    token_balance: u64,
    last_price: Option<f64>,
    last_pnl: Option<PnLResult>,
    throttle: ThrottleStats,
}

type Senders = (mpsc::Sender<PriceUpdate>, mpsc::Sender<BotError>);

pub struct MonitoringSession {
    config: SessionConfig,
    state: Mutex<SessionState>,
    cancel: CancellationToken,
    done: CancellationToken,
    senders: Mutex<Option<Senders>>,
    price_rx: Mutex<Option<mpsc::Receiver<PriceUpdate>>>,
    error_rx: Mutex<Option<mpsc::Receiver<BotError>>>,
    snapshot: Mutex<Snapshot>,
}

impl MonitoringSession {
    /// The session stops on its own when `parent` is cancelled
    pub fn new(config: SessionConfig, parent: &CancellationToken) -> Arc<Self> {
        let (price_tx, price_rx) = mpsc::channel(config.update_buffer.max(1));
        let (error_tx, error_rx) = mpsc::channel(ERROR_BUFFER);
        let snapshot = Snapshot {
            initial_price: config.initial_price,
            token_balance: config.token_balance,
            ..Snapshot::default()
        };

        Arc::new(Self {
            config,
            state: Mutex::new(SessionState::Created),
            cancel: parent.child_token(),
            done: CancellationToken::new(),
            senders: Mutex::new(Some((price_tx, error_tx))),
            price_rx: Mutex::new(Some(price_rx)),
            error_rx: Mutex::new(Some(error_rx)),
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn mint(&self) -> &str {
        &self.config.task.token_mint
    }

    pub fn task(&self) -> &Arc<Task> {
        &self.config.task
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), SessionState::Created | SessionState::Running)
    }

    /// Receiver of throttled price updates; can be taken once
    pub fn take_price_updates(&self) -> Option<mpsc::Receiver<PriceUpdate>> {
        self.price_rx.lock().take()
    }

    /// Receiver of poll errors; can be taken once
    pub fn take_errors(&self) -> Option<mpsc::Receiver<BotError>> {
        self.error_rx.lock().take()
    }

    pub fn initial_price(&self) -> f64 {
        self.snapshot.lock().initial_price
    }

    pub fn token_balance(&self) -> u64 {
        self.snapshot.lock().token_balance
    }

    pub fn last_price(&self) -> Option<f64> {
        self.snapshot.lock().last_price
    }

    pub fn last_pnl(&self) -> Option<PnLResult> {
        self.snapshot.lock().last_pnl
    }

    pub fn throttle_stats(&self) -> ThrottleStats {
        self.snapshot.lock().throttle
    }

    pub fn start(self: &Arc<Self>) -> BotResult<()> {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Created {
                return Err(BotError::AlreadyStarted);
            }
            *state = SessionState::Running;
        }

        let (price_tx, error_tx) = self.senders.lock().take().ok_or(BotError::AlreadyStarted)?;
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let _done = session.done.clone().drop_guard();
            session.run(price_tx, error_tx).await;
        });

        info!("👀 monitoring session for {} started", self.mint());
        Ok(())
    }

    /// Cancel polling and wait until the session is terminated. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                SessionState::Terminated => return,
                SessionState::Created => {
                    *state = SessionState::Terminated;
                    self.senders.lock().take();
                    self.cancel.cancel();
                    self.done.cancel();
                    return;
                }
                SessionState::Running => *state = SessionState::Stopping,
                SessionState::Stopping => {}
            }
        }

        self.cancel.cancel();
        self.done.cancelled().await;
        *self.state.lock() = SessionState::Terminated;
        debug!("monitoring session for {} stopped", self.mint());
    }

    /// Resolves once the poll loop has exited
    pub async fn terminated(&self) {
        self.done.cancelled().await;
    }

    async fn run(self: Arc<Self>, price_tx: mpsc::Sender<PriceUpdate>, error_tx: mpsc::Sender<BotError>) {
        let throttler = PriceThrottler::new(price_tx, self.config.throttle_interval);

        match self.poll(&throttler, &error_tx).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => debug!("monitoring session for {} cancelled during startup", self.mint()),
            Err(e) => {
                warn!("monitoring session for {} ended: {}", self.mint(), e);
                if error_tx.try_send(e).is_err() {
                    debug!("error channel for {} full or closed", self.mint());
                }
            }
        }

        self.snapshot.lock().throttle = throttler.stats();
        *self.state.lock() = SessionState::Terminated;
        // closing the channels is what consumers observe as termination
        drop(throttler);
        drop(error_tx);
    }

    async fn poll(&self, throttler: &PriceThrottler<PriceUpdate>, error_tx: &mpsc::Sender<BotError>) -> BotResult<()> {
        let dex = &self.config.dex;
        let mint = self.mint().to_string();

        let balance = self.resolve_balance().await?;
        let decimals = match self.bounded("decimals lookup", dex.get_token_decimals(&mint)).await {
            Ok(decimals) => decimals,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(_) => DEFAULT_TOKEN_DECIMALS,
        };
        let tokens = ui_amount(balance, decimals);
        let initial_price = self.resolve_initial_price().await?;
        let investment = self.config.task.amount_sol;

        let mut ticker = tokio::time::interval(self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            throttler.flush_pending();

            let price = match self.bounded("price lookup", dex.get_token_price(&mint)).await {
                Err(e) if e.is_cancelled() => return Ok(()),
                Ok(price) => {
                    consecutive_failures = 0;
                    price
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let limit = self.config.max_consecutive_failures;
                    if limit > 0 && consecutive_failures >= limit {
                        return Err(BotError::Protocol(format!(
                            "price feed for {} failed {} times in a row: {}",
                            mint, consecutive_failures, e
                        )));
                    }
                    if error_tx.try_send(e).is_err() {
                        debug!("dropping price error for {}: consumer is behind", mint);
                    }
                    continue;
                }
            };

            let pnl = match self.bounded("pnl lookup", dex.calculate_pnl(&mint, tokens, investment)).await {
                Ok(pnl) => Some(pnl),
                Err(e) if e.is_cancelled() => return Ok(()),
                Err(e) => {
                    debug!("pnl for {} unavailable: {}", mint, e);
                    None
                }
            };

            // a stop that landed mid-lookup must not produce another update
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let percent_change = if initial_price > 0.0 {
                (price - initial_price) / initial_price * 100.0
            } else {
                0.0
            };

            {
                let mut snapshot = self.snapshot.lock();
                snapshot.last_price = Some(price);
                if pnl.is_some() {
                    snapshot.last_pnl = pnl;
                }
            }

            throttler.send(PriceUpdate {
                current_price: price,
                initial_price,
                percent_change,
                tokens,
                pnl,
            });
        }
    }

    /// Raw balance, polling the chain when the caller did not know it yet.
    /// An unknown balance is not fatal: sells always read the balance live.
    async fn resolve_balance(&self) -> BotResult<u64> {
        if self.config.token_balance > 0 {
            return Ok(self.config.token_balance);
        }

        for attempt in 1..=RESOLVE_ATTEMPTS {
            match self.bounded("balance lookup", self.config.dex.get_token_balance(self.mint())).await {
                Ok(balance) if balance > 0 => {
                    self.snapshot.lock().token_balance = balance;
                    return Ok(balance);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Ok(_) => debug!("balance for {} still zero (attempt {})", self.mint(), attempt),
                Err(e) => debug!("balance for {} unavailable (attempt {}): {}", self.mint(), attempt, e),
            }
            self.pause(RESOLVE_DELAY).await?;
        }

        warn!("balance for {} unknown, monitoring with zero holdings", self.mint());
        Ok(0)
    }

    async fn resolve_initial_price(&self) -> BotResult<f64> {
        if self.config.initial_price > 0.0 {
            return Ok(self.config.initial_price);
        }

        let mut last_error = None;
        for _ in 0..RESOLVE_ATTEMPTS {
            match self.bounded("price lookup", self.config.dex.get_token_price(self.mint())).await {
                Ok(price) if price > 0.0 => {
                    self.snapshot.lock().initial_price = price;
                    return Ok(price);
                }
                Ok(price) => last_error = Some(format!("non-positive price {}", price)),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => last_error = Some(e.to_string()),
            }
            self.pause(RESOLVE_DELAY).await?;
        }

        Err(BotError::Protocol(format!(
            "could not resolve initial price for {}: {}",
            self.mint(),
            last_error.unwrap_or_default()
        )))
    }

    /// A chain read under the lookup budget that gives way to `stop`
    async fn bounded<T>(&self, operation: &str, read: impl Future<Output = BotResult<T>>) -> BotResult<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BotError::Cancelled),
            result = with_deadline(operation, PRICE_LOOKUP_BUDGET, read) => result,
        }
    }

    async fn pause(&self, delay: Duration) -> BotResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(BotError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl fmt::Debug for MonitoringSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringSession")
            .field("mint", &self.mint())
            .field("state", &self.state())
            .finish()
    }
}
