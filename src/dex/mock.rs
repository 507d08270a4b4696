//! Scripted in-memory DEX used by the pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::dex::{Dex, DexFactory, PnLResult, PricingModel};
use crate::error::{BotError, BotResult};
use crate::models::{DexModule, PriorityFee, Task, Wallet};

pub struct MockDex {
    /// `None` entries fail with a transient error; the last entry repeats
    prices: Mutex<VecDeque<Option<f64>>>,
    balance: AtomicU64,
    balance_script: Mutex<VecDeque<u64>>,
    fail_execute: AtomicBool,
    fail_sell: AtomicBool,
    hang_reads: AtomicBool,
    sell_delay: Mutex<Duration>,
    pub execute_calls: AtomicU32,
    pub price_calls: AtomicU32,
    pub sell_calls: AtomicU32,
    pub sells_completed: AtomicU32,
    last_sell_percent: Mutex<Option<f64>>,
    last_quoted: Mutex<Option<f64>>,
}

impl MockDex {
    pub fn new(price: f64, balance: u64) -> Self {
        Self {
            prices: Mutex::new(VecDeque::from([Some(price)])),
            balance: AtomicU64::new(balance),
            balance_script: Mutex::new(VecDeque::new()),
            fail_execute: AtomicBool::new(false),
            fail_sell: AtomicBool::new(false),
            hang_reads: AtomicBool::new(false),
            sell_delay: Mutex::new(Duration::ZERO),
            execute_calls: AtomicU32::new(0),
            price_calls: AtomicU32::new(0),
            sell_calls: AtomicU32::new(0),
            sells_completed: AtomicU32::new(0),
            last_sell_percent: Mutex::new(None),
            last_quoted: Mutex::new(None),
        }
    }

    pub fn with_prices(self, prices: Vec<Option<f64>>) -> Self {
        *self.prices.lock() = prices.into();
        self
    }

    /// Balances returned by successive reads before falling back to the fixed one
    pub fn with_balance_script(self, balances: Vec<u64>) -> Self {
        *self.balance_script.lock() = balances.into();
        self
    }

    pub fn failing_execute(self) -> Self {
        self.fail_execute.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_sell(self) -> Self {
        self.fail_sell.store(true, Ordering::SeqCst);
        self
    }

    /// Balance and PnL reads never resolve
    pub fn with_hanging_reads(self) -> Self {
        self.hang_reads.store(true, Ordering::SeqCst);
        self
    }

    async fn maybe_hang(&self) {
        if self.hang_reads.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn with_sell_delay(self, delay: Duration) -> Self {
        *self.sell_delay.lock() = delay;
        self
    }

    pub fn last_sell_percent(&self) -> Option<f64> {
        *self.last_sell_percent.lock()
    }

    fn next_price(&self) -> Option<f64> {
        let mut prices = self.prices.lock();
        if prices.len() > 1 {
            prices.pop_front().flatten()
        } else {
            prices.front().copied().flatten()
        }
    }
}

#[async_trait]
impl Dex for MockDex {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, task: &Task) -> BotResult<String> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(BotError::Protocol("slippage tolerance exceeded".to_string()));
        }
        Ok(format!("sig-execute-{}", task.id))
    }

    async fn get_token_price(&self, mint: &str) -> BotResult<f64> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        let price = self
            .next_price()
            .ok_or_else(|| BotError::TransientRpc(format!("price feed unavailable for {}", mint)))?;
        *self.last_quoted.lock() = Some(price);
        Ok(price)
    }

    async fn get_token_balance(&self, _mint: &str) -> BotResult<u64> {
        self.maybe_hang().await;
        if let Some(next) = self.balance_script.lock().pop_front() {
            return Ok(next);
        }
        Ok(self.balance.load(Ordering::SeqCst))
    }

    async fn sell_percent_tokens(
        &self,
        mint: &str,
        percent: f64,
        _slippage_percent: f64,
        _priority_fee: PriorityFee,
        _compute_units: u32,
    ) -> BotResult<String> {
        self.sell_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sell_percent.lock() = Some(percent);

        let delay = *self.sell_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_sell.load(Ordering::SeqCst) {
            return Err(BotError::Protocol("insufficient liquidity".to_string()));
        }

        let balance = self.balance.load(Ordering::SeqCst);
        let sold = (balance as f64 * percent / 100.0) as u64;
        self.balance.fetch_sub(sold.min(balance), Ordering::SeqCst);
        self.sells_completed.fetch_add(1, Ordering::SeqCst);
        Ok(format!("sig-sell-{}", mint))
    }

    /// Values against the last quoted price so PnL does not consume the script
    async fn calculate_pnl(&self, mint: &str, token_amount: f64, initial_investment: f64) -> BotResult<PnLResult> {
        self.maybe_hang().await;
        let last = *self.last_quoted.lock();
        let price = match last {
            Some(price) => price,
            None => self.get_token_price(mint).await?,
        };
        Ok(PricingModel::Amm { fee: 0.0 }.pnl(price, token_amount, initial_investment))
    }
}

/// Hands out one shared `MockDex` regardless of module
pub struct MockDexFactory {
    pub dex: Arc<MockDex>,
    pub created: AtomicU32,
    fail: bool,
}

impl MockDexFactory {
    pub fn new(dex: Arc<MockDex>) -> Self {
        Self { dex, created: AtomicU32::new(0), fail: false }
    }

    pub fn failing() -> Self {
        Self {
            dex: Arc::new(MockDex::new(0.0, 0)),
            created: AtomicU32::new(0),
            fail: true,
        }
    }
}

impl DexFactory for MockDexFactory {
    fn create(&self, module: DexModule, _wallet: Arc<Wallet>) -> BotResult<Arc<dyn Dex>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BotError::Configuration(format!("module {} unavailable", module)));
        }
        Ok(self.dex.clone())
    }
}
