//! # Trading Service
//!
//! Command handlers behind the command bus: run a task on demand, sell part
//! or all of a monitored position, refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::bus::{Command, CommandBus, CommandHandler, CommandKind, Event, EventBus, EventPayload};
use crate::dex::retry::with_deadline;
use crate::dex::{ui_amount, Dex, DexFactory, PnLResult, DEFAULT_TOKEN_DECIMALS};
use crate::error::{BotError, BotResult};
use crate::history::TradeHistory;
use crate::models::{Task, TaskStore, Trade, TradeAction, Wallet, WalletStore};
use crate::monitor::session::{SessionConfig, DEFAULT_POLLING_INTERVAL, PRICE_LOOKUP_BUDGET};
use crate::monitor::MonitorService;
use crate::worker_pool::{BALANCE_WAIT_BUDGET, EXECUTE_BUDGET};

pub const SELL_COMMAND_BUDGET: Duration = Duration::from_secs(120);

pub struct TradingService {
    event_bus: Arc<EventBus>,
    monitor_service: Arc<MonitorService>,
    factory: Arc<dyn DexFactory>,
    wallets: Arc<WalletStore>,
    tasks: Arc<TaskStore>,
    history: Arc<TradeHistory>,
    polling_interval: Duration,
}

impl TradingService {
    pub fn new(
        event_bus: Arc<EventBus>,
        monitor_service: Arc<MonitorService>,
        factory: Arc<dyn DexFactory>,
        wallets: Arc<WalletStore>,
        tasks: Arc<TaskStore>,
        history: Arc<TradeHistory>,
    ) -> Self {
        Self {
            event_bus,
            monitor_service,
            factory,
            wallets,
            tasks,
            history,
            polling_interval: DEFAULT_POLLING_INTERVAL,
        }
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.polling_interval = interval;
        }
        self
    }

    /// Route every command kind on `bus` to this service
    pub fn register_handlers(self: &Arc<Self>, bus: &CommandBus) {
        for kind in [CommandKind::ExecuteTask, CommandKind::SellPosition, CommandKind::RefreshData] {
            bus.register(kind, Arc::clone(self) as Arc<dyn CommandHandler>);
        }
    }

    fn record(&self, trade: Trade) {
        if let Err(e) = self.history.log_trade(trade) {
            warn!("failed to record trade: {}", e);
        }
    }

    async fn read_balance(dex: &dyn Dex, mint: &str) -> u64 {
        match tokio::time::timeout(BALANCE_WAIT_BUDGET, dex.get_token_balance(mint)).await {
            Ok(Ok(balance)) => balance,
            Ok(Err(e)) => {
                debug!("balance for {} unavailable: {}", mint, e);
                0
            }
            Err(_) => 0,
        }
    }

    async fn read_price(dex: &dyn Dex, mint: &str) -> f64 {
        match tokio::time::timeout(PRICE_LOOKUP_BUDGET, dex.get_token_price(mint)).await {
            Ok(Ok(price)) => price,
            Ok(Err(e)) => {
                debug!("price for {} unavailable: {}", mint, e);
                0.0
            }
            Err(_) => 0.0,
        }
    }

    async fn execute_task(&self, task_id: u64, user_id: &str) -> BotResult<()> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or_else(|| BotError::NotFound(format!("task {} not found", task_id)))?;
        let wallet = self
            .wallets
            .get(&task.wallet)
            .ok_or_else(|| BotError::NotFound(format!("wallet '{}' not found", task.wallet)))?;
        let dex = self.factory.create(task.module, Arc::clone(&wallet))?;

        info!("🚀 executing task {} '{}' for {}", task.id, task.name, user_id);
        let result = with_deadline("execute", EXECUTE_BUDGET, dex.execute(&task)).await;

        self.event_bus.publish(Event::new(user_id, EventPayload::TaskExecuted {
            task_id: task.id,
            token_mint: task.token_mint.clone(),
            operation: task.operation,
            success: result.is_ok(),
            tx_signature: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
        }));

        let owner = wallet.pubkey().to_string();
        if !task.operation.is_buy() || result.is_err() {
            let action = if task.operation.is_buy() { TradeAction::Buy } else { TradeAction::Sell };
            self.record(
                Trade::new(action, task.id, &owner, &task.token_mint, dex.name())
                    .with_amounts(task.amount_sol, 0.0, 0.0)
                    .with_result(&result),
            );
            return result.map(|_| ());
        }

        self.open_position(task, &wallet, dex, &result, user_id).await
    }

    async fn open_position(
        &self,
        task: Arc<Task>,
        wallet: &Wallet,
        dex: Arc<dyn Dex>,
        result: &BotResult<String>,
        user_id: &str,
    ) -> BotResult<()> {
        let mint = task.token_mint.clone();
        let balance = Self::read_balance(dex.as_ref(), &mint).await;
        let price = Self::read_price(dex.as_ref(), &mint).await;
        let decimals = dex.get_token_decimals(&mint).await.unwrap_or(DEFAULT_TOKEN_DECIMALS);

        self.record(
            Trade::new(TradeAction::Buy, task.id, &wallet.pubkey().to_string(), &mint, dex.name())
                .with_amounts(task.amount_sol, ui_amount(balance, decimals), price)
                .with_result(result),
        );

        self.event_bus.publish(Event::new(user_id, EventPayload::PositionCreated {
            task_id: task.id,
            token_mint: mint.clone(),
            wallet: task.wallet.clone(),
            amount_sol: task.amount_sol,
            token_amount: balance,
            entry_price: price,
        }));

        let config = SessionConfig::new(task, dex)
            .with_initial_price(price)
            .with_token_balance(balance)
            .with_polling_interval(self.polling_interval);
        self.monitor_service.start_monitoring(config, user_id)?;
        Ok(())
    }

    async fn sell_position(&self, mint: &str, percentage: f64, user_id: &str) -> BotResult<()> {
        let Some(session) = self.monitor_service.get(mint).filter(|s| s.is_active()) else {
            let err = BotError::NotFound(format!("monitoring session not found for token {}", mint));
            self.publish_sell(user_id, mint, percentage, &Err(err.to_string()), None);
            return Err(err);
        };

        let task = Arc::clone(session.task());
        let wallet = self
            .wallets
            .get(&task.wallet)
            .or_else(|| self.wallets.default_wallet())
            .ok_or_else(|| BotError::NotFound("no wallet available for sell".to_string()))?;
        let dex = self.factory.create(task.module, Arc::clone(&wallet))?;

        // reporting only, a failed read never blocks the sell
        let balance = Self::read_balance(dex.as_ref(), mint).await;
        let decimals = dex.get_token_decimals(mint).await.unwrap_or(DEFAULT_TOKEN_DECIMALS);
        let share = percentage / 100.0;
        let tokens = ui_amount(balance, decimals) * share;
        let pnl = if tokens > 0.0 {
            dex.calculate_pnl(mint, tokens, task.amount_sol * share).await.ok()
        } else {
            None
        };

        info!("🔻 selling {}% of {} for {}", percentage, mint, user_id);
        let result = with_deadline(
            "sell",
            SELL_COMMAND_BUDGET,
            dex.sell_percent_tokens(mint, percentage, task.slippage_percent, task.priority_fee, task.compute_units),
        )
        .await;

        let exit_price = match pnl {
            Some(p) if tokens > 0.0 => p.theoretical_value / tokens,
            _ => 0.0,
        };
        let mut trade = Trade::new(TradeAction::Sell, task.id, &wallet.pubkey().to_string(), mint, dex.name())
            .with_amounts(pnl.map(|p| p.sell_estimate).unwrap_or(0.0), tokens, exit_price)
            .with_result(&result);
        if let Some(p) = pnl {
            trade = trade.with_exit(session.initial_price(), exit_price, p.net_pnl, p.pnl_percent);
        }
        self.record(trade);
        self.publish_sell(user_id, mint, percentage, &result, pnl);

        result?;
        if percentage >= 100.0 {
            self.monitor_service
                .stop_monitoring(mint, "position_fully_sold", user_id)
                .await?;
        }
        Ok(())
    }

    fn publish_sell(
        &self,
        user_id: &str,
        mint: &str,
        percentage: f64,
        result: &Result<String, impl std::fmt::Display>,
        pnl: Option<PnLResult>,
    ) {
        self.event_bus.publish(Event::new(user_id, EventPayload::SellCompleted {
            token_mint: mint.to_string(),
            percentage,
            success: result.is_ok(),
            tx_signature: result.as_ref().ok().cloned(),
            error: result.as_ref().err().map(|e| e.to_string()),
            pnl,
        }));
    }
}

#[async_trait]
impl CommandHandler for TradingService {
    async fn handle(&self, command: &Command) -> BotResult<()> {
        match command {
            Command::ExecuteTask { task_id, user_id, .. } => self.execute_task(*task_id, user_id).await,
            Command::SellPosition { token_mint, percentage, user_id, .. } => {
                self.sell_position(token_mint, *percentage, user_id).await
            }
            Command::RefreshData { user_id, .. } => {
                debug!("refresh requested by {}", user_id);
                Ok(())
            }
        }
    }
}
