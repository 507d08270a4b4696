use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BotError, BotResult};

pub const DEFAULT_SLIPPAGE_PERCENT: f64 = 1.0;
pub const MIN_SLIPPAGE_PERCENT: f64 = 0.5;
pub const MAX_SLIPPAGE_PERCENT: f64 = 100.0;
pub const DEFAULT_AUTOSELL_PERCENT: u8 = 99;

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

/// Exchange module a task is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DexModule {
    Smart,
    PumpFun,
    PumpSwap,
    Raydium,
}

impl DexModule {
    pub fn as_str(&self) -> &'static str {
        match self {
            DexModule::Smart => "smart",
            DexModule::PumpFun => "pumpfun",
            DexModule::PumpSwap => "pumpswap",
            DexModule::Raydium => "raydium",
        }
    }
}

impl fmt::Display for DexModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DexModule {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "smart" => Ok(DexModule::Smart),
            "pumpfun" => Ok(DexModule::PumpFun),
            "pumpswap" => Ok(DexModule::PumpSwap),
            "raydium" => Ok(DexModule::Raydium),
            other => Err(BotError::Validation(format!("unknown module '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Snipe,
    Swap,
    Sell,
}

impl Operation {
    /// Snipe and swap acquire a position that gets monitored afterwards
    pub fn is_buy(&self) -> bool {
        matches!(self, Operation::Snipe | Operation::Swap)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Snipe => "snipe",
            Operation::Swap => "swap",
            Operation::Sell => "sell",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snipe" => Ok(Operation::Snipe),
            "swap" => Ok(Operation::Swap),
            "sell" => Ok(Operation::Sell),
            other => Err(BotError::Validation(format!("unknown operation '{}'", other))),
        }
    }
}

/// Priority fee as written in the tasks file: `default` or an amount of SOL
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PriorityFee {
    Default,
    Sol(f64),
}

impl PriorityFee {
    pub fn lamports(&self) -> Option<u64> {
        match self {
            PriorityFee::Default => None,
            PriorityFee::Sol(sol) => Some((sol * LAMPORTS_PER_SOL).round() as u64),
        }
    }
}

impl Default for PriorityFee {
    fn default() -> Self {
        PriorityFee::Default
    }
}

impl fmt::Display for PriorityFee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorityFee::Default => f.write_str("default"),
            PriorityFee::Sol(sol) => write!(f, "{}", sol),
        }
    }
}

impl FromStr for PriorityFee {
    type Err = BotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("default") {
            return Ok(PriorityFee::Default);
        }
        match trimmed.parse::<f64>() {
            Ok(sol) if sol.is_finite() && sol >= 0.0 => Ok(PriorityFee::Sol(sol)),
            _ => Err(BotError::Validation(format!("invalid priority fee '{}'", trimmed))),
        }
    }
}

/// Slippage outside 0.5..=100 falls back to the default
pub fn normalize_slippage(percent: f64) -> f64 {
    if percent.is_finite() && (MIN_SLIPPAGE_PERCENT..=MAX_SLIPPAGE_PERCENT).contains(&percent) {
        percent
    } else {
        DEFAULT_SLIPPAGE_PERCENT
    }
}

/// Autosell outside 1..=99 falls back to 99
pub fn normalize_autosell(percent: i64) -> u8 {
    if (1..=99).contains(&percent) {
        percent as u8
    } else {
        DEFAULT_AUTOSELL_PERCENT
    }
}

/// One declarative trading intent, immutable after load
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: u64,
    pub name: String,
    pub module: DexModule,
    pub wallet: String,
    pub operation: Operation,
    pub amount_sol: f64,
    pub slippage_percent: f64,
    pub priority_fee: PriorityFee,
    /// 0 means "let the DEX decide"
    pub compute_units: u32,
    pub autosell_percent: u8,
    pub token_mint: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn validate(&self) -> BotResult<()> {
        if self.id == 0 {
            return Err(BotError::Validation("task id must be positive".to_string()));
        }
        if self.operation.is_buy() && !(self.amount_sol > 0.0) {
            return Err(BotError::Validation(format!(
                "task '{}': {} requires amount_sol > 0",
                self.name, self.operation
            )));
        }
        if self.wallet.trim().is_empty() {
            return Err(BotError::Validation(format!("task '{}': wallet is required", self.name)));
        }
        solana_sdk::pubkey::Pubkey::from_str(&self.token_mint).map_err(|e| {
            BotError::Validation(format!("task '{}': invalid token mint: {}", self.name, e))
        })?;
        Ok(())
    }

    pub fn amount_lamports(&self) -> u64 {
        (self.amount_sol * LAMPORTS_PER_SOL).round() as u64
    }

    pub fn slippage_bps(&self) -> u16 {
        (self.slippage_percent * 100.0).round().clamp(1.0, 10_000.0) as u16
    }
}

/// Read-only lookup of loaded tasks by id
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<u64, Arc<Task>>,
    order: Vec<u64>,
}

impl TaskStore {
    pub fn new(tasks: Vec<Task>) -> Self {
        let mut store = Self::default();
        for task in tasks {
            store.order.push(task.id);
            store.tasks.insert(task.id, Arc::new(task));
        }
        store
    }

    pub fn get(&self, id: u64) -> Option<Arc<Task>> {
        self.tasks.get(&id).cloned()
    }

    /// Tasks in file order
    pub fn all(&self) -> Vec<Arc<Task>> {
        self.order.iter().filter_map(|id| self.tasks.get(id).cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn sample_task(id: u64, operation: Operation, mint: &str) -> Task {
    Task {
        id,
        name: format!("task-{}", id),
        module: DexModule::PumpFun,
        wallet: "main".to_string(),
        operation,
        amount_sol: 0.1,
        slippage_percent: DEFAULT_SLIPPAGE_PERCENT,
        priority_fee: PriorityFee::Default,
        compute_units: 0,
        autosell_percent: DEFAULT_AUTOSELL_PERCENT,
        token_mint: mint.to_string(),
        created_at: Utc::now(),
    }
}
