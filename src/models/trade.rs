use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

static TRADE_SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub const CSV_HEADER: &str = "id,timestamp,wallet,token_mint,symbol,action,amount_sol,amount_token,price,entry_price,exit_price,pnl,pnl_percent,hold_time,tx_signature,dex,success,error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed (or failed) trade as recorded in the history log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trade {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub wallet: String,
    pub token_mint: String,
    pub symbol: String,
    pub action: TradeAction,
    pub amount_sol: f64,
    pub amount_token: f64,
    pub price: f64,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    /// Seconds between entry and exit
    pub hold_time_secs: Option<u64>,
    pub tx_signature: Option<String>,
    pub dex: String,
    pub success: bool,
    pub error: Option<String>,
}

impl Trade {
    pub fn new(action: TradeAction, task_id: u64, wallet: &str, token_mint: &str, dex: &str) -> Self {
        let timestamp = Utc::now();
        Self {
            id: Self::next_id(action, task_id, timestamp),
            timestamp,
            wallet: wallet.to_string(),
            token_mint: token_mint.to_string(),
            symbol: short_symbol(token_mint),
            action,
            amount_sol: 0.0,
            amount_token: 0.0,
            price: 0.0,
            entry_price: None,
            exit_price: None,
            pnl: None,
            pnl_percent: None,
            hold_time_secs: None,
            tx_signature: None,
            dex: dex.to_string(),
            success: false,
            error: None,
        }
    }

    /// `action_taskId_unixTs_seq`, unique within a run
    fn next_id(action: TradeAction, task_id: u64, timestamp: DateTime<Utc>) -> String {
        let seq = TRADE_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}_{}_{}", action, task_id, timestamp.timestamp(), seq)
    }

    pub fn with_amounts(mut self, amount_sol: f64, amount_token: f64, price: f64) -> Self {
        self.amount_sol = amount_sol;
        self.amount_token = amount_token;
        self.price = price;
        self
    }

    pub fn with_exit(mut self, entry_price: f64, exit_price: f64, pnl: f64, pnl_percent: f64) -> Self {
        self.entry_price = Some(entry_price);
        self.exit_price = Some(exit_price);
        self.pnl = Some(pnl);
        self.pnl_percent = Some(pnl_percent);
        self
    }

    pub fn with_hold_time(mut self, opened_at: DateTime<Utc>) -> Self {
        let held = self.timestamp.signed_duration_since(opened_at).num_seconds();
        self.hold_time_secs = Some(held.max(0) as u64);
        self
    }

    /// Marks the trade succeeded or failed from an execution result
    pub fn with_result<E: fmt::Display>(mut self, result: &Result<String, E>) -> Self {
        match result {
            Ok(signature) => {
                self.success = true;
                self.tx_signature = Some(signature.clone());
                self.error = None;
            }
            Err(e) => {
                self.success = false;
                self.error = Some(e.to_string());
            }
        }
        self
    }

    pub fn to_csv_row(&self) -> String {
        let fields = [
            csv_escape(&self.id),
            self.timestamp.to_rfc3339(),
            csv_escape(&self.wallet),
            csv_escape(&self.token_mint),
            csv_escape(&self.symbol),
            self.action.to_string(),
            format!("{:.9}", self.amount_sol),
            format!("{:.6}", self.amount_token),
            format!("{:.12}", self.price),
            opt_float(self.entry_price, 12),
            opt_float(self.exit_price, 12),
            opt_float(self.pnl, 9),
            opt_float(self.pnl_percent, 2),
            self.hold_time_secs.map(|s| s.to_string()).unwrap_or_default(),
            self.tx_signature.as_deref().map(csv_escape).unwrap_or_default(),
            csv_escape(&self.dex),
            self.success.to_string(),
            self.error.as_deref().map(csv_escape).unwrap_or_default(),
        ];
        fields.join(",")
    }
}

/// Short display symbol derived from the mint address
pub fn short_symbol(mint: &str) -> String {
    let head: String = mint.chars().take(4).collect();
    let tail: String = mint.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if mint.chars().count() <= 8 {
        mint.to_string()
    } else {
        format!("{}..{}", head, tail)
    }
}

fn opt_float(value: Option<f64>, precision: usize) -> String {
    value.map(|v| format!("{:.*}", precision, v)).unwrap_or_default()
}

/// Quote a CSV field when it contains separators, quotes or newlines
pub fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
