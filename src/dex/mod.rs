//! # DEX Capability
//!
//! The narrow interface the pipeline consumes from an exchange adapter, the
//! factory that builds one adapter per task, and the PnL models shared by the
//! adapters.

pub mod jupiter;
pub mod retry;

#[cfg(test)]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BotResult;
use crate::models::{DexModule, PriorityFee, Task, Wallet};

/// Decimals used when the mint account cannot be read
pub const DEFAULT_TOKEN_DECIMALS: u8 = 6;

/// Valuation of a position relative to what was spent on it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PnLResult {
    pub initial_investment: f64,
    pub theoretical_value: f64,
    /// What a full sell would return after pool/protocol fees
    pub sell_estimate: f64,
    pub net_pnl: f64,
    pub pnl_percent: f64,
}

#[async_trait]
pub trait Dex: Send + Sync {
    fn name(&self) -> &str;

    /// Run the task's operation; returns the transaction signature
    async fn execute(&self, task: &Task) -> BotResult<String>;

    /// Price in SOL per whole token
    async fn get_token_price(&self, mint: &str) -> BotResult<f64>;

    /// Raw (smallest unit) balance held by the adapter's wallet
    async fn get_token_balance(&self, mint: &str) -> BotResult<u64>;

    async fn get_token_decimals(&self, _mint: &str) -> BotResult<u8> {
        Ok(DEFAULT_TOKEN_DECIMALS)
    }

    async fn sell_percent_tokens(
        &self,
        mint: &str,
        percent: f64,
        slippage_percent: f64,
        priority_fee: PriorityFee,
        compute_units: u32,
    ) -> BotResult<String>;

    /// Value `token_amount` whole tokens of `mint` against `initial_investment` SOL
    async fn calculate_pnl(
        &self,
        mint: &str,
        token_amount: f64,
        initial_investment: f64,
    ) -> BotResult<PnLResult>;
}

/// Builds one adapter per task
pub trait DexFactory: Send + Sync {
    fn create(&self, module: DexModule, wallet: Arc<Wallet>) -> BotResult<Arc<dyn Dex>>;
}

/// How a venue turns a spot price into an exit estimate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PricingModel {
    /// Constant-product pool; fee is a fraction (0.0025 = 0.25%)
    Amm { fee: f64 },
    /// Launchpad bonding curve; large exits walk down the curve
    BondingCurve { fee: f64, depth_sol: f64 },
}

impl PricingModel {
    pub fn for_module(module: DexModule) -> Self {
        match module {
            DexModule::Smart => PricingModel::Amm { fee: 0.005 },
            DexModule::PumpFun => PricingModel::BondingCurve { fee: 0.01, depth_sol: 85.0 },
            DexModule::PumpSwap => PricingModel::Amm { fee: 0.0025 },
            DexModule::Raydium => PricingModel::Amm { fee: 0.0025 },
        }
    }

    pub fn pnl(&self, price: f64, token_amount: f64, initial_investment: f64) -> PnLResult {
        let theoretical_value = price * token_amount;
        let sell_estimate = match *self {
            PricingModel::Amm { fee } => theoretical_value * (1.0 - fee),
            PricingModel::BondingCurve { fee, depth_sol } => {
                let impact = if depth_sol > 0.0 {
                    (theoretical_value / depth_sol).min(0.5)
                } else {
                    0.0
                };
                theoretical_value * (1.0 - fee) * (1.0 - impact)
            }
        };
        let net_pnl = sell_estimate - initial_investment;
        let pnl_percent = if initial_investment > 0.0 {
            net_pnl / initial_investment * 100.0
        } else {
            0.0
        };

        PnLResult {
            initial_investment,
            theoretical_value,
            sell_estimate,
            net_pnl,
            pnl_percent,
        }
    }
}

/// Raw amount to human units
pub fn ui_amount(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}
