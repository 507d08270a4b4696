//! Jupiter-routed DEX adapter.
//!
//! One adapter type serves every task module; the module picks the route
//! filter passed to the quote API and the pricing model used for PnL.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dashmap::DashMap;
use reqwest::Client;
use serde_json::{json, Value};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    pubkey::Pubkey,
    signature::Signer,
    transaction::VersionedTransaction,
};
use spl_token::solana_program::program_pack::Pack;
use tracing::{debug, info, warn};

use crate::dex::retry::{retry_transient, RetryConfig};
use crate::dex::{Dex, DexFactory, PnLResult, PricingModel, DEFAULT_TOKEN_DECIMALS};
use crate::error::{BotError, BotResult};
use crate::models::{DexModule, Operation, PriorityFee, Task, Wallet};

const JUPITER_QUOTE_API: &str = "https://quote-api.jup.ag/v6/quote";
const JUPITER_SWAP_API: &str = "https://quote-api.jup.ag/v6/swap";
const JUPITER_PRICE_API: &str = "https://api.jup.ag/price/v2";
const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Creates Jupiter adapters sharing one RPC and HTTP client
pub struct JupiterDexFactory {
    rpc: Arc<RpcClient>,
    http: Client,
    retry: RetryConfig,
}

impl JupiterDexFactory {
    pub fn new(rpc_url: &str, retry: RetryConfig) -> BotResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BotError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        let rpc = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());

        Ok(Self {
            rpc: Arc::new(rpc),
            http,
            retry,
        })
    }
}

impl DexFactory for JupiterDexFactory {
    fn create(&self, module: DexModule, wallet: Arc<Wallet>) -> BotResult<Arc<dyn Dex>> {
        Ok(Arc::new(JupiterDex {
            name: format!("jupiter:{}", module),
            module,
            pricing: PricingModel::for_module(module),
            wallet,
            rpc: Arc::clone(&self.rpc),
            http: self.http.clone(),
            retry: self.retry.clone(),
            decimals_cache: DashMap::new(),
        }))
    }
}

pub struct JupiterDex {
    name: String,
    module: DexModule,
    pricing: PricingModel,
    wallet: Arc<Wallet>,
    rpc: Arc<RpcClient>,
    http: Client,
    retry: RetryConfig,
    decimals_cache: DashMap<String, u8>,
}

/// Swap parameters shared by buys and sells
struct SwapParams<'a> {
    input_mint: &'a str,
    output_mint: &'a str,
    amount: u64,
    slippage_bps: u16,
    priority_fee: PriorityFee,
    compute_units: u32,
}

impl JupiterDex {
    /// Jupiter `dexes` filter for the module, `None` routes everywhere
    fn route_filter(&self) -> Option<&'static str> {
        match self.module {
            DexModule::Smart => None,
            DexModule::PumpFun => Some("Pump.fun"),
            DexModule::PumpSwap => Some("Pump.fun Amm"),
            DexModule::Raydium => Some("Raydium,Raydium CP,Raydium CLMM"),
        }
    }

    fn parse_mint(mint: &str) -> BotResult<Pubkey> {
        Pubkey::from_str(mint).map_err(|e| BotError::Validation(format!("invalid mint {}: {}", mint, e)))
    }

    async fn fetch_quote(&self, params: &SwapParams<'_>) -> BotResult<Value> {
        let amount = params.amount.to_string();
        let slippage = params.slippage_bps.to_string();
        let mut query = vec![
            ("inputMint", params.input_mint),
            ("outputMint", params.output_mint),
            ("amount", amount.as_str()),
            ("slippageBps", slippage.as_str()),
        ];
        if let Some(dexes) = self.route_filter() {
            query.push(("dexes", dexes));
        }

        let response = self.http
            .get(JUPITER_QUOTE_API)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;

        let quote: Value = response.json().await?;
        if quote.get("outAmount").is_none() {
            return Err(BotError::Protocol(format!(
                "no route for {} -> {} on {}",
                params.input_mint, params.output_mint, self.module
            )));
        }
        Ok(quote)
    }

    fn swap_body(&self, quote: Value, params: &SwapParams<'_>) -> Value {
        let mut body = json!({
            "quoteResponse": quote,
            "userPublicKey": self.wallet.pubkey().to_string(),
            "wrapAndUnwrapSol": true,
        });

        match (params.priority_fee.lamports(), params.compute_units) {
            // explicit budget: fee spread over the requested compute units
            (Some(fee), cu) if cu > 0 => {
                body["computeUnitPriceMicroLamports"] = json!(fee.saturating_mul(1_000_000) / cu as u64);
                body["dynamicComputeUnitLimit"] = json!(false);
            }
            (Some(fee), _) => {
                body["prioritizationFeeLamports"] = json!(fee);
                body["dynamicComputeUnitLimit"] = json!(true);
            }
            (None, _) => {
                body["prioritizationFeeLamports"] = json!("auto");
                body["dynamicComputeUnitLimit"] = json!(true);
            }
        }
        body
    }

    /// Quote, build, sign and confirm one swap
    async fn swap(&self, params: SwapParams<'_>) -> BotResult<String> {
        let quote = self.fetch_quote(&params).await?;
        debug!("{} quote {} -> {}: out={}", self.name, params.input_mint, params.output_mint,
               quote["outAmount"].as_str().unwrap_or("?"));

        let body = self.swap_body(quote, &params);
        let response = self.http
            .post(JUPITER_SWAP_API)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let swap: Value = response.json().await?;
        let encoded = swap["swapTransaction"]
            .as_str()
            .ok_or_else(|| BotError::Protocol("swap response missing transaction".to_string()))?;

        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BotError::Protocol(format!("failed to decode swap transaction: {}", e)))?;

        let mut tx: VersionedTransaction = bincode::deserialize(&bytes)
            .map_err(|e| BotError::Protocol(format!("failed to deserialize swap transaction: {}", e)))?;

        let keypair = self.wallet.keypair();
        let signer_index = tx
            .message
            .static_account_keys()
            .iter()
            .position(|key| key == &keypair.pubkey())
            .filter(|index| *index < tx.signatures.len())
            .ok_or_else(|| BotError::Internal("wallet is not a signer of the swap transaction".to_string()))?;

        let signature = keypair.sign_message(&tx.message.serialize());
        tx.signatures[signer_index] = signature;

        let confirmed = self.rpc.send_and_confirm_transaction(&tx).await?;
        info!("{} swap confirmed: {}", self.name, confirmed);
        Ok(confirmed.to_string())
    }

    async fn read_price(&self, mint: &str) -> BotResult<f64> {
        let response = self.http
            .get(JUPITER_PRICE_API)
            .query(&[("ids", mint), ("vsToken", SOL_MINT)])
            .send()
            .await?
            .error_for_status()?;

        let json: Value = response.json().await?;
        let entry = &json["data"][mint]["price"];
        let price = match entry {
            Value::String(s) => s.parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None,
        };

        match price {
            Some(p) if p.is_finite() && p > 0.0 => Ok(p),
            // unpriced tokens show up as null until the first trade lands
            _ => Err(BotError::TransientRpc(format!("no price available for {}", mint))),
        }
    }

    async fn read_balance(&self, mint: &Pubkey) -> BotResult<u64> {
        let ata = self.wallet.ata_for(mint);
        match self.rpc.get_token_account_balance(&ata).await {
            Ok(balance) => balance
                .amount
                .parse::<u64>()
                .map_err(|e| BotError::Protocol(format!("invalid token amount '{}': {}", balance.amount, e))),
            Err(e) if is_missing_account(&e.to_string()) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_missing_account(message: &str) -> bool {
    message.contains("could not find account") || message.contains("AccountNotFound")
}

#[async_trait]
impl Dex for JupiterDex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, task: &Task) -> BotResult<String> {
        match task.operation {
            Operation::Snipe | Operation::Swap => {
                info!("{} buying {} with {} SOL (slippage {}%)",
                      self.name, task.token_mint, task.amount_sol, task.slippage_percent);
                self.swap(SwapParams {
                    input_mint: SOL_MINT,
                    output_mint: &task.token_mint,
                    amount: task.amount_lamports(),
                    slippage_bps: task.slippage_bps(),
                    priority_fee: task.priority_fee,
                    compute_units: task.compute_units,
                })
                .await
            }
            Operation::Sell => {
                self.sell_percent_tokens(
                    &task.token_mint,
                    task.autosell_percent as f64,
                    task.slippage_percent,
                    task.priority_fee,
                    task.compute_units,
                )
                .await
            }
        }
    }

    async fn get_token_price(&self, mint: &str) -> BotResult<f64> {
        retry_transient(&self.retry, "price lookup", || self.read_price(mint)).await
    }

    async fn get_token_balance(&self, mint: &str) -> BotResult<u64> {
        let mint = Self::parse_mint(mint)?;
        retry_transient(&self.retry, "balance lookup", || self.read_balance(&mint)).await
    }

    async fn get_token_decimals(&self, mint: &str) -> BotResult<u8> {
        if let Some(cached) = self.decimals_cache.get(mint) {
            return Ok(*cached);
        }

        let mint_key = Self::parse_mint(mint)?;
        let decimals = match self.rpc.get_account(&mint_key).await {
            Ok(account) if account.data.len() >= spl_token::state::Mint::LEN => {
                spl_token::state::Mint::unpack_from_slice(&account.data[..spl_token::state::Mint::LEN])
                    .map(|m| m.decimals)
                    .unwrap_or(DEFAULT_TOKEN_DECIMALS)
            }
            Ok(_) => DEFAULT_TOKEN_DECIMALS,
            Err(e) => {
                warn!("failed to read mint {}: {}, assuming {} decimals", mint, e, DEFAULT_TOKEN_DECIMALS);
                return Ok(DEFAULT_TOKEN_DECIMALS);
            }
        };

        self.decimals_cache.insert(mint.to_string(), decimals);
        Ok(decimals)
    }

    async fn sell_percent_tokens(
        &self,
        mint: &str,
        percent: f64,
        slippage_percent: f64,
        priority_fee: PriorityFee,
        compute_units: u32,
    ) -> BotResult<String> {
        if !(percent > 0.0 && percent <= 100.0) {
            return Err(BotError::Validation(format!("sell percentage {} outside (0, 100]", percent)));
        }

        // never sell against an estimate: the balance must be read live
        let balance = self.get_token_balance(mint).await?;
        if balance == 0 {
            return Err(BotError::Protocol(format!("no {} balance to sell", mint)));
        }

        let amount = ((balance as u128 * (percent * 100.0).round() as u128) / 10_000) as u64;
        if amount == 0 {
            return Err(BotError::Protocol(format!(
                "{}% of balance {} rounds to zero", percent, balance
            )));
        }

        info!("{} selling {}% of {} ({} raw units)", self.name, percent, mint, amount);
        self.swap(SwapParams {
            input_mint: mint,
            output_mint: SOL_MINT,
            amount,
            slippage_bps: (slippage_percent * 100.0).round().clamp(1.0, 10_000.0) as u16,
            priority_fee,
            compute_units,
        })
        .await
    }

    async fn calculate_pnl(&self, mint: &str, token_amount: f64, initial_investment: f64) -> BotResult<PnLResult> {
        let price = self.get_token_price(mint).await?;
        Ok(self.pricing.pnl(price, token_amount, initial_investment))
    }
}
