//! # Solana Task Bot
//!
//! Runs declarative trading tasks against Solana DEXes: every buy is
//! followed by a live monitoring session that the operator ends with a
//! keystroke (sell) or `q` (walk away).
//!
//! ## Layout
//! - `models`: tasks, wallets and trade records
//! - `dex`: exchange capability and the Jupiter-routed adapter
//! - `bus`: command and event buses
//! - `monitor`: sessions, throttling, operator input and the monitor worker
//! - `worker_pool`: concurrent task execution
//! - `trading_service`: command handlers for execute and sell requests
//! - `history`: daily CSV trade log with in-memory statistics
//! - `shutdown`: signal handling and ordered service teardown
//! - `runner`: wires it all together
//!
//! ## Running
//! ```bash
//! # configs/config.json (or .yaml), configs/wallets.csv, configs/tasks.csv
//! cargo run --release
//! ```
//! Trades are appended to `logs/trades_YYYY-MM-DD.csv`.

mod bus;
mod config;
mod dex;
mod error;
mod history;
mod loader;
mod models;
mod monitor;
mod runner;
mod shutdown;
mod trading_service;
mod worker_pool;

use std::path::Path;
use std::process::ExitCode;

use tracing_subscriber::{ layer::SubscriberExt, util::SubscriberInitExt, EnvFilter };

use crate::config::Config;
use crate::runner::{Runner, CONFIG_DIR, LOGS_DIR};

/// Console logging; `RUST_LOG` wins over the configured level
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber
        ::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt
                ::layer()
                .with_target(false)
                .compact()
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let config_dir = Path::new(CONFIG_DIR);
    let config = match Config::load(config_dir) {
        Ok(config) => config,
        Err(e) => {
            init_tracing("info");
            tracing::error!("❌ {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_level());

    tracing::info!("🏁 Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    tracing::info!("🏗️  Build profile: {}", if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    });
    if let Some(webhook) = &config.webhook_url {
        tracing::debug!("webhook configured: {}", webhook);
    }

    let runner = match Runner::load(config, config_dir, LOGS_DIR) {
        Ok(runner) => runner,
        Err(e) => {
            tracing::error!("❌ Startup failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match runner.run().await {
        Ok(summary) => {
            if !summary.shutdown.is_clean() {
                tracing::warn!("⚠️ Shutdown finished with errors: {:?}", summary.shutdown);
            }
            tracing::info!("👋 Bye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}
