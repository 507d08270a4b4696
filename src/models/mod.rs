//! # Models
//!
//! Plain data carried through the pipeline: tasks, wallets and trade records.

pub mod task;
pub mod trade;
pub mod wallet;

pub use task::{DexModule, Operation, PriorityFee, Task, TaskStore};
pub use trade::{Trade, TradeAction};
pub use wallet::{Wallet, WalletStore};
