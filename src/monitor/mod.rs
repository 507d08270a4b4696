//! # Position Monitoring
//!
//! Everything that happens between a confirmed buy and the exit: price
//! polling sessions, update throttling, operator input, rendering and the
//! worker that ties them together.

pub mod display;
pub mod service;
pub mod session;
pub mod throttler;
pub mod ui;
pub mod worker;

pub use display::{ConsoleRenderer, PriceRenderer};
pub use service::MonitorService;
pub use session::{MonitoringSession, PriceUpdate, SessionConfig, SessionState};
pub use throttler::PriceThrottler;
pub use ui::{UiEvent, UiInputHandler};
pub use worker::{MonitorWorker, SellFn, WorkerOutcome};
