//! Spot Trader Library
//!
//! Buy-low/sell-high automation against a spot exchange:
//!
//! 1. **Capital-bounded purchases**: every position is recorded against a
//!    capital threshold that OPEN positions can never exceed.
//!
//! 2. **Scheduled liquidation**: a timer claims the next scheduled slot,
//!    sells every position whose target has been reached and re-arms itself
//!    while positions remain open.
//!
//! 3. **Daily purchase**: an optional quote-sized buy at a fixed UTC hour,
//!    immediately protected by a limit sell at the target price.
//!
//! Every attempt, successful or not, lands in the execution history.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod exchange;
pub mod notify;
pub mod services;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use db::Database;
pub use error::{TradingError, TradingResult};
pub use exchange::{BinanceClient, ExchangeError, ExchangeGateway};
pub use notify::{LogNotifier, NotificationChannel, WebhookNotifier};
pub use types::{
    CredentialRecord, ExchangeEnvironment, ExecutionRecord, OperationStatus, OperationType, ScheduleStatus,
    ScheduledOperation, TradingOperation,
};
