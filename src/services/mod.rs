//! Trading engine services

pub mod automation;
pub mod credential_store;
pub mod credentials;
pub mod daily_purchase;
pub mod ledger;
pub mod parameters;
pub mod price_alerts;
pub mod price_history;
pub mod purchase;
pub mod schedule;
pub mod symbols;

pub use automation::{AutomationLoop, CycleOutcome};
pub use credential_store::{ActiveCredentials, CredentialStore};
pub use credentials::{CredentialManager, CredentialStatus};
pub use daily_purchase::{DailyPurchaseLoop, DailyPurchaseSettingsService};
pub use ledger::CapitalLedger;
pub use parameters::{TradingParameters, TradingSettings};
pub use price_alerts::{PriceAlertMonitor, PriceAlertService};
pub use price_history::{HistoryPeriod, PriceHistoryService, PriceSnapshot};
pub use purchase::{PurchaseReceipt, PurchaseService};
pub use schedule::ScheduleStateMachine;
pub use symbols::SymbolCatalogue;

use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeError;
use std::future::Future;
use std::time::Duration;

/// Ticker reads
pub const PRICE_TIMEOUT: Duration = Duration::from_secs(8);
/// Kline reads, which can return up to a thousand rows
pub const HISTORY_TIMEOUT: Duration = Duration::from_secs(12);
/// Signed account check during credential validation
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(8);
/// Order placement
pub const ORDER_TIMEOUT: Duration = Duration::from_secs(15);
/// Single persistence statement or transaction
pub const PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait for an automation cycle triggered over HTTP
pub const MANUAL_CYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run an exchange call under a deadline. A timeout is a gateway failure.
pub(crate) async fn exchange_call<T, F>(what: &str, limit: Duration, call: F) -> TradingResult<T>
where
    F: Future<Output = Result<T, ExchangeError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(TradingError::Gateway),
        Err(_) => Err(TradingError::Gateway(ExchangeError::Timeout(what.to_string()))),
    }
}

/// Run a store call under the persistence deadline
pub(crate) async fn store_call<T, F>(what: &str, call: F) -> TradingResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(PERSISTENCE_TIMEOUT, call).await {
        Ok(result) => result.map_err(|e| TradingError::Persistence(e.context(what.to_string()))),
        Err(_) => Err(TradingError::Persistence(anyhow::anyhow!("{} timed out", what))),
    }
}
