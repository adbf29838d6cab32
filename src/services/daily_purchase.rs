//! Daily purchase - one capital-bounded market buy per UTC day
//!
//! Settings select the symbol and quote amount; the loop fires at the
//! configured UTC hour, buys, places the protective sell and records the
//! position. Every firing leaves exactly one DAILY_BUY execution record.

use super::purchase::{buy_with_protective_sell, positive_price};
use super::{store_call, CapitalLedger, CredentialManager, ScheduleStateMachine, SymbolCatalogue, TradingSettings};
use crate::db::{self, Database};
use crate::error::{TradingError, TradingResult};
use crate::exchange::ExchangeGateway;
use crate::types::{DailyPurchaseSettings, ExecutionRecord, NewPurchase, OperationType};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Wait used when the computed next run is already in the past
const FALLBACK_WAIT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct DailyPurchaseSettingsService {
    db: Arc<Database>,
    trade_symbol: String,
    default_execution_hour_utc: u32,
}

impl DailyPurchaseSettingsService {
    pub fn new(db: Arc<Database>, trade_symbol: &str, default_execution_hour_utc: u32) -> Self {
        Self {
            db,
            trade_symbol: trade_symbol.to_uppercase(),
            default_execution_hour_utc: default_execution_hour_utc.min(23),
        }
    }

    /// Replace the active settings
    pub async fn save_settings(&self, symbol: &str, quote_amount: Decimal) -> TradingResult<DailyPurchaseSettings> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(TradingError::validation("Daily purchase trading pair is required"));
        }
        if symbol != self.trade_symbol {
            return Err(TradingError::validation(format!(
                "Daily purchase can only buy {}, got {}",
                self.trade_symbol, symbol
            )));
        }
        if quote_amount <= Decimal::ZERO {
            return Err(TradingError::validation("Daily purchase amount must be greater than zero"));
        }

        let saved = store_call(
            "save daily purchase settings",
            self.db.save_daily_settings(&symbol, quote_amount, self.default_execution_hour_utc),
        )
        .await?;
        info!(
            "[DailyBuy] Settings saved: {} {} at {:02}:00 UTC",
            saved.quote_amount, saved.symbol, saved.execution_hour_utc
        );
        Ok(saved)
    }

    pub async fn active_settings(&self) -> TradingResult<Option<DailyPurchaseSettings>> {
        store_call("load daily purchase settings", self.db.active_daily_settings()).await
    }

    /// Hour of the active settings when valid, else the configured default
    pub async fn resolve_execution_hour(&self) -> u32 {
        match self.active_settings().await {
            Ok(Some(settings)) if settings.execution_hour_utc <= 23 => settings.execution_hour_utc,
            _ => self.default_execution_hour_utc,
        }
    }
}

/// Next occurrence of `hour`:00 UTC strictly after `now`
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(now);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub struct DailyPurchaseLoop {
    settings: DailyPurchaseSettingsService,
    credentials: Arc<CredentialManager>,
    ledger: CapitalLedger,
    schedule: ScheduleStateMachine,
    gateway: Arc<dyn ExchangeGateway>,
    symbols: SymbolCatalogue,
    trading: TradingSettings,
}

impl DailyPurchaseLoop {
    pub fn new(
        settings: DailyPurchaseSettingsService,
        credentials: Arc<CredentialManager>,
        ledger: CapitalLedger,
        schedule: ScheduleStateMachine,
        gateway: Arc<dyn ExchangeGateway>,
        symbols: SymbolCatalogue,
        trading: TradingSettings,
    ) -> Self {
        Self {
            settings,
            credentials,
            ledger,
            schedule,
            gateway,
            symbols,
            trading,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("[DailyBuy] Started");
        loop {
            let now = db::now();
            let next = next_run_after(now, self.settings.resolve_execution_hour().await);
            let wait = (next - now).to_std().unwrap_or(FALLBACK_WAIT);
            debug!("[DailyBuy] Next run at {} (in {}s)", next, wait.as_secs());

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.execute_once().await;
                }
                _ = shutdown.recv() => {
                    info!("[DailyBuy] Shutting down");
                    break;
                }
            }
        }
    }

    async fn log_failure(&self, symbol: &str, message: impl Into<String>) -> Option<ExecutionRecord> {
        let record = ExecutionRecord::failure(symbol, OperationType::DailyBuy, message);
        self.schedule.log_execution(record.clone()).await;
        Some(record)
    }

    /// One firing. Returns the DAILY_BUY record written, or `None` when nothing is configured.
    pub async fn execute_once(&self) -> Option<ExecutionRecord> {
        let settings = match self.settings.active_settings().await {
            Ok(Some(settings)) => settings,
            Ok(None) => {
                info!("[DailyBuy] Skipped: no settings configured");
                return None;
            }
            Err(e) => {
                error!("[DailyBuy] Settings lookup failed: {}", e);
                return self
                    .log_failure(self.ledger.trade_symbol(), "Daily purchase settings could not be loaded.")
                    .await;
            }
        };
        let symbol = settings.symbol.as_str();

        if let Err(e) = self.credentials.require_valid().await {
            warn!("[DailyBuy] Skipped for {}: {}", symbol, e);
            return self.log_failure(symbol, format!("Daily purchase failed: {}", e)).await;
        }

        if let Err(e) = self.ledger.ensure_capital_available(settings.quote_amount).await {
            warn!("[DailyBuy] Skipped for {}: {}", symbol, e);
            return self.log_failure(symbol, format!("Daily purchase skipped: {}", e)).await;
        }

        let ticker_price = match positive_price(self.gateway.as_ref(), symbol).await {
            Ok(price) => price,
            Err(e) => {
                error!("[DailyBuy] Price lookup failed for {}: {}", symbol, e);
                return self
                    .log_failure(symbol, "Daily purchase failed: could not fetch current price.")
                    .await;
            }
        };

        let target_profit_percent = self.trading.current().await.target_profit_percent;
        let bought = match buy_with_protective_sell(
            self.gateway.as_ref(),
            &self.symbols,
            symbol,
            settings.quote_amount,
            ticker_price,
            target_profit_percent,
        )
        .await
        {
            Ok(bought) => bought,
            Err(e) => {
                error!("[DailyBuy] Buy failed for {}: {}", symbol, e);
                return self.log_failure(symbol, format!("Daily purchase failed: {}", e)).await;
            }
        };

        let sell_order_id = bought.sell.as_ref().ok().map(|order| order.order_id.clone());
        let recorded = self
            .ledger
            .record_purchase(NewPurchase {
                symbol: symbol.to_string(),
                quantity: bought.fill.executed_quantity,
                purchase_price: bought.realized_price,
                target_profit_percent: Some(target_profit_percent),
                buy_order_id: Some(bought.fill.order_id.clone()),
                sell_order_id,
            })
            .await;
        if let Err(e) = recorded {
            error!(
                "[DailyBuy] Buy order {} filled but could not be recorded: {}",
                bought.fill.order_id, e
            );
            return self
                .log_failure(symbol, "Daily purchase failed: could not record the operation.")
                .await;
        }

        if let Err(e) = self.schedule.enqueue_if_idle().await {
            warn!("[DailyBuy] Could not schedule liquidation check: {}", e);
        }

        if let Err(e) = &bought.sell {
            warn!("[DailyBuy] Sell order failed for {}: {}", symbol, e);
            return self
                .log_failure(symbol, format!("Daily purchase completed but sell order failed: {}", e))
                .await;
        }

        info!(
            "[DailyBuy] Bought {} {} @ {} (target {})",
            bought.fill.executed_quantity, symbol, bought.realized_price, bought.target_sell_price
        );
        let record = ExecutionRecord::success(
            symbol,
            OperationType::DailyBuy,
            bought.realized_price,
            bought.fill.executed_quantity,
            Some(bought.fill.order_id.clone()),
        );
        self.schedule.log_execution(record.clone()).await;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exchange::ExchangeError;
    use crate::services::{CredentialStore, SymbolCatalogue, TradingParameters};
    use crate::testing::FakeExchange;
    use rust_decimal_macros::dec;

    struct Harness {
        db: Arc<Database>,
        fake: Arc<FakeExchange>,
        settings: DailyPurchaseSettingsService,
        daily: DailyPurchaseLoop,
    }

    async fn harness(threshold: Decimal) -> Harness {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let fake = Arc::new(FakeExchange::with_price(dec!(200)));
        let trading = TradingSettings::new(TradingParameters {
            capital_threshold: threshold,
            target_profit_percent: dec!(5),
        });
        let config = Config::default();
        let store = CredentialStore::new(config.environment, &config.api_base_url);
        let symbols = SymbolCatalogue::new(fake.clone());
        let credentials = Arc::new(CredentialManager::new(
            db.clone(),
            store,
            fake.clone(),
            symbols.clone(),
            Arc::new(config),
        ));
        credentials
            .validate_and_persist("test-api-key-0001", "test-api-secret-0001", "testnet")
            .await
            .unwrap();

        let ledger = CapitalLedger::new(db.clone(), trading.clone(), "BTCUSDT");
        let schedule = ScheduleStateMachine::new(db.clone(), trading.clone(), "BTCUSDT", Duration::from_secs(3600));
        let settings = DailyPurchaseSettingsService::new(db.clone(), "BTCUSDT", 9);
        let daily = DailyPurchaseLoop::new(
            settings.clone(),
            credentials,
            ledger,
            schedule,
            fake.clone(),
            symbols,
            trading,
        );
        Harness {
            db,
            fake,
            settings,
            daily,
        }
    }

    fn at(text: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(text).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_next_run_today_or_tomorrow() {
        assert_eq!(next_run_after(at("2024-03-01T08:30:00Z"), 9), at("2024-03-01T09:00:00Z"));
        assert_eq!(next_run_after(at("2024-03-01T09:00:00Z"), 9), at("2024-03-02T09:00:00Z"));
        assert_eq!(next_run_after(at("2024-12-31T23:59:00Z"), 0), at("2025-01-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn test_settings_validation_and_hour() {
        let h = harness(dec!(1000)).await;
        assert_eq!(h.settings.resolve_execution_hour().await, 9);
        assert!(matches!(h.settings.save_settings(" ", dec!(10)).await, Err(TradingError::Validation(_))));
        assert!(matches!(h.settings.save_settings("BTCUSDT", dec!(0)).await, Err(TradingError::Validation(_))));
        assert!(matches!(h.settings.save_settings("ETHUSDT", dec!(10)).await, Err(TradingError::Validation(_))));

        h.settings.save_settings("btcusdt", dec!(10)).await.unwrap();
        let second = h.settings.save_settings("BTCUSDT", dec!(20)).await.unwrap();
        let active = h.settings.active_settings().await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        assert_eq!(active.quote_amount, dec!(20));
        assert_eq!(h.settings.resolve_execution_hour().await, 9);
    }

    #[tokio::test]
    async fn test_skips_without_settings() {
        let h = harness(dec!(1000)).await;
        assert!(h.daily.execute_once().await.is_none());
        assert!(h.fake.buys().is_empty());
    }

    #[tokio::test]
    async fn test_daily_buy_records_position() {
        let h = harness(dec!(1000)).await;
        h.settings.save_settings("BTCUSDT", dec!(100)).await.unwrap();

        let record = h.daily.execute_once().await.unwrap();
        assert!(record.success);
        assert_eq!(record.operation_type, OperationType::DailyBuy);
        assert_eq!(record.unit_price, dec!(200));
        assert_eq!(record.quantity, dec!(0.5));
        assert_eq!(record.total_value, dec!(100));

        assert_eq!(h.fake.sells(), vec![("BTCUSDT".to_string(), dec!(0.5), dec!(210))]);
        let open = h.db.open_operations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].sell_order_id.is_some());
        assert_eq!(h.db.count_active_scheduled("BTCUSDT").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capital_precheck_logs_failure() {
        let h = harness(dec!(50)).await;
        h.settings.save_settings("BTCUSDT", dec!(100)).await.unwrap();

        let record = h.daily.execute_once().await.unwrap();
        assert!(!record.success);
        assert!(h.fake.buys().is_empty());
    }

    #[tokio::test]
    async fn test_price_failure_logs_failure() {
        let h = harness(dec!(1000)).await;
        h.settings.save_settings("BTCUSDT", dec!(100)).await.unwrap();
        h.fake.fail_price(ExchangeError::NetworkError("connection refused".to_string()));

        let record = h.daily.execute_once().await.unwrap();
        assert_eq!(
            record.error_message.as_deref(),
            Some("Daily purchase failed: could not fetch current price.")
        );
        assert!(h.fake.buys().is_empty());
    }

    #[tokio::test]
    async fn test_sell_failure_keeps_position() {
        let h = harness(dec!(1000)).await;
        h.settings.save_settings("BTCUSDT", dec!(100)).await.unwrap();
        h.fake.fail_sell(ExchangeError::FilterRejected("LOT_SIZE".to_string()));

        let record = h.daily.execute_once().await.unwrap();
        assert!(!record.success);
        assert!(record
            .error_message
            .as_deref()
            .unwrap_or("")
            .starts_with("Daily purchase completed but sell order failed"));

        let open = h.db.open_operations().await.unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].sell_order_id.is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(dec!(1000)).await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let daily = Arc::new(h.daily);
        let runner = daily.clone();
        let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
