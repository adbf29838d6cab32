//! Purchase flow - market buy by quote, protective limit sell, ledger record
//!
//! The exchange has no combined buy+sell order. When the protective sell fails
//! after a filled buy, the position is still recorded and the sell failure is
//! reported alongside it.

use super::{
    exchange_call, CapitalLedger, CredentialManager, ScheduleStateMachine, SymbolCatalogue, TradingSettings,
    ORDER_TIMEOUT, PRICE_TIMEOUT,
};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeError, ExchangeGateway, MarketBuyFill, PlacedOrder, SymbolFilters};
use crate::types::{target_price_for, ExecutionRecord, NewPurchase, OperationType, TradingOperation};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result of a filled buy and its protective sell attempt
pub(crate) struct ProtectedBuy {
    pub fill: MarketBuyFill,
    pub realized_price: Decimal,
    pub target_sell_price: Decimal,
    /// Executed quantity rounded down to the lot size
    pub sell_quantity: Decimal,
    pub sell: TradingResult<PlacedOrder>,
}

/// Quantity and price of the protective sell on the symbol's increments.
/// The price rounds up so the order never rests below target.
pub(crate) fn protective_sell_terms(
    filters: &SymbolFilters,
    executed_quantity: Decimal,
    realized_price: Decimal,
    target_profit_percent: Decimal,
) -> TradingResult<(Decimal, Decimal)> {
    let price = target_price_for(realized_price, target_profit_percent)
        .and_then(|target| filters.price_at_or_above(target))
        .ok_or_else(|| TradingError::validation("Target sell price is out of range"))?;
    let quantity = filters.quantity_at_or_below(executed_quantity).unwrap_or(Decimal::ZERO);
    if quantity <= Decimal::ZERO || quantity < filters.min_quantity {
        return Err(TradingError::validation(format!(
            "Filled quantity {} is below the minimum lot size {}",
            executed_quantity, filters.min_quantity
        )));
    }
    Ok((quantity, price))
}

/// Market buy `quote_amount` of `symbol`, then place a limit sell for the
/// executed quantity at the target. Only the buy can fail the call.
pub(crate) async fn buy_with_protective_sell(
    gateway: &dyn ExchangeGateway,
    symbols: &SymbolCatalogue,
    symbol: &str,
    quote_amount: Decimal,
    ticker_price: Decimal,
    target_profit_percent: Decimal,
) -> TradingResult<ProtectedBuy> {
    // Loaded before the buy so missing metadata cannot strand a fill
    let filters = symbols.filters(symbol).await?;

    let fill = exchange_call(
        "market buy",
        ORDER_TIMEOUT,
        gateway.place_market_buy_by_quote(symbol, quote_amount),
    )
    .await?;

    if fill.executed_quantity <= Decimal::ZERO {
        return Err(TradingError::Gateway(ExchangeError::MalformedResponse(
            "exchange returned an invalid executed quantity".to_string(),
        )));
    }

    let realized_price = fill.realized_price(ticker_price);
    let terms = protective_sell_terms(&filters, fill.executed_quantity, realized_price, target_profit_percent);
    let (sell_quantity, target_sell_price, sell) = match terms {
        Ok((quantity, price)) => {
            let sell = exchange_call(
                "limit sell",
                ORDER_TIMEOUT,
                gateway.place_limit_sell(symbol, quantity, price),
            )
            .await;
            (quantity, price, sell)
        }
        Err(e) => {
            let target = target_price_for(realized_price, target_profit_percent).unwrap_or(realized_price);
            (Decimal::ZERO, target, Err(e))
        }
    };

    Ok(ProtectedBuy {
        fill,
        realized_price,
        target_sell_price,
        sell_quantity,
        sell,
    })
}

/// Price lookup that rejects non-positive tickers
pub(crate) async fn positive_price(gateway: &dyn ExchangeGateway, symbol: &str) -> TradingResult<Decimal> {
    let price = exchange_call("price lookup", PRICE_TIMEOUT, gateway.current_price(symbol)).await?;
    if price <= Decimal::ZERO {
        return Err(TradingError::Gateway(ExchangeError::MalformedResponse(format!(
            "current price is unavailable for {}",
            symbol
        ))));
    }
    Ok(price)
}

/// What a purchase request produced
#[derive(Debug, Clone, Serialize)]
pub struct PurchaseReceipt {
    pub operation: TradingOperation,
    pub buy_order_id: String,
    pub sell_order_id: Option<String>,
    pub realized_price: Decimal,
    pub target_sell_price: Decimal,
    /// Set when the buy went through but the protective sell did not
    pub sell_error: Option<String>,
}

#[derive(Clone)]
pub struct PurchaseService {
    credentials: Arc<CredentialManager>,
    ledger: CapitalLedger,
    schedule: ScheduleStateMachine,
    gateway: Arc<dyn ExchangeGateway>,
    symbols: SymbolCatalogue,
    settings: TradingSettings,
}

impl PurchaseService {
    pub fn new(
        credentials: Arc<CredentialManager>,
        ledger: CapitalLedger,
        schedule: ScheduleStateMachine,
        gateway: Arc<dyn ExchangeGateway>,
        symbols: SymbolCatalogue,
        settings: TradingSettings,
    ) -> Self {
        Self {
            credentials,
            ledger,
            schedule,
            gateway,
            symbols,
            settings,
        }
    }

    pub async fn execute_purchase(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        target_profit_percent: Option<Decimal>,
    ) -> TradingResult<PurchaseReceipt> {
        self.credentials.require_valid().await?;
        let symbol = self.ledger.ensure_trade_symbol(symbol)?;
        if quote_amount <= Decimal::ZERO {
            return Err(TradingError::validation("Purchase amount must be greater than zero"));
        }
        let target_profit_percent = match target_profit_percent {
            Some(p) if p <= Decimal::ZERO => {
                return Err(TradingError::validation("Target profit percent must be greater than zero"))
            }
            Some(p) => p,
            None => self.settings.current().await.target_profit_percent,
        };

        // Nothing reaches the exchange when the cap would be breached
        self.ledger.ensure_capital_available(quote_amount).await?;

        let ticker_price = positive_price(self.gateway.as_ref(), &symbol).await?;

        let bought = match buy_with_protective_sell(
            self.gateway.as_ref(),
            &self.symbols,
            &symbol,
            quote_amount,
            ticker_price,
            target_profit_percent,
        )
        .await
        {
            Ok(bought) => bought,
            Err(e) => {
                error!("[Purchase] Buy failed for {}: {}", symbol, e);
                self.schedule
                    .log_execution(ExecutionRecord::failure(&symbol, OperationType::Buy, format!("Buy failed: {}", e)))
                    .await;
                return Err(e);
            }
        };

        let quantity = bought.fill.executed_quantity;
        let (sell_order_id, sell_error) = match &bought.sell {
            Ok(order) => {
                self.schedule
                    .log_execution(ExecutionRecord::success(
                        &symbol,
                        OperationType::Sell,
                        bought.target_sell_price,
                        bought.sell_quantity,
                        Some(order.order_id.clone()),
                    ))
                    .await;
                (Some(order.order_id.clone()), None)
            }
            Err(e) => {
                warn!("[Purchase] Sell order placement failed for {}: {}", symbol, e);
                self.schedule
                    .log_execution(ExecutionRecord::failure(&symbol, OperationType::Sell, e.to_string()))
                    .await;
                (None, Some(e.to_string()))
            }
        };

        let operation = match self
            .ledger
            .record_purchase(NewPurchase {
                symbol: symbol.clone(),
                quantity,
                purchase_price: bought.realized_price,
                target_profit_percent: Some(target_profit_percent),
                buy_order_id: Some(bought.fill.order_id.clone()),
                sell_order_id: sell_order_id.clone(),
            })
            .await
        {
            Ok(operation) => operation,
            Err(e) => {
                // Filled on the exchange but not tracked locally
                error!(
                    "[Purchase] Buy order {} filled but could not be recorded: {}",
                    bought.fill.order_id, e
                );
                self.schedule
                    .log_execution(ExecutionRecord::failure(
                        &symbol,
                        OperationType::Buy,
                        format!("Buy order {} could not be recorded: {}", bought.fill.order_id, e),
                    ))
                    .await;
                return Err(e);
            }
        };

        self.schedule
            .log_execution(ExecutionRecord::success(
                &symbol,
                OperationType::Buy,
                bought.realized_price,
                quantity,
                Some(bought.fill.order_id.clone()),
            ))
            .await;

        if let Err(e) = self.schedule.enqueue_if_idle().await {
            warn!("[Purchase] Could not schedule liquidation check: {}", e);
        }

        info!(
            "[Purchase] Bought {} {} @ {} (operation {}, target {})",
            quantity, symbol, bought.realized_price, operation.id, bought.target_sell_price
        );

        Ok(PurchaseReceipt {
            operation,
            buy_order_id: bought.fill.order_id,
            sell_order_id,
            realized_price: bought.realized_price,
            target_sell_price: bought.target_sell_price,
            sell_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use crate::services::{CredentialStore, SymbolCatalogue, TradingParameters};
    use crate::testing::FakeExchange;
    use crate::types::OperationStatus;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        db: Arc<Database>,
        fake: Arc<FakeExchange>,
        schedule: ScheduleStateMachine,
        credentials: Arc<CredentialManager>,
        service: PurchaseService,
    }

    async fn harness(threshold: Decimal) -> Harness {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let fake = Arc::new(FakeExchange::with_price(dec!(100)));
        let settings = TradingSettings::new(TradingParameters {
            capital_threshold: threshold,
            target_profit_percent: dec!(10),
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
        let ledger = CapitalLedger::new(db.clone(), settings.clone(), "BTCUSDT");
        let schedule = ScheduleStateMachine::new(db.clone(), settings.clone(), "BTCUSDT", Duration::from_secs(3600));
        let service = PurchaseService::new(
            credentials.clone(),
            ledger,
            schedule.clone(),
            fake.clone(),
            symbols,
            settings,
        );
        Harness {
            db,
            fake,
            schedule,
            credentials,
            service,
        }
    }

    async fn validated(threshold: Decimal) -> Harness {
        let h = harness(threshold).await;
        h.credentials
            .validate_and_persist("test-api-key-0001", "test-api-secret-0001", "testnet")
            .await
            .unwrap();
        h
    }

    #[tokio::test]
    async fn test_purchase_records_position_and_sell() {
        let h = validated(dec!(1000)).await;
        let receipt = h.service.execute_purchase("btcusdt", dec!(50), None).await.unwrap();

        assert_eq!(receipt.realized_price, dec!(100));
        assert_eq!(receipt.target_sell_price, dec!(110));
        assert!(receipt.sell_error.is_none());
        assert_eq!(receipt.operation.quantity, dec!(0.5));
        assert_eq!(receipt.operation.status, OperationStatus::Open);
        assert_eq!(receipt.operation.buy_order_id.as_deref(), Some(receipt.buy_order_id.as_str()));
        assert_eq!(receipt.operation.sell_order_id, receipt.sell_order_id);

        assert_eq!(h.fake.sells(), vec![("BTCUSDT".to_string(), dec!(0.5), dec!(110))]);

        let buys = h.schedule.list_recent(10, Some(OperationType::Buy)).await.unwrap();
        assert_eq!(buys.len(), 1);
        assert!(buys[0].success);
        assert_eq!(buys[0].total_value, dec!(50));
        let sells = h.schedule.list_recent(10, Some(OperationType::Sell)).await.unwrap();
        assert_eq!(sells[0].unit_price, dec!(110));
        assert_eq!(sells[0].total_value, dec!(55));

        assert_eq!(h.db.count_active_scheduled("BTCUSDT").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_protective_sell_uses_symbol_increments() {
        let h = validated(dec!(1000)).await;
        h.fake.set_buy_fill(MarketBuyFill {
            order_id: "42".to_string(),
            executed_quantity: dec!(0.000379),
            cumulative_quote: dec!(25),
        });

        let receipt = h.service.execute_purchase("BTCUSDT", dec!(25), None).await.unwrap();
        assert!(receipt.sell_error.is_none());
        assert_eq!(receipt.operation.quantity, dec!(0.000379));

        let (_, quantity, price) = h.fake.sells()[0].clone();
        assert_eq!(quantity, dec!(0.00037));
        assert_eq!(price, receipt.target_sell_price);
        assert_eq!(price % dec!(0.01), Decimal::ZERO);
        assert!(price >= receipt.operation.target_price());
    }

    #[test]
    fn test_sell_terms_reject_dust() {
        let filters = crate::testing::DEFAULT_FILTERS;
        let err = protective_sell_terms(&filters, dec!(0.000009), dec!(100), dec!(10)).unwrap_err();
        assert!(matches!(err, TradingError::Validation(_)));

        let (quantity, price) = protective_sell_terms(&filters, dec!(0.5), dec!(100.001), dec!(10)).unwrap();
        assert_eq!(quantity, dec!(0.5));
        assert_eq!(price, dec!(110.01));
    }

    #[tokio::test]
    async fn test_gate_blocks_without_credentials() {
        let h = harness(dec!(1000)).await;
        let err = h.service.execute_purchase("BTCUSDT", dec!(50), None).await.unwrap_err();
        assert!(matches!(err, TradingError::CredentialsUnavailable));
        assert!(h.fake.buys().is_empty());
    }

    #[tokio::test]
    async fn test_capital_precheck_skips_exchange() {
        let h = validated(dec!(100)).await;
        let err = h.service.execute_purchase("BTCUSDT", dec!(150), None).await.unwrap_err();
        assert!(matches!(err, TradingError::CapitalExceeded { .. }));
        assert!(h.fake.buys().is_empty());
        assert_eq!(h.fake.price_calls(), 0);
    }

    #[tokio::test]
    async fn test_sell_failure_still_records_buy() {
        let h = validated(dec!(1000)).await;
        h.fake.fail_sell(ExchangeError::FilterRejected("PRICE_FILTER".to_string()));

        let receipt = h.service.execute_purchase("BTCUSDT", dec!(50), Some(dec!(20))).await.unwrap();
        assert!(receipt.sell_error.is_some());
        assert!(receipt.sell_order_id.is_none());
        assert_eq!(receipt.target_sell_price, dec!(120));
        assert_eq!(receipt.operation.target_profit_percent, dec!(20));

        let sells = h.schedule.list_recent(10, Some(OperationType::Sell)).await.unwrap();
        assert!(!sells[0].success);
        let buys = h.schedule.list_recent(10, Some(OperationType::Buy)).await.unwrap();
        assert!(buys[0].success);
    }

    #[tokio::test]
    async fn test_buy_failure_is_logged() {
        let h = validated(dec!(1000)).await;
        h.fake.fail_buy(ExchangeError::InsufficientBalance);

        let err = h.service.execute_purchase("BTCUSDT", dec!(50), None).await.unwrap_err();
        assert!(matches!(err, TradingError::Gateway(ExchangeError::InsufficientBalance)));
        assert!(h.fake.sells().is_empty());

        let records = h.schedule.list_recent(10, None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_type, OperationType::Buy);
        assert!(!records[0].success);
        assert_eq!(h.db.open_allocation_total().await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_empty_fill_is_rejected() {
        let h = validated(dec!(1000)).await;
        h.fake.set_buy_fill(MarketBuyFill {
            order_id: "7".to_string(),
            executed_quantity: Decimal::ZERO,
            cumulative_quote: Decimal::ZERO,
        });
        let err = h.service.execute_purchase("BTCUSDT", dec!(50), None).await.unwrap_err();
        assert!(matches!(err, TradingError::Gateway(ExchangeError::MalformedResponse(_))));
        assert!(h.fake.sells().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let h = validated(dec!(1000)).await;
        assert!(matches!(
            h.service.execute_purchase("ETHUSDT", dec!(50), None).await,
            Err(TradingError::Validation(_))
        ));
        assert!(matches!(
            h.service.execute_purchase("BTCUSDT", dec!(0), None).await,
            Err(TradingError::Validation(_))
        ));
        assert!(matches!(
            h.service.execute_purchase("BTCUSDT", dec!(10), Some(dec!(-1))).await,
            Err(TradingError::Validation(_))
        ));
    }
}
