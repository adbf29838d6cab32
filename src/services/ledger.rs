//! Capital ledger - owns trading operations and the allocation cap
//!
//! The sum of `quantity * purchase_price` over OPEN operations never exceeds
//! the capital threshold. The check and the insert share one transaction.

use super::{store_call, TradingSettings};
use crate::db::{self, AllocationOutcome, Database};
use crate::error::{TradingError, TradingResult};
use crate::types::{target_price_for, NewPurchase, OperationStatus, Page, TradingOperation};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// Positions that reached target at a given price
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaleCandidates {
    pub count: usize,
    pub quantity: Decimal,
    pub value: Decimal,
}

#[derive(Clone)]
pub struct CapitalLedger {
    db: Arc<Database>,
    settings: TradingSettings,
    trade_symbol: String,
}

impl CapitalLedger {
    pub fn new(db: Arc<Database>, settings: TradingSettings, trade_symbol: &str) -> Self {
        Self {
            db,
            settings,
            trade_symbol: trade_symbol.to_uppercase(),
        }
    }

    pub fn trade_symbol(&self) -> &str {
        &self.trade_symbol
    }

    /// Reject symbols other than the configured pair
    pub fn ensure_trade_symbol(&self, symbol: &str) -> TradingResult<String> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(TradingError::validation("Symbol is required"));
        }
        if symbol != self.trade_symbol {
            return Err(TradingError::validation(format!(
                "Only {} can be traded, got {}",
                self.trade_symbol, symbol
            )));
        }
        Ok(symbol)
    }

    /// Persist a purchase as OPEN if it fits under the capital threshold
    pub async fn record_purchase(&self, purchase: NewPurchase) -> TradingResult<TradingOperation> {
        let symbol = self.ensure_trade_symbol(&purchase.symbol)?;
        if purchase.quantity <= Decimal::ZERO {
            return Err(TradingError::validation("Quantity must be greater than zero"));
        }
        if purchase.purchase_price <= Decimal::ZERO {
            return Err(TradingError::validation("Purchase price must be greater than zero"));
        }

        let parameters = self.settings.current().await;
        let target_profit_percent = purchase
            .target_profit_percent
            .filter(|p| *p > Decimal::ZERO)
            .unwrap_or(parameters.target_profit_percent);
        let purchase_value = purchase
            .purchase_value()
            .ok_or_else(|| TradingError::validation("Purchase value is out of range"))?;
        let target_sell_price = target_price_for(purchase.purchase_price, target_profit_percent)
            .ok_or_else(|| TradingError::validation("Target sell price is out of range"))?;

        let purchase = NewPurchase { symbol, ..purchase };
        let outcome = store_call(
            "record purchase",
            self.db.insert_operation_within_capital(
                &purchase,
                target_profit_percent,
                target_sell_price,
                parameters.capital_threshold,
            ),
        )
        .await?;

        match outcome {
            AllocationOutcome::Recorded(operation) => {
                info!(
                    "[Ledger] Recorded operation {}: {} {} @ {} (target {})",
                    operation.id, operation.quantity, operation.symbol, operation.purchase_price, target_sell_price
                );
                Ok(operation)
            }
            AllocationOutcome::Exceeded { open_total } => {
                warn!(
                    "[Ledger] Purchase of {} rejected: open allocation {} / threshold {}",
                    purchase_value, open_total, parameters.capital_threshold
                );
                Err(TradingError::CapitalExceeded {
                    open_total,
                    requested: purchase_value,
                    threshold: parameters.capital_threshold,
                })
            }
        }
    }

    /// Pre-flight check for an order of `amount` quote value, before any exchange call
    pub async fn ensure_capital_available(&self, amount: Decimal) -> TradingResult<()> {
        let threshold = self.settings.current().await.capital_threshold;
        let open_total = self.open_allocation_total().await?;
        if !open_total.checked_add(amount).is_some_and(|total| total <= threshold) {
            return Err(TradingError::CapitalExceeded {
                open_total,
                requested: amount,
                threshold,
            });
        }
        Ok(())
    }

    pub async fn open_allocation_total(&self) -> TradingResult<Decimal> {
        store_call("open allocation total", self.db.open_allocation_total()).await
    }

    pub async fn open_operations(&self) -> TradingResult<Vec<TradingOperation>> {
        store_call("load open operations", self.db.open_operations()).await
    }

    /// In-memory summary of what `close_operations_at_or_above_price` would sell
    pub async fn sale_candidates(&self, current_price: Decimal) -> TradingResult<SaleCandidates> {
        let open = self.open_operations().await?;
        let mut due = SaleCandidates::default();
        for op in open.iter().filter(|op| op.has_reached_target(current_price)) {
            let value = op.quantity.checked_mul(current_price);
            match (due.quantity.checked_add(op.quantity), value.and_then(|v| due.value.checked_add(v))) {
                (Some(quantity), Some(value)) => {
                    due.count += 1;
                    due.quantity = quantity;
                    due.value = value;
                }
                _ => return Err(TradingError::validation("Sale value is out of range")),
            }
        }
        Ok(due)
    }

    /// Close every OPEN operation whose target is at or below `current_price`.
    ///
    /// Every eligible row is attempted; the first failure is returned after the
    /// rest have been tried. Returns the operations this call closed.
    pub async fn close_operations_at_or_above_price(
        &self,
        current_price: Decimal,
    ) -> TradingResult<Vec<TradingOperation>> {
        let open = self.open_operations().await?;
        let mut closed = Vec::new();
        let mut first_error: Option<TradingError> = None;

        for mut operation in open.into_iter().filter(|op| op.has_reached_target(current_price)) {
            let sold_at = db::now();
            let marked = store_call(
                "close operation",
                self.db.mark_operation_sold(operation.id, current_price, sold_at),
            )
            .await;
            match marked {
                Ok(true) => {
                    info!(
                        "[Ledger] Operation {} sold at {} (target {})",
                        operation.id,
                        current_price,
                        operation.target_price()
                    );
                    operation.status = OperationStatus::Sold;
                    operation.sell_price = Some(current_price);
                    operation.sold_at = Some(sold_at);
                    closed.push(operation);
                }
                // Closed concurrently by another cycle
                Ok(false) => {}
                Err(e) => {
                    warn!("[Ledger] Failed to close operation {}: {}", operation.id, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }

    pub async fn find_oldest_open_position(&self, symbol: &str) -> TradingResult<Option<TradingOperation>> {
        store_call("oldest open position", self.db.oldest_open_operation(&symbol.to_uppercase())).await
    }

    pub async fn list_operations(&self, limit: u32) -> TradingResult<Vec<TradingOperation>> {
        store_call("list operations", self.db.list_operations(limit)).await
    }

    pub async fn list_operations_page(&self, page_size: u32, page: u32) -> TradingResult<Page<TradingOperation>> {
        store_call("list operations page", self.db.list_operations_page(page_size, page)).await
    }
}
