//! Automation loop - periodic price check and liquidation of positions at target
//!
//! One cycle: fetch price -> claim schedule slot -> close positions at target
//! -> write audit record -> retire the slot -> make sure a next slot exists.
//! The order matters because the audit record references the claimed slot.

use super::schedule::DEFAULT_STALE_CLAIM_AGE;
use super::purchase::positive_price;
use super::{CapitalLedger, ScheduleStateMachine, MANUAL_CYCLE_TIMEOUT};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::types::{ExecutionRecord, OperationType};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

/// What one evaluation cycle did
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub success: bool,
    pub current_price: Option<Decimal>,
    pub scheduled_operation_id: Option<i64>,
    pub closed_operations: usize,
    pub quantity_sold: Decimal,
    pub value_sold: Decimal,
    pub error: Option<String>,
}

impl CycleOutcome {
    fn failed(current_price: Option<Decimal>, scheduled_operation_id: Option<i64>, error: &TradingError) -> Self {
        Self {
            success: false,
            current_price,
            scheduled_operation_id,
            closed_operations: 0,
            quantity_sold: Decimal::ZERO,
            value_sold: Decimal::ZERO,
            error: Some(error.to_string()),
        }
    }
}

pub struct AutomationLoop {
    ledger: CapitalLedger,
    schedule: ScheduleStateMachine,
    gateway: Arc<dyn ExchangeGateway>,
    interval: Duration,
    stale_claim_age: Duration,
}

impl AutomationLoop {
    pub fn new(
        ledger: CapitalLedger,
        schedule: ScheduleStateMachine,
        gateway: Arc<dyn ExchangeGateway>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            schedule,
            gateway,
            interval,
            stale_claim_age: DEFAULT_STALE_CLAIM_AGE,
        }
    }

    fn symbol(&self) -> &str {
        self.ledger.trade_symbol()
    }

    /// Run until the shutdown signal fires
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "[Automation] Started for {} every {} min",
            self.symbol(),
            self.interval.as_secs() / 60
        );

        if let Err(e) = self.schedule.release_stale_claims(self.stale_claim_age).await {
            warn!("[Automation] Could not release stale claims: {}", e);
        }
        self.ensure_next_scheduled().await;

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.run_cycle().await;
                    if !outcome.success {
                        warn!("[Automation] Cycle failed: {}", outcome.error.as_deref().unwrap_or("unknown"));
                    }
                }
                _ = shutdown.recv() => {
                    info!("[Automation] Shutting down");
                    break;
                }
            }
        }
    }

    /// One cycle on demand. The cycle runs on its own task so a caller that
    /// stops waiting never interrupts it between the close and the audit write.
    pub async fn run_manual(self: Arc<Self>) -> TradingResult<CycleOutcome> {
        let cycle = tokio::spawn(async move { self.run_cycle().await });
        match tokio::time::timeout(MANUAL_CYCLE_TIMEOUT, cycle).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(TradingError::Persistence(anyhow::anyhow!("automation cycle task failed: {}", e))),
            Err(_) => {
                warn!("[Automation] Manual cycle still running after {:?}", MANUAL_CYCLE_TIMEOUT);
                Err(TradingError::Gateway(ExchangeError::Timeout("automation cycle".to_string())))
            }
        }
    }

    /// One full evaluation cycle. Failures end up in the audit log, never in a panic.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let symbol = self.symbol().to_string();

        if let Err(e) = self.schedule.release_stale_claims(self.stale_claim_age).await {
            warn!("[Automation] Could not release stale claims: {}", e);
        }

        // 1. Price. A failure ends the cycle before any state changes.
        let current_price = match positive_price(self.gateway.as_ref(), &symbol).await {
            Ok(price) => price,
            Err(e) => {
                error!("[Automation] Could not fetch price for {}: {}", symbol, e);
                self.schedule
                    .log_execution(ExecutionRecord::failure(&symbol, OperationType::Sell, e.to_string()))
                    .await;
                return CycleOutcome::failed(None, None, &e);
            }
        };

        // 2. Claim. Nothing to claim is not an error.
        let claimed_id = match self.schedule.claim_next().await {
            Ok(claimed) => claimed.map(|op| op.id),
            Err(e) => {
                warn!("[Automation] Could not claim scheduled operation: {}", e);
                None
            }
        };

        // 3. Report what is due
        match self.ledger.sale_candidates(current_price).await {
            Ok(due) if due.count > 0 => info!(
                "[Automation] {} position(s) at target for {} @ {}: qty {} value {}",
                due.count, symbol, current_price, due.quantity, due.value
            ),
            Ok(_) => {}
            Err(e) => warn!("[Automation] Could not evaluate open positions: {}", e),
        }

        // 4-6. Close, log, retire
        let outcome = match self.ledger.close_operations_at_or_above_price(current_price).await {
            Ok(closed) => {
                let quantity = closed
                    .iter()
                    .try_fold(Decimal::ZERO, |total, op| total.checked_add(op.quantity))
                    .unwrap_or(Decimal::MAX);
                let record = ExecutionRecord::success(&symbol, OperationType::Sell, current_price, quantity, None)
                    .with_schedule(claimed_id);
                let value_sold = record.total_value;
                self.schedule.log_execution(record).await;

                if !closed.is_empty() {
                    info!(
                        "[Automation] Sold {} position(s) of {} at {} (qty {}, value {})",
                        closed.len(),
                        symbol,
                        current_price,
                        quantity,
                        value_sold
                    );
                }

                CycleOutcome {
                    success: true,
                    current_price: Some(current_price),
                    scheduled_operation_id: claimed_id,
                    closed_operations: closed.len(),
                    quantity_sold: quantity,
                    value_sold,
                    error: None,
                }
            }
            Err(e) => {
                error!("[Automation] Could not close positions at target: {}", e);
                self.schedule
                    .log_execution(
                        ExecutionRecord::failure(&symbol, OperationType::Sell, e.to_string()).with_schedule(claimed_id),
                    )
                    .await;
                CycleOutcome::failed(Some(current_price), claimed_id, &e)
            }
        };

        // The slot is retired whatever happened to the trade
        if let Some(id) = claimed_id {
            if let Err(e) = self.schedule.complete(id).await {
                warn!("[Automation] Could not retire scheduled operation {}: {}", id, e);
            }
        }

        // 7. Re-arm
        self.ensure_next_scheduled().await;

        outcome
    }

    /// Enqueue a slot when an OPEN position exists and no slot is active
    pub async fn ensure_next_scheduled(&self) {
        match self.ledger.find_oldest_open_position(self.symbol()).await {
            Ok(Some(_)) => {
                if let Err(e) = self.schedule.enqueue_if_idle().await {
                    warn!("[Automation] Could not enqueue next scheduled operation: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("[Automation] Could not determine open position for scheduling: {}", e),
        }
    }
}
