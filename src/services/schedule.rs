//! Schedule state machine
//!
//! SCHEDULED -> EXECUTING -> CANCELLED. Every transition is a conditional
//! update in the store, so several engine instances can share one database.
//! A retired slot is never revived; the next cycle gets a fresh row.

use super::{store_call, TradingSettings};
use crate::db::{self, Database};
use crate::error::TradingResult;
use crate::types::{ExecutionRecord, OperationType, Page, ScheduleStatus, ScheduledOperation};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Age after which an EXECUTING claim is considered abandoned
pub const DEFAULT_STALE_CLAIM_AGE: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
pub struct ScheduleStateMachine {
    db: Arc<Database>,
    settings: TradingSettings,
    symbol: String,
    interval: Duration,
}

impl ScheduleStateMachine {
    pub fn new(db: Arc<Database>, settings: TradingSettings, symbol: &str, interval: Duration) -> Self {
        Self {
            db,
            settings,
            symbol: symbol.to_uppercase(),
            interval,
        }
    }

    fn next_execution_time(&self) -> chrono::DateTime<chrono::Utc> {
        let interval = ChronoDuration::from_std(self.interval).unwrap_or_else(|_| ChronoDuration::hours(1));
        db::now() + interval
    }

    /// Insert a new SCHEDULED sell one interval from now
    pub async fn enqueue_next_sell(&self) -> TradingResult<ScheduledOperation> {
        let parameters = self.settings.current().await;
        let scheduled = store_call(
            "enqueue scheduled sell",
            self.db.insert_scheduled(
                &self.symbol,
                parameters.capital_threshold,
                parameters.target_profit_percent,
                OperationType::Sell,
                self.next_execution_time(),
            ),
        )
        .await?;
        info!("[Schedule] Enqueued sell {} for {}", scheduled.id, scheduled.scheduled_for);
        Ok(scheduled)
    }

    /// Enqueue a sell unless one is already SCHEDULED or EXECUTING for the symbol
    pub async fn enqueue_if_idle(&self) -> TradingResult<Option<i64>> {
        let parameters = self.settings.current().await;
        let inserted = store_call(
            "enqueue scheduled sell",
            self.db.insert_scheduled_if_none_active(
                &self.symbol,
                parameters.capital_threshold,
                parameters.target_profit_percent,
                OperationType::Sell,
                self.next_execution_time(),
            ),
        )
        .await?;
        match inserted {
            Some(id) => info!("[Schedule] Enqueued sell {}", id),
            None => debug!("[Schedule] Active slot already present for {}", self.symbol),
        }
        Ok(inserted)
    }

    /// Claim the earliest SCHEDULED row. `None` means nothing to claim.
    pub async fn claim_next(&self) -> TradingResult<Option<ScheduledOperation>> {
        let claimed = store_call("claim scheduled operation", self.db.claim_next_scheduled()).await?;
        if let Some(op) = &claimed {
            info!("[Schedule] Claimed scheduled operation {}", op.id);
        }
        Ok(claimed)
    }

    /// Retire a claimed slot
    pub async fn complete(&self, id: i64) -> TradingResult<()> {
        let retired = store_call(
            "retire scheduled operation",
            self.db.transition_schedule(id, ScheduleStatus::Executing, ScheduleStatus::Cancelled),
        )
        .await?;
        if !retired {
            warn!("[Schedule] Operation {} was not EXECUTING when retired", id);
        }
        Ok(())
    }

    /// Retire EXECUTING claims older than `max_age`
    pub async fn release_stale_claims(&self, max_age: Duration) -> TradingResult<u64> {
        let max_age = ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::minutes(15));
        let released = store_call("release stale claims", self.db.cancel_executing_before(db::now() - max_age)).await?;
        if released > 0 {
            warn!("[Schedule] Retired {} stale EXECUTING operation(s)", released);
        }
        Ok(released)
    }

    /// Best-effort audit write; a failure is logged and never propagated
    pub async fn log_execution(&self, record: ExecutionRecord) -> Option<i64> {
        match store_call("write execution record", self.db.insert_execution(&record)).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(
                    "[Schedule] Could not write {} execution record (success={}): {}",
                    record.operation_type, record.success, e
                );
                None
            }
        }
    }

    pub async fn list_recent(
        &self,
        limit: u32,
        operation_type: Option<OperationType>,
    ) -> TradingResult<Vec<ExecutionRecord>> {
        store_call("list executions", self.db.list_executions(limit, operation_type)).await
    }

    pub async fn list_page(
        &self,
        page_size: u32,
        page: u32,
        operation_type: Option<OperationType>,
    ) -> TradingResult<Page<ExecutionRecord>> {
        store_call("list executions page", self.db.list_executions_page(page_size, page, operation_type)).await
    }

    pub async fn list_scheduled(&self, limit: u32) -> TradingResult<Vec<ScheduledOperation>> {
        store_call("list scheduled operations", self.db.list_scheduled(limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::TradingParameters;
    use rust_decimal_macros::dec;

    async fn machine() -> ScheduleStateMachine {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let settings = TradingSettings::new(TradingParameters {
            capital_threshold: dec!(100),
            target_profit_percent: dec!(10),
        });
        ScheduleStateMachine::new(db, settings, "BTCUSDT", Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let schedule = machine().await;
        let enqueued = schedule.enqueue_next_sell().await.unwrap();
        assert_eq!(enqueued.status, ScheduleStatus::Scheduled);
        assert_eq!(enqueued.capital_threshold, dec!(100));
        assert!(enqueued.scheduled_for > enqueued.created_at);

        let claimed = schedule.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, enqueued.id);
        assert_eq!(claimed.status, ScheduleStatus::Executing);
        assert!(schedule.claim_next().await.unwrap().is_none());

        schedule.complete(claimed.id).await.unwrap();
        let stored = schedule.db.get_scheduled(claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);

        // Completing twice is harmless
        schedule.complete(claimed.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_winner() {
        let schedule = machine().await;
        schedule.enqueue_next_sell().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let schedule = schedule.clone();
            handles.push(tokio::spawn(async move { schedule.claim_next().await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_enqueue_if_idle_respects_executing() {
        let schedule = machine().await;
        assert!(schedule.enqueue_if_idle().await.unwrap().is_some());
        schedule.claim_next().await.unwrap().unwrap();
        // Still active while EXECUTING
        assert!(schedule.enqueue_if_idle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let schedule = machine().await;
        schedule.enqueue_next_sell().await.unwrap();
        schedule.claim_next().await.unwrap().unwrap();

        assert_eq!(schedule.release_stale_claims(DEFAULT_STALE_CLAIM_AGE).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(schedule.release_stale_claims(Duration::from_millis(1)).await.unwrap(), 1);
        assert!(schedule.enqueue_if_idle().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_log_execution_and_listing() {
        let schedule = machine().await;
        let record =
            ExecutionRecord::success("BTCUSDT", OperationType::Sell, dec!(111), dec!(1), None).with_schedule(Some(7));
        assert!(schedule.log_execution(record).await.is_some());
        schedule
            .log_execution(ExecutionRecord::failure("BTCUSDT", OperationType::Buy, "rejected"))
            .await;

        let all = schedule.list_recent(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let sells = schedule.list_recent(10, Some(OperationType::Sell)).await.unwrap();
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].scheduled_operation_id, Some(7));
        assert_eq!(sells[0].total_value, dec!(111));

        let page = schedule.list_page(1, 1, None).await.unwrap();
        assert!(page.has_next);
    }
}
