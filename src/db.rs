//! SQLite store for trading operations, schedules, audit records and credentials

use crate::types::{
    CredentialRecord, DailyPurchaseSettings, ExchangeEnvironment, ExecutionRecord, NewPurchase,
    OperationStatus, OperationType, Page, PriceAlert, ScheduleStatus, ScheduledOperation,
    TradingOperation,
};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Fixed-width RFC 3339 so that lexical order is chronological order
pub fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at the precision the store keeps
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {:?}", s))?
        .with_timezone(&Utc))
}

fn parse_dec(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("bad decimal {:?}", s))
}

fn opt_dec(row: &SqliteRow, col: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.as_deref().map(parse_dec).transpose()
}

fn opt_ts(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.as_deref().map(parse_ts).transpose()
}

fn dec(row: &SqliteRow, col: &str) -> Result<Decimal> {
    let raw: String = row.try_get(col)?;
    parse_dec(&raw)
}

fn time(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>> {
    let raw: String = row.try_get(col)?;
    parse_ts(&raw)
}

/// Result of an atomic capital-checked insert
#[derive(Debug)]
pub enum AllocationOutcome {
    Recorded(TradingOperation),
    /// Nothing was written; `open_total` excludes the rejected purchase
    Exceeded { open_total: Decimal },
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Private in-memory database on a single pinned connection
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.initialize().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trading_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                quantity TEXT NOT NULL,
                purchase_price TEXT NOT NULL,
                target_profit_percent TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'OPEN',
                sell_price TEXT,
                buy_order_id TEXT,
                sell_order_id TEXT,
                target_sell_price TEXT,
                purchased_at TEXT NOT NULL,
                sold_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_operations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                capital_threshold TEXT NOT NULL,
                target_profit_percent TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                scheduled_for TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'SCHEDULED',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scheduled_operation_id INTEGER,
                symbol TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                unit_price TEXT NOT NULL,
                quantity TEXT NOT NULL,
                total_value TEXT NOT NULL,
                executed_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                order_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchange_credentials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                api_key TEXT NOT NULL,
                api_secret TEXT NOT NULL,
                environment TEXT NOT NULL,
                api_base_url TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_purchase_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                quote_amount TEXT NOT NULL,
                execution_hour_utc INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS price_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient TEXT NOT NULL,
                symbol TEXT NOT NULL,
                min_threshold TEXT NOT NULL,
                max_threshold TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                triggered_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_operations_status ON trading_operations(status, purchased_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_schedule_status ON scheduled_operations(status, scheduled_for)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_schedule_symbol ON scheduled_operations(symbol, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_executions_time ON execution_records(executed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_credentials_env ON exchange_credentials(environment, is_active)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_active ON price_alerts(is_active)")
            .execute(&self.pool)
            .await?;

        info!("Database initialized");
        Ok(())
    }

    // ==================== TRADING OPERATIONS ====================

    /// Sum of `quantity * purchase_price` over OPEN operations
    pub async fn open_allocation_total(&self) -> Result<Decimal> {
        let rows = sqlx::query("SELECT quantity, purchase_price FROM trading_operations WHERE status = 'OPEN'")
            .fetch_all(&self.pool)
            .await?;
        sum_allocation(&rows)
    }

    /// Insert an OPEN operation only if the open allocation stays within `threshold`.
    ///
    /// The insert happens first so the transaction holds the write lock while
    /// the total is computed; an over-threshold total rolls it back.
    pub async fn insert_operation_within_capital(
        &self,
        purchase: &NewPurchase,
        target_profit_percent: Decimal,
        target_sell_price: Decimal,
        threshold: Decimal,
    ) -> Result<AllocationOutcome> {
        let value = purchase.purchase_value().context("purchase value is out of range")?;
        let purchased_at = now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO trading_operations
                (symbol, quantity, purchase_price, target_profit_percent, status,
                 buy_order_id, sell_order_id, target_sell_price, purchased_at)
            VALUES (?, ?, ?, ?, 'OPEN', ?, ?, ?, ?)
            "#,
        )
        .bind(&purchase.symbol)
        .bind(purchase.quantity.to_string())
        .bind(purchase.purchase_price.to_string())
        .bind(target_profit_percent.to_string())
        .bind(&purchase.buy_order_id)
        .bind(&purchase.sell_order_id)
        .bind(target_sell_price.to_string())
        .bind(ts(&purchased_at))
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        let rows = sqlx::query(
            "SELECT quantity, purchase_price FROM trading_operations WHERE status = 'OPEN' AND id != ?",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;
        let open_total = sum_allocation(&rows)?;

        // An overflowing total cannot fit under any threshold
        let fits = open_total.checked_add(value).is_some_and(|total| total <= threshold);
        if !fits {
            tx.rollback().await?;
            return Ok(AllocationOutcome::Exceeded { open_total });
        }

        tx.commit().await?;

        Ok(AllocationOutcome::Recorded(TradingOperation {
            id,
            symbol: purchase.symbol.clone(),
            quantity: purchase.quantity,
            purchase_price: purchase.purchase_price,
            target_profit_percent,
            status: OperationStatus::Open,
            sell_price: None,
            buy_order_id: purchase.buy_order_id.clone(),
            sell_order_id: purchase.sell_order_id.clone(),
            target_sell_price: Some(target_sell_price),
            purchased_at,
            sold_at: None,
        }))
    }

    /// Mark an OPEN operation SOLD. Returns false if it was not OPEN.
    pub async fn mark_operation_sold(&self, id: i64, sell_price: Decimal, sold_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE trading_operations SET status = 'SOLD', sell_price = ?, sold_at = ? \
             WHERE id = ? AND status = 'OPEN'",
        )
        .bind(sell_price.to_string())
        .bind(ts(&sold_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// All OPEN operations, oldest first
    pub async fn open_operations(&self) -> Result<Vec<TradingOperation>> {
        let rows = sqlx::query("SELECT * FROM trading_operations WHERE status = 'OPEN' ORDER BY purchased_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_operation).collect()
    }

    pub async fn oldest_open_operation(&self, symbol: &str) -> Result<Option<TradingOperation>> {
        let row = sqlx::query(
            "SELECT * FROM trading_operations WHERE status = 'OPEN' AND symbol = ? ORDER BY purchased_at, id LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_operation).transpose()
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<TradingOperation>> {
        let row = sqlx::query("SELECT * FROM trading_operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_operation).transpose()
    }

    /// Most recent operations first
    pub async fn list_operations(&self, limit: u32) -> Result<Vec<TradingOperation>> {
        let rows = sqlx::query("SELECT * FROM trading_operations ORDER BY purchased_at DESC, id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_operation).collect()
    }

    pub async fn list_operations_page(&self, page_size: u32, page: u32) -> Result<Page<TradingOperation>> {
        let (page, offset) = crate::types::page_offset(page, page_size);
        let rows = sqlx::query(
            "SELECT * FROM trading_operations ORDER BY purchased_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(page_size as i64 + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(row_to_operation).collect::<Result<Vec<_>>>()?;
        Ok(Page::from_overfetch(items, page, page_size))
    }

    // ==================== SCHEDULED OPERATIONS ====================

    /// Unconditionally insert a SCHEDULED row
    pub async fn insert_scheduled(
        &self,
        symbol: &str,
        capital_threshold: Decimal,
        target_profit_percent: Decimal,
        operation_type: OperationType,
        scheduled_for: DateTime<Utc>,
    ) -> Result<ScheduledOperation> {
        let created_at = now();
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_operations
                (symbol, capital_threshold, target_profit_percent, operation_type, scheduled_for, status,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'SCHEDULED', ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(capital_threshold.to_string())
        .bind(target_profit_percent.to_string())
        .bind(operation_type.as_str())
        .bind(ts(&scheduled_for))
        .bind(ts(&created_at))
        .bind(ts(&created_at))
        .execute(&self.pool)
        .await?;

        Ok(ScheduledOperation {
            id: result.last_insert_rowid(),
            symbol: symbol.to_string(),
            capital_threshold,
            target_profit_percent,
            operation_type,
            scheduled_for,
            status: ScheduleStatus::Scheduled,
            created_at,
            updated_at: created_at,
        })
    }

    /// Insert a SCHEDULED row unless the symbol already has a SCHEDULED or
    /// EXECUTING one. Single statement, so concurrent callers cannot both insert.
    pub async fn insert_scheduled_if_none_active(
        &self,
        symbol: &str,
        capital_threshold: Decimal,
        target_profit_percent: Decimal,
        operation_type: OperationType,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let created_at = ts(&now());
        let result = sqlx::query(
            r#"
            INSERT INTO scheduled_operations
                (symbol, capital_threshold, target_profit_percent, operation_type, scheduled_for, status,
                 created_at, updated_at)
            SELECT ?, ?, ?, ?, ?, 'SCHEDULED', ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM scheduled_operations
                WHERE symbol = ? AND status IN ('SCHEDULED', 'EXECUTING')
            )
            "#,
        )
        .bind(symbol)
        .bind(capital_threshold.to_string())
        .bind(target_profit_percent.to_string())
        .bind(operation_type.as_str())
        .bind(ts(&scheduled_for))
        .bind(&created_at)
        .bind(&created_at)
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    /// Claim the earliest SCHEDULED row by moving it to EXECUTING.
    ///
    /// The update is conditional on the row still being SCHEDULED, so across
    /// any number of callers (and processes) exactly one wins a given row.
    pub async fn claim_next_scheduled(&self) -> Result<Option<ScheduledOperation>> {
        loop {
            let candidate = sqlx::query(
                "SELECT * FROM scheduled_operations WHERE status = 'SCHEDULED' ORDER BY scheduled_for, id LIMIT 1",
            )
            .fetch_optional(&self.pool)
            .await?;

            let Some(row) = candidate else {
                return Ok(None);
            };
            let mut op = row_to_scheduled(&row)?;

            let claimed_at = now();
            let result = sqlx::query(
                "UPDATE scheduled_operations SET status = 'EXECUTING', updated_at = ? \
                 WHERE id = ? AND status = 'SCHEDULED'",
            )
            .bind(ts(&claimed_at))
            .bind(op.id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                op.status = ScheduleStatus::Executing;
                op.updated_at = claimed_at;
                return Ok(Some(op));
            }

            // Another caller took it between select and update; look again
            debug!("Scheduled operation {} claimed elsewhere", op.id);
        }
    }

    /// Compare-and-set a schedule status. Returns false if the row was not in `from`.
    pub async fn transition_schedule(&self, id: i64, from: ScheduleStatus, to: ScheduleStatus) -> Result<bool> {
        let result =
            sqlx::query("UPDATE scheduled_operations SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(ts(&now()))
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Retire EXECUTING rows last touched before `cutoff`
    pub async fn cancel_executing_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scheduled_operations SET status = 'CANCELLED', updated_at = ? \
             WHERE status = 'EXECUTING' AND updated_at < ?",
        )
        .bind(ts(&now()))
        .bind(ts(&cutoff))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_scheduled(&self, id: i64) -> Result<Option<ScheduledOperation>> {
        let row = sqlx::query("SELECT * FROM scheduled_operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_scheduled).transpose()
    }

    /// Count SCHEDULED or EXECUTING rows for a symbol
    pub async fn count_active_scheduled(&self, symbol: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM scheduled_operations WHERE symbol = ? AND status IN ('SCHEDULED', 'EXECUTING')",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Most recently created first
    pub async fn list_scheduled(&self, limit: u32) -> Result<Vec<ScheduledOperation>> {
        let rows = sqlx::query("SELECT * FROM scheduled_operations ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_scheduled).collect()
    }

    // ==================== EXECUTION RECORDS ====================

    pub async fn insert_execution(&self, record: &ExecutionRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_records
                (scheduled_operation_id, symbol, operation_type, unit_price, quantity, total_value,
                 executed_at, success, error_message, order_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.scheduled_operation_id)
        .bind(&record.symbol)
        .bind(record.operation_type.as_str())
        .bind(record.unit_price.to_string())
        .bind(record.quantity.to_string())
        .bind(record.total_value.to_string())
        .bind(ts(&record.executed_at))
        .bind(record.success)
        .bind(&record.error_message)
        .bind(&record.order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent first, optionally restricted to one operation type
    pub async fn list_executions(
        &self,
        limit: u32,
        operation_type: Option<OperationType>,
    ) -> Result<Vec<ExecutionRecord>> {
        let type_filter = operation_type.map(|t| t.as_str());
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_records
            WHERE (? IS NULL OR operation_type = ?)
            ORDER BY executed_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(type_filter)
        .bind(type_filter)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_execution).collect()
    }

    pub async fn list_executions_page(
        &self,
        page_size: u32,
        page: u32,
        operation_type: Option<OperationType>,
    ) -> Result<Page<ExecutionRecord>> {
        let (page, offset) = crate::types::page_offset(page, page_size);
        let type_filter = operation_type.map(|t| t.as_str());
        let rows = sqlx::query(
            r#"
            SELECT * FROM execution_records
            WHERE (? IS NULL OR operation_type = ?)
            ORDER BY executed_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(type_filter)
        .bind(type_filter)
        .bind(page_size as i64 + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let items = rows.iter().map(row_to_execution).collect::<Result<Vec<_>>>()?;
        Ok(Page::from_overfetch(items, page, page_size))
    }

    // ==================== CREDENTIALS ====================

    /// Deactivate every stored key pair and insert this one as active
    pub async fn insert_active_credential(
        &self,
        api_key: &str,
        api_secret: &str,
        environment: ExchangeEnvironment,
        api_base_url: &str,
    ) -> Result<CredentialRecord> {
        let created_at = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE exchange_credentials SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO exchange_credentials (api_key, api_secret, environment, api_base_url, is_active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(api_key)
        .bind(api_secret)
        .bind(environment.as_str())
        .bind(api_base_url)
        .bind(ts(&created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CredentialRecord {
            id: result.last_insert_rowid(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            environment,
            api_base_url: api_base_url.to_string(),
            is_active: true,
            created_at,
        })
    }

    /// Deactivate every stored key pair, then activate `id`
    pub async fn activate_credential(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE exchange_credentials SET is_active = 0 WHERE is_active = 1")
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("UPDATE exchange_credentials SET is_active = 1 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            anyhow::bail!("credential record {} not found", id);
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn active_credential(&self) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            "SELECT * FROM exchange_credentials WHERE is_active = 1 ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_credential).transpose()
    }

    pub async fn latest_credential_for(&self, environment: ExchangeEnvironment) -> Result<Option<CredentialRecord>> {
        let row = sqlx::query(
            "SELECT * FROM exchange_credentials WHERE environment = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(environment.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_credential).transpose()
    }

    pub async fn count_active_credentials(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM exchange_credentials WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    // ==================== DAILY PURCHASE SETTINGS ====================

    /// Deactivate previous settings and insert these as the active ones
    pub async fn save_daily_settings(
        &self,
        symbol: &str,
        quote_amount: Decimal,
        execution_hour_utc: u32,
    ) -> Result<DailyPurchaseSettings> {
        let created_at = now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE daily_purchase_settings SET is_active = 0, updated_at = ? WHERE is_active = 1")
            .bind(ts(&created_at))
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO daily_purchase_settings
                (symbol, quote_amount, execution_hour_utc, is_active, created_at, updated_at)
            VALUES (?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(symbol)
        .bind(quote_amount.to_string())
        .bind(execution_hour_utc as i64)
        .bind(ts(&created_at))
        .bind(ts(&created_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DailyPurchaseSettings {
            id: result.last_insert_rowid(),
            symbol: symbol.to_string(),
            quote_amount,
            execution_hour_utc,
            is_active: true,
            created_at,
            updated_at: created_at,
        })
    }

    pub async fn active_daily_settings(&self) -> Result<Option<DailyPurchaseSettings>> {
        let row = sqlx::query(
            "SELECT * FROM daily_purchase_settings WHERE is_active = 1 ORDER BY updated_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_daily_settings).transpose()
    }

    // ==================== PRICE ALERTS ====================

    pub async fn insert_alert(
        &self,
        recipient: &str,
        symbol: &str,
        min_threshold: Decimal,
        max_threshold: Decimal,
    ) -> Result<PriceAlert> {
        let created_at = now();
        let result = sqlx::query(
            r#"
            INSERT INTO price_alerts (recipient, symbol, min_threshold, max_threshold, is_active, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(recipient)
        .bind(symbol)
        .bind(min_threshold.to_string())
        .bind(max_threshold.to_string())
        .bind(ts(&created_at))
        .execute(&self.pool)
        .await?;

        Ok(PriceAlert {
            id: result.last_insert_rowid(),
            recipient: recipient.to_string(),
            symbol: symbol.to_string(),
            min_threshold,
            max_threshold,
            is_active: true,
            created_at,
            triggered_at: None,
        })
    }

    pub async fn active_alerts(&self) -> Result<Vec<PriceAlert>> {
        let rows = sqlx::query("SELECT * FROM price_alerts WHERE is_active = 1 ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_alert).collect()
    }

    pub async fn list_alerts(&self, limit: u32) -> Result<Vec<PriceAlert>> {
        let rows = sqlx::query("SELECT * FROM price_alerts ORDER BY created_at DESC, id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_alert).collect()
    }

    /// Deactivate an alert once delivered. Returns false if it was already inactive.
    pub async fn mark_alert_triggered(&self, id: i64, triggered_at: DateTime<Utc>) -> Result<bool> {
        let result =
            sqlx::query("UPDATE price_alerts SET is_active = 0, triggered_at = ? WHERE id = ? AND is_active = 1")
                .bind(ts(&triggered_at))
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Run a raw statement, e.g. a trigger that scripts a store failure
    #[cfg(test)]
    pub(crate) async fn execute_raw(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

fn sum_allocation(rows: &[SqliteRow]) -> Result<Decimal> {
    let mut total = Decimal::ZERO;
    for row in rows {
        let value = dec(row, "quantity")?
            .checked_mul(dec(row, "purchase_price")?)
            .context("position value is out of range")?;
        total = total.checked_add(value).context("open allocation is out of range")?;
    }
    Ok(total)
}

fn row_to_operation(row: &SqliteRow) -> Result<TradingOperation> {
    let status: String = row.try_get("status")?;
    Ok(TradingOperation {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        quantity: dec(row, "quantity")?,
        purchase_price: dec(row, "purchase_price")?,
        target_profit_percent: dec(row, "target_profit_percent")?,
        status: OperationStatus::from_str(&status)?,
        sell_price: opt_dec(row, "sell_price")?,
        buy_order_id: row.try_get("buy_order_id")?,
        sell_order_id: row.try_get("sell_order_id")?,
        target_sell_price: opt_dec(row, "target_sell_price")?,
        purchased_at: time(row, "purchased_at")?,
        sold_at: opt_ts(row, "sold_at")?,
    })
}

fn row_to_scheduled(row: &SqliteRow) -> Result<ScheduledOperation> {
    let operation_type: String = row.try_get("operation_type")?;
    let status: String = row.try_get("status")?;
    Ok(ScheduledOperation {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        capital_threshold: dec(row, "capital_threshold")?,
        target_profit_percent: dec(row, "target_profit_percent")?,
        operation_type: OperationType::from_str(&operation_type)?,
        scheduled_for: time(row, "scheduled_for")?,
        status: ScheduleStatus::from_str(&status)?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

fn row_to_execution(row: &SqliteRow) -> Result<ExecutionRecord> {
    let operation_type: String = row.try_get("operation_type")?;
    Ok(ExecutionRecord {
        id: Some(row.try_get("id")?),
        scheduled_operation_id: row.try_get("scheduled_operation_id")?,
        symbol: row.try_get("symbol")?,
        operation_type: OperationType::from_str(&operation_type)?,
        unit_price: dec(row, "unit_price")?,
        quantity: dec(row, "quantity")?,
        total_value: dec(row, "total_value")?,
        executed_at: time(row, "executed_at")?,
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
        order_id: row.try_get("order_id")?,
    })
}

fn row_to_credential(row: &SqliteRow) -> Result<CredentialRecord> {
    let environment: String = row.try_get("environment")?;
    Ok(CredentialRecord {
        id: row.try_get("id")?,
        api_key: row.try_get("api_key")?,
        api_secret: row.try_get("api_secret")?,
        environment: ExchangeEnvironment::normalize(&environment),
        api_base_url: row.try_get("api_base_url")?,
        is_active: row.try_get("is_active")?,
        created_at: time(row, "created_at")?,
    })
}

fn row_to_daily_settings(row: &SqliteRow) -> Result<DailyPurchaseSettings> {
    let hour: i64 = row.try_get("execution_hour_utc")?;
    Ok(DailyPurchaseSettings {
        id: row.try_get("id")?,
        symbol: row.try_get("symbol")?,
        quote_amount: dec(row, "quote_amount")?,
        execution_hour_utc: u32::try_from(hour).unwrap_or(u32::MAX),
        is_active: row.try_get("is_active")?,
        created_at: time(row, "created_at")?,
        updated_at: time(row, "updated_at")?,
    })
}

fn row_to_alert(row: &SqliteRow) -> Result<PriceAlert> {
    Ok(PriceAlert {
        id: row.try_get("id")?,
        recipient: row.try_get("recipient")?,
        symbol: row.try_get("symbol")?,
        min_threshold: dec(row, "min_threshold")?,
        max_threshold: dec(row, "max_threshold")?,
        is_active: row.try_get("is_active")?,
        created_at: time(row, "created_at")?,
        triggered_at: opt_ts(row, "triggered_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn purchase(quantity: Decimal, price: Decimal) -> NewPurchase {
        NewPurchase {
            symbol: "BTCUSDT".to_string(),
            quantity,
            purchase_price: price,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_capital_checked_insert() {
        let db = Database::in_memory().await.unwrap();

        let first = db
            .insert_operation_within_capital(&purchase(dec!(1), dec!(50)), dec!(10), dec!(55), dec!(100))
            .await
            .unwrap();
        assert!(matches!(first, AllocationOutcome::Recorded(_)));

        let second = db
            .insert_operation_within_capital(&purchase(dec!(1), dec!(60)), dec!(10), dec!(66), dec!(100))
            .await
            .unwrap();
        match second {
            AllocationOutcome::Exceeded { open_total } => assert_eq!(open_total, dec!(50)),
            other => panic!("expected rejection, got {:?}", other),
        }

        assert_eq!(db.open_allocation_total().await.unwrap(), dec!(50));
        assert_eq!(db.open_operations().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mark_sold_only_once() {
        let db = Database::in_memory().await.unwrap();
        let AllocationOutcome::Recorded(op) = db
            .insert_operation_within_capital(&purchase(dec!(1), dec!(100)), dec!(10), dec!(110), dec!(1000))
            .await
            .unwrap()
        else {
            panic!("insert rejected");
        };

        assert!(db.mark_operation_sold(op.id, dec!(111), now()).await.unwrap());
        assert!(!db.mark_operation_sold(op.id, dec!(120), now()).await.unwrap());

        let stored = db.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Sold);
        assert_eq!(stored.sell_price, Some(dec!(111)));
        assert!(stored.sold_at.is_some());
        assert_eq!(db.open_allocation_total().await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        db.insert_scheduled("BTCUSDT", dec!(100), dec!(10), OperationType::Sell, now())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            handles.push(tokio::spawn(async move { db.claim_next_scheduled().await.unwrap() }));
        }

        let mut winners = 0;
        for handle in handles {
            if let Some(op) = handle.await.unwrap() {
                assert_eq!(op.status, ScheduleStatus::Executing);
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_takes_earliest() {
        let db = Database::in_memory().await.unwrap();
        let later = db
            .insert_scheduled("BTCUSDT", dec!(100), dec!(10), OperationType::Sell, now() + ChronoDuration::hours(2))
            .await
            .unwrap();
        let earlier = db
            .insert_scheduled("BTCUSDT", dec!(100), dec!(10), OperationType::Sell, now() + ChronoDuration::hours(1))
            .await
            .unwrap();

        let claimed = db.claim_next_scheduled().await.unwrap().unwrap();
        assert_eq!(claimed.id, earlier.id);
        let claimed = db.claim_next_scheduled().await.unwrap().unwrap();
        assert_eq!(claimed.id, later.id);
        assert!(db.claim_next_scheduled().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_guarded_insert() {
        let db = Database::in_memory().await.unwrap();
        let first = db
            .insert_scheduled_if_none_active("BTCUSDT", dec!(100), dec!(10), OperationType::Sell, now())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = db
            .insert_scheduled_if_none_active("BTCUSDT", dec!(100), dec!(10), OperationType::Sell, now())
            .await
            .unwrap();
        assert!(second.is_none());

        // A different symbol is independent
        let other = db
            .insert_scheduled_if_none_active("ETHUSDT", dec!(100), dec!(10), OperationType::Sell, now())
            .await
            .unwrap();
        assert!(other.is_some());
        assert_eq!(db.count_active_scheduled("BTCUSDT").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancel_stale_executing() {
        let db = Database::in_memory().await.unwrap();
        let op = db
            .insert_scheduled("BTCUSDT", dec!(100), dec!(10), OperationType::Sell, now())
            .await
            .unwrap();
        db.claim_next_scheduled().await.unwrap().unwrap();

        assert_eq!(db.cancel_executing_before(now() - ChronoDuration::minutes(15)).await.unwrap(), 0);
        assert_eq!(db.cancel_executing_before(now() + ChronoDuration::seconds(1)).await.unwrap(), 1);

        let stored = db.get_scheduled(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ScheduleStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_execution_paging_and_filter() {
        let db = Database::in_memory().await.unwrap();
        for i in 0..5 {
            let record = ExecutionRecord::success("BTCUSDT", OperationType::Sell, dec!(100), Decimal::from(i), None);
            db.insert_execution(&record).await.unwrap();
        }
        db.insert_execution(&ExecutionRecord::failure("BTCUSDT", OperationType::DailyBuy, "price unavailable"))
            .await
            .unwrap();

        let page1 = db.list_executions_page(4, 1, None).await.unwrap();
        assert_eq!(page1.items.len(), 4);
        assert!(page1.has_next);
        assert!(!page1.has_previous);

        let page2 = db.list_executions_page(4, 2, None).await.unwrap();
        assert_eq!(page2.items.len(), 2);
        assert!(!page2.has_next);
        assert!(page2.has_previous);

        let daily = db.list_executions(10, Some(OperationType::DailyBuy)).await.unwrap();
        assert_eq!(daily.len(), 1);
        assert!(!daily[0].success);
        assert_eq!(daily[0].error_message.as_deref(), Some("price unavailable"));
    }

    #[tokio::test]
    async fn test_credential_activation_is_exclusive() {
        let db = Database::in_memory().await.unwrap();
        let prod = db
            .insert_active_credential(
                "prod-key-123456",
                "prod-secret-123456",
                ExchangeEnvironment::Production,
                ExchangeEnvironment::PRODUCTION_URL,
            )
            .await
            .unwrap();
        db.insert_active_credential(
            "test-key-123456",
            "test-secret-123456",
            ExchangeEnvironment::Testnet,
            ExchangeEnvironment::TESTNET_URL,
        )
            .await
            .unwrap();
        assert_eq!(db.count_active_credentials().await.unwrap(), 1);
        assert_eq!(db.active_credential().await.unwrap().unwrap().environment, ExchangeEnvironment::Testnet);

        db.activate_credential(prod.id).await.unwrap();
        assert_eq!(db.count_active_credentials().await.unwrap(), 1);
        let active = db.active_credential().await.unwrap().unwrap();
        assert_eq!(active.id, prod.id);
        assert_eq!(active.api_secret, "prod-secret-123456");

        assert!(db.activate_credential(9999).await.is_err());
        assert_eq!(db.active_credential().await.unwrap().unwrap().id, prod.id);
    }

    #[tokio::test]
    async fn test_daily_settings_replace_previous() {
        let db = Database::in_memory().await.unwrap();
        db.save_daily_settings("BTCUSDT", dec!(25), 12).await.unwrap();
        let latest = db.save_daily_settings("ETHUSDT", dec!(40), 9).await.unwrap();

        let active = db.active_daily_settings().await.unwrap().unwrap();
        assert_eq!(active.id, latest.id);
        assert_eq!(active.quote_amount, dec!(40));
        assert_eq!(active.execution_hour_utc, 9);
    }

    #[tokio::test]
    async fn test_alert_triggered_once() {
        let db = Database::in_memory().await.unwrap();
        let alert = db.insert_alert("ops@example.com", "BTCUSDT", dec!(90), dec!(120)).await.unwrap();
        assert_eq!(db.active_alerts().await.unwrap().len(), 1);

        assert!(db.mark_alert_triggered(alert.id, now()).await.unwrap());
        assert!(!db.mark_alert_triggered(alert.id, now()).await.unwrap());
        assert!(db.active_alerts().await.unwrap().is_empty());
        assert!(db.list_alerts(10).await.unwrap()[0].triggered_at.is_some());
    }
}
