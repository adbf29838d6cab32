//! Core types for the spot trading engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `price * (1 + target_profit_percent / 100)`, or `None` when it does not fit a `Decimal`
pub fn target_price_for(price: Decimal, target_profit_percent: Decimal) -> Option<Decimal> {
    (target_profit_percent / Decimal::ONE_HUNDRED)
        .checked_add(Decimal::ONE)
        .and_then(|multiplier| price.checked_mul(multiplier))
}

/// Status of a purchased position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Open,
    Sold,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Open => "OPEN",
            OperationStatus::Sold => "SOLD",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(OperationStatus::Open),
            "SOLD" => Ok(OperationStatus::Sold),
            other => anyhow::bail!("unknown operation status {}", other),
        }
    }
}

/// One purchased position and, once closed, its sale
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingOperation {
    pub id: i64,
    pub symbol: String,
    pub quantity: Decimal,
    pub purchase_price: Decimal,
    pub target_profit_percent: Decimal,
    pub status: OperationStatus,
    pub sell_price: Option<Decimal>,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
    pub target_sell_price: Option<Decimal>,
    pub purchased_at: DateTime<Utc>,
    pub sold_at: Option<DateTime<Utc>>,
}

impl TradingOperation {
    /// Price per unit at which the position becomes sellable. A target too
    /// large to represent is never reached.
    pub fn target_price(&self) -> Decimal {
        target_price_for(self.purchase_price, self.target_profit_percent).unwrap_or(Decimal::MAX)
    }

    /// Inclusive: a price exactly on target triggers the sale
    pub fn has_reached_target(&self, current_price: Decimal) -> bool {
        current_price >= self.target_price()
    }

    pub fn is_open(&self) -> bool {
        self.status == OperationStatus::Open
    }
}

/// A purchase to be recorded in the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPurchase {
    pub symbol: String,
    pub quantity: Decimal,
    pub purchase_price: Decimal,
    /// Falls back to the configured default when absent or not positive
    pub target_profit_percent: Option<Decimal>,
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
}

impl NewPurchase {
    /// Quote value committed by this purchase, `None` on overflow
    pub fn purchase_value(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.purchase_price)
    }
}

/// Lifecycle of a scheduling slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Scheduled,
    Executing,
    /// Terminal: the slot is retired, whatever happened to the trade
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "SCHEDULED",
            ScheduleStatus::Executing => "EXECUTING",
            ScheduleStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(ScheduleStatus::Scheduled),
            "EXECUTING" => Ok(ScheduleStatus::Executing),
            "CANCELLED" => Ok(ScheduleStatus::Cancelled),
            other => anyhow::bail!("unknown schedule status {}", other),
        }
    }
}

/// Kind of trading action recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Buy,
    Sell,
    DailyBuy,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Buy => "BUY",
            OperationType::Sell => "SELL",
            OperationType::DailyBuy => "DAILY_BUY",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(OperationType::Buy),
            "SELL" => Ok(OperationType::Sell),
            "DAILY_BUY" => Ok(OperationType::DailyBuy),
            other => anyhow::bail!("unknown operation type {}", other),
        }
    }
}

/// A pending liquidation attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledOperation {
    pub id: i64,
    pub symbol: String,
    pub capital_threshold: Decimal,
    pub target_profit_percent: Decimal,
    pub operation_type: OperationType,
    pub scheduled_for: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit entry for one attempted trading action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Option<i64>,
    pub scheduled_operation_id: Option<i64>,
    pub symbol: String,
    pub operation_type: OperationType,
    pub unit_price: Decimal,
    pub quantity: Decimal,
    pub total_value: Decimal,
    pub executed_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub order_id: Option<String>,
}

impl ExecutionRecord {
    /// Successful attempt; the total is `unit_price * quantity`, saturating at `Decimal::MAX`
    pub fn success(
        symbol: &str,
        operation_type: OperationType,
        unit_price: Decimal,
        quantity: Decimal,
        order_id: Option<String>,
    ) -> Self {
        Self {
            id: None,
            scheduled_operation_id: None,
            symbol: symbol.to_string(),
            operation_type,
            unit_price,
            quantity,
            total_value: unit_price.saturating_mul(quantity),
            executed_at: Utc::now(),
            success: true,
            error_message: None,
            order_id,
        }
    }

    /// Failed attempt; an empty message is replaced so failures are never silent
    pub fn failure(symbol: &str, operation_type: OperationType, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = format!("{} failed for an unknown reason", operation_type);
        }

        Self {
            id: None,
            scheduled_operation_id: None,
            symbol: symbol.to_string(),
            operation_type,
            unit_price: Decimal::ZERO,
            quantity: Decimal::ZERO,
            total_value: Decimal::ZERO,
            executed_at: Utc::now(),
            success: false,
            error_message: Some(message),
            order_id: None,
        }
    }

    pub fn with_schedule(mut self, scheduled_operation_id: Option<i64>) -> Self {
        self.scheduled_operation_id = scheduled_operation_id;
        self
    }
}

/// A named exchange deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeEnvironment {
    Production,
    Testnet,
}

impl ExchangeEnvironment {
    pub const PRODUCTION_URL: &'static str = "https://api.binance.com";
    pub const TESTNET_URL: &'static str = "https://testnet.binance.vision";

    /// Anything that is not explicitly production is treated as the sandbox
    pub fn normalize(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("PRODUCTION") {
            ExchangeEnvironment::Production
        } else {
            ExchangeEnvironment::Testnet
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeEnvironment::Production => "PRODUCTION",
            ExchangeEnvironment::Testnet => "TESTNET",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ExchangeEnvironment::Production => Self::PRODUCTION_URL,
            ExchangeEnvironment::Testnet => Self::TESTNET_URL,
        }
    }
}

impl fmt::Display for ExchangeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored exchange key pair bound to an environment
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: i64,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    pub environment: ExchangeEnvironment,
    pub api_base_url: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("api_key", &mask_secret(&self.api_key))
            .field("environment", &self.environment)
            .field("api_base_url", &self.api_base_url)
            .field("is_active", &self.is_active)
            .finish()
    }
}

/// Show only the last four characters of a secret
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

/// Configured recurring quote-sized purchase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPurchaseSettings {
    pub id: i64,
    pub symbol: String,
    pub quote_amount: Decimal,
    pub execution_hour_utc: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Price band watched on behalf of a recipient
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceAlert {
    pub id: i64,
    pub recipient: String,
    pub symbol: String,
    pub min_threshold: Decimal,
    pub max_threshold: Decimal,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub triggered_at: Option<DateTime<Utc>>,
}

/// Which edge of a price band was crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertBoundary {
    Minimum,
    Maximum,
}

impl PriceAlert {
    pub fn crossed_boundary(&self, current_price: Decimal) -> Option<AlertBoundary> {
        if current_price <= self.min_threshold {
            Some(AlertBoundary::Minimum)
        } else if current_price >= self.max_threshold {
            Some(AlertBoundary::Maximum)
        } else {
            None
        }
    }
}

impl fmt::Display for AlertBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertBoundary::Minimum => write!(f, "minimum"),
            AlertBoundary::Maximum => write!(f, "maximum"),
        }
    }
}

/// One page of a listing, computed from a `page_size + 1` over-fetch
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    /// Trim the extra row fetched beyond `page_size`; its presence means another page exists
    pub fn from_overfetch(mut rows: Vec<T>, page: u32, page_size: u32) -> Self {
        let has_next = rows.len() > page_size as usize;
        rows.truncate(page_size as usize);
        Self {
            items: rows,
            page,
            page_size,
            has_next,
            has_previous: page > 1,
        }
    }
}

/// Offset of a 1-based page; pages below 1 are clamped to the first page
pub fn page_offset(page: u32, page_size: u32) -> (u32, i64) {
    let page = page.max(1);
    (page, (page as i64 - 1) * page_size as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_operation(price: Decimal, percent: Decimal) -> TradingOperation {
        TradingOperation {
            id: 1,
            symbol: "BTCUSDT".to_string(),
            quantity: dec!(2),
            purchase_price: price,
            target_profit_percent: percent,
            status: OperationStatus::Open,
            sell_price: None,
            buy_order_id: None,
            sell_order_id: None,
            target_sell_price: None,
            purchased_at: Utc::now(),
            sold_at: None,
        }
    }

    #[test]
    fn test_target_price_is_inclusive() {
        let op = open_operation(dec!(100), dec!(10));
        assert_eq!(op.target_price(), dec!(110));
        assert!(op.has_reached_target(dec!(110)));
        assert!(op.has_reached_target(dec!(111)));
        assert!(!op.has_reached_target(dec!(109.99)));
    }

    #[test]
    fn test_oversized_values_do_not_overflow() {
        assert_eq!(target_price_for(Decimal::MAX, dec!(10)), None);
        let op = open_operation(Decimal::MAX, dec!(10));
        assert_eq!(op.target_price(), Decimal::MAX);
        assert!(!op.has_reached_target(dec!(1000000)));

        let purchase = NewPurchase {
            quantity: dec!(1000000000000000),
            purchase_price: dec!(1000000000000000),
            ..Default::default()
        };
        assert_eq!(purchase.purchase_value(), None);

        let record = ExecutionRecord::success("BTCUSDT", OperationType::Sell, Decimal::MAX, dec!(2), None);
        assert_eq!(record.total_value, Decimal::MAX);
    }

    #[test]
    fn test_failure_record_always_has_message() {
        let record = ExecutionRecord::failure("BTCUSDT", OperationType::Sell, "  ");
        assert!(!record.success);
        assert_eq!(
            record.error_message.as_deref(),
            Some("SELL failed for an unknown reason")
        );
    }

    #[test]
    fn test_success_record_total_matches() {
        let record = ExecutionRecord::success("BTCUSDT", OperationType::Buy, dec!(111), dec!(0.5), None);
        assert_eq!(record.total_value, dec!(55.5));
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_environment_normalization() {
        assert_eq!(ExchangeEnvironment::normalize(" production "), ExchangeEnvironment::Production);
        assert_eq!(ExchangeEnvironment::normalize("sandbox"), ExchangeEnvironment::Testnet);
        assert_eq!(ExchangeEnvironment::normalize(""), ExchangeEnvironment::Testnet);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret("abcdefgh1234"), "****1234");
    }

    #[test]
    fn test_page_from_overfetch() {
        let page = Page::from_overfetch(vec![1, 2, 3, 4], 2, 3);
        assert_eq!(page.items, vec![1, 2, 3]);
        assert!(page.has_next);
        assert!(page.has_previous);

        let last = Page::from_overfetch(vec![1, 2], 1, 3);
        assert!(!last.has_next);
        assert!(!last.has_previous);
        assert_eq!(page_offset(0, 25), (1, 0));
        assert_eq!(page_offset(3, 25), (3, 50));
    }

    #[test]
    fn test_alert_boundaries() {
        let alert = PriceAlert {
            id: 1,
            recipient: "ops@example.com".to_string(),
            symbol: "BTCUSDT".to_string(),
            min_threshold: dec!(90),
            max_threshold: dec!(120),
            is_active: true,
            created_at: Utc::now(),
            triggered_at: None,
        };
        assert_eq!(alert.crossed_boundary(dec!(90)), Some(AlertBoundary::Minimum));
        assert_eq!(alert.crossed_boundary(dec!(125)), Some(AlertBoundary::Maximum));
        assert_eq!(alert.crossed_boundary(dec!(100)), None);
    }
}
