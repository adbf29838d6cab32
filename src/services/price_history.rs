//! Price history snapshots built from exchange klines
//!
//! Each period maps to one kline request whose interval keeps the point
//! count under the exchange's per-request limit.

use super::{exchange_call, HISTORY_TIMEOUT};
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeError, ExchangeGateway, PricePoint};
use chrono::{DateTime, Duration as ChronoDuration, Months, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HistoryPeriod {
    #[serde(rename = "1D")]
    OneDay,
    #[serde(rename = "1W")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
    #[serde(rename = "3M")]
    ThreeMonths,
    #[serde(rename = "1Y")]
    OneYear,
}

impl HistoryPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryPeriod::OneDay => "1D",
            HistoryPeriod::OneWeek => "1W",
            HistoryPeriod::OneMonth => "1M",
            HistoryPeriod::ThreeMonths => "3M",
            HistoryPeriod::OneYear => "1Y",
        }
    }

    /// Kline interval for the period
    pub fn interval(&self) -> &'static str {
        match self {
            HistoryPeriod::OneDay => "5m",
            HistoryPeriod::OneWeek => "1h",
            HistoryPeriod::OneMonth | HistoryPeriod::ThreeMonths | HistoryPeriod::OneYear => "1d",
        }
    }

    /// Start of the window ending at `end`; months are calendar months
    pub fn start(&self, end: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            HistoryPeriod::OneDay => end - ChronoDuration::hours(24),
            HistoryPeriod::OneWeek => end - ChronoDuration::days(7),
            HistoryPeriod::OneMonth => months_before(end, 1),
            HistoryPeriod::ThreeMonths => months_before(end, 3),
            HistoryPeriod::OneYear => months_before(end, 12),
        }
    }
}

fn months_before(end: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    end.checked_sub_months(Months::new(months))
        .unwrap_or_else(|| end - ChronoDuration::days(30 * i64::from(months)))
}

impl fmt::Display for HistoryPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryPeriod {
    type Err = TradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "1D" => Ok(HistoryPeriod::OneDay),
            "1W" => Ok(HistoryPeriod::OneWeek),
            "1M" => Ok(HistoryPeriod::OneMonth),
            "3M" => Ok(HistoryPeriod::ThreeMonths),
            "1Y" => Ok(HistoryPeriod::OneYear),
            other => Err(TradingError::validation(format!(
                "Unsupported history period {:?}; use 1D, 1W, 1M, 3M or 1Y",
                other
            ))),
        }
    }
}

/// Closing prices over a period with their range
#[derive(Debug, Clone, Serialize)]
pub struct PriceSnapshot {
    pub symbol: String,
    pub period: HistoryPeriod,
    pub interval: String,
    pub points: Vec<PricePoint>,
    pub minimum_price: Decimal,
    pub maximum_price: Decimal,
}

#[derive(Clone)]
pub struct PriceHistoryService {
    gateway: Arc<dyn ExchangeGateway>,
}

impl PriceHistoryService {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self { gateway }
    }

    pub async fn snapshot(&self, symbol: &str, period: HistoryPeriod) -> TradingResult<PriceSnapshot> {
        self.snapshot_ending(symbol, period, Utc::now()).await
    }

    pub async fn snapshot_ending(
        &self,
        symbol: &str,
        period: HistoryPeriod,
        end: DateTime<Utc>,
    ) -> TradingResult<PriceSnapshot> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return Err(TradingError::validation("Symbol is required"));
        }

        let interval = period.interval();
        let points = exchange_call(
            "price history",
            HISTORY_TIMEOUT,
            self.gateway.price_history(&symbol, interval, period.start(end), end),
        )
        .await?;

        let (Some(minimum_price), Some(maximum_price)) = (
            points.iter().map(|p| p.price).min(),
            points.iter().map(|p| p.price).max(),
        ) else {
            return Err(TradingError::Gateway(ExchangeError::MalformedResponse(format!(
                "no price history returned for {}",
                symbol
            ))));
        };

        debug!(
            "[History] {} {}: {} points, range {} - {}",
            symbol,
            period,
            points.len(),
            minimum_price,
            maximum_price
        );

        Ok(PriceSnapshot {
            symbol,
            period,
            interval: interval.to_string(),
            points,
            minimum_price,
            maximum_price,
        })
    }
}
