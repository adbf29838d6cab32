//! Spot exchange collaborator
//!
//! The engine only needs a handful of capabilities from the exchange: a
//! ticker price, a quote-sized market buy, a limit sell, the open order book
//! for a symbol, account validation, symbol metadata and price history.
//! Reads are safe to repeat; order placement is not.

pub mod binance;
pub mod errors;
pub mod rate_limiter;

pub use binance::BinanceClient;
pub use errors::ExchangeError;
pub use rate_limiter::{EndpointClass, RateLimiter};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Fill report of a quote-sized market buy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketBuyFill {
    pub order_id: String,
    pub executed_quantity: Decimal,
    pub cumulative_quote: Decimal,
}

impl MarketBuyFill {
    /// Average fill price, or `fallback` when the fill carries no usable totals
    pub fn realized_price(&self, fallback: Decimal) -> Decimal {
        if self.executed_quantity > Decimal::ZERO && self.cumulative_quote > Decimal::ZERO {
            self.cumulative_quote.checked_div(self.executed_quantity).unwrap_or(fallback)
        } else {
            fallback
        }
    }
}

/// Order increments a symbol accepts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SymbolFilters {
    /// PRICE_FILTER tickSize; zero means unrestricted
    pub tick_size: Decimal,
    /// LOT_SIZE stepSize; zero means unrestricted
    pub step_size: Decimal,
    /// LOT_SIZE minQty
    pub min_quantity: Decimal,
}

impl SymbolFilters {
    /// Smallest valid price at or above `price`, so a resting sell never
    /// undercuts its target
    pub fn price_at_or_above(&self, price: Decimal) -> Option<Decimal> {
        snap(price, self.tick_size, Decimal::ceil)
    }

    /// Largest valid quantity at or below `quantity`, never more than was bought
    pub fn quantity_at_or_below(&self, quantity: Decimal) -> Option<Decimal> {
        snap(quantity, self.step_size, Decimal::floor)
    }
}

fn snap(value: Decimal, increment: Decimal, round: fn(&Decimal) -> Decimal) -> Option<Decimal> {
    if increment <= Decimal::ZERO {
        return Some(value.normalize());
    }
    let steps = round(&value.checked_div(increment)?);
    steps.checked_mul(increment).map(|v| v.normalize())
}

/// Closing price of one kline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
}

/// Acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlacedOrder {
    pub order_id: String,
}

/// An order resting on the book
#[derive(Debug, Clone, Serialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: Decimal,
    pub original_quantity: Decimal,
    pub status: String,
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    async fn place_market_buy_by_quote(
        &self,
        symbol: &str,
        quote_amount: Decimal,
    ) -> Result<MarketBuyFill, ExchangeError>;

    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, ExchangeError>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError>;

    /// Check a key pair with a signed account request against `base_url`.
    /// Does not touch the active credentials.
    async fn validate_account(&self, base_url: &str, api_key: &str, api_secret: &str) -> Result<(), ExchangeError>;

    /// Symbols currently trading with spot enabled
    async fn tradable_symbols(&self) -> Result<Vec<String>, ExchangeError>;

    /// Price and lot increments for one symbol
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError>;

    /// Closing prices between `start` and `end` at kline `interval` (e.g. "5m", "1d")
    async fn price_history(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, ExchangeError>;
}
