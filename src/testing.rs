//! Scripted exchange for unit tests

use crate::exchange::{ExchangeError, ExchangeGateway, MarketBuyFill, OpenOrder, PlacedOrder, PricePoint, SymbolFilters};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Mutex;

/// A BTCUSDT-like symbol: cent ticks, 0.00001 lots
pub const DEFAULT_FILTERS: SymbolFilters = SymbolFilters {
    tick_size: dec!(0.01),
    step_size: dec!(0.00001),
    min_quantity: dec!(0.00001),
};

/// One history request: symbol, interval, start, end
pub type HistoryRequest = (String, String, DateTime<Utc>, DateTime<Utc>);

#[derive(Default)]
struct FakeState {
    price: Option<Decimal>,
    price_error: Option<ExchangeError>,
    buy_error: Option<ExchangeError>,
    sell_error: Option<ExchangeError>,
    validation_error: Option<ExchangeError>,
    /// Overrides the fill computed from price and quote
    buy_fill: Option<MarketBuyFill>,
    symbols: Vec<String>,
    open_orders: Vec<OpenOrder>,
    filters: Option<SymbolFilters>,
    history: Vec<PricePoint>,
    history_error: Option<ExchangeError>,
    next_order_id: u64,
    price_calls: usize,
    symbol_calls: usize,
    filter_calls: usize,
    history_requests: Vec<HistoryRequest>,
    buys: Vec<(String, Decimal)>,
    sells: Vec<(String, Decimal, Decimal)>,
    validations: Vec<(String, String)>,
}

#[derive(Default)]
pub struct FakeExchange {
    state: Mutex<FakeState>,
}

impl FakeExchange {
    pub fn with_price(price: Decimal) -> Self {
        let fake = Self::default();
        fake.set_price(price);
        fake
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_price(&self, price: Decimal) {
        let mut state = self.state();
        state.price = Some(price);
        state.price_error = None;
    }

    pub fn fail_price(&self, error: ExchangeError) {
        self.state().price_error = Some(error);
    }

    pub fn fail_buy(&self, error: ExchangeError) {
        self.state().buy_error = Some(error);
    }

    pub fn fail_sell(&self, error: ExchangeError) {
        self.state().sell_error = Some(error);
    }

    pub fn fail_validation(&self, error: ExchangeError) {
        self.state().validation_error = Some(error);
    }

    pub fn set_buy_fill(&self, fill: MarketBuyFill) {
        self.state().buy_fill = Some(fill);
    }

    pub fn set_symbols(&self, symbols: &[&str]) {
        self.state().symbols = symbols.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_open_orders(&self, orders: Vec<OpenOrder>) {
        self.state().open_orders = orders;
    }

    pub fn set_filters(&self, filters: SymbolFilters) {
        self.state().filters = Some(filters);
    }

    pub fn set_history(&self, points: Vec<PricePoint>) {
        self.state().history = points;
    }

    pub fn fail_history(&self, error: ExchangeError) {
        self.state().history_error = Some(error);
    }

    pub fn filter_calls(&self) -> usize {
        self.state().filter_calls
    }

    pub fn history_requests(&self) -> Vec<HistoryRequest> {
        self.state().history_requests.clone()
    }

    pub fn price_calls(&self) -> usize {
        self.state().price_calls
    }

    pub fn symbol_calls(&self) -> usize {
        self.state().symbol_calls
    }

    pub fn buys(&self) -> Vec<(String, Decimal)> {
        self.state().buys.clone()
    }

    pub fn sells(&self) -> Vec<(String, Decimal, Decimal)> {
        self.state().sells.clone()
    }

    pub fn validations(&self) -> Vec<(String, String)> {
        self.state().validations.clone()
    }
}

#[async_trait]
impl ExchangeGateway for FakeExchange {
    async fn current_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
        let mut state = self.state();
        state.price_calls += 1;
        if let Some(err) = state.price_error.clone() {
            return Err(err);
        }
        state
            .price
            .ok_or_else(|| ExchangeError::NetworkError("no price scripted".to_string()))
    }

    async fn place_market_buy_by_quote(
        &self,
        symbol: &str,
        quote_amount: Decimal,
    ) -> Result<MarketBuyFill, ExchangeError> {
        let mut state = self.state();
        state.buys.push((symbol.to_string(), quote_amount));
        if let Some(err) = state.buy_error.clone() {
            return Err(err);
        }
        if let Some(fill) = state.buy_fill.clone() {
            return Ok(fill);
        }
        let price = state
            .price
            .ok_or_else(|| ExchangeError::NetworkError("no price scripted".to_string()))?;
        state.next_order_id += 1;
        Ok(MarketBuyFill {
            order_id: format!("buy-{}", state.next_order_id),
            executed_quantity: quote_amount.checked_div(price).unwrap_or(Decimal::ZERO),
            cumulative_quote: quote_amount,
        })
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, ExchangeError> {
        let mut state = self.state();
        state.sells.push((symbol.to_string(), quantity, price));
        if let Some(err) = state.sell_error.clone() {
            return Err(err);
        }
        state.next_order_id += 1;
        Ok(PlacedOrder {
            order_id: format!("sell-{}", state.next_order_id),
        })
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        let state = self.state();
        Ok(state.open_orders.iter().filter(|o| o.symbol == symbol).cloned().collect())
    }

    async fn validate_account(&self, base_url: &str, api_key: &str, _api_secret: &str) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.validations.push((base_url.to_string(), api_key.to_string()));
        match state.validation_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn tradable_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        let mut state = self.state();
        state.symbol_calls += 1;
        Ok(state.symbols.clone())
    }

    async fn symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        let mut state = self.state();
        state.filter_calls += 1;
        Ok(state.filters.unwrap_or(DEFAULT_FILTERS))
    }

    async fn price_history(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, ExchangeError> {
        let mut state = self.state();
        state
            .history_requests
            .push((symbol.to_string(), interval.to_string(), start, end));
        if let Some(err) = state.history_error.clone() {
            return Err(err);
        }
        Ok(state.history.clone())
    }
}
