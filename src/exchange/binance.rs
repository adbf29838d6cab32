//! Binance spot REST client
//!
//! Signed endpoints take an HMAC-SHA256 hex signature over the exact query
//! string, with the key in the `X-MBX-APIKEY` header.

use super::errors::ExchangeError;
use super::rate_limiter::{EndpointClass, RateLimiter};
use super::{ExchangeGateway, MarketBuyFill, OpenOrder, PlacedOrder, PricePoint, SymbolFilters};
use crate::services::CredentialStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const READ_TIMEOUT: Duration = Duration::from_secs(8);
const HISTORY_TIMEOUT: Duration = Duration::from_secs(12);
const ORDER_TIMEOUT: Duration = Duration::from_secs(15);
const KLINE_LIMIT: &str = "1000";
const RECV_WINDOW_MS: &str = "5000";

// Request weights per endpoint
const WEIGHT_TIME: u32 = 1;
const WEIGHT_TICKER: u32 = 2;
const WEIGHT_ACCOUNT: u32 = 20;
const WEIGHT_OPEN_ORDERS: u32 = 6;
const WEIGHT_EXCHANGE_INFO: u32 = 20;
const WEIGHT_SYMBOL_INFO: u32 = 2;
const WEIGHT_KLINES: u32 = 2;
const WEIGHT_ORDER: u32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    #[serde(default)]
    server_time: i64,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(default)]
    order_id: i64,
    #[serde(default)]
    executed_qty: Option<String>,
    #[serde(default, rename = "cummulativeQuoteQty")]
    cumulative_quote_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderResponse {
    order_id: i64,
    symbol: String,
    side: String,
    price: String,
    #[serde(default)]
    orig_qty: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    #[serde(default)]
    symbols: Vec<SymbolEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolEntry {
    symbol: String,
    status: String,
    #[serde(default)]
    is_spot_trading_allowed: bool,
    #[serde(default)]
    filters: Vec<RawFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFilter {
    filter_type: String,
    #[serde(default)]
    tick_size: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
}

/// PRICE_FILTER and LOT_SIZE of a symbol; an absent filter leaves that side unrestricted
fn filters_from_entry(entry: &SymbolEntry) -> Result<SymbolFilters, ExchangeError> {
    let mut filters = SymbolFilters {
        tick_size: Decimal::ZERO,
        step_size: Decimal::ZERO,
        min_quantity: Decimal::ZERO,
    };
    for filter in &entry.filters {
        match filter.filter_type.as_str() {
            "PRICE_FILTER" => {
                if let Some(raw) = filter.tick_size.as_deref() {
                    filters.tick_size = parse_decimal("tickSize", raw)?;
                }
            }
            "LOT_SIZE" => {
                if let Some(raw) = filter.step_size.as_deref() {
                    filters.step_size = parse_decimal("stepSize", raw)?;
                }
                if let Some(raw) = filter.min_qty.as_deref() {
                    filters.min_quantity = parse_decimal("minQty", raw)?;
                }
            }
            _ => {}
        }
    }
    Ok(filters)
}

/// `[openTime, open, high, low, close, ...]` -> close at open time
fn parse_kline(kline: &[serde_json::Value]) -> Result<PricePoint, ExchangeError> {
    if kline.len() < 5 {
        return Err(ExchangeError::MalformedResponse(
            "kline did not include enough data".to_string(),
        ));
    }
    let open_time = kline[0]
        .as_i64()
        .ok_or_else(|| ExchangeError::MalformedResponse(format!("kline open time is not a number: {}", kline[0])))?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(open_time)
        .ok_or_else(|| ExchangeError::MalformedResponse(format!("kline open time out of range: {}", open_time)))?;
    let close = kline[4]
        .as_str()
        .ok_or_else(|| ExchangeError::MalformedResponse(format!("kline close is not a string: {}", kline[4])))?;
    Ok(PricePoint {
        timestamp,
        price: parse_decimal("close", close)?,
    })
}

/// Hex HMAC-SHA256 of a query string
pub fn sign_query(query: &str, secret: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::AuthenticationFailed(e.to_string()))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Join parameters into a query string, percent-encoding values
fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Plain decimal notation without trailing zeros
fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(raw.trim())
        .map_err(|_| ExchangeError::MalformedResponse(format!("{} is not a number: {:?}", field, raw)))
}

fn local_timestamp_ms() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

/// Binance REST client bound to the active credentials
#[derive(Clone)]
pub struct BinanceClient {
    http: Client,
    credentials: CredentialStore,
    limiter: RateLimiter,
}

impl BinanceClient {
    pub fn new(credentials: CredentialStore) -> Self {
        let http = Client::builder()
            .timeout(ORDER_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http,
            credentials,
            limiter: RateLimiter::new(),
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ExchangeError> {
        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        if !status.is_success() {
            return Err(ExchangeError::from_response(status.as_u16(), &body));
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::MalformedResponse(e.to_string()))
    }

    async fn server_time(&self, base_url: &str) -> Result<i64, ExchangeError> {
        self.limiter.acquire(EndpointClass::General, WEIGHT_TIME).await;
        let url = format!("{}/api/v3/time", base_url);
        let time: ServerTime = self.send(self.http.get(&url).timeout(READ_TIMEOUT)).await?;
        if time.server_time == 0 {
            return Err(ExchangeError::MalformedResponse(
                "time endpoint returned an empty timestamp".to_string(),
            ));
        }
        Ok(time.server_time)
    }

    /// Build a signed request with the active key pair
    async fn signed(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(&str, String)>,
        timeout: Duration,
    ) -> Result<RequestBuilder, ExchangeError> {
        let (api_key, api_secret) = self
            .credentials
            .signing_pair()
            .await
            .ok_or(ExchangeError::MissingCredentials)?;
        let base_url = self.credentials.base_url().await;

        params.push(("timestamp", local_timestamp_ms()));
        let query = encode_query(&params);
        let signature = sign_query(&query, &api_secret)?;
        let url = format!("{}{}?{}&signature={}", base_url, path, query, signature);

        Ok(self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", api_key)
            .timeout(timeout))
    }
}

#[async_trait]
impl ExchangeGateway for BinanceClient {
    async fn current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.limiter.acquire(EndpointClass::General, WEIGHT_TICKER).await;
        let url = format!("{}/api/v3/ticker/price", self.credentials.base_url().await);
        let ticker: TickerPrice = self
            .send(self.http.get(&url).query(&[("symbol", symbol)]).timeout(READ_TIMEOUT))
            .await?;
        parse_decimal("price", &ticker.price)
    }

    async fn place_market_buy_by_quote(
        &self,
        symbol: &str,
        quote_amount: Decimal,
    ) -> Result<MarketBuyFill, ExchangeError> {
        self.limiter.acquire(EndpointClass::Order, 1).await;
        self.limiter.acquire(EndpointClass::General, WEIGHT_ORDER).await;

        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "BUY".to_string()),
            ("type", "MARKET".to_string()),
            ("quoteOrderQty", format_decimal(quote_amount)),
        ];
        let request = self.signed(reqwest::Method::POST, "/api/v3/order", params, ORDER_TIMEOUT).await?;
        let order: OrderResponse = self.send(request).await?;

        if order.order_id == 0 {
            return Err(ExchangeError::MalformedResponse(
                "exchange did not return an orderId for the buy request".to_string(),
            ));
        }

        let executed_quantity = match order.executed_qty.as_deref() {
            Some(raw) => parse_decimal("executedQty", raw)?,
            None => Decimal::ZERO,
        };
        let cumulative_quote = match order.cumulative_quote_qty.as_deref() {
            Some(raw) => parse_decimal("cummulativeQuoteQty", raw)?,
            None => Decimal::ZERO,
        };

        debug!("[Binance] Market buy {} filled {} for {}", order.order_id, executed_quantity, cumulative_quote);

        Ok(MarketBuyFill {
            order_id: order.order_id.to_string(),
            executed_quantity,
            cumulative_quote,
        })
    }

    async fn place_limit_sell(
        &self,
        symbol: &str,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<PlacedOrder, ExchangeError> {
        self.limiter.acquire(EndpointClass::Order, 1).await;
        self.limiter.acquire(EndpointClass::General, WEIGHT_ORDER).await;

        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", "SELL".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", format_decimal(quantity)),
            ("price", format_decimal(price)),
        ];
        let request = self.signed(reqwest::Method::POST, "/api/v3/order", params, ORDER_TIMEOUT).await?;
        let order: OrderResponse = self.send(request).await?;

        if order.order_id == 0 {
            return Err(ExchangeError::MalformedResponse(
                "exchange did not return an orderId for the sell request".to_string(),
            ));
        }

        Ok(PlacedOrder {
            order_id: order.order_id.to_string(),
        })
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>, ExchangeError> {
        self.limiter.acquire(EndpointClass::General, WEIGHT_OPEN_ORDERS).await;

        let params = vec![("symbol", symbol.to_string())];
        let request = self.signed(reqwest::Method::GET, "/api/v3/openOrders", params, READ_TIMEOUT).await?;
        let orders: Vec<OpenOrderResponse> = self.send(request).await?;

        orders
            .into_iter()
            .map(|o| -> Result<OpenOrder, ExchangeError> {
                Ok(OpenOrder {
                    order_id: o.order_id.to_string(),
                    symbol: o.symbol,
                    side: o.side,
                    price: parse_decimal("price", &o.price)?,
                    original_quantity: match o.orig_qty.as_deref() {
                        Some(raw) => parse_decimal("origQty", raw)?,
                        None => Decimal::ZERO,
                    },
                    status: o.status,
                })
            })
            .collect()
    }

    async fn validate_account(&self, base_url: &str, api_key: &str, api_secret: &str) -> Result<(), ExchangeError> {
        let base_url = base_url.trim_end_matches('/');
        let server_time = self.server_time(base_url).await?;

        self.limiter.acquire(EndpointClass::General, WEIGHT_ACCOUNT).await;
        let query = encode_query(&[
            ("timestamp", server_time.to_string()),
            ("recvWindow", RECV_WINDOW_MS.to_string()),
        ]);
        let signature = sign_query(&query, api_secret)?;
        let url = format!("{}/api/v3/account?{}&signature={}", base_url, query, signature);

        let response = self
            .http
            .get(&url)
            .header("X-MBX-APIKEY", api_key)
            .timeout(READ_TIMEOUT)
            .send()
            .await
            .map_err(|e| ExchangeError::from_network_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::from_response(status.as_u16(), &body));
        }

        Ok(())
    }

    async fn tradable_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        self.limiter.acquire(EndpointClass::General, WEIGHT_EXCHANGE_INFO).await;
        let url = format!("{}/api/v3/exchangeInfo", self.credentials.base_url().await);
        let info: ExchangeInfo = self.send(self.http.get(&url).timeout(READ_TIMEOUT)).await?;

        let mut symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.status.eq_ignore_ascii_case("TRADING") && s.is_spot_trading_allowed)
            .map(|s| s.symbol)
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.limiter.acquire(EndpointClass::General, WEIGHT_SYMBOL_INFO).await;
        let url = format!("{}/api/v3/exchangeInfo", self.credentials.base_url().await);
        let info: ExchangeInfo = self
            .send(self.http.get(&url).query(&[("symbol", symbol)]).timeout(READ_TIMEOUT))
            .await?;

        let entry = info
            .symbols
            .iter()
            .find(|s| s.symbol.eq_ignore_ascii_case(symbol))
            .ok_or_else(|| ExchangeError::MalformedResponse(format!("exchange info has no entry for {}", symbol)))?;
        filters_from_entry(entry)
    }

    async fn price_history(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<PricePoint>, ExchangeError> {
        self.limiter.acquire(EndpointClass::General, WEIGHT_KLINES).await;
        let url = format!("{}/api/v3/klines", self.credentials.base_url().await);
        let params = [
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", start.timestamp_millis().to_string()),
            ("endTime", end.timestamp_millis().to_string()),
            ("limit", KLINE_LIMIT.to_string()),
        ];
        let klines: Vec<Vec<serde_json::Value>> = self
            .send(self.http.get(&url).query(&params).timeout(HISTORY_TIMEOUT))
            .await?;

        klines.iter().map(|kline| parse_kline(kline)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExchangeEnvironment;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signature_matches_exchange_reference() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = concat!(
            "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1",
            "&recvWindow=5000&timestamp=1499827319559"
        );
        assert_eq!(
            sign_query(query, secret).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_encode_query_keeps_order() {
        let query = encode_query(&[("symbol", "BTCUSDT".to_string()), ("quoteOrderQty", "25.5".to_string())]);
        assert_eq!(query, "symbol=BTCUSDT&quoteOrderQty=25.5");
    }

    #[test]
    fn test_format_decimal() {
        assert_eq!(format_decimal(dec!(25.500)), "25.5");
        assert_eq!(format_decimal(dec!(110.00)), "110");
    }

    #[test]
    fn test_order_response_parsing() {
        let body = r#"{"symbol":"BTCUSDT","orderId":28,"executedQty":"0.00100000",
            "cummulativeQuoteQty":"25.00000000","status":"FILLED"}"#;
        let order: OrderResponse = serde_json::from_str(body).unwrap();
        assert_eq!(order.order_id, 28);
        assert_eq!(parse_decimal("executedQty", order.executed_qty.as_deref().unwrap()).unwrap(), dec!(0.001));
    }

    #[test]
    fn test_symbol_filters_from_exchange_info() {
        let body = r#"{"symbols":[{"symbol":"BTCUSDT","status":"TRADING","isSpotTradingAllowed":true,"filters":[
            {"filterType":"PRICE_FILTER","minPrice":"0.01000000","maxPrice":"1000000.00000000","tickSize":"0.01000000"},
            {"filterType":"LOT_SIZE","minQty":"0.00001000","maxQty":"9000.00000000","stepSize":"0.00001000"},
            {"filterType":"NOTIONAL","minNotional":"5.00000000"}
        ]}]}"#;
        let info: ExchangeInfo = serde_json::from_str(body).unwrap();
        let filters = filters_from_entry(&info.symbols[0]).unwrap();
        assert_eq!(filters.tick_size, dec!(0.01));
        assert_eq!(filters.step_size, dec!(0.00001));
        assert_eq!(filters.min_quantity, dec!(0.00001));
        assert_eq!(format_decimal(filters.price_at_or_above(dec!(74324.3243243243)).unwrap()), "74324.33");
    }

    #[test]
    fn test_kline_parsing() {
        let body = r#"[[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100","148976.11427815",
            1499644799999,"2434.19055334",308,"1756.87402397","28.46694368","0"]]"#;
        let klines: Vec<Vec<serde_json::Value>> = serde_json::from_str(body).unwrap();
        let point = parse_kline(&klines[0]).unwrap();
        assert_eq!(point.price, dec!(0.015771));
        assert_eq!(point.timestamp.timestamp_millis(), 1499040000000);

        let short: Vec<serde_json::Value> = serde_json::from_str(r#"[1499040000000,"1"]"#).unwrap();
        assert!(matches!(parse_kline(&short), Err(ExchangeError::MalformedResponse(_))));
    }

    #[tokio::test]
    async fn test_signed_request_requires_credentials() {
        let store = CredentialStore::new(ExchangeEnvironment::Testnet, ExchangeEnvironment::TESTNET_URL);
        let client = BinanceClient::new(store);
        let result = client
            .signed(reqwest::Method::GET, "/api/v3/openOrders", vec![], READ_TIMEOUT)
            .await;
        assert!(matches!(result, Err(ExchangeError::MissingCredentials)));
    }
}
