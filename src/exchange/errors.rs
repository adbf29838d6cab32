//! Exchange API error differentiation
//!
//! Parses Binance REST error responses (`{"code":-2010,"msg":"..."}`) into
//! structured types for logging, diagnostics and user-facing messages.

use serde::Deserialize;
use std::fmt;

/// Structured exchange API error types
#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Account has insufficient quote or base balance
    InsufficientBalance,
    /// Quantity/price rejected by a symbol filter (LOT_SIZE, PRICE_FILTER, NOTIONAL)
    FilterRejected(String),
    /// Symbol unknown to the exchange
    InvalidSymbol,
    /// Request weight or order count exceeded
    RateLimited,
    /// Key, signature or timestamp rejected
    AuthenticationFailed(String),
    /// Exchange responded without the expected fields
    MalformedResponse(String),
    /// No key pair is loaded for signed requests
    MissingCredentials,
    /// Call exceeded its deadline
    Timeout(String),
    /// Network/connection error (DNS, refused, TLS)
    NetworkError(String),
    /// Unknown error with status code and body
    Unknown { status: u16, body: String },
}

/// Binance error body
#[derive(Debug, Deserialize)]
struct BinanceErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

impl ExchangeError {
    /// Parse a non-2xx exchange response into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        let (code, error_msg) = match serde_json::from_str::<BinanceErrorResponse>(body) {
            Ok(parsed) => (parsed.code, parsed.msg.unwrap_or_else(|| body.to_string())),
            Err(_) => (None, body.to_string()),
        };

        let msg_lower = error_msg.to_lowercase();

        if status == 429 || status == 418 || code == Some(-1003) || msg_lower.contains("too many requests") {
            return ExchangeError::RateLimited;
        }

        if status == 401
            || matches!(code, Some(-2014) | Some(-2015) | Some(-1022) | Some(-1021))
            || msg_lower.contains("invalid api-key")
            || msg_lower.contains("signature")
        {
            return ExchangeError::AuthenticationFailed(error_msg);
        }

        if msg_lower.contains("insufficient balance") {
            return ExchangeError::InsufficientBalance;
        }

        if code == Some(-1121) || msg_lower.contains("invalid symbol") {
            return ExchangeError::InvalidSymbol;
        }

        if code == Some(-1013) || msg_lower.contains("filter failure") {
            return ExchangeError::FilterRejected(error_msg);
        }

        ExchangeError::Unknown {
            status,
            body: error_msg,
        }
    }

    /// Parse a network/reqwest error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ExchangeError::Timeout("request timed out".to_string())
        } else if err.is_connect() {
            ExchangeError::NetworkError("connection failed".to_string())
        } else if err.is_decode() {
            ExchangeError::MalformedResponse(err.to_string())
        } else {
            ExchangeError::NetworkError(err.to_string())
        }
    }

    /// Whether a later attempt could succeed. Informational only: callers
    /// never retry within the same cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExchangeError::RateLimited | ExchangeError::NetworkError(_) | ExchangeError::Timeout(_)
        )
    }

    /// Human-readable error message
    pub fn user_message(&self) -> String {
        match self {
            ExchangeError::InsufficientBalance => "Insufficient account balance for this order.".to_string(),
            ExchangeError::FilterRejected(msg) => format!("Order rejected by symbol filter: {}", msg),
            ExchangeError::InvalidSymbol => "Symbol is not available on the exchange.".to_string(),
            ExchangeError::RateLimited => "Exchange rate limit reached. Try again shortly.".to_string(),
            ExchangeError::AuthenticationFailed(msg) => format!("Exchange rejected the API credentials: {}", msg),
            ExchangeError::MalformedResponse(msg) => format!("Unexpected exchange response: {}", msg),
            ExchangeError::MissingCredentials => "No exchange API credentials are configured.".to_string(),
            ExchangeError::Timeout(what) => format!("Exchange call timed out: {}", what),
            ExchangeError::NetworkError(msg) => format!("Network error: {}", msg),
            ExchangeError::Unknown { status, body } => format!("Exchange API error {}: {}", status, body),
        }
    }
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for ExchangeError {}
