//! Domain error taxonomy for the trading engine

use crate::exchange::ExchangeError;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TradingError {
    /// Caller input rejected before any I/O
    #[error("{0}")]
    Validation(String),

    #[error("capital threshold exceeded: open allocation {open_total} + purchase {requested} > threshold {threshold}")]
    CapitalExceeded {
        open_total: Decimal,
        requested: Decimal,
        threshold: Decimal,
    },

    #[error("invalid exchange credentials: {0}")]
    CredentialInvalid(String),

    /// No validated key pair is active; mutating exchange actions are refused
    #[error("exchange credentials are missing or not validated")]
    CredentialsUnavailable,

    #[error("exchange error: {0}")]
    Gateway(#[from] ExchangeError),

    #[error("persistence error: {0:#}")]
    Persistence(#[from] anyhow::Error),
}

impl TradingError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TradingError::Validation(msg.into())
    }

    /// Validation and capital errors reflect caller input and are surfaced as-is
    pub fn is_caller_error(&self) -> bool {
        matches!(self, TradingError::Validation(_) | TradingError::CapitalExceeded { .. })
    }
}

pub type TradingResult<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_capital_exceeded_message() {
        let err = TradingError::CapitalExceeded {
            open_total: dec!(50),
            requested: dec!(60),
            threshold: dec!(100),
        };
        assert!(err.is_caller_error());
        assert_eq!(
            err.to_string(),
            "capital threshold exceeded: open allocation 50 + purchase 60 > threshold 100"
        );
    }

    #[test]
    fn test_gateway_conversion() {
        let err: TradingError = ExchangeError::RateLimited.into();
        assert!(matches!(err, TradingError::Gateway(ExchangeError::RateLimited)));
        assert!(!err.is_caller_error());
    }
}
