//! Runtime-adjustable trading parameters

use crate::error::{TradingError, TradingResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradingParameters {
    pub capital_threshold: Decimal,
    pub target_profit_percent: Decimal,
}

/// Shared handle; the ledger, the schedule and the loops all read through it
#[derive(Clone)]
pub struct TradingSettings {
    inner: Arc<RwLock<TradingParameters>>,
}

impl TradingSettings {
    pub fn new(parameters: TradingParameters) -> Self {
        Self {
            inner: Arc::new(RwLock::new(parameters)),
        }
    }

    pub async fn current(&self) -> TradingParameters {
        *self.inner.read().await
    }

    /// Apply the given changes; both values must stay positive
    pub async fn update(
        &self,
        capital_threshold: Option<Decimal>,
        target_profit_percent: Option<Decimal>,
    ) -> TradingResult<TradingParameters> {
        if let Some(threshold) = capital_threshold {
            if threshold <= Decimal::ZERO {
                return Err(TradingError::validation("Capital threshold must be greater than zero"));
            }
        }
        if let Some(percent) = target_profit_percent {
            if percent <= Decimal::ZERO {
                return Err(TradingError::validation("Target profit percent must be greater than zero"));
            }
        }

        let mut guard = self.inner.write().await;
        if let Some(threshold) = capital_threshold {
            guard.capital_threshold = threshold;
        }
        if let Some(percent) = target_profit_percent {
            guard.target_profit_percent = percent;
        }
        info!(
            "[Settings] Capital threshold {} / target profit {}%",
            guard.capital_threshold, guard.target_profit_percent
        );
        Ok(*guard)
    }
}
