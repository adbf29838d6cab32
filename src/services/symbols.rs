//! Cached exchange metadata: tradable symbols and per-symbol order filters
//!
//! Filters change rarely, so they are kept until the environment changes.

use super::{exchange_call, PRICE_TIMEOUT};
use crate::error::TradingResult;
use crate::exchange::{ExchangeGateway, SymbolFilters};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::info;

pub const SYMBOL_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

struct CachedSymbols {
    symbols: Vec<String>,
    fetched_at: Instant,
}

#[derive(Clone)]
pub struct SymbolCatalogue {
    gateway: Arc<dyn ExchangeGateway>,
    cache: Arc<Mutex<Option<CachedSymbols>>>,
    filters: Arc<RwLock<HashMap<String, SymbolFilters>>>,
    ttl: Duration,
}

impl SymbolCatalogue {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            gateway,
            cache: Arc::new(Mutex::new(None)),
            filters: Arc::new(RwLock::new(HashMap::new())),
            ttl: SYMBOL_CACHE_TTL,
        }
    }

    /// Symbols with status TRADING and spot enabled, served from cache while fresh
    pub async fn tradable_symbols(&self) -> TradingResult<Vec<String>> {
        // Held across the fetch so concurrent callers share one request
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if !cached.symbols.is_empty() && cached.fetched_at.elapsed() < self.ttl {
                return Ok(cached.symbols.clone());
            }
        }

        let symbols = exchange_call("exchange info", PRICE_TIMEOUT, self.gateway.tradable_symbols()).await?;
        info!("[Symbols] Loaded {} tradable symbols", symbols.len());
        *cache = Some(CachedSymbols {
            symbols: symbols.clone(),
            fetched_at: Instant::now(),
        });
        Ok(symbols)
    }

    /// Price and lot increments for `symbol`, fetched once and then cached
    pub async fn filters(&self, symbol: &str) -> TradingResult<SymbolFilters> {
        let symbol = symbol.to_uppercase();
        if let Some(filters) = self.filters.read().await.get(&symbol) {
            return Ok(*filters);
        }

        let filters = exchange_call("symbol filters", PRICE_TIMEOUT, self.gateway.symbol_filters(&symbol)).await?;
        info!(
            "[Symbols] {} tick size {}, step size {}",
            symbol, filters.tick_size, filters.step_size
        );
        self.filters.write().await.insert(symbol, filters);
        Ok(filters)
    }

    /// Drop the caches, e.g. after the active environment changes
    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
        self.filters.write().await.clear();
    }
}
