//! Configuration management for the spot trader

use crate::types::ExchangeEnvironment;
use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

/// Engine configuration loaded from environment
#[derive(Clone)]
pub struct Config {
    /// SQLite connection string
    pub database_path: String,

    /// HTTP API port
    pub api_port: u16,

    /// The single trading pair the engine manages (e.g. BTCUSDT)
    pub trade_symbol: String,

    /// Maximum total purchase value across OPEN positions
    pub capital_threshold: Decimal,

    /// Default percentage above purchase price at which a position sells
    pub target_profit_percent: Decimal,

    /// Interval between automatic sell evaluations
    pub auto_sell_interval_minutes: u64,

    /// Default UTC hour for the daily purchase when settings carry none
    pub daily_purchase_hour_utc: u32,

    /// Price alert polling interval
    pub price_alert_poll_seconds: u64,

    /// Exchange environment the configured key pair belongs to
    pub environment: ExchangeEnvironment,

    /// REST base URL for the configured environment
    pub api_base_url: String,

    /// Key pair supplied via configuration (optional)
    pub api_key: Option<String>,
    pub api_secret: Option<String>,

    /// Webhook for price alert delivery (optional)
    pub alert_webhook_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "sqlite://spot_trader.db".to_string(),
            api_port: 5020,
            trade_symbol: "BTCUSDT".to_string(),
            capital_threshold: Decimal::from(100),
            target_profit_percent: Decimal::from(10),
            auto_sell_interval_minutes: 60,
            daily_purchase_hour_utc: 12,
            price_alert_poll_seconds: 60,
            environment: ExchangeEnvironment::Production,
            api_base_url: ExchangeEnvironment::PRODUCTION_URL.to_string(),
            api_key: None,
            api_secret: None,
            alert_webhook_url: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("api_port", &self.api_port)
            .field("trade_symbol", &self.trade_symbol)
            .field("capital_threshold", &self.capital_threshold)
            .field("target_profit_percent", &self.target_profit_percent)
            .field("environment", &self.environment)
            .field("api_base_url", &self.api_base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .finish()
    }
}

/// Parse an optional env var, falling back (with a warning) on bad input
fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Invalid value for {}: {:?}, using default", name, raw);
                default
            }
        },
        _ => default,
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let database_path = non_empty_var("DATABASE_PATH").unwrap_or(defaults.database_path);
        let api_port = parse_var("API_PORT", defaults.api_port);

        let trade_symbol = non_empty_var("TRADE_SYMBOL")
            .map(|s| s.to_uppercase())
            .unwrap_or(defaults.trade_symbol);

        let mut capital_threshold = parse_var("TRADING_CAPITAL_THRESHOLD", defaults.capital_threshold);
        if capital_threshold <= Decimal::ZERO {
            warn!("TRADING_CAPITAL_THRESHOLD must be positive, using default");
            capital_threshold = defaults.capital_threshold;
        }

        let mut target_profit_percent = parse_var("TARGET_PROFIT_PERCENT", defaults.target_profit_percent);
        if target_profit_percent <= Decimal::ZERO {
            warn!("TARGET_PROFIT_PERCENT must be positive, using default");
            target_profit_percent = defaults.target_profit_percent;
        }

        let auto_sell_interval_minutes =
            parse_var("AUTO_SELL_INTERVAL_MINUTES", defaults.auto_sell_interval_minutes).max(1);

        let daily_purchase_hour_utc = parse_var("DAILY_PURCHASE_HOUR_UTC", defaults.daily_purchase_hour_utc).min(23);

        let price_alert_poll_seconds =
            parse_var("PRICE_ALERT_POLL_SECONDS", defaults.price_alert_poll_seconds).max(1);

        let environment = match non_empty_var("BINANCE_ENVIRONMENT") {
            Some(name) => ExchangeEnvironment::normalize(&name),
            None if env::var("BINANCE_TESTNET").map(|v| v.to_lowercase() == "true").unwrap_or(false) => {
                ExchangeEnvironment::Testnet
            }
            None => ExchangeEnvironment::Production,
        };

        let api_base_url = non_empty_var("BINANCE_API_BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| environment.default_base_url().to_string());

        let api_key = non_empty_var("BINANCE_API_KEY");
        let api_secret = non_empty_var("BINANCE_API_SECRET");
        if api_key.is_some() != api_secret.is_some() {
            warn!("Only one of BINANCE_API_KEY / BINANCE_API_SECRET is set; configured credentials ignored");
        }
        let (api_key, api_secret) = match (api_key, api_secret) {
            (Some(k), Some(s)) => (Some(k), Some(s)),
            _ => (None, None),
        };

        let alert_webhook_url = non_empty_var("ALERT_WEBHOOK_URL");

        Ok(Self {
            database_path,
            api_port,
            trade_symbol,
            capital_threshold,
            target_profit_percent,
            auto_sell_interval_minutes,
            daily_purchase_hour_utc,
            price_alert_poll_seconds,
            environment,
            api_base_url,
            api_key,
            api_secret,
            alert_webhook_url,
        })
    }

    /// Whether a key pair was supplied via configuration
    pub fn has_configured_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }

    /// Log the non-sensitive parts of the configuration
    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  Trading pair:        {}", self.trade_symbol);
        info!("  Capital threshold:   {}", self.capital_threshold);
        info!("  Target profit:       {}%", self.target_profit_percent);
        info!("  Auto-sell interval:  {} min", self.auto_sell_interval_minutes);
        info!("  Daily purchase hour: {:02}:00 UTC", self.daily_purchase_hour_utc);
        info!("  Environment:         {} ({})", self.environment, self.api_base_url);
        info!(
            "  Credentials:         {}",
            if self.has_configured_credentials() { "configured" } else { "not configured" }
        );
        info!(
            "  Alert delivery:      {}",
            if self.alert_webhook_url.is_some() { "webhook" } else { "log only" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_port, 5020);
        assert_eq!(config.trade_symbol, "BTCUSDT");
        assert_eq!(config.capital_threshold, Decimal::from(100));
        assert_eq!(config.target_profit_percent, Decimal::from(10));
        assert_eq!(config.auto_sell_interval_minutes, 60);
        assert_eq!(config.api_base_url, "https://api.binance.com");
        assert!(!config.has_configured_credentials());
    }

    #[test]
    fn test_parse_var_falls_back() {
        std::env::set_var("SPOT_TRADER_TEST_BAD_PORT", "not-a-port");
        assert_eq!(parse_var("SPOT_TRADER_TEST_BAD_PORT", 5020u16), 5020);
        std::env::set_var("SPOT_TRADER_TEST_GOOD_PORT", " 8080 ");
        assert_eq!(parse_var("SPOT_TRADER_TEST_GOOD_PORT", 5020u16), 8080);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = Config {
            api_key: Some("very-secret-key".to_string()),
            api_secret: Some("very-secret-secret".to_string()),
            ..Config::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("very-secret"));
    }
}
