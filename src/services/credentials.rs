//! Credential manager - validates, persists and activates exchange key pairs
//!
//! Sole writer of the `CredentialStore` and of credential activation in the
//! database. A pair is never activated without a live check against the
//! exchange.

use super::{exchange_call, store_call, CredentialStore, SymbolCatalogue, ActiveCredentials, VALIDATION_TIMEOUT};
use crate::config::Config;
use crate::db::Database;
use crate::error::{TradingError, TradingResult};
use crate::exchange::{ExchangeError, ExchangeGateway};
use crate::types::{mask_secret, CredentialRecord, ExchangeEnvironment};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

const MIN_CREDENTIAL_LENGTH: usize = 10;

/// Display-safe credential state
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub environment: ExchangeEnvironment,
    pub api_base_url: String,
    pub has_valid_credentials: bool,
    pub has_supplied_credentials: bool,
    pub masked_api_key: String,
    pub masked_api_secret: String,
}

pub struct CredentialManager {
    db: Arc<Database>,
    store: CredentialStore,
    gateway: Arc<dyn ExchangeGateway>,
    symbols: SymbolCatalogue,
    config: Arc<Config>,
}

/// Non-2xx and missing server time mean the pair is bad; transport failures do not
fn classify_validation_error(error: TradingError) -> TradingError {
    match error {
        TradingError::Gateway(ExchangeError::NetworkError(_))
        | TradingError::Gateway(ExchangeError::Timeout(_))
        | TradingError::Gateway(ExchangeError::RateLimited) => error,
        TradingError::Gateway(other) => TradingError::CredentialInvalid(other.to_string()),
        other => other,
    }
}

impl CredentialManager {
    pub fn new(
        db: Arc<Database>,
        store: CredentialStore,
        gateway: Arc<dyn ExchangeGateway>,
        symbols: SymbolCatalogue,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            store,
            gateway,
            symbols,
            config,
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// Base URL for an environment; the configured override applies to the configured environment only
    pub fn base_url_for(&self, environment: ExchangeEnvironment) -> String {
        if environment == self.config.environment {
            self.config.api_base_url.clone()
        } else {
            environment.default_base_url().to_string()
        }
    }

    fn check_shape(api_key: &str, api_secret: &str) -> TradingResult<()> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(TradingError::validation("API key and secret are required"));
        }
        if api_key.chars().count() < MIN_CREDENTIAL_LENGTH || api_secret.chars().count() < MIN_CREDENTIAL_LENGTH {
            return Err(TradingError::validation(
                "Credentials are too short. Please verify the API key and secret",
            ));
        }
        Ok(())
    }

    async fn check_live(&self, base_url: &str, api_key: &str, api_secret: &str) -> TradingResult<()> {
        Self::check_shape(api_key, api_secret)?;
        exchange_call(
            "credential validation",
            VALIDATION_TIMEOUT,
            self.gateway.validate_account(base_url, api_key, api_secret),
        )
        .await
        .map_err(classify_validation_error)
    }

    /// Load and validate the stored active pair, falling back to configured
    /// credentials. Never fails: with nothing valid the service stays gated.
    pub async fn initialize(&self) {
        let stored = match store_call("load active credentials", self.db.active_credential()).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("[Credentials] Could not load saved credentials: {}", e);
                None
            }
        };

        if let Some(record) = stored {
            match self.check_live(&record.api_base_url, &record.api_key, &record.api_secret).await {
                Ok(()) => {
                    self.store.replace(Self::active_from(&record, true)).await;
                    info!("[Credentials] Saved {} credentials validated", record.environment);
                    return;
                }
                Err(e) => {
                    warn!("[Credentials] Saved credentials are not valid: {}", e);
                    self.store.replace(Self::active_from(&record, false)).await;
                }
            }
        }

        let (Some(api_key), Some(api_secret)) = (self.config.api_key.clone(), self.config.api_secret.clone()) else {
            info!("[Credentials] No configured credentials; exchange actions stay disabled");
            return;
        };

        let environment = self.config.environment;
        if let Err(e) = self.validate_and_persist(&api_key, &api_secret, environment.as_str()).await {
            warn!("[Credentials] Configured credentials are not valid: {}", e);
        }
    }

    fn active_from(record: &CredentialRecord, validated: bool) -> ActiveCredentials {
        ActiveCredentials {
            api_key: record.api_key.clone(),
            api_secret: record.api_secret.clone(),
            environment: record.environment,
            base_url: record.api_base_url.clone(),
            validated,
            supplied: true,
        }
    }

    /// Validate a new pair live, then make it the only active record
    pub async fn validate_and_persist(
        &self,
        api_key: &str,
        api_secret: &str,
        environment: &str,
    ) -> TradingResult<CredentialRecord> {
        let api_key = api_key.trim();
        let api_secret = api_secret.trim();
        let environment = ExchangeEnvironment::normalize(environment);
        let base_url = self.base_url_for(environment);

        if let Err(e) = self.check_live(&base_url, api_key, api_secret).await {
            self.store.mark_rejected().await;
            return Err(e);
        }

        let record = match store_call(
            "save credentials",
            self.db.insert_active_credential(api_key, api_secret, environment, &base_url),
        )
        .await
        {
            Ok(record) => record,
            Err(e) => {
                self.store.mark_rejected().await;
                return Err(e);
            }
        };

        let previous_environment = self.store.environment().await;
        self.store.replace(Self::active_from(&record, true)).await;
        if previous_environment != environment {
            self.symbols.invalidate().await;
        }

        info!(
            "[Credentials] Key {} validated and activated for {}",
            mask_secret(api_key),
            environment
        );
        Ok(record)
    }

    /// Switch to the latest stored pair of another environment after re-validating it
    pub async fn activate_environment(&self, name: &str) -> TradingResult<CredentialRecord> {
        let environment = ExchangeEnvironment::normalize(name);
        let record = store_call("load environment credentials", self.db.latest_credential_for(environment))
            .await?
            .ok_or_else(|| {
                TradingError::validation(format!("No stored credentials for the {} environment", environment))
            })?;

        self.check_live(&record.api_base_url, &record.api_key, &record.api_secret).await?;

        store_call("activate credentials", self.db.activate_credential(record.id)).await?;
        self.store.replace(Self::active_from(&record, true)).await;
        self.symbols.invalidate().await;

        info!("[Credentials] Switched to {} ({})", environment, record.api_base_url);
        Ok(CredentialRecord {
            is_active: true,
            ..record
        })
    }

    /// Re-check the held pair without changing stored state
    pub async fn revalidate(&self) -> TradingResult<bool> {
        let current = self.store.snapshot().await;
        if !current.has_pair() {
            return Err(TradingError::CredentialsUnavailable);
        }

        match self.check_live(&current.base_url, &current.api_key, &current.api_secret).await {
            Ok(()) => {
                self.store.set_validated(true).await;
                Ok(true)
            }
            Err(e) => {
                warn!("[Credentials] Revalidation failed: {}", e);
                self.store.set_validated(false).await;
                match e {
                    TradingError::CredentialInvalid(_) => Ok(false),
                    other => Err(other),
                }
            }
        }
    }

    pub async fn has_valid_credentials(&self) -> bool {
        self.store.has_valid().await
    }

    pub async fn has_supplied_credentials(&self) -> bool {
        self.store.has_supplied().await
    }

    /// Gate for every exchange-mutating action
    pub async fn require_valid(&self) -> TradingResult<()> {
        if self.has_valid_credentials().await {
            Ok(())
        } else {
            Err(TradingError::CredentialsUnavailable)
        }
    }

    pub async fn masked_key(&self) -> String {
        self.store.masked_key().await
    }

    pub async fn masked_secret(&self) -> String {
        self.store.masked_secret().await
    }

    pub async fn status(&self) -> CredentialStatus {
        let current = self.store.snapshot().await;
        CredentialStatus {
            environment: current.environment,
            api_base_url: current.base_url.clone(),
            has_valid_credentials: current.validated && current.has_pair(),
            has_supplied_credentials: current.is_supplied(),
            masked_api_key: self.store.masked_key().await,
            masked_api_secret: self.store.masked_secret().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeExchange;

    const KEY: &str = "test-api-key-0001";
    const SECRET: &str = "test-api-secret-0001";

    async fn manager(fake: Arc<FakeExchange>, config: Config) -> CredentialManager {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let store = CredentialStore::new(config.environment, &config.api_base_url);
        let symbols = SymbolCatalogue::new(fake.clone());
        CredentialManager::new(db, store, fake, symbols, Arc::new(config))
    }

    #[tokio::test]
    async fn test_validate_and_persist() {
        let fake = Arc::new(FakeExchange::default());
        let manager = manager(fake.clone(), Config::default()).await;

        let record = manager.validate_and_persist(KEY, SECRET, "testnet").await.unwrap();
        assert!(record.is_active);
        assert_eq!(record.environment, ExchangeEnvironment::Testnet);
        assert_eq!(record.api_base_url, ExchangeEnvironment::TESTNET_URL);
        assert_eq!(fake.validations()[0].0, ExchangeEnvironment::TESTNET_URL);

        assert!(manager.has_valid_credentials().await);
        assert_eq!(manager.masked_key().await, "****0001");
        assert_eq!(manager.store().base_url().await, ExchangeEnvironment::TESTNET_URL);
    }

    #[tokio::test]
    async fn test_short_credentials_rejected_without_io() {
        let fake = Arc::new(FakeExchange::default());
        let manager = manager(fake.clone(), Config::default()).await;

        let err = manager.validate_and_persist("short", SECRET, "PRODUCTION").await.unwrap_err();
        assert!(matches!(err, TradingError::Validation(_)));
        assert!(fake.validations().is_empty());
        assert!(!manager.has_valid_credentials().await);
    }

    #[tokio::test]
    async fn test_rejected_pair_is_credential_invalid() {
        let fake = Arc::new(FakeExchange::default());
        fake.fail_validation(ExchangeError::from_response(401, r#"{"code":-2015,"msg":"Invalid API-key"}"#));
        let manager = manager(fake, Config::default()).await;

        let err = manager.validate_and_persist(KEY, SECRET, "PRODUCTION").await.unwrap_err();
        assert!(matches!(err, TradingError::CredentialInvalid(_)));
        assert!(manager.has_supplied_credentials().await);
        assert!(!manager.has_valid_credentials().await);
        assert_eq!(manager.masked_key().await, "");
    }

    #[tokio::test]
    async fn test_unreachable_gateway_leaves_supplied_but_invalid() {
        let fake = Arc::new(FakeExchange::default());
        fake.fail_validation(ExchangeError::NetworkError("connection failed".to_string()));
        let config = Config {
            api_key: Some(KEY.to_string()),
            api_secret: Some(SECRET.to_string()),
            ..Config::default()
        };
        let manager = manager(fake, config).await;

        manager.initialize().await;
        assert!(!manager.has_valid_credentials().await);
        assert!(manager.has_supplied_credentials().await);
        assert!(matches!(manager.require_valid().await, Err(TradingError::CredentialsUnavailable)));
    }

    #[tokio::test]
    async fn test_initialize_prefers_stored_pair() {
        let fake = Arc::new(FakeExchange::default());
        let config = Config {
            api_key: Some("configured-key-0002".to_string()),
            api_secret: Some("configured-secret-0002".to_string()),
            ..Config::default()
        };
        let manager = manager(fake.clone(), config).await;
        manager
            .db
            .insert_active_credential(KEY, SECRET, ExchangeEnvironment::Testnet, ExchangeEnvironment::TESTNET_URL)
            .await
            .unwrap();

        manager.initialize().await;
        assert!(manager.has_valid_credentials().await);
        assert_eq!(manager.store().environment().await, ExchangeEnvironment::Testnet);
        assert_eq!(fake.validations().len(), 1);
        assert_eq!(fake.validations()[0].1, KEY);
    }

    #[tokio::test]
    async fn test_activate_environment_switches_without_reentry() {
        let fake = Arc::new(FakeExchange::default());
        fake.set_symbols(&["BTCUSDT"]);
        let manager = manager(fake.clone(), Config::default()).await;

        let prod = manager.validate_and_persist(KEY, SECRET, "PRODUCTION").await.unwrap();
        manager
            .validate_and_persist("testnet-key-0003", "testnet-secret-0003", "TESTNET")
            .await
            .unwrap();
        manager.symbols.tradable_symbols().await.unwrap();

        let activated = manager.activate_environment("production").await.unwrap();
        assert_eq!(activated.id, prod.id);
        assert_eq!(manager.store().environment().await, ExchangeEnvironment::Production);
        assert_eq!(manager.db.count_active_credentials().await.unwrap(), 1);
        assert_eq!(manager.db.active_credential().await.unwrap().unwrap().id, prod.id);

        // Cache was dropped on the switch
        manager.symbols.tradable_symbols().await.unwrap();
        assert_eq!(fake.symbol_calls(), 2);
    }

    #[tokio::test]
    async fn test_activate_failure_keeps_current() {
        let fake = Arc::new(FakeExchange::default());
        let manager = manager(fake.clone(), Config::default()).await;
        let test = manager.validate_and_persist(KEY, SECRET, "TESTNET").await.unwrap();

        assert!(matches!(
            manager.activate_environment("PRODUCTION").await,
            Err(TradingError::Validation(_))
        ));

        manager.validate_and_persist("prod-key-000004", "prod-secret-000004", "PRODUCTION").await.unwrap();
        manager.activate_environment("TESTNET").await.unwrap();

        fake.fail_validation(ExchangeError::AuthenticationFailed("revoked".to_string()));
        assert!(matches!(
            manager.activate_environment("PRODUCTION").await,
            Err(TradingError::CredentialInvalid(_))
        ));
        assert_eq!(manager.db.active_credential().await.unwrap().unwrap().id, test.id);
    }

    #[tokio::test]
    async fn test_revalidate_recovers() {
        let fake = Arc::new(FakeExchange::default());
        let manager = manager(fake.clone(), Config::default()).await;
        assert!(matches!(manager.revalidate().await, Err(TradingError::CredentialsUnavailable)));

        manager.validate_and_persist(KEY, SECRET, "PRODUCTION").await.unwrap();

        fake.fail_validation(ExchangeError::Timeout("credential validation".to_string()));
        assert!(manager.revalidate().await.is_err());
        assert!(!manager.has_valid_credentials().await);

        fake.fail_validation(ExchangeError::from_response(401, "{}"));
        assert!(!manager.revalidate().await.unwrap());

        let fresh = Arc::new(FakeExchange::default());
        let recovered = CredentialManager {
            gateway: fresh,
            ..manager
        };
        assert!(recovered.revalidate().await.unwrap());
        assert!(recovered.has_valid_credentials().await);
    }
}
