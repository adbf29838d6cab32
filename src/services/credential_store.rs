//! In-memory holder of the active exchange key pair
//!
//! Written only by the credential manager; read by the exchange client and
//! the HTTP gate.

use crate::types::{mask_secret, ExchangeEnvironment};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Clone)]
pub struct ActiveCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub environment: ExchangeEnvironment,
    pub base_url: String,
    /// Exchange accepted the pair on the last check
    pub validated: bool,
    /// A pair was submitted at some point, even if it never validated
    pub supplied: bool,
}

impl ActiveCredentials {
    pub fn has_pair(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    /// A key pair was provided, whether or not it validated
    pub fn is_supplied(&self) -> bool {
        self.supplied || self.has_pair()
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<RwLock<ActiveCredentials>>,
}

impl CredentialStore {
    /// Empty store pointing at an environment's base URL
    pub fn new(environment: ExchangeEnvironment, base_url: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ActiveCredentials {
                api_key: String::new(),
                api_secret: String::new(),
                environment,
                base_url: base_url.trim_end_matches('/').to_string(),
                validated: false,
                supplied: false,
            })),
        }
    }

    pub async fn snapshot(&self) -> ActiveCredentials {
        self.inner.read().await.clone()
    }

    /// Replace the held key pair and environment
    pub async fn replace(&self, credentials: ActiveCredentials) {
        let mut guard = self.inner.write().await;
        info!(
            "[Credentials] Active key {} on {} ({}), validated={}",
            mask_secret(&credentials.api_key),
            credentials.environment,
            credentials.base_url,
            credentials.validated
        );
        *guard = credentials;
    }

    pub async fn set_validated(&self, validated: bool) {
        let mut guard = self.inner.write().await;
        if guard.validated != validated {
            info!("[Credentials] Validation state changed to {}", validated);
        }
        guard.validated = validated;
    }

    /// A submitted pair failed validation; trading stays gated until one passes
    pub async fn mark_rejected(&self) {
        let mut guard = self.inner.write().await;
        guard.validated = false;
        guard.supplied = true;
        info!("[Credentials] Submitted key pair was not validated");
    }

    pub async fn has_valid(&self) -> bool {
        let guard = self.inner.read().await;
        guard.validated && guard.has_pair()
    }

    pub async fn has_supplied(&self) -> bool {
        self.inner.read().await.is_supplied()
    }

    pub async fn base_url(&self) -> String {
        self.inner.read().await.base_url.clone()
    }

    pub async fn environment(&self) -> ExchangeEnvironment {
        self.inner.read().await.environment
    }

    /// Key pair for signed requests, if one is held
    pub async fn signing_pair(&self) -> Option<(String, String)> {
        let guard = self.inner.read().await;
        guard
            .has_pair()
            .then(|| (guard.api_key.clone(), guard.api_secret.clone()))
    }

    /// Masked key for display; empty until validated
    pub async fn masked_key(&self) -> String {
        let guard = self.inner.read().await;
        if guard.validated {
            mask_secret(&guard.api_key)
        } else {
            String::new()
        }
    }

    /// Masked secret for display; empty until validated
    pub async fn masked_secret(&self) -> String {
        let guard = self.inner.read().await;
        if guard.validated {
            mask_secret(&guard.api_secret)
        } else {
            String::new()
        }
    }
}
