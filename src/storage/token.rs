use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::error::ProviderError;
use crate::observability::metrics as obs;

/// Credentials are cached for less than the provider's 24h validity.
pub fn default_credential_ttl() -> Duration {
    Duration::hours(23)
}

/// What the provider hands back from account authorization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountAuthorization {
    pub authorization_token: String,
    pub api_url: String,
    pub download_url: String,
}

/// Performs one account-authorization round-trip.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self) -> Result<AccountAuthorization, ProviderError>;
}

/// A bearer credential plus the endpoints it is valid against.
#[derive(Clone)]
pub struct Credential {
    pub token: String,
    pub api_url: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("download_url", &self.download_url)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Process-lifetime cache of the provider credential.
///
/// The async mutex is held across the authorization call, so concurrent
/// callers that find the cache cold wait for one round-trip instead of each
/// starting their own. An expired credential is never returned.
pub struct TokenCache {
    authorizer: Arc<dyn Authorizer>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cached: Mutex<Option<Credential>>,
}

impl TokenCache {
    pub fn new(authorizer: Arc<dyn Authorizer>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(authorizer, clock, default_credential_ttl())
    }

    pub fn with_ttl(authorizer: Arc<dyn Authorizer>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            authorizer,
            clock,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Return a valid credential, authorizing if the cache is cold or stale.
    pub async fn get_credential(&self) -> Result<Credential, ProviderError> {
        let mut cached = self.cached.lock().await;

        if let Some(credential) = cached.as_ref() {
            if credential.is_valid_at(self.clock.now()) {
                debug!("using cached object store credential");
                return Ok(credential.clone());
            }
            debug!(expired_at = %credential.expires_at, "cached credential expired");
        }

        info!("authorizing with object store");
        let authorization = match self.authorizer.authorize().await {
            Ok(a) => a,
            Err(e) => {
                obs::inc_provider_authorization("failure");
                warn!(error = %e, "object store authorization failed");
                *cached = None;
                return Err(e);
            }
        };
        obs::inc_provider_authorization("success");

        let credential = Credential {
            token: authorization.authorization_token,
            api_url: authorization.api_url,
            download_url: authorization.download_url,
            expires_at: self.clock.now() + self.ttl,
        };
        info!(
            api_url = %credential.api_url,
            download_url = %credential.download_url,
            expires_at = %credential.expires_at,
            "object store authorization successful"
        );
        *cached = Some(credential.clone());
        Ok(credential)
    }

    /// Drop the cached credential so the next call re-authorizes.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if cached.take().is_some() {
            info!("cached object store credential invalidated");
        }
    }
}
