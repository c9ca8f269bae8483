//! Access credentials and the providers that supply them
//!
//! A [`Credential`] is an immutable snapshot. Refreshing means building a new
//! one and handing it over wholesale; nothing mutates a credential in place.
//! Where it comes from is hidden behind [`CredentialProvider`]:
//!
//! - [`StaticCredentials`] - fixed keys, usually read from the environment
//! - [`PoolCredentials`] - exchanged from an identity pool, cached until expiry
//! - [`ExternalCredentials`] - pushed in by the host application

use crate::config::CredentialsSection;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// Short-lived access material for the broker
#[derive(Clone, PartialEq)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Identity the credential was issued to, if known
    pub identity_id: Option<String>,
}

impl Credential {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            expires_at: None,
            identity_id: None,
        }
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_identity(mut self, identity_id: impl Into<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self
    }

    /// True when either key half is missing
    pub fn is_empty(&self) -> bool {
        self.access_key_id.trim().is_empty() || self.secret_access_key.trim().is_empty()
    }

    /// Principal a policy gets attached to: the identity id when known,
    /// the access key id otherwise
    pub fn principal(&self) -> &str {
        self.identity_id
            .as_deref()
            .unwrap_or(self.access_key_id.as_str())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// True when the credential expires within `margin` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, margin: ChronoDuration) -> bool {
        self.expires_at.is_some_and(|expiry| expiry - margin <= now)
    }
}

// Secrets never show up in logs
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .field("identity_id", &self.identity_id)
            .finish()
    }
}

/// Credential acquisition errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Identity pool exchange failed: {0}")]
    PoolExchange(String),
    #[error("No credential has been published yet")]
    NotAvailable,
    #[error("Credential expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Source of credential snapshots
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(&self) -> Result<Credential, CredentialError>;
}

/// Fixed credential, returned as-is on every call
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    credential: Credential,
}

impl StaticCredentials {
    pub fn new(credential: Credential) -> Self {
        Self { credential }
    }

    /// Read access key, secret and optional session token from the
    /// environment variables named in the configuration
    pub fn from_env(section: &CredentialsSection) -> Result<Self, CredentialError> {
        let access_key = read_env(&section.access_key_env)?;
        let secret_key = read_env(&section.secret_key_env)?;

        let mut credential = Credential::new(access_key, secret_key);
        if let Some(token_env) = &section.session_token_env {
            if let Ok(token) = std::env::var(token_env) {
                if !token.is_empty() {
                    credential = credential.with_session_token(token);
                }
            }
        }
        Ok(Self { credential })
    }

    pub fn into_credential(self) -> Credential {
        self.credential
    }
}

fn read_env(name: &str) -> Result<String, CredentialError> {
    std::env::var(name).map_err(|_| CredentialError::EnvVarNotFound(name.to_string()))
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> Result<Credential, CredentialError> {
        Ok(self.credential.clone())
    }
}

/// Exchanges an identity pool id for short-lived keys
///
/// Implemented by whatever talks to the identity service; the session crate
/// only consumes it.
#[async_trait]
pub trait IdentityPool: Send + Sync {
    async fn exchange(&self, pool_id: &str, region: &str) -> Result<Credential, CredentialError>;
}

/// Credentials derived from an identity pool, cached until close to expiry
pub struct PoolCredentials {
    pool_id: String,
    region: String,
    pool: Arc<dyn IdentityPool>,
    refresh_margin: ChronoDuration,
    cached: Mutex<Option<Credential>>,
}

impl PoolCredentials {
    pub fn new(
        pool_id: impl Into<String>,
        region: impl Into<String>,
        pool: Arc<dyn IdentityPool>,
    ) -> Self {
        Self {
            pool_id: pool_id.into(),
            region: region.into(),
            pool,
            refresh_margin: ChronoDuration::seconds(60),
            cached: Mutex::new(None),
        }
    }

    /// Refresh this long before the cached credential expires
    pub fn with_refresh_margin(mut self, margin: ChronoDuration) -> Self {
        self.refresh_margin = margin;
        self
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }
}

#[async_trait]
impl CredentialProvider for PoolCredentials {
    async fn credential(&self) -> Result<Credential, CredentialError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if !credential.expires_within(Utc::now(), self.refresh_margin) {
                debug!(pool_id = %self.pool_id, "Using cached pool credential");
                return Ok(credential.clone());
            }
        }

        info!(pool_id = %self.pool_id, region = %self.region, "Exchanging identity pool credential");
        let fresh = self.pool.exchange(&self.pool_id, &self.region).await?;
        *cached = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Credentials managed by the host application
///
/// The host keeps the [`CredentialPublisher`] and pushes a new snapshot
/// whenever it refreshes; readers always see the latest one.
#[derive(Debug, Clone)]
pub struct ExternalCredentials {
    rx: watch::Receiver<Option<Credential>>,
}

/// Publishing half of [`ExternalCredentials`]
#[derive(Debug)]
pub struct CredentialPublisher {
    tx: watch::Sender<Option<Credential>>,
}

impl ExternalCredentials {
    pub fn channel() -> (CredentialPublisher, Self) {
        let (tx, rx) = watch::channel(None);
        (CredentialPublisher { tx }, Self { rx })
    }

    /// Wait until the publisher pushes a snapshot different from the last
    /// one seen. Returns `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<Credential> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}

impl CredentialPublisher {
    pub fn publish(&self, credential: Credential) {
        self.tx.send_replace(Some(credential));
    }
}

#[async_trait]
impl CredentialProvider for ExternalCredentials {
    async fn credential(&self) -> Result<Credential, CredentialError> {
        let current = self.rx.borrow().clone();
        match current {
            None => Err(CredentialError::NotAvailable),
            Some(credential) => match credential.expires_at {
                Some(expiry) if credential.is_expired_at(Utc::now()) => {
                    Err(CredentialError::Expired(expiry))
                }
                _ => Ok(credential),
            },
        }
    }
}
