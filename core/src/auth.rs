//! Credential providers.
//!
//! # Design
//! The executors ask for a bearer token right before every send and never
//! keep it, so a freshly refreshed token is always the one on the wire.
//! `CachedAuth` / `AsyncCachedAuth` hold the lock across the refresh itself:
//! at most one refresh runs at a time and concurrent callers wait for it,
//! then observe the new token. How a token is obtained (JWT grant, refresh
//! grant, ...) lives behind `TokenSource`.

use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::debug;

use crate::error::CozeError;

/// Default margin before expiry at which a cached credential is replaced.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// A bearer token and, optionally, the instant it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub expires_at: Option<SystemTime>,
}

impl Credential {
    pub fn new(token: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Valid for at least `margin` from now.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(at) => SystemTime::now()
                .checked_add(margin)
                .is_some_and(|deadline| deadline < at),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Supplies the `Authorization` header for blocking calls.
pub trait Auth: Send + Sync {
    fn token_type(&self) -> &str {
        "Bearer"
    }

    fn token(&self) -> Result<String, CozeError>;
}

/// Supplies the `Authorization` header for async calls.
#[async_trait]
pub trait AsyncAuth: Send + Sync {
    fn token_type(&self) -> &str {
        "Bearer"
    }

    async fn token(&self) -> Result<String, CozeError>;
}

/// A fixed personal access token.
#[derive(Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenAuth(<redacted>)")
    }
}

impl Auth for TokenAuth {
    fn token(&self) -> Result<String, CozeError> {
        Ok(self.token.clone())
    }
}

#[async_trait]
impl AsyncAuth for TokenAuth {
    async fn token(&self) -> Result<String, CozeError> {
        Ok(self.token.clone())
    }
}

/// Obtains a new credential, e.g. via an OAuth grant.
pub trait TokenSource: Send + Sync {
    fn fetch(&self) -> Result<Credential, CozeError>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Result<Credential, CozeError> + Send + Sync,
{
    fn fetch(&self) -> Result<Credential, CozeError> {
        self()
    }
}

#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    async fn fetch(&self) -> Result<Credential, CozeError>;
}

/// Caches the credential from a [`TokenSource`] and refreshes it single-flight.
pub struct CachedAuth<S> {
    source: S,
    margin: Duration,
    cached: parking_lot::Mutex<Option<Credential>>,
}

impl<S: TokenSource> CachedAuth<S> {
    pub fn new(source: S) -> Self {
        Self::with_margin(source, DEFAULT_REFRESH_MARGIN)
    }

    pub fn with_margin(source: S, margin: Duration) -> Self {
        Self {
            source,
            margin,
            cached: parking_lot::Mutex::new(None),
        }
    }

    /// Drop the cached credential so the next call refreshes.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

impl<S: TokenSource> Auth for CachedAuth<S> {
    fn token(&self) -> Result<String, CozeError> {
        let mut cached = self.cached.lock();
        if let Some(credential) = cached.as_ref().filter(|c| c.is_fresh(self.margin)) {
            return Ok(credential.token.clone());
        }

        let credential = self.source.fetch()?;
        debug!(expires_at = ?credential.expires_at, "refreshed credential");
        let token = credential.token.clone();
        *cached = Some(credential);
        Ok(token)
    }
}

/// Async counterpart of [`CachedAuth`].
pub struct AsyncCachedAuth<S> {
    source: S,
    margin: Duration,
    cached: tokio::sync::Mutex<Option<Credential>>,
}

impl<S: AsyncTokenSource> AsyncCachedAuth<S> {
    pub fn new(source: S) -> Self {
        Self::with_margin(source, DEFAULT_REFRESH_MARGIN)
    }

    pub fn with_margin(source: S, margin: Duration) -> Self {
        Self {
            source,
            margin,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}

#[async_trait]
impl<S: AsyncTokenSource> AsyncAuth for AsyncCachedAuth<S> {
    async fn token(&self) -> Result<String, CozeError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref().filter(|c| c.is_fresh(self.margin)) {
            return Ok(credential.token.clone());
        }

        let credential = self.source.fetch().await?;
        debug!(expires_at = ?credential.expires_at, "refreshed credential");
        let token = credential.token.clone();
        *cached = Some(credential);
        Ok(token)
    }
}
