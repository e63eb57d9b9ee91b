//! Token caching.
//!
//! [`TokenStoreCredential`] serves a token handed over by a parent process and
//! reloads it from a [`TokenStore`] when it nears expiry. [`SharedTokenHandle`]
//! owns the single instance of it for the process. [`TokenSlot`] is the
//! per-credential cache used by every network-backed strategy.

use super::credential::TokenCredential;
use super::types::{AccessToken, CredentialKind, MINIMUM_TOKEN_VALID_DURATION, TokenInfo};
use crate::error::{IdentityError, IdentityResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persisted token source backing token-store mode.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn has_cached_token(&self) -> bool;

    async fn load_token(&self) -> IdentityResult<TokenInfo>;
}

#[derive(Default)]
pub struct InMemoryTokenStore {
    token: RwLock<Option<TokenInfo>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: TokenInfo) -> Self {
        Self {
            token: RwLock::new(Some(token)),
        }
    }

    pub async fn set_token(&self, token: TokenInfo) {
        *self.token.write().await = Some(token);
    }

    pub async fn clear(&self) {
        *self.token.write().await = None;
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn has_cached_token(&self) -> bool {
        self.token.read().await.is_some()
    }

    async fn load_token(&self) -> IdentityResult<TokenInfo> {
        self.token
            .read()
            .await
            .clone()
            .ok_or_else(|| IdentityError::NoCachedToken("no cached token found".to_string()))
    }
}

fn no_cached_token() -> IdentityError {
    IdentityError::NoCachedToken("no cached token found in token store mode".to_string())
}

pub struct TokenStoreCredential {
    token: RwLock<AccessToken>,
    store: Option<Arc<dyn TokenStore>>,
    recheck: bool,
}

impl TokenStoreCredential {
    pub fn new(token: AccessToken, store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            token: RwLock::new(token),
            store,
            recheck: false,
        }
    }

    /// Re-validates expiry after the exclusive lock is taken, so tasks that
    /// queued behind a refresh reuse its result instead of reloading.
    pub fn with_recheck(mut self, recheck: bool) -> Self {
        self.recheck = recheck;
        self
    }

    pub async fn current(&self) -> AccessToken {
        self.token.read().await.clone()
    }

    async fn refresh(&self) -> IdentityResult<AccessToken> {
        let mut token = self.token.write().await;

        if self.recheck && !token.needs_refresh() {
            return Ok(token.clone());
        }

        let Some(store) = self.store.as_ref() else {
            return Err(no_cached_token());
        };
        if !store.has_cached_token().await {
            return Err(no_cached_token());
        }

        let info = store.load_token().await?;
        log::debug!("Reloaded token from token store");
        *token = AccessToken::new(info.access_token.clone(), info.expires());
        Ok(token.clone())
    }
}

#[async_trait]
impl TokenCredential for TokenStoreCredential {
    async fn get_token(&self, _scopes: &[&str]) -> IdentityResult<AccessToken> {
        {
            let token = self.token.read().await;
            if token.expires_on - Utc::now() > MINIMUM_TOKEN_VALID_DURATION {
                return Ok(token.clone());
            }
        }
        self.refresh().await
    }

    fn kind(&self) -> CredentialKind {
        CredentialKind::TokenStore
    }
}

/// Owner of the process-wide [`TokenStoreCredential`].
///
/// Cloning the handle shares the same slot. The first call to
/// [`get_or_init`](Self::get_or_init) wins and later seeds are ignored.
#[derive(Clone, Default)]
pub struct SharedTokenHandle {
    cell: Arc<OnceCell<Arc<TokenStoreCredential>>>,
    store: Option<Arc<dyn TokenStore>>,
    recheck: bool,
}

impl SharedTokenHandle {
    pub fn new(store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            cell: Arc::new(OnceCell::new()),
            store,
            recheck: false,
        }
    }

    pub fn with_recheck(mut self, recheck: bool) -> Self {
        self.recheck = recheck;
        self
    }

    pub fn get_or_init(
        &self,
        token: &str,
        expires_on: DateTime<Utc>,
    ) -> Arc<TokenStoreCredential> {
        self.cell
            .get_or_init(|| {
                log::debug!("Initializing shared token store credential");
                Arc::new(
                    TokenStoreCredential::new(AccessToken::new(token, expires_on), self.store.clone())
                        .with_recheck(self.recheck),
                )
            })
            .clone()
    }

    pub fn get(&self) -> Option<Arc<TokenStoreCredential>> {
        self.cell.get().cloned()
    }

    pub fn store(&self) -> Option<&Arc<dyn TokenStore>> {
        self.store.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.get().is_some()
    }
}

/// Per-credential token cache keyed by scope set.
#[derive(Default)]
pub struct TokenSlot {
    tokens: RwLock<HashMap<String, AccessToken>>,
}

impl TokenSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<AccessToken> {
        let tokens = self.tokens.read().await;
        tokens
            .get(key)
            .filter(|token| !token.needs_refresh())
            .cloned()
    }

    /// Returns the cached token for `key`, running `refresh` under the write
    /// lock when it is missing or inside the refresh window.
    pub async fn get_or_refresh<F, Fut>(&self, key: &str, refresh: F) -> IdentityResult<AccessToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = IdentityResult<AccessToken>>,
    {
        if let Some(token) = self.get(key).await {
            return Ok(token);
        }

        let mut tokens = self.tokens.write().await;
        if let Some(token) = tokens.get(key).filter(|token| !token.needs_refresh()) {
            return Ok(token.clone());
        }

        let token = refresh().await?;
        if token.token.is_empty() {
            return Err(IdentityError::InvalidState(
                "credential returned an empty access token".to_string(),
            ));
        }
        tokens.insert(key.to_string(), token.clone());
        Ok(token)
    }

    pub async fn invalidate(&self, key: &str) {
        self.tokens.write().await.remove(key);
    }

    pub async fn clear(&self) {
        self.tokens.write().await.clear();
    }
}
