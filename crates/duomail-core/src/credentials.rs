use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::gmail::oauth::{
    OAuthError, OAuthTokens, TokenExchange, generate_pkce_verifier, generate_state, pkce_challenge,
};
use crate::remote::{AccessToken, RemoteError};
use crate::secrets::{SecretError, SecretStore, oauth_tokens_key};

pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PENDING_FLOW_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    NoCredential,
    Valid,
    Refreshing,
    Expired,
    Revoked,
}

#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    #[error("account {account_id} must be re-authorized")]
    ReauthenticationRequired { account_id: String },
    #[error("temporary credential failure: {0}")]
    Transient(String),
    #[error("secret storage failure: {0}")]
    Storage(#[from] SecretError),
    #[error("authorization callback does not match a pending sign-in")]
    InvalidCallback,
    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),
    #[error("authorization code exchange failed: {0}")]
    Exchange(String),
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::ReauthenticationRequired { .. } => "credential.reauthentication_required",
            CredentialError::Transient(_) => "credential.transient",
            CredentialError::Storage(_) => "credential.storage",
            CredentialError::InvalidCallback => "credential.invalid_callback",
            CredentialError::AuthorizationDenied(_) => "credential.authorization_denied",
            CredentialError::Exchange(_) => "credential.exchange",
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CredentialError::Transient(_) | CredentialError::Storage(_)
        )
    }

    fn reauth(account_id: &str) -> Self {
        CredentialError::ReauthenticationRequired {
            account_id: account_id.to_string(),
        }
    }
}

/// Failure of a remote call made with a managed credential.
#[derive(Debug, Clone, Error)]
pub enum AuthorizedError {
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialSettings {
    pub refresh_buffer: Duration,
    pub pending_flow_ttl: Duration,
}

impl Default for CredentialSettings {
    fn default() -> Self {
        Self {
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            pending_flow_ttl: DEFAULT_PENDING_FLOW_TTL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Query parameters delivered to the OAuth redirect URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletedAuthorization {
    /// Set when the flow re-authorized a known account; its tokens are already stored.
    pub account_id: Option<String>,
    pub tokens: OAuthTokens,
}

#[derive(Debug)]
struct PendingAuthorizationFlow {
    verifier: String,
    redirect_uri: String,
    account_id: Option<String>,
    created_at: Instant,
}

#[derive(Debug)]
struct AccountSlot {
    loaded: bool,
    state: CredentialState,
    tokens: Option<OAuthTokens>,
    /// Bytes last seen in the secret store, used as the compare-and-swap expectation.
    stored: Option<Vec<u8>>,
    /// Bumped whenever tokens are replaced from outside a refresh (sign-in, sign-out).
    generation: u64,
    refresh_lock: Arc<AsyncMutex<()>>,
    completed_refreshes: u64,
    last_refresh: Option<Result<AccessToken, CredentialError>>,
}

impl Default for AccountSlot {
    fn default() -> Self {
        Self {
            loaded: false,
            state: CredentialState::NoCredential,
            tokens: None,
            stored: None,
            generation: 0,
            refresh_lock: Arc::new(AsyncMutex::new(())),
            completed_refreshes: 0,
            last_refresh: None,
        }
    }
}

enum CachedToken {
    Ready(AccessToken),
    NeedsRefresh {
        lock: Arc<AsyncMutex<()>>,
        completed: u64,
    },
}

/// Keeps one live token set per account. Concurrent callers needing a refresh queue on the
/// account's refresh lock; only the first performs the network refresh, the rest take its result.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<Inner>,
}

struct Inner {
    secrets: Arc<dyn SecretStore>,
    exchange: Arc<dyn TokenExchange>,
    settings: CredentialSettings,
    slots: Mutex<HashMap<String, AccountSlot>>,
    pending: Mutex<HashMap<String, PendingAuthorizationFlow>>,
}

impl CredentialManager {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        exchange: Arc<dyn TokenExchange>,
        settings: CredentialSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                secrets,
                exchange,
                settings,
                slots: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, AccountSlot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingAuthorizationFlow>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_fresh(&self, tokens: &OAuthTokens) -> bool {
        let buffer = chrono::Duration::from_std(self.inner.settings.refresh_buffer)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        !tokens.needs_refresh(Utc::now(), buffer)
    }

    async fn ensure_loaded(&self, account_id: &str) -> Result<(), CredentialError> {
        let generation = {
            let slots = self.slots();
            match slots.get(account_id) {
                Some(slot) if slot.loaded => return Ok(()),
                Some(slot) => slot.generation,
                None => 0,
            }
        };

        let stored = self
            .inner
            .secrets
            .get(&oauth_tokens_key(account_id))
            .await?;
        let tokens = stored.as_deref().and_then(|bytes| {
            serde_json::from_slice::<OAuthTokens>(bytes)
                .inspect_err(|err| warn!(account_id, error = %err, "discarding unreadable token set"))
                .ok()
        });

        let mut slots = self.slots();
        let slot = slots.entry(account_id.to_string()).or_default();
        if slot.loaded || slot.generation != generation {
            return Ok(());
        }
        slot.state = if tokens.is_some() {
            CredentialState::Valid
        } else {
            CredentialState::NoCredential
        };
        slot.tokens = tokens;
        slot.stored = stored;
        slot.loaded = true;
        Ok(())
    }

    pub async fn state(&self, account_id: &str) -> Result<CredentialState, CredentialError> {
        self.ensure_loaded(account_id).await?;
        let slots = self.slots();
        Ok(match slots.get(account_id) {
            Some(slot)
                if slot.state == CredentialState::Valid && slot.refresh_lock.try_lock().is_err() =>
            {
                CredentialState::Refreshing
            }
            Some(slot) => slot.state,
            None => CredentialState::NoCredential,
        })
    }

    fn cached_token(&self, account_id: &str) -> Result<CachedToken, CredentialError> {
        let slots = self.slots();
        let Some(slot) = slots.get(account_id) else {
            return Err(CredentialError::reauth(account_id));
        };
        match (slot.state, slot.tokens.as_ref()) {
            (CredentialState::Valid | CredentialState::Refreshing, Some(tokens)) => {
                if self.is_fresh(tokens) {
                    Ok(CachedToken::Ready(AccessToken::new(tokens.access_token.clone())))
                } else {
                    Ok(CachedToken::NeedsRefresh {
                        lock: slot.refresh_lock.clone(),
                        completed: slot.completed_refreshes,
                    })
                }
            }
            _ => Err(CredentialError::reauth(account_id)),
        }
    }

    /// Returns a token that stays valid for at least the refresh buffer, refreshing when needed.
    pub async fn get_valid_token(&self, account_id: &str) -> Result<AccessToken, CredentialError> {
        self.ensure_loaded(account_id).await?;

        let (lock, completed) = match self.cached_token(account_id)? {
            CachedToken::Ready(token) => return Ok(token),
            CachedToken::NeedsRefresh { lock, completed } => (lock, completed),
        };

        let _guard = lock.lock_owned().await;

        let (current, generation) = {
            let slots = self.slots();
            let Some(slot) = slots.get(account_id) else {
                return Err(CredentialError::reauth(account_id));
            };
            if slot.completed_refreshes != completed {
                if let Some(outcome) = slot.last_refresh.clone() {
                    return outcome;
                }
            }
            match (slot.state, slot.tokens.as_ref()) {
                (CredentialState::Valid, Some(tokens)) if self.is_fresh(tokens) => {
                    return Ok(AccessToken::new(tokens.access_token.clone()));
                }
                (CredentialState::Valid, Some(tokens)) => (tokens.clone(), slot.generation),
                _ => return Err(CredentialError::reauth(account_id)),
            }
        };

        debug!(account_id, "refreshing access token");
        let outcome = match self.inner.exchange.refresh(&current).await {
            Ok(refreshed) => self.adopt_refreshed(account_id, generation, refreshed).await,
            Err(err) => Err(self.refresh_failed(account_id, generation, err)),
        };

        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(account_id) {
            slot.completed_refreshes += 1;
            slot.last_refresh = Some(outcome.clone());
        }
        outcome
    }

    async fn adopt_refreshed(
        &self,
        account_id: &str,
        generation: u64,
        refreshed: OAuthTokens,
    ) -> Result<AccessToken, CredentialError> {
        let bytes = serde_json::to_vec(&refreshed)
            .map_err(|err| CredentialError::Transient(err.to_string()))?;
        let expected = {
            let slots = self.slots();
            match slots.get(account_id) {
                Some(slot) if slot.generation == generation => slot.stored.clone(),
                _ => return Err(CredentialError::reauth(account_id)),
            }
        };

        let persisted = self
            .inner
            .secrets
            .replace(&oauth_tokens_key(account_id), expected.as_deref(), &bytes)
            .await;

        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(account_id) else {
            return Err(CredentialError::reauth(account_id));
        };
        if slot.generation != generation {
            // Signed out or re-authorized while the refresh was in flight.
            return Err(CredentialError::reauth(account_id));
        }

        let token = AccessToken::new(refreshed.access_token.clone());
        match persisted {
            Ok(()) => {
                slot.stored = Some(bytes);
                slot.tokens = Some(refreshed);
                slot.state = CredentialState::Valid;
                info!(account_id, "access token refreshed");
                Ok(token)
            }
            Err(SecretError::Conflict(_)) => {
                warn!(account_id, "token set changed in the secret store, reloading");
                slot.loaded = false;
                slot.generation += 1;
                Err(CredentialError::Transient(
                    "credential changed concurrently".to_string(),
                ))
            }
            Err(err) => {
                error!(account_id, error = %err, "failed to persist refreshed token");
                slot.tokens = Some(refreshed);
                slot.state = CredentialState::Valid;
                Err(CredentialError::Storage(err))
            }
        }
    }

    fn refresh_failed(&self, account_id: &str, generation: u64, err: OAuthError) -> CredentialError {
        let mut slots = self.slots();
        let Some(slot) = slots.get_mut(account_id) else {
            return CredentialError::reauth(account_id);
        };
        if slot.generation != generation {
            return CredentialError::reauth(account_id);
        }

        match err {
            OAuthError::InvalidGrant | OAuthError::MissingRefreshToken => {
                warn!(account_id, error = %err, "refresh token rejected");
                slot.state = CredentialState::Expired;
                CredentialError::reauth(account_id)
            }
            OAuthError::ClientRevoked(_) => {
                warn!(account_id, error = %err, "oauth client revoked");
                slot.state = CredentialState::Revoked;
                CredentialError::reauth(account_id)
            }
            other => {
                warn!(account_id, error = %other, "token refresh failed, keeping stale token");
                CredentialError::Transient(other.to_string())
            }
        }
    }

    /// Runs `op` with a valid token, retrying once with a fresh token if the remote rejects it.
    pub async fn call_authorized<T, F, Fut>(
        &self,
        account_id: &str,
        op: F,
    ) -> Result<T, AuthorizedError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let token = self.get_valid_token(account_id).await?;
        match op(token.clone()).await {
            Err(RemoteError::AuthRejected) => {
                debug!(account_id, "token rejected by remote, forcing refresh");
                self.invalidate(account_id, &token);
                let token = self.get_valid_token(account_id).await?;
                Ok(op(token).await?)
            }
            other => Ok(other?),
        }
    }

    /// Marks `token` as expired so the next caller refreshes. A newer token is left alone.
    pub fn invalidate(&self, account_id: &str, token: &AccessToken) {
        let mut slots = self.slots();
        if let Some(tokens) = slots
            .get_mut(account_id)
            .and_then(|slot| slot.tokens.as_mut())
        {
            if tokens.access_token == token.secret() {
                tokens.expires_at = Utc::now();
            }
        }
    }

    /// Stores a freshly granted token set, replacing whatever was there.
    pub async fn store_tokens(
        &self,
        account_id: &str,
        tokens: OAuthTokens,
    ) -> Result<(), CredentialError> {
        let bytes = serde_json::to_vec(&tokens)
            .map_err(|err| CredentialError::Transient(err.to_string()))?;
        self.inner
            .secrets
            .put(&oauth_tokens_key(account_id), &bytes)
            .await?;

        let mut slots = self.slots();
        let slot = slots.entry(account_id.to_string()).or_default();
        slot.loaded = true;
        slot.generation += 1;
        slot.state = CredentialState::Valid;
        slot.tokens = Some(tokens);
        slot.stored = Some(bytes);
        slot.last_refresh = None;
        info!(account_id, "stored new credentials");
        Ok(())
    }

    pub async fn sign_out(&self, account_id: &str) -> Result<(), CredentialError> {
        self.inner
            .secrets
            .delete(&oauth_tokens_key(account_id))
            .await?;

        let mut slots = self.slots();
        let slot = slots.entry(account_id.to_string()).or_default();
        slot.loaded = true;
        slot.generation += 1;
        slot.state = CredentialState::NoCredential;
        slot.tokens = None;
        slot.stored = None;
        slot.last_refresh = None;
        info!(account_id, "signed out");
        Ok(())
    }

    /// Starts an interactive sign-in. Pass `account_id` when re-authorizing a known account.
    pub fn begin_authorization(
        &self,
        redirect_uri: &str,
        account_id: Option<&str>,
    ) -> AuthorizationRequest {
        self.purge_expired_flows();

        let state = generate_state();
        let verifier = generate_pkce_verifier();
        let url = self.inner.exchange.authorization_url(
            &state,
            &pkce_challenge(&verifier),
            redirect_uri,
        );

        self.pending().insert(
            state.clone(),
            PendingAuthorizationFlow {
                verifier,
                redirect_uri: redirect_uri.to_string(),
                account_id: account_id.map(str::to_string),
                created_at: Instant::now(),
            },
        );

        AuthorizationRequest { url, state }
    }

    pub async fn complete_authorization(
        &self,
        params: &CallbackParams,
    ) -> Result<CompletedAuthorization, CredentialError> {
        self.purge_expired_flows();

        let state = params
            .state
            .as_deref()
            .ok_or(CredentialError::InvalidCallback)?;
        let flow = self
            .pending()
            .remove(state)
            .ok_or(CredentialError::InvalidCallback)?;

        if let Some(error) = params.error.as_deref() {
            return Err(CredentialError::AuthorizationDenied(error.to_string()));
        }
        let code = params
            .code
            .as_deref()
            .filter(|code| !code.is_empty())
            .ok_or(CredentialError::InvalidCallback)?;

        let tokens = self
            .inner
            .exchange
            .exchange_code(code, &flow.verifier, &flow.redirect_uri)
            .await
            .map_err(|err| CredentialError::Exchange(err.to_string()))?;

        if let Some(account_id) = flow.account_id.as_deref() {
            self.store_tokens(account_id, tokens.clone()).await?;
        }

        Ok(CompletedAuthorization {
            account_id: flow.account_id,
            tokens,
        })
    }

    fn purge_expired_flows(&self) {
        let ttl = self.inner.settings.pending_flow_ttl;
        let mut pending = self.pending();
        let before = pending.len();
        pending.retain(|_, flow| flow.created_at.elapsed() <= ttl);
        let purged = before - pending.len();
        if purged > 0 {
            debug!(purged, "discarded expired authorization flows");
        }
    }

    #[cfg(test)]
    fn pending_flow_count(&self) -> usize {
        self.pending().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::MemorySecretStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum RefreshBehavior {
        Succeed,
        InvalidGrant,
        ClientRevoked,
        ServerError,
    }

    struct FakeExchange {
        refresh_calls: AtomicUsize,
        exchange_calls: AtomicUsize,
        behavior: Mutex<RefreshBehavior>,
        delay: Duration,
    }

    impl FakeExchange {
        fn new(behavior: RefreshBehavior) -> Arc<Self> {
            Arc::new(Self {
                refresh_calls: AtomicUsize::new(0),
                exchange_calls: AtomicUsize::new(0),
                behavior: Mutex::new(behavior),
                delay: Duration::from_millis(50),
            })
        }

        fn set_behavior(&self, behavior: RefreshBehavior) {
            *self.behavior.lock().expect("behavior lock") = behavior;
        }
    }

    #[async_trait]
    impl TokenExchange for FakeExchange {
        async fn refresh(&self, tokens: &OAuthTokens) -> Result<OAuthTokens, OAuthError> {
            let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            let behavior = *self.behavior.lock().expect("behavior lock");
            match behavior {
                RefreshBehavior::Succeed => Ok(OAuthTokens {
                    access_token: format!("refreshed-{call}"),
                    refresh_token: tokens.refresh_token.clone(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                    scope: tokens.scope.clone(),
                }),
                RefreshBehavior::InvalidGrant => Err(OAuthError::InvalidGrant),
                RefreshBehavior::ClientRevoked => {
                    Err(OAuthError::ClientRevoked("invalid_client".into()))
                }
                RefreshBehavior::ServerError => Err(OAuthError::TokenEndpoint {
                    status: 503,
                    body: "unavailable".into(),
                }),
            }
        }

        async fn exchange_code(
            &self,
            code: &str,
            verifier: &str,
            _redirect_uri: &str,
        ) -> Result<OAuthTokens, OAuthError> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(verifier.len(), 64);
            Ok(OAuthTokens {
                access_token: format!("access-for-{code}"),
                refresh_token: "refresh".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                scope: None,
            })
        }

        fn authorization_url(&self, state: &str, challenge: &str, redirect_uri: &str) -> String {
            format!("https://auth.test/?state={state}&code_challenge={challenge}&redirect_uri={redirect_uri}")
        }
    }

    fn tokens(access: &str, expires_in: chrono::Duration) -> OAuthTokens {
        OAuthTokens {
            access_token: access.into(),
            refresh_token: "refresh".into(),
            expires_at: Utc::now() + expires_in,
            scope: Some("mail".into()),
        }
    }

    async fn manager_with(
        behavior: RefreshBehavior,
        initial: Option<OAuthTokens>,
    ) -> (CredentialManager, Arc<FakeExchange>, MemorySecretStore) {
        let store = MemorySecretStore::new();
        if let Some(initial) = initial {
            store
                .put(
                    &oauth_tokens_key("acc"),
                    &serde_json::to_vec(&initial).expect("encode"),
                )
                .await
                .expect("seed");
        }
        let exchange = FakeExchange::new(behavior);
        let manager = CredentialManager::new(
            Arc::new(store.clone()),
            exchange.clone(),
            CredentialSettings::default(),
        );
        (manager, exchange, store)
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let (manager, exchange, _store) = manager_with(
            RefreshBehavior::Succeed,
            Some(tokens("live", chrono::Duration::hours(1))),
        )
        .await;

        let token = manager.get_valid_token("acc").await.expect("token");
        assert_eq!(token.secret(), "live");
        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            manager.state("acc").await.expect("state"),
            CredentialState::Valid
        );
    }

    #[tokio::test]
    async fn token_inside_buffer_window_is_refreshed_and_persisted() {
        let (manager, exchange, store) = manager_with(
            RefreshBehavior::Succeed,
            Some(tokens("stale", chrono::Duration::minutes(4))),
        )
        .await;

        let token = manager.get_valid_token("acc").await.expect("token");
        assert_eq!(token.secret(), "refreshed-1");
        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 1);

        let stored = store
            .get(&oauth_tokens_key("acc"))
            .await
            .expect("get")
            .expect("present");
        let stored: OAuthTokens = serde_json::from_slice(&stored).expect("decode");
        assert_eq!(stored.access_token, "refreshed-1");
        assert_eq!(stored.scope.as_deref(), Some("mail"));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let (manager, exchange, _store) = manager_with(
            RefreshBehavior::Succeed,
            Some(tokens("expired", chrono::Duration::minutes(-1))),
        )
        .await;

        let calls = (0..10).map(|_| {
            let manager = manager.clone();
            async move { manager.get_valid_token("acc").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 1);
        for result in results {
            assert_eq!(result.expect("token").secret(), "refreshed-1");
        }
    }

    #[tokio::test]
    async fn concurrent_waiters_share_a_transient_failure() {
        let (manager, exchange, _store) = manager_with(
            RefreshBehavior::ServerError,
            Some(tokens("expired", chrono::Duration::minutes(-1))),
        )
        .await;

        let calls = (0..5).map(|_| {
            let manager = manager.clone();
            async move { manager.get_valid_token("acc").await }
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 1);
        for result in results {
            let err = result.expect_err("transient");
            assert!(matches!(err, CredentialError::Transient(_)));
            assert!(err.is_recoverable());
        }
        assert_eq!(
            manager.state("acc").await.expect("state"),
            CredentialState::Valid
        );

        exchange.set_behavior(RefreshBehavior::Succeed);
        let token = manager.get_valid_token("acc").await.expect("later retry");
        assert_eq!(token.secret(), "refreshed-2");
    }

    #[tokio::test]
    async fn invalid_grant_expires_credentials() {
        let (manager, exchange, _store) = manager_with(
            RefreshBehavior::InvalidGrant,
            Some(tokens("expired", chrono::Duration::minutes(-1))),
        )
        .await;

        let err = manager.get_valid_token("acc").await.expect_err("reauth");
        assert!(matches!(
            err,
            CredentialError::ReauthenticationRequired { ref account_id } if account_id == "acc"
        ));
        assert_eq!(
            manager.state("acc").await.expect("state"),
            CredentialState::Expired
        );

        manager.get_valid_token("acc").await.expect_err("still reauth");
        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_client_requires_reauthentication() {
        let (manager, _exchange, _store) = manager_with(
            RefreshBehavior::ClientRevoked,
            Some(tokens("expired", chrono::Duration::minutes(-1))),
        )
        .await;

        let err = manager.get_valid_token("acc").await.expect_err("reauth");
        assert!(matches!(err, CredentialError::ReauthenticationRequired { .. }));
        assert_eq!(
            manager.state("acc").await.expect("state"),
            CredentialState::Revoked
        );
    }

    #[tokio::test]
    async fn unknown_account_has_no_credential() {
        let (manager, exchange, _store) = manager_with(RefreshBehavior::Succeed, None).await;
        assert_eq!(
            manager.state("acc").await.expect("state"),
            CredentialState::NoCredential
        );
        let err = manager.get_valid_token("acc").await.expect_err("no tokens");
        assert!(matches!(err, CredentialError::ReauthenticationRequired { .. }));
        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sign_out_deletes_tokens_and_blocks_silent_refresh() {
        let (manager, exchange, store) = manager_with(
            RefreshBehavior::Succeed,
            Some(tokens("live", chrono::Duration::hours(1))),
        )
        .await;
        manager.get_valid_token("acc").await.expect("token");

        manager.sign_out("acc").await.expect("sign out");
        assert_eq!(
            store.get(&oauth_tokens_key("acc")).await.expect("get"),
            None
        );
        assert_eq!(
            manager.state("acc").await.expect("state"),
            CredentialState::NoCredential
        );
        let err = manager.get_valid_token("acc").await.expect_err("signed out");
        assert!(matches!(err, CredentialError::ReauthenticationRequired { .. }));
        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sign_out_during_refresh_does_not_resurrect_tokens() {
        let (manager, _exchange, store) = manager_with(
            RefreshBehavior::Succeed,
            Some(tokens("expired", chrono::Duration::minutes(-1))),
        )
        .await;

        let refreshing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_valid_token("acc").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.sign_out("acc").await.expect("sign out");

        let result = refreshing.await.expect("join");
        assert!(matches!(
            result,
            Err(CredentialError::ReauthenticationRequired { .. })
        ));
        assert_eq!(
            store.get(&oauth_tokens_key("acc")).await.expect("get"),
            None
        );
    }

    #[tokio::test]
    async fn call_authorized_retries_once_after_rejection() {
        let (manager, exchange, _store) = manager_with(
            RefreshBehavior::Succeed,
            Some(tokens("live", chrono::Duration::hours(1))),
        )
        .await;

        let attempts = AtomicUsize::new(0);
        let value = manager
            .call_authorized("acc", |token| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        assert_eq!(token.secret(), "live");
                        Err(RemoteError::AuthRejected)
                    } else {
                        Ok(token.secret().to_string())
                    }
                }
            })
            .await
            .expect("second attempt succeeds");

        assert_eq!(value, "refreshed-1");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(exchange.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn authorization_flow_is_consumed_once() {
        let (manager, exchange, _store) = manager_with(RefreshBehavior::Succeed, None).await;

        let request = manager.begin_authorization("http://127.0.0.1:1/cb", Some("acc"));
        assert!(request.url.contains(&request.state));
        assert!(request.url.contains("code_challenge="));

        let params = CallbackParams {
            state: Some(request.state.clone()),
            code: Some("abc".into()),
            error: None,
        };
        let completed = manager.complete_authorization(&params).await.expect("completes");
        assert_eq!(completed.account_id.as_deref(), Some("acc"));
        assert_eq!(completed.tokens.access_token, "access-for-abc");
        assert_eq!(
            manager.get_valid_token("acc").await.expect("token").secret(),
            "access-for-abc"
        );

        let err = manager
            .complete_authorization(&params)
            .await
            .expect_err("replayed callback");
        assert!(matches!(err, CredentialError::InvalidCallback));
        assert_eq!(exchange.exchange_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_callback_consumes_flow() {
        let (manager, exchange, _store) = manager_with(RefreshBehavior::Succeed, None).await;
        let request = manager.begin_authorization("http://127.0.0.1:1/cb", None);

        let denied = CallbackParams {
            state: Some(request.state.clone()),
            code: None,
            error: Some("access_denied".into()),
        };
        let err = manager
            .complete_authorization(&denied)
            .await
            .expect_err("denied");
        assert!(matches!(err, CredentialError::AuthorizationDenied(ref e) if e == "access_denied"));
        assert_eq!(manager.pending_flow_count(), 0);
        assert_eq!(exchange.exchange_calls.load(Ordering::SeqCst), 0);

        let unknown = CallbackParams {
            state: Some("unknown".into()),
            code: Some("abc".into()),
            error: None,
        };
        assert!(matches!(
            manager.complete_authorization(&unknown).await,
            Err(CredentialError::InvalidCallback)
        ));
    }

    #[tokio::test]
    async fn expired_flows_are_purged() {
        let store = MemorySecretStore::new();
        let manager = CredentialManager::new(
            Arc::new(store),
            FakeExchange::new(RefreshBehavior::Succeed),
            CredentialSettings {
                refresh_buffer: DEFAULT_REFRESH_BUFFER,
                pending_flow_ttl: Duration::from_millis(5),
            },
        );

        let request = manager.begin_authorization("http://127.0.0.1:1/cb", None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let params = CallbackParams {
            state: Some(request.state),
            code: Some("abc".into()),
            error: None,
        };
        assert!(matches!(
            manager.complete_authorization(&params).await,
            Err(CredentialError::InvalidCallback)
        ));
    }
}
