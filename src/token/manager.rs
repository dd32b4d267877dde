use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::crypto::EncryptionService;
use crate::error::GatewayError;
use crate::oauth::AuthorizedGrant;
use crate::providers::OAuthProvider;
use crate::store::{CredentialStatus, CredentialStore, StoredCredential};

/// Lifecycle of one owner's credential.
///
/// `Unauthenticated → Authorizing → Authenticated → Expiring → Refreshing →
/// {Authenticated | Invalid}`. `Invalid` is terminal until the owner runs
/// the authorization flow again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialState {
    Unauthenticated,
    Authorizing,
    Authenticated,
    Expiring,
    Refreshing,
    Invalid,
}

/// Decrypted access token held in memory between refreshes.
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
    /// Refresh token from a refresh whose result could not be stored.
    /// Used for the next refresh and persisted with it.
    unsaved_refresh_token: Option<String>,
}

struct CredentialSlot {
    state: Mutex<CredentialState>,
    /// Refresh lock. Whoever holds it owns the refresh; everyone else waits
    /// here and then reads the token it produced.
    token: tokio::sync::Mutex<Option<CachedToken>>,
}

impl CredentialSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(CredentialState::Unauthenticated),
            token: tokio::sync::Mutex::new(None),
        }
    }

    fn state(&self) -> CredentialState {
        match self.state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_state(&self, next: CredentialState) {
        match self.state.lock() {
            Ok(mut state) => *state = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}

/// Public view of a connected credential. Never carries token material.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub owner_id: String,
    pub platform: String,
    pub state: CredentialState,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub manager_account_id: Option<String>,
}

/// Owns credential state for one OAuth platform and hands out valid access tokens.
pub struct TokenManager {
    provider: Arc<dyn OAuthProvider>,
    store: Arc<dyn CredentialStore>,
    cipher: Arc<dyn EncryptionService>,
    refresh_buffer: Duration,
    slots: Mutex<HashMap<String, Arc<CredentialSlot>>>,
}

impl TokenManager {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        store: Arc<dyn CredentialStore>,
        cipher: Arc<dyn EncryptionService>,
        refresh_buffer: std::time::Duration,
    ) -> Self {
        Self {
            provider,
            store,
            cipher,
            refresh_buffer: Duration::from_std(refresh_buffer).unwrap_or_else(|_| Duration::minutes(5)),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn platform(&self) -> &str {
        self.provider.id()
    }

    fn slot(&self, owner_id: &str) -> Arc<CredentialSlot> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(owner_id.to_string())
            .or_insert_with(|| Arc::new(CredentialSlot::new()))
            .clone()
    }

    /// Current in-memory lifecycle state for `owner_id`.
    pub fn state(&self, owner_id: &str) -> CredentialState {
        self.slot(owner_id).state()
    }

    /// Mark an authorization round trip as started for `owner_id`.
    pub fn begin_authorization(&self, owner_id: &str) {
        self.slot(owner_id).set_state(CredentialState::Authorizing);
    }

    /// Roll back a failed authorization round trip.
    pub fn authorization_failed(&self, owner_id: &str) {
        let slot = self.slot(owner_id);
        if slot.state() == CredentialState::Authorizing {
            slot.set_state(CredentialState::Unauthenticated);
        }
    }

    /// Persist the tokens from a successful code exchange.
    pub async fn complete_authorization(
        &self,
        grant: AuthorizedGrant,
    ) -> Result<ConnectionStatus, GatewayError> {
        if grant.expires_at <= grant.issued_at {
            return Err(GatewayError::Auth("token expiry precedes issuance".into()));
        }
        if grant.refresh_token.is_none() {
            warn!(owner_id = %grant.owner_id, "Code exchange returned no refresh token");
        }

        let access_token_enc = self.cipher.encrypt(&grant.access_token)?;
        let refresh_token_enc = grant
            .refresh_token
            .as_deref()
            .map(|rt| self.cipher.encrypt(rt))
            .transpose()?;

        let record = StoredCredential {
            platform: self.platform().to_string(),
            owner_id: grant.owner_id.clone(),
            access_token_enc,
            refresh_token_enc,
            expires_at: grant.expires_at,
            scopes: grant.scopes.clone(),
            connected_at: grant.issued_at,
            status: CredentialStatus::Active,
            manager_account_id: None,
        };

        let slot = self.slot(&grant.owner_id);
        let mut cached = slot.token.lock().await;
        self.store.upsert(&record).await?;
        *cached = Some(CachedToken {
            access_token: grant.access_token,
            expires_at: grant.expires_at,
            unsaved_refresh_token: None,
        });
        slot.set_state(CredentialState::Authenticated);
        drop(cached);

        self.audit(&grant.owner_id, "oauth.connected", json!({ "scopes": grant.scopes }))
            .await;
        info!(owner_id = %grant.owner_id, expires_at = %grant.expires_at, "Credential connected");

        self.describe(&grant.owner_id)
            .await?
            .ok_or_else(|| GatewayError::NotConnected(grant.owner_id.clone()))
    }

    /// Return a usable access token, refreshing first when it is inside the
    /// safety buffer. Concurrent callers share a single refresh.
    pub async fn get_access_token(&self, owner_id: &str) -> Result<String, GatewayError> {
        self.token_with_margin(owner_id, self.refresh_buffer).await
    }

    /// Refresh now if the token expires within `margin`. Used by the
    /// background daemon to stay ahead of callers.
    pub async fn refresh_ahead(&self, owner_id: &str, margin: std::time::Duration) -> Result<(), GatewayError> {
        let margin = Duration::from_std(margin).unwrap_or(self.refresh_buffer);
        self.token_with_margin(owner_id, margin.max(self.refresh_buffer))
            .await
            .map(|_| ())
    }

    /// Owners whose stored token expires within `window` from now.
    pub async fn expiring_owners(&self, window: std::time::Duration) -> Result<Vec<String>, GatewayError> {
        let window = Duration::from_std(window).unwrap_or(self.refresh_buffer);
        self.store.list_expiring(self.platform(), Utc::now() + window).await
    }

    pub fn refresh_buffer(&self) -> std::time::Duration {
        self.refresh_buffer.to_std().unwrap_or_default()
    }

    async fn token_with_margin(&self, owner_id: &str, margin: Duration) -> Result<String, GatewayError> {
        let slot = self.slot(owner_id);
        if slot.state() == CredentialState::Invalid {
            return Err(GatewayError::AuthExpired);
        }

        let mut cached = slot.token.lock().await;

        // The refresh we were waiting on may have invalidated the credential.
        if slot.state() == CredentialState::Invalid {
            return Err(GatewayError::AuthExpired);
        }

        if cached.is_none() {
            *cached = Some(self.load_cached(owner_id, &slot).await?);
        }

        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if now < token.expires_at - margin {
                return Ok(token.access_token.clone());
            }
        }

        slot.set_state(CredentialState::Expiring);
        self.refresh_locked(owner_id, &slot, &mut cached).await
    }

    /// Load and decrypt the stored credential into the cache.
    async fn load_cached(
        &self,
        owner_id: &str,
        slot: &CredentialSlot,
    ) -> Result<CachedToken, GatewayError> {
        let stored = self
            .store
            .load(self.platform(), owner_id)
            .await?
            .ok_or_else(|| GatewayError::NotConnected(owner_id.to_string()))?;

        if stored.status == CredentialStatus::Invalid {
            slot.set_state(CredentialState::Invalid);
            return Err(GatewayError::AuthExpired);
        }

        let access_token = self.cipher.decrypt(&stored.access_token_enc)?;
        slot.set_state(CredentialState::Authenticated);

        Ok(CachedToken {
            access_token,
            expires_at: stored.expires_at,
            unsaved_refresh_token: None,
        })
    }

    async fn refresh_locked(
        &self,
        owner_id: &str,
        slot: &CredentialSlot,
        cached: &mut Option<CachedToken>,
    ) -> Result<String, GatewayError> {
        slot.set_state(CredentialState::Refreshing);
        let result = self.run_refresh(owner_id, slot, cached).await;

        // Storage or decryption failures must not strand the credential mid-refresh.
        if result.is_err() && slot.state() == CredentialState::Refreshing {
            slot.set_state(CredentialState::Expiring);
        }
        result
    }

    async fn run_refresh(
        &self,
        owner_id: &str,
        slot: &CredentialSlot,
        cached: &mut Option<CachedToken>,
    ) -> Result<String, GatewayError> {
        let carried = cached.as_ref().and_then(|t| t.unsaved_refresh_token.clone());

        let refresh_token = match carried.clone() {
            Some(rt) => rt,
            None => {
                let stored = self
                    .store
                    .load(self.platform(), owner_id)
                    .await?
                    .ok_or_else(|| GatewayError::NotConnected(owner_id.to_string()))?;

                match stored.refresh_token_enc.as_deref() {
                    Some(enc) => self.cipher.decrypt(enc)?,
                    None => {
                        warn!(owner_id, "Access token expiring and no refresh token stored");
                        self.invalidate(owner_id, slot, cached, "missing_refresh_token").await;
                        return Err(GatewayError::AuthExpired);
                    }
                }
            }
        };

        info!(owner_id, "Refreshing access token");
        match self.provider.refresh_token(&refresh_token).await {
            Ok(tokens) => {
                let issued_at = Utc::now();
                let expires_in = tokens
                    .expires_in
                    .filter(|secs| *secs > 0)
                    .unwrap_or_else(|| self.provider.token_ttl().as_secs().max(1));
                let expires_at = issued_at + Duration::seconds(expires_in as i64);

                // Rotation: only replace the stored refresh token when a new one is
                // issued, or when the one just used never made it to storage.
                let next_refresh = tokens.refresh_token.clone().or(carried);
                let unsaved_refresh_token = match self
                    .persist_refresh(owner_id, &tokens.access_token, next_refresh.as_deref(), expires_at)
                    .await
                {
                    Ok(()) => None,
                    Err(e) => {
                        error!(owner_id, "Refreshed tokens could not be stored, keeping them in memory: {e}");
                        self.audit(owner_id, "oauth.refresh_persist_failed", json!({ "error": e.to_string() }))
                            .await;
                        next_refresh.clone()
                    }
                };

                *cached = Some(CachedToken {
                    access_token: tokens.access_token.clone(),
                    expires_at,
                    unsaved_refresh_token,
                });
                slot.set_state(CredentialState::Authenticated);
                info!(owner_id, expires_at = %expires_at, rotated = tokens.refresh_token.is_some(), "Access token refreshed");

                Ok(tokens.access_token)
            }
            Err(e) if !e.is_retryable() => {
                error!(owner_id, "Refresh rejected, credential invalidated: {e}");
                self.invalidate(owner_id, slot, cached, &e.to_string()).await;
                Err(GatewayError::AuthExpired)
            }
            Err(e) => {
                error!(owner_id, "Refresh failed: {e}");
                self.audit(owner_id, "oauth.refresh_failed", json!({ "error": e.to_string() }))
                    .await;

                // Still inside the safety buffer: the old token keeps working for now.
                match cached.as_ref() {
                    Some(token) if Utc::now() < token.expires_at => {
                        slot.set_state(CredentialState::Expiring);
                        warn!(owner_id, "Serving current access token until next refresh attempt");
                        Ok(token.access_token.clone())
                    }
                    _ => {
                        slot.set_state(CredentialState::Expiring);
                        Err(e)
                    }
                }
            }
        }
    }

    async fn persist_refresh(
        &self,
        owner_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let access_token_enc = self.cipher.encrypt(access_token)?;
        let refresh_token_enc = refresh_token.map(|rt| self.cipher.encrypt(rt)).transpose()?;

        self.store
            .update_refreshed(
                self.platform(),
                owner_id,
                &access_token_enc,
                refresh_token_enc.as_deref(),
                expires_at,
            )
            .await
    }

    async fn invalidate(
        &self,
        owner_id: &str,
        slot: &CredentialSlot,
        cached: &mut Option<CachedToken>,
        reason: &str,
    ) {
        *cached = None;
        slot.set_state(CredentialState::Invalid);

        if let Err(e) = self.store.mark_invalid(self.platform(), owner_id).await {
            error!(owner_id, "Failed to persist credential invalidation: {e}");
        }
        self.audit(owner_id, "oauth.invalidated", json!({ "reason": reason }))
            .await;
    }

    /// Revoke and delete the credential. Only explicit disconnects delete records.
    pub async fn disconnect(&self, owner_id: &str) -> Result<(), GatewayError> {
        let slot = self.slot(owner_id);
        let mut cached = slot.token.lock().await;

        let stored = self
            .store
            .load(self.platform(), owner_id)
            .await?
            .ok_or_else(|| GatewayError::NotConnected(owner_id.to_string()))?;

        if let Some(enc) = stored.refresh_token_enc.as_deref() {
            match self.cipher.decrypt(enc) {
                Ok(refresh_token) => {
                    if let Err(e) = self.provider.revoke(&refresh_token).await {
                        warn!(owner_id, "Token revocation failed, deleting anyway: {e}");
                    }
                }
                Err(e) => warn!(owner_id, "Could not decrypt refresh token for revocation: {e}"),
            }
        }

        self.store.delete(self.platform(), owner_id).await?;
        *cached = None;
        slot.set_state(CredentialState::Unauthenticated);
        drop(cached);

        self.audit(owner_id, "oauth.disconnected", json!({})).await;
        info!(owner_id, "Credential disconnected");
        Ok(())
    }

    /// Connection summary for `owner_id`, or `None` if nothing is stored.
    pub async fn describe(&self, owner_id: &str) -> Result<Option<ConnectionStatus>, GatewayError> {
        let stored = match self.store.load(self.platform(), owner_id).await? {
            Some(s) => s,
            None => return Ok(None),
        };

        let state = match (stored.status, self.state(owner_id)) {
            (CredentialStatus::Invalid, _) => CredentialState::Invalid,
            (CredentialStatus::Active, CredentialState::Unauthenticated) => CredentialState::Authenticated,
            (CredentialStatus::Active, state) => state,
        };

        Ok(Some(ConnectionStatus {
            owner_id: stored.owner_id,
            platform: stored.platform,
            state,
            expires_at: stored.expires_at,
            scopes: stored.scopes,
            connected_at: stored.connected_at,
            manager_account_id: stored.manager_account_id,
        }))
    }

    async fn audit(&self, owner_id: &str, event_type: &str, metadata: serde_json::Value) {
        if let Err(e) = self
            .store
            .record_event(self.platform(), owner_id, event_type, metadata)
            .await
        {
            warn!(owner_id, event_type, "Failed to record audit event: {e}");
        }
    }
}
