//! Credential persistence: encrypted OAuth credentials keyed by (platform, owner).
//!
//! Records only ever hold ciphertext; decryption happens in the token
//! manager, in memory, for the duration of a request.

pub mod db;
pub mod memory;
pub mod refresh;

pub use db::PgCredentialStore;
pub use memory::MemoryCredentialStore;
pub use refresh::{refresh_cycle, refresh_daemon, RefreshReport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::GatewayError;

/// Persisted lifecycle marker. `Invalid` survives restarts so a revoked
/// credential keeps failing fast until the owner reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Invalid,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Invalid => "invalid",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "invalid" => CredentialStatus::Invalid,
            _ => CredentialStatus::Active,
        }
    }
}

/// A credential row as stored. Token fields are ciphertext.
#[derive(Clone)]
pub struct StoredCredential {
    pub platform: String,
    pub owner_id: String,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub status: CredentialStatus,
    pub manager_account_id: Option<String>,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("platform", &self.platform)
            .field("owner_id", &self.owner_id)
            .field("expires_at", &self.expires_at)
            .field("status", &self.status)
            .field("manager_account_id", &self.manager_account_id)
            .finish_non_exhaustive()
    }
}

/// Storage collaborator for credentials and their audit trail.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(
        &self,
        platform: &str,
        owner_id: &str,
    ) -> Result<Option<StoredCredential>, GatewayError>;

    /// Insert or replace the credential for (platform, owner). Resets status to active.
    async fn upsert(&self, credential: &StoredCredential) -> Result<(), GatewayError>;

    /// Store refreshed tokens. A `None` refresh token keeps the existing one.
    async fn update_refreshed(
        &self,
        platform: &str,
        owner_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), GatewayError>;

    async fn mark_invalid(&self, platform: &str, owner_id: &str) -> Result<(), GatewayError>;

    /// Remove the credential. Returns whether a record existed.
    async fn delete(&self, platform: &str, owner_id: &str) -> Result<bool, GatewayError>;

    /// Owners of active credentials expiring before `before`.
    async fn list_expiring(
        &self,
        platform: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, GatewayError>;

    async fn set_manager_account(
        &self,
        platform: &str,
        owner_id: &str,
        manager_account_id: &str,
    ) -> Result<(), GatewayError>;

    async fn record_event(
        &self,
        platform: &str,
        owner_id: &str,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<(), GatewayError>;
}
