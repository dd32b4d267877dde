//! In-process credential store for local development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{CredentialStatus, CredentialStore, StoredCredential};
use crate::error::GatewayError;

type Key = (String, String);

/// An audit event captured by [`MemoryCredentialStore`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub platform: String,
    pub owner_id: String,
    pub event_type: String,
    pub metadata: serde_json::Value,
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: RwLock<HashMap<Key, StoredCredential>>,
    events: RwLock<Vec<RecordedEvent>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().await.clone()
    }
}

fn key(platform: &str, owner_id: &str) -> Key {
    (platform.to_string(), owner_id.to_string())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(
        &self,
        platform: &str,
        owner_id: &str,
    ) -> Result<Option<StoredCredential>, GatewayError> {
        Ok(self.credentials.read().await.get(&key(platform, owner_id)).cloned())
    }

    async fn upsert(&self, credential: &StoredCredential) -> Result<(), GatewayError> {
        let mut credentials = self.credentials.write().await;
        let k = key(&credential.platform, &credential.owner_id);

        let mut next = credential.clone();
        if let Some(existing) = credentials.get(&k) {
            if next.refresh_token_enc.is_none() {
                next.refresh_token_enc = existing.refresh_token_enc.clone();
            }
            if next.manager_account_id.is_none() {
                next.manager_account_id = existing.manager_account_id.clone();
            }
        }
        credentials.insert(k, next);
        Ok(())
    }

    async fn update_refreshed(
        &self,
        platform: &str,
        owner_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), GatewayError> {
        let mut credentials = self.credentials.write().await;
        if let Some(credential) = credentials.get_mut(&key(platform, owner_id)) {
            credential.access_token_enc = access_token_enc.to_string();
            if let Some(rt) = refresh_token_enc {
                credential.refresh_token_enc = Some(rt.to_string());
            }
            credential.expires_at = expires_at;
            credential.status = CredentialStatus::Active;
        }
        Ok(())
    }

    async fn mark_invalid(&self, platform: &str, owner_id: &str) -> Result<(), GatewayError> {
        if let Some(credential) = self
            .credentials
            .write()
            .await
            .get_mut(&key(platform, owner_id))
        {
            credential.status = CredentialStatus::Invalid;
        }
        Ok(())
    }

    async fn delete(&self, platform: &str, owner_id: &str) -> Result<bool, GatewayError> {
        Ok(self
            .credentials
            .write()
            .await
            .remove(&key(platform, owner_id))
            .is_some())
    }

    async fn list_expiring(
        &self,
        platform: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| {
                c.platform == platform
                    && c.status == CredentialStatus::Active
                    && c.refresh_token_enc.is_some()
                    && c.expires_at < before
            })
            .map(|c| c.owner_id.clone())
            .collect())
    }

    async fn set_manager_account(
        &self,
        platform: &str,
        owner_id: &str,
        manager_account_id: &str,
    ) -> Result<(), GatewayError> {
        match self
            .credentials
            .write()
            .await
            .get_mut(&key(platform, owner_id))
        {
            Some(credential) => {
                credential.manager_account_id = Some(manager_account_id.to_string());
                Ok(())
            }
            None => Err(GatewayError::NotConnected(owner_id.to_string())),
        }
    }

    async fn record_event(
        &self,
        platform: &str,
        owner_id: &str,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<(), GatewayError> {
        self.events.write().await.push(RecordedEvent {
            platform: platform.to_string(),
            owner_id: owner_id.to_string(),
            event_type: event_type.to_string(),
            metadata,
        });
        Ok(())
    }
}
