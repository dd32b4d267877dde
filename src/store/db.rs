//! PostgreSQL-backed credential store.
//!
//! Tables:
//! - `ads_credentials`: encrypted OAuth tokens per (platform, owner_id)
//! - `auth_events`: audit log for connect / refresh / disconnect events

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{CredentialStatus, CredentialStore, StoredCredential};
use crate::error::GatewayError;

pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub async fn new(db_url: &str) -> Result<Self, GatewayError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(db_url)
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to connect to PostgreSQL: {e}")))?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run schema migrations.
    pub async fn migrate(&self) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ads_credentials (
                id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                platform            TEXT NOT NULL,
                owner_id            TEXT NOT NULL,
                access_token        TEXT NOT NULL,
                refresh_token       TEXT,
                expires_at          TIMESTAMPTZ NOT NULL,
                scopes              TEXT NOT NULL DEFAULT '',
                status              TEXT NOT NULL DEFAULT 'active',
                manager_account_id  TEXT,
                connected_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at          TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE(platform, owner_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS auth_events (
                id          UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                platform    TEXT NOT NULL,
                owner_id    TEXT NOT NULL,
                event_type  TEXT NOT NULL,
                metadata    JSONB DEFAULT '{}',
                created_at  TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ads_credentials_expiry ON ads_credentials(expires_at) WHERE status = 'active'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_auth_events_owner ON auth_events(owner_id, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn credential_from_row(row: &PgRow) -> Result<StoredCredential, GatewayError> {
    let scopes: String = row.try_get("scopes")?;
    let status: String = row.try_get("status")?;

    Ok(StoredCredential {
        platform: row.try_get("platform")?,
        owner_id: row.try_get("owner_id")?,
        access_token_enc: row.try_get("access_token")?,
        refresh_token_enc: row.try_get("refresh_token")?,
        expires_at: row.try_get("expires_at")?,
        scopes: scopes.split_whitespace().map(str::to_string).collect(),
        connected_at: row.try_get("connected_at")?,
        status: CredentialStatus::parse(&status),
        manager_account_id: row.try_get("manager_account_id")?,
    })
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn load(
        &self,
        platform: &str,
        owner_id: &str,
    ) -> Result<Option<StoredCredential>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT platform, owner_id, access_token, refresh_token, expires_at,
                   scopes, connected_at, status, manager_account_id
            FROM ads_credentials
            WHERE platform = $1 AND owner_id = $2
            "#,
        )
        .bind(platform)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(credential_from_row).transpose()
    }

    async fn upsert(&self, credential: &StoredCredential) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO ads_credentials
                (platform, owner_id, access_token, refresh_token, expires_at,
                 scopes, status, manager_account_id, connected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (platform, owner_id)
            DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = COALESCE(EXCLUDED.refresh_token, ads_credentials.refresh_token),
                expires_at = EXCLUDED.expires_at,
                scopes = EXCLUDED.scopes,
                status = EXCLUDED.status,
                connected_at = EXCLUDED.connected_at,
                updated_at = NOW()
            "#,
        )
        .bind(&credential.platform)
        .bind(&credential.owner_id)
        .bind(&credential.access_token_enc)
        .bind(&credential.refresh_token_enc)
        .bind(credential.expires_at)
        .bind(credential.scopes.join(" "))
        .bind(credential.status.as_str())
        .bind(&credential.manager_account_id)
        .bind(credential.connected_at)
        .execute(&self.pool)
        .await?;

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
        sqlx::query(
            r#"
            UPDATE ads_credentials
            SET access_token = $1,
                refresh_token = COALESCE($2, refresh_token),
                expires_at = $3,
                status = 'active',
                updated_at = NOW()
            WHERE platform = $4 AND owner_id = $5
            "#,
        )
        .bind(access_token_enc)
        .bind(refresh_token_enc)
        .bind(expires_at)
        .bind(platform)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_invalid(&self, platform: &str, owner_id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            "UPDATE ads_credentials SET status = 'invalid', updated_at = NOW() WHERE platform = $1 AND owner_id = $2",
        )
        .bind(platform)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, platform: &str, owner_id: &str) -> Result<bool, GatewayError> {
        let affected = sqlx::query("DELETE FROM ads_credentials WHERE platform = $1 AND owner_id = $2")
            .bind(platform)
            .bind(owner_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(affected > 0)
    }

    async fn list_expiring(
        &self,
        platform: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<String>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id
            FROM ads_credentials
            WHERE platform = $1
              AND status = 'active'
              AND refresh_token IS NOT NULL
              AND expires_at < $2
            "#,
        )
        .bind(platform)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn set_manager_account(
        &self,
        platform: &str,
        owner_id: &str,
        manager_account_id: &str,
    ) -> Result<(), GatewayError> {
        let affected = sqlx::query(
            "UPDATE ads_credentials SET manager_account_id = $1, updated_at = NOW() WHERE platform = $2 AND owner_id = $3",
        )
        .bind(manager_account_id)
        .bind(platform)
        .bind(owner_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(GatewayError::NotConnected(owner_id.to_string()));
        }
        Ok(())
    }

    async fn record_event(
        &self,
        platform: &str,
        owner_id: &str,
        event_type: &str,
        metadata: serde_json::Value,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO auth_events (platform, owner_id, event_type, metadata)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(platform)
        .bind(owner_id)
        .bind(event_type)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
