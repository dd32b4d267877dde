//! Background refresh daemon for stored Ads credentials.
//!
//! Runs on a fixed interval. Finds credentials expiring within twice the
//! refresh buffer and refreshes them through the token manager, so the
//! single-flight lock and invalidation rules apply as they do for callers.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::GatewayError;
use crate::token::TokenManager;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub invalidated: usize,
    pub failed: usize,
}

/// Start the refresh daemon loop.
pub async fn refresh_daemon(tokens: Arc<TokenManager>, interval: Duration) {
    info!(interval_secs = interval.as_secs(), "Token refresh daemon started");

    loop {
        tokio::time::sleep(interval).await;
        match refresh_cycle(&tokens).await {
            Ok(report) if report != RefreshReport::default() => {
                info!(
                    refreshed = report.refreshed,
                    invalidated = report.invalidated,
                    failed = report.failed,
                    "Refresh cycle complete"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Refresh cycle error: {e}"),
        }
    }
}

pub async fn refresh_cycle(tokens: &TokenManager) -> Result<RefreshReport, GatewayError> {
    let horizon = tokens.refresh_buffer() * 2;
    let expiring = tokens.expiring_owners(horizon).await?;

    let mut report = RefreshReport::default();
    if expiring.is_empty() {
        return Ok(report);
    }

    info!("Found {} credentials to refresh", expiring.len());

    for owner_id in expiring {
        match tokens.refresh_ahead(&owner_id, horizon).await {
            Ok(()) => report.refreshed += 1,
            Err(GatewayError::AuthExpired) => {
                warn!(owner_id, "Credential needs reauthorization");
                report.invalidated += 1;
            }
            Err(e) => {
                error!(owner_id, "Failed to refresh credential: {e}");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_engine;
    use crate::oauth::AuthorizedGrant;
    use crate::providers::{OAuthProvider, TokenSet};
    use crate::store::{CredentialStore, MemoryCredentialStore};
    use async_trait::async_trait;
    use chrono::Utc;

    struct RotatingProvider;

    #[async_trait]
    impl OAuthProvider for RotatingProvider {
        fn id(&self) -> &str {
            "google_ads"
        }

        fn display_name(&self) -> &str {
            "Rotating"
        }

        fn auth_url(&self, _: &[String], _: &str, _: &str, _: &str) -> String {
            String::new()
        }

        async fn exchange_code(&self, _: &str, _: &str, _: &str) -> Result<TokenSet, GatewayError> {
            unreachable!()
        }

        async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, GatewayError> {
            if refresh_token == "1//revoked" {
                return Err(GatewayError::AuthExpired);
            }
            Ok(TokenSet {
                access_token: "ya29.rotated".into(),
                refresh_token: Some("1//next".into()),
                token_type: "Bearer".into(),
                expires_in: Some(3599),
                scope: None,
            })
        }
    }

    async fn connect(manager: &TokenManager, owner: &str, refresh: &str, expires_in: chrono::Duration) {
        let issued_at = Utc::now();
        manager
            .complete_authorization(AuthorizedGrant {
                owner_id: owner.into(),
                platform: "google_ads".into(),
                access_token: format!("ya29.{owner}"),
                refresh_token: Some(refresh.into()),
                issued_at,
                expires_at: issued_at + expires_in,
                scopes: vec![],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_refreshes_only_credentials_near_expiry() {
        let store = Arc::new(MemoryCredentialStore::new());
        let manager = TokenManager::new(
            Arc::new(RotatingProvider),
            store.clone(),
            Arc::new(test_engine()),
            Duration::from_secs(300),
        );

        connect(&manager, "soon", "1//soon", chrono::Duration::minutes(8)).await;
        connect(&manager, "later", "1//later", chrono::Duration::minutes(50)).await;
        connect(&manager, "revoked", "1//revoked", chrono::Duration::minutes(3)).await;

        let report = refresh_cycle(&manager).await.unwrap();
        assert_eq!(
            report,
            RefreshReport {
                refreshed: 1,
                invalidated: 1,
                failed: 0
            }
        );

        assert_eq!(manager.get_access_token("soon").await.unwrap(), "ya29.rotated");
        assert_eq!(manager.get_access_token("later").await.unwrap(), "ya29.later");
        assert!(matches!(
            manager.get_access_token("revoked").await,
            Err(GatewayError::AuthExpired)
        ));

        let soon = store.load("google_ads", "soon").await.unwrap().unwrap();
        assert!(soon.expires_at > Utc::now() + chrono::Duration::minutes(50));
    }

    #[tokio::test]
    async fn test_cycle_with_nothing_expiring_is_a_no_op() {
        let manager = TokenManager::new(
            Arc::new(RotatingProvider),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(test_engine()),
            Duration::from_secs(300),
        );

        assert_eq!(refresh_cycle(&manager).await.unwrap(), RefreshReport::default());
    }
}
