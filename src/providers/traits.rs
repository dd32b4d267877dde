use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GatewayError;

/// A set of tokens returned from an OAuth provider after code exchange or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub scope: Option<String>,
}

impl TokenSet {
    /// Granted scopes as a list (providers return them space separated).
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// Token endpoint client for one OAuth platform.
///
/// Error contract: a rejected authorization code is `Auth`, a refresh token
/// the platform will never accept again is `AuthExpired`, and anything the
/// caller could retry later (5xx, network) is `TransientApi`.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Unique platform identifier (e.g., "google_ads").
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Build the authorization URL the owner should be redirected to.
    fn auth_url(
        &self,
        scopes: &[String],
        state: &str,
        redirect_uri: &str,
        code_challenge: &str,
    ) -> String;

    /// Exchange an authorization code (plus its PKCE verifier) for tokens.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, GatewayError>;

    /// Obtain a new access token with a refresh token.
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, GatewayError>;

    /// Revoke an access or refresh token. Not all providers support this.
    async fn revoke(&self, _token: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    /// Lifetime assumed when the token endpoint omits `expires_in`.
    fn token_ttl(&self) -> Duration {
        Duration::from_secs(3600)
    }
}
