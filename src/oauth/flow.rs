//! PKCE authorization-code flow: authorization URL construction and code exchange.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::pkce::{generate_challenge_pair, PkcePair, PkceVerifier};
use super::state::{NonceLedger, StatePayload};
use crate::crypto::CryptoEngine;
use crate::error::GatewayError;
use crate::providers::OAuthProvider;

/// Where to send the owner, plus the state value that will come back.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

/// Tokens obtained from a successful code exchange.
#[derive(Clone)]
pub struct AuthorizedGrant {
    pub owner_id: String,
    pub platform: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl std::fmt::Debug for AuthorizedGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedGrant")
            .field("owner_id", &self.owner_id)
            .field("platform", &self.platform)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish_non_exhaustive()
    }
}

pub struct AuthFlow {
    provider: Arc<dyn OAuthProvider>,
    crypto: Arc<CryptoEngine>,
    redirect_uri: String,
    scopes: Vec<String>,
    state_ttl: chrono::Duration,
    nonces: NonceLedger,
}

impl AuthFlow {
    pub fn new(
        provider: Arc<dyn OAuthProvider>,
        crypto: Arc<CryptoEngine>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
        state_ttl: std::time::Duration,
    ) -> Self {
        Self {
            provider,
            crypto,
            redirect_uri: redirect_uri.into(),
            scopes,
            state_ttl: chrono::Duration::from_std(state_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
            nonces: NonceLedger::new(),
        }
    }

    /// Generate a fresh PKCE pair and the authorization URL bound to it.
    ///
    /// The returned verifier must be kept by the caller (scoped to the
    /// owner's session) and handed back to [`AuthFlow::exchange_code`].
    pub fn start(&self, owner_id: &str) -> Result<(AuthorizationRequest, PkceVerifier), GatewayError> {
        let pair = generate_challenge_pair();
        let request = self.build_authorization_url(owner_id, &pair)?;
        Ok((request, pair.verifier))
    }

    pub fn build_authorization_url(
        &self,
        owner_id: &str,
        pair: &PkcePair,
    ) -> Result<AuthorizationRequest, GatewayError> {
        if owner_id.trim().is_empty() {
            return Err(GatewayError::BadRequest("owner_id is required".into()));
        }

        let payload = StatePayload::new(owner_id, self.provider.id(), &pair.challenge, Utc::now());
        let state = payload.sign(&self.crypto)?;
        let url = self
            .provider
            .auth_url(&self.scopes, &state, &self.redirect_uri, &pair.challenge);

        Ok(AuthorizationRequest { url, state })
    }

    /// Owner named in a correctly signed state, expired or not.
    pub fn owner_of(&self, state: &str) -> Option<String> {
        StatePayload::decode(state, &self.crypto)
            .ok()
            .map(|payload| payload.owner_id)
    }

    /// Validate the callback and exchange the code for tokens.
    ///
    /// The verifier slot is emptied only when the exchange succeeds.
    pub async fn exchange_code(
        &self,
        code: &str,
        state: &str,
        verifier: &mut Option<PkceVerifier>,
    ) -> Result<AuthorizedGrant, GatewayError> {
        self.exchange_code_at(code, state, verifier, Utc::now()).await
    }

    pub(crate) async fn exchange_code_at(
        &self,
        code: &str,
        state: &str,
        verifier: &mut Option<PkceVerifier>,
        now: DateTime<Utc>,
    ) -> Result<AuthorizedGrant, GatewayError> {
        let payload = StatePayload::verify(state, &self.crypto, self.state_ttl, now)?;

        if payload.platform != self.provider.id() {
            return Err(GatewayError::Auth("state was issued for another platform".into()));
        }

        let code_verifier = verifier
            .as_ref()
            .ok_or_else(|| GatewayError::Auth("missing PKCE code verifier".into()))?;

        if code_verifier.challenge() != payload.challenge {
            warn!(owner_id = %payload.owner_id, "PKCE verifier does not match issued challenge");
            return Err(GatewayError::Auth(
                "code verifier does not match the authorization request".into(),
            ));
        }

        if code.is_empty() {
            return Err(GatewayError::Auth("missing authorization code".into()));
        }

        let claim = self
            .nonces
            .claim(&payload.nonce, payload.expires_at(self.state_ttl), now)
            .inspect_err(|_| warn!(owner_id = %payload.owner_id, "Rejected reused OAuth state"))?;

        // A failed exchange drops the claim, so the same state can be retried.
        let tokens = self
            .provider
            .exchange_code(code, &self.redirect_uri, code_verifier.as_str())
            .await?;
        claim.redeem();

        let expires_in = tokens
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or_else(|| self.provider.token_ttl().as_secs().max(1));

        // Single use: the verifier is gone once the code has been redeemed.
        verifier.take();

        let issued_at = Utc::now();
        info!(owner_id = %payload.owner_id, "Authorization code exchanged");

        Ok(AuthorizedGrant {
            scopes: tokens.scopes(),
            owner_id: payload.owner_id,
            platform: payload.platform,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            issued_at,
            expires_at: issued_at + chrono::Duration::seconds(expires_in as i64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_engine;
    use crate::oauth::pkce::challenge_for;
    use crate::providers::TokenSet;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Token endpoint stand-in that only accepts the verifier it was told about.
    struct StubProvider {
        accepted_verifier: std::sync::Mutex<Option<String>>,
        exchanges: AtomicUsize,
    }

    #[async_trait]
    impl OAuthProvider for StubProvider {
        fn id(&self) -> &str {
            "google_ads"
        }

        fn display_name(&self) -> &str {
            "Stub"
        }

        fn auth_url(&self, _: &[String], state: &str, _: &str, challenge: &str) -> String {
            format!("https://auth.example.com/?state={state}&code_challenge={challenge}")
        }

        async fn exchange_code(&self, _: &str, _: &str, verifier: &str) -> Result<TokenSet, GatewayError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            let accepted = self.accepted_verifier.lock().unwrap().clone();
            if accepted.as_deref() != Some(verifier) {
                return Err(GatewayError::Auth("invalid_grant".into()));
            }
            Ok(TokenSet {
                access_token: "ya29.access".into(),
                refresh_token: Some("1//refresh".into()),
                token_type: "Bearer".into(),
                expires_in: Some(3599),
                scope: Some("https://www.googleapis.com/auth/adwords".into()),
            })
        }

        async fn refresh_token(&self, _: &str) -> Result<TokenSet, GatewayError> {
            unreachable!("flow never refreshes")
        }
    }

    fn flow() -> (AuthFlow, Arc<StubProvider>) {
        let provider = Arc::new(StubProvider {
            accepted_verifier: std::sync::Mutex::new(None),
            exchanges: AtomicUsize::new(0),
        });
        let flow = AuthFlow::new(
            provider.clone(),
            Arc::new(test_engine()),
            "https://dash.example.com/oauth/callback",
            vec!["https://www.googleapis.com/auth/adwords".into()],
            std::time::Duration::from_secs(600),
        );
        (flow, provider)
    }

    #[tokio::test]
    async fn test_successful_exchange_erases_verifier() {
        let (flow, provider) = flow();
        let (request, verifier) = flow.start("client-7").unwrap();
        *provider.accepted_verifier.lock().unwrap() = Some(verifier.as_str().to_string());
        assert!(request.url.contains(&challenge_for(verifier.as_str())));

        let mut slot = Some(verifier);
        let grant = flow.exchange_code("4/code", &request.state, &mut slot).await.unwrap();

        assert!(slot.is_none());
        assert_eq!(grant.owner_id, "client-7");
        assert_eq!(grant.refresh_token.as_deref(), Some("1//refresh"));
        assert!(grant.expires_at > grant.issued_at);
        assert_eq!(grant.scopes, vec!["https://www.googleapis.com/auth/adwords"]);
    }

    #[tokio::test]
    async fn test_mismatched_verifier_fails_without_network_call() {
        let (flow, provider) = flow();
        let (request, _verifier) = flow.start("client-7").unwrap();
        let other = generate_challenge_pair().verifier;

        let mut slot = Some(other);
        let err = flow.exchange_code("4/code", &request.state, &mut slot).await.unwrap_err();

        assert!(matches!(err, GatewayError::Auth(_)));
        assert!(slot.is_some());
        assert_eq!(provider.exchanges.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_verifier_is_auth_error() {
        let (flow, _) = flow();
        let (request, _verifier) = flow.start("client-7").unwrap();

        let err = flow.exchange_code("4/code", &request.state, &mut None).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(msg) if msg.contains("verifier")));
    }

    #[tokio::test]
    async fn test_replayed_state_is_rejected() {
        let (flow, provider) = flow();
        let (request, verifier) = flow.start("client-7").unwrap();
        *provider.accepted_verifier.lock().unwrap() = Some(verifier.as_str().to_string());

        let mut first = Some(verifier.clone());
        flow.exchange_code("4/code", &request.state, &mut first).await.unwrap();

        let mut second = Some(verifier);
        let err = flow.exchange_code("4/code", &request.state, &mut second).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(msg) if msg.contains("already been used")));
        assert_eq!(provider.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_callback_is_rejected() {
        let (flow, _) = flow();
        let (request, verifier) = flow.start("client-7").unwrap();

        let mut slot = Some(verifier);
        let later = Utc::now() + chrono::Duration::minutes(11);
        let err = flow
            .exchange_code_at("4/code", &request.state, &mut slot, later)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth(msg) if msg.contains("expired")));
    }

    #[tokio::test]
    async fn test_rejected_code_keeps_verifier() {
        let (flow, provider) = flow();
        let (request, verifier) = flow.start("client-7").unwrap();
        *provider.accepted_verifier.lock().unwrap() = Some("someone-else".into());

        let mut slot = Some(verifier);
        let err = flow.exchange_code("4/bad", &request.state, &mut slot).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
        assert!(slot.is_some());
    }

    #[tokio::test]
    async fn test_failed_exchange_can_be_retried_with_same_state() {
        let (flow, provider) = flow();
        let (request, verifier) = flow.start("client-7").unwrap();
        *provider.accepted_verifier.lock().unwrap() = Some("not-yet".into());

        let mut slot = Some(verifier);
        flow.exchange_code("4/code", &request.state, &mut slot).await.unwrap_err();
        assert!(slot.is_some());

        let kept = slot.clone().unwrap();
        *provider.accepted_verifier.lock().unwrap() = Some(kept.as_str().to_string());

        let grant = flow.exchange_code("4/code", &request.state, &mut slot).await.unwrap();
        assert_eq!(grant.owner_id, "client-7");
        assert!(slot.is_none());
        assert_eq!(provider.exchanges.load(Ordering::SeqCst), 2);

        let mut again = Some(kept);
        let err = flow.exchange_code("4/code", &request.state, &mut again).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(msg) if msg.contains("already been used")));
    }
}
