use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::traits::{OAuthProvider, TokenSet};
use crate::config::OAuthEndpoints;
use crate::error::GatewayError;

/// Google OAuth 2.0 provider for the Google Ads API.
///
/// Token lifetime: 1 hour.
/// Refresh: requires `access_type=offline` and `prompt=consent` on the
/// authorization request, otherwise no refresh token is issued.
pub struct GoogleAdsProvider {
    client_id: String,
    client_secret: String,
    endpoints: OAuthEndpoints,
    http: reqwest::Client,
}

// Raw token response from Google's token endpoint
#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: Option<u64>,
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".into()
}

#[derive(Debug, Default, Deserialize)]
struct GoogleTokenError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Which grant a token endpoint failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

/// Refresh failures that will never succeed with the same refresh token.
const TERMINAL_REFRESH_ERRORS: &[&str] = &["invalid_grant", "invalid_client", "unauthorized_client"];

impl GoogleAdsProvider {
    pub fn new(client_id: String, client_secret: String, endpoints: OAuthEndpoints) -> Self {
        Self {
            client_id,
            client_secret,
            endpoints,
            http: reqwest::Client::new(),
        }
    }

    async fn post_token(
        &self,
        form: &[(&str, &str)],
        grant: Grant,
    ) -> Result<TokenSet, GatewayError> {
        let resp = self
            .http
            .post(&self.endpoints.token_url)
            .form(form)
            .send()
            .await
            .map_err(|e| GatewayError::TransientApi {
                status: None,
                message: format!("Token request failed: {e}"),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_token_error(status.as_u16(), &body, grant));
        }

        let token_resp: GoogleTokenResponse = resp.json().await.map_err(|e| {
            GatewayError::PermanentApi {
                status: status.as_u16(),
                message: format!("Failed to parse token response: {e}"),
            }
        })?;

        Ok(TokenSet {
            access_token: token_resp.access_token,
            refresh_token: token_resp.refresh_token,
            token_type: token_resp.token_type,
            expires_in: token_resp.expires_in,
            scope: token_resp.scope,
        })
    }
}

fn classify_token_error(status: u16, body: &str, grant: Grant) -> GatewayError {
    let parsed: GoogleTokenError = serde_json::from_str(body).unwrap_or_default();
    let detail = match parsed.error_description {
        Some(desc) if !parsed.error.is_empty() => format!("{}: {desc}", parsed.error),
        _ if !parsed.error.is_empty() => parsed.error.clone(),
        _ => body.to_string(),
    };

    if status >= 500 || status == 429 {
        return GatewayError::TransientApi {
            status: Some(status),
            message: format!("Google token endpoint unavailable: {detail}"),
        };
    }

    match grant {
        Grant::AuthorizationCode => {
            GatewayError::Auth(format!("Google token exchange failed: {detail}"))
        }
        Grant::RefreshToken if TERMINAL_REFRESH_ERRORS.contains(&parsed.error.as_str()) => {
            GatewayError::AuthExpired
        }
        Grant::RefreshToken => GatewayError::PermanentApi {
            status,
            message: format!("Google refresh failed: {detail}"),
        },
    }
}

#[async_trait]
impl OAuthProvider for GoogleAdsProvider {
    fn id(&self) -> &str {
        "google_ads"
    }

    fn display_name(&self) -> &str {
        "Google Ads"
    }

    fn auth_url(
        &self,
        scopes: &[String],
        state: &str,
        redirect_uri: &str,
        code_challenge: &str,
    ) -> String {
        let scope_str = scopes.join(" ");
        format!(
            "{base}?\
             client_id={client_id}\
             &redirect_uri={redirect_uri}\
             &response_type=code\
             &scope={scope}\
             &state={state}\
             &access_type=offline\
             &prompt=consent\
             &code_challenge={challenge}\
             &code_challenge_method=S256",
            base = self.endpoints.authorize_url,
            client_id = urlencoding(&self.client_id),
            redirect_uri = urlencoding(redirect_uri),
            scope = urlencoding(&scope_str),
            state = urlencoding(state),
            challenge = urlencoding(code_challenge),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, GatewayError> {
        self.post_token(
            &[
                ("code", code),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
                ("code_verifier", code_verifier),
            ],
            Grant::AuthorizationCode,
        )
        .await
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenSet, GatewayError> {
        self.post_token(
            &[
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("grant_type", "refresh_token"),
            ],
            Grant::RefreshToken,
        )
        .await
    }

    async fn revoke(&self, token: &str) -> Result<(), GatewayError> {
        let resp = self
            .http
            .post(&self.endpoints.revoke_url)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| GatewayError::TransientApi {
                status: None,
                message: format!("Revoke request failed: {e}"),
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::PermanentApi {
                status,
                message: format!("Google revoke failed: {body}"),
            });
        }

        Ok(())
    }

    fn token_ttl(&self) -> Duration {
        Duration::from_secs(3600) // Google tokens expire in 1 hour
    }
}

/// Simple percent-encoding for URL parameters.
fn urlencoding(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GoogleAdsProvider {
        GoogleAdsProvider::new("client-id".into(), "secret".into(), OAuthEndpoints::default())
    }

    #[test]
    fn test_auth_url_carries_pkce_and_offline_access() {
        let url = provider().auth_url(
            &["https://www.googleapis.com/auth/adwords".into()],
            "signed-state",
            "https://dash.example.com/oauth/callback",
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM",
        );

        let parsed = url::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["code_challenge"], "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["state"], "signed-state");
        assert_eq!(params["scope"], "https://www.googleapis.com/auth/adwords");
        assert_eq!(params["redirect_uri"], "https://dash.example.com/oauth/callback");
    }

    #[test]
    fn test_invalid_grant_on_refresh_is_terminal() {
        let err = classify_token_error(
            400,
            r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#,
            Grant::RefreshToken,
        );
        assert!(matches!(err, GatewayError::AuthExpired));
    }

    #[test]
    fn test_invalid_grant_on_exchange_is_auth_error() {
        let err = classify_token_error(400, r#"{"error":"invalid_grant"}"#, Grant::AuthorizationCode);
        assert!(matches!(err, GatewayError::Auth(msg) if msg.contains("invalid_grant")));
    }

    #[test]
    fn test_server_errors_are_transient() {
        let err = classify_token_error(503, "upstream unavailable", Grant::RefreshToken);
        assert!(matches!(err, GatewayError::TransientApi { status: Some(503), .. }));
    }
}
