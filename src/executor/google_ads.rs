use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{ApiRequest, ApiTransport};
use crate::error::GatewayError;

const DEVELOPER_TOKEN_HEADER: &str = "developer-token";
const LOGIN_CUSTOMER_HEADER: &str = "login-customer-id";

/// Sends requests to the Google Ads REST interface.
pub struct GoogleAdsExecutor {
    base_url: String,
    api_version: String,
    developer_token: String,
    http: reqwest::Client,
}

// {"error": {"code": 400, "message": "...", "status": "INVALID_ARGUMENT"}}
#[derive(Debug, Default, Deserialize)]
struct ApiErrorEnvelope {
    #[serde(default)]
    error: ApiErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

impl GoogleAdsExecutor {
    pub fn new(
        base_url: impl Into<String>,
        api_version: impl Into<String>,
        developer_token: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            developer_token: developer_token.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            self.api_version,
            path.trim_start_matches('/')
        )
    }
}

/// Map a non-success Ads API response onto the error taxonomy.
pub fn classify_api_error(status: u16, body: &str) -> GatewayError {
    let parsed: ApiErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.error.message.is_empty() {
        body.to_string()
    } else {
        parsed.error.message
    };

    match (status, parsed.error.status.as_str()) {
        (401, _) | (_, "UNAUTHENTICATED") => {
            GatewayError::Auth(format!("access token rejected: {message}"))
        }
        (429, _) | (_, "RESOURCE_EXHAUSTED") => GatewayError::TransientApi {
            status: Some(status),
            message,
        },
        (s, _) if s >= 500 => GatewayError::TransientApi {
            status: Some(s),
            message,
        },
        (s, _) => GatewayError::PermanentApi { status: s, message },
    }
}

#[async_trait]
impl ApiTransport for GoogleAdsExecutor {
    async fn execute(
        &self,
        access_token: &str,
        request: &ApiRequest,
    ) -> Result<serde_json::Value, GatewayError> {
        let op = &request.operation;
        let mut builder = self
            .http
            .request(op.method.clone(), self.url(&op.path))
            .bearer_auth(access_token)
            .header(DEVELOPER_TOKEN_HEADER, &self.developer_token);

        if let Some(manager_id) = request.acting_as.as_deref() {
            builder = builder.header(LOGIN_CUSTOMER_HEADER, manager_id);
        }
        if let Some(body) = &op.body {
            builder = builder.json(body);
        }

        debug!(path = %op.path, target = request.qps_bucket(), "Dispatching Ads API call");

        let resp = builder.send().await.map_err(|e| GatewayError::TransientApi {
            status: None,
            message: format!("request failed: {e}"),
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_api_error(status.as_u16(), &body));
        }

        // The call was accepted; resending it on a garbled body is not safe.
        resp.json().await.map_err(|e| GatewayError::PermanentApi {
            status: status.as_u16(),
            message: format!("failed to parse response: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_exhausted_is_transient() {
        let body = r#"{"error":{"code":429,"message":"Too many requests","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(matches!(
            classify_api_error(429, body),
            GatewayError::TransientApi { status: Some(429), message } if message == "Too many requests"
        ));
    }

    #[test]
    fn test_malformed_query_is_permanent() {
        let body = r#"{"error":{"code":400,"message":"Error in query","status":"INVALID_ARGUMENT"}}"#;
        assert!(matches!(
            classify_api_error(400, body),
            GatewayError::PermanentApi { status: 400, .. }
        ));
    }

    #[test]
    fn test_unauthenticated_is_auth_error() {
        assert!(matches!(classify_api_error(401, "nope"), GatewayError::Auth(_)));
    }

    #[test]
    fn test_server_error_without_body_is_transient() {
        assert!(matches!(
            classify_api_error(502, ""),
            GatewayError::TransientApi { status: Some(502), .. }
        ));
    }

    #[test]
    fn test_url_joins_version_and_path() {
        let executor = GoogleAdsExecutor::new("https://googleads.googleapis.com/", "v17", "dev");
        assert_eq!(
            executor.url("/customers:listAccessibleCustomers"),
            "https://googleads.googleapis.com/v17/customers:listAccessibleCustomers"
        );
    }
}
