//! Authenticated transport for Google Ads API calls.
//!
//! The executor is a thin layer: it attaches headers, sends one request and
//! classifies the outcome. Retry and pacing decisions belong to the
//! orchestrator.

mod google_ads;

pub use google_ads::{classify_api_error, GoogleAdsExecutor};

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;

use crate::error::GatewayError;

/// QPS bucket used for calls that are not scoped to a customer account.
pub const UNSCOPED_BUCKET: &str = "_unscoped";

/// Quota class of an operation. Report-class calls also count against the
/// hourly report limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Standard,
    Report,
}

/// What to call, relative to the versioned API root.
#[derive(Debug, Clone)]
pub struct ApiOperation {
    pub kind: OperationKind,
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
}

impl ApiOperation {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Standard,
            method: Method::GET,
            path: path.into(),
            body: None,
        }
    }

    /// A GAQL search against one customer (report-class).
    pub fn search(customer_id: &str, query: &str) -> Self {
        Self {
            kind: OperationKind::Report,
            method: Method::POST,
            path: format!("customers/{customer_id}/googleAds:search"),
            body: Some(serde_json::json!({ "query": query })),
        }
    }
}

/// One outbound API call on behalf of a connected owner.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Owner whose OAuth credential authorizes the call.
    pub owner_id: String,
    /// Customer account the call targets; selects the QPS bucket.
    pub target_account_id: Option<String>,
    /// Manager account to act through (`login-customer-id`).
    pub acting_as: Option<String>,
    pub operation: ApiOperation,
}

impl ApiRequest {
    pub fn new(owner_id: impl Into<String>, operation: ApiOperation) -> Self {
        Self {
            owner_id: owner_id.into(),
            target_account_id: None,
            acting_as: None,
            operation,
        }
    }

    pub fn for_account(mut self, account_id: impl Into<String>) -> Self {
        self.target_account_id = Some(account_id.into());
        self
    }

    pub fn acting_as(mut self, manager_id: impl Into<String>) -> Self {
        self.acting_as = Some(manager_id.into());
        self
    }

    pub fn qps_bucket(&self) -> &str {
        self.target_account_id.as_deref().unwrap_or(UNSCOPED_BUCKET)
    }
}

#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Send `request` once with `access_token`. Never retries.
    async fn execute(
        &self,
        access_token: &str,
        request: &ApiRequest,
    ) -> Result<serde_json::Value, GatewayError>;
}
