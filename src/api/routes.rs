//! API route handlers.
//!
//! Everything except `/status` is for service-to-service use and requires the
//! `x-internal-secret` header.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::oauth::PkceVerifier;
use crate::SharedState;

const INTERNAL_SECRET_HEADER: &str = "x-internal-secret";

// =============================================================================
// V1 Router
// =============================================================================

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        // ── Health ───────────────────────────────────────────────────────
        .route("/status", get(status))
        // ── OAuth ────────────────────────────────────────────────────────
        .route("/oauth/start", post(oauth_start))
        .route("/oauth/exchange", post(oauth_exchange))
        .route(
            "/oauth/connections/{owner_id}",
            get(oauth_connection_get).delete(oauth_connection_delete),
        )
        // ── Accounts ─────────────────────────────────────────────────────
        .route("/accounts/{owner_id}", get(accounts_hierarchy))
        .route("/accounts/{owner_id}/manager", post(accounts_discover_manager))
        // ── Quota ────────────────────────────────────────────────────────
        .route("/quota", get(quota_snapshot))
        .with_state(state)
}

fn require_internal(state: &SharedState, headers: &HeaderMap) -> Result<(), GatewayError> {
    let provided = headers
        .get(INTERNAL_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthorized)?;

    let expected = &state.config.auth_service_secret;
    if expected.is_empty() || provided != expected {
        return Err(GatewayError::Unauthorized);
    }
    Ok(())
}

// =============================================================================
// Health
// =============================================================================

async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ads-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// OAuth
// =============================================================================

#[derive(Deserialize)]
struct OAuthStartRequest {
    owner_id: String,
}

/// POST /v1/oauth/start — Begin a PKCE authorization round trip.
///
/// The verifier is returned to the caller, which keeps it with the owner's
/// session and sends it back with the callback parameters.
async fn oauth_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<OAuthStartRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_internal(&state, &headers)?;

    let (request, verifier) = state.auth_flow.start(&body.owner_id)?;
    state.tokens.begin_authorization(&body.owner_id);

    Ok(Json(json!({
        "data": {
            "authorization_url": request.url,
            "state": request.state,
            "code_verifier": verifier.as_str(),
        }
    })))
}

#[derive(Deserialize)]
struct OAuthExchangeRequest {
    #[serde(default)]
    code: String,
    state: String,
    code_verifier: Option<String>,
    /// Set when the provider redirected back with an error instead of a code.
    error: Option<String>,
    error_description: Option<String>,
}

/// POST /v1/oauth/exchange — Complete the flow with the callback's code and state.
async fn oauth_exchange(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<OAuthExchangeRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_internal(&state, &headers)?;

    if let Some(error) = body.error.as_deref() {
        let owner_id = state.auth_flow.owner_of(&body.state);
        if let Some(owner_id) = owner_id.as_deref() {
            state.tokens.authorization_failed(owner_id);
        }
        warn!(owner_id = ?owner_id, error, "Provider denied authorization");

        let reason = match body.error_description.as_deref() {
            Some(description) => format!("{error}: {description}"),
            None => error.to_string(),
        };
        return Err(GatewayError::Auth(format!("authorization denied by provider ({reason})")));
    }

    let mut verifier = body
        .code_verifier
        .map(PkceVerifier::new)
        .transpose()?;

    let grant = match state
        .auth_flow
        .exchange_code(&body.code, &body.state, &mut verifier)
        .await
    {
        Ok(grant) => grant,
        Err(e) => {
            if let Some(owner_id) = state.auth_flow.owner_of(&body.state) {
                state.tokens.authorization_failed(&owner_id);
            }
            return Err(e);
        }
    };

    let connection = state.tokens.complete_authorization(grant).await?;
    info!(owner_id = %connection.owner_id, "OAuth connection established");

    Ok(Json(json!({ "data": connection })))
}

/// GET /v1/oauth/connections/:owner_id — Credential status without token material.
async fn oauth_connection_get(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(owner_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_internal(&state, &headers)?;

    let connection = state
        .tokens
        .describe(&owner_id)
        .await?
        .ok_or(GatewayError::NotConnected(owner_id))?;

    Ok(Json(json!({ "data": connection })))
}

/// DELETE /v1/oauth/connections/:owner_id — Revoke and forget the credential.
async fn oauth_connection_delete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(owner_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    require_internal(&state, &headers)?;
    state.tokens.disconnect(&owner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Accounts
// =============================================================================

/// GET /v1/accounts/:owner_id — Manager account and its direct children.
async fn accounts_hierarchy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(owner_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_internal(&state, &headers)?;
    let hierarchy = state.discovery.discover_hierarchy(&owner_id).await?;
    Ok(Json(json!({ "data": hierarchy })))
}

/// POST /v1/accounts/:owner_id/manager — Rediscover and persist the manager account.
async fn accounts_discover_manager(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(owner_id): Path<String>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_internal(&state, &headers)?;
    let manager_account_id = state.discovery.discover_manager_account(&owner_id).await?;
    Ok(Json(json!({ "data": { "manager_account_id": manager_account_id } })))
}

// =============================================================================
// Quota
// =============================================================================

/// GET /v1/quota — Current usage of every quota window.
async fn quota_snapshot(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, GatewayError> {
    require_internal(&state, &headers)?;
    Ok(Json(json!({ "data": state.orchestrator.quota_snapshot() })))
}
