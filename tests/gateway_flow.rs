//! End-to-end: PKCE connect, discovery through the orchestrator, disconnect.

use std::sync::Arc;
use std::time::Duration;

use ads_gateway::config::{OAuthEndpoints, OrchestratorConfig, QuotaConfig, ADWORDS_SCOPE};
use ads_gateway::executor::GoogleAdsExecutor;
use ads_gateway::oauth::challenge_for;
use ads_gateway::providers::GoogleAdsProvider;
use ads_gateway::store::MemoryCredentialStore;
use ads_gateway::token::CredentialState;
use ads_gateway::{api, AppState, Config, SharedState};
use base64::Engine;
use serde_json::{json, Value};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "internal-test-secret";

fn config(upstream: &MockServer) -> Config {
    let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
    let hmac = base64::engine::general_purpose::STANDARD.encode([9u8; 32]);

    Config {
        host: "127.0.0.1".into(),
        port: 0,
        auth_service_secret: SECRET.into(),
        database_url: String::new(),
        master_key: key,
        hmac_secret: hmac,
        client_id: "client-id.apps.googleusercontent.com".into(),
        client_secret: "client-secret".into(),
        redirect_uri: "http://localhost:3000/oauth/callback".into(),
        scopes: vec![ADWORDS_SCOPE.into()],
        endpoints: OAuthEndpoints {
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: format!("{}/token", upstream.uri()),
            revoke_url: format!("{}/revoke", upstream.uri()),
        },
        state_ttl: Duration::from_secs(600),
        refresh_buffer: Duration::from_secs(300),
        refresh_daemon_interval: Duration::from_secs(300),
        developer_token: "dev-token".into(),
        api_base_url: upstream.uri(),
        api_version: "v17".into(),
        quota: QuotaConfig {
            daily_operations: 100,
            qps_per_account: 20,
            hourly_reports: 50,
        },
        orchestrator: OrchestratorConfig::default(),
    }
}

async fn mount_upstream(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.granted",
            "refresh_token": "1//granted",
            "token_type": "Bearer",
            "expires_in": 3599,
            "scope": ADWORDS_SCOPE,
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/revoke"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/v17/customers:listAccessibleCustomers"))
        .and(header("authorization", "Bearer ya29.granted"))
        .and(header("developer-token", "dev-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resourceNames": ["customers/111", "customers/222"]
        })))
        .mount(server)
        .await;

    for (id, manager) in [("111", false), ("222", true)] {
        Mock::given(method("POST"))
            .and(path(format!("/v17/customers/{id}/googleAds:search")))
            .and(body_string_contains("FROM customer LIMIT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{
                    "customer": {
                        "id": id,
                        "descriptiveName": format!("Account {id}"),
                        "currencyCode": "USD",
                        "timeZone": "America/Chicago",
                        "manager": manager,
                    }
                }]
            })))
            .mount(server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path("/v17/customers/222/googleAds:search"))
        .and(body_string_contains("FROM customer_client"))
        .and(header("login-customer-id", "222"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [
                { "customerClient": { "id": "222", "manager": true, "level": "0" } },
                { "customerClient": { "id": "333", "descriptiveName": "Child", "manager": false, "level": "1" } },
            ]
        })))
        .mount(server)
        .await;
}

/// Serve the router on an ephemeral port and return its base URL.
async fn spawn_gateway(upstream: &MockServer) -> String {
    spawn_gateway_with_state(upstream).await.0
}

async fn spawn_gateway_with_state(upstream: &MockServer) -> (String, SharedState) {
    let config = config(upstream);
    let provider = Arc::new(GoogleAdsProvider::new(
        config.client_id.clone(),
        config.client_secret.clone(),
        config.endpoints.clone(),
    ));
    let transport = Arc::new(GoogleAdsExecutor::new(
        config.api_base_url.clone(),
        config.api_version.clone(),
        config.developer_token.clone(),
    ));

    let state = Arc::new(
        AppState::build(config, Arc::new(MemoryCredentialStore::new()), provider, transport).unwrap(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = api::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{addr}/v1"), state)
}

#[tokio::test]
async fn test_internal_secret_is_required() {
    let upstream = MockServer::start().await;
    let base = spawn_gateway(&upstream).await;
    let http = reqwest::Client::new();

    let status = http.get(format!("{base}/status")).send().await.unwrap();
    assert_eq!(status.status(), 200);

    let denied = http
        .post(format!("{base}/oauth/start"))
        .json(&json!({ "owner_id": "client-42" }))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 401);

    let wrong = http
        .get(format!("{base}/quota"))
        .header("x-internal-secret", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong.status(), 401);
}

#[tokio::test]
async fn test_connect_discover_disconnect() {
    let upstream = MockServer::start().await;
    mount_upstream(&upstream).await;
    let base = spawn_gateway(&upstream).await;
    let http = reqwest::Client::new();

    // ── Start ────────────────────────────────────────────────────────────
    let started: Value = http
        .post(format!("{base}/oauth/start"))
        .header("x-internal-secret", SECRET)
        .json(&json!({ "owner_id": "client-42" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let data = &started["data"];
    let verifier = data["code_verifier"].as_str().unwrap().to_string();
    let state = data["state"].as_str().unwrap().to_string();
    let url = data["authorization_url"].as_str().unwrap();

    assert_eq!(verifier.len(), 64);
    assert!(url.contains(&format!("code_challenge={}", challenge_for(&verifier))));
    assert!(url.contains("code_challenge_method=S256"));
    assert!(url.contains("access_type=offline"));

    // ── A verifier from another session is rejected ──────────────────────
    let other_verifier = "A".repeat(64);
    let mismatched = http
        .post(format!("{base}/oauth/exchange"))
        .header("x-internal-secret", SECRET)
        .json(&json!({ "code": "4/0Ab", "state": state, "code_verifier": other_verifier }))
        .send()
        .await
        .unwrap();
    assert_eq!(mismatched.status(), 400);
    let body: Value = mismatched.json().await.unwrap();
    assert_eq!(body["error"]["code"], "auth_error");

    // ── Exchange ─────────────────────────────────────────────────────────
    let exchanged = http
        .post(format!("{base}/oauth/exchange"))
        .header("x-internal-secret", SECRET)
        .json(&json!({ "code": "4/0Ab", "state": state, "code_verifier": verifier }))
        .send()
        .await
        .unwrap();
    assert_eq!(exchanged.status(), 200);
    let connection: Value = exchanged.json().await.unwrap();
    assert_eq!(connection["data"]["owner_id"], "client-42");
    assert_eq!(connection["data"]["state"], "authenticated");

    // The same state cannot be redeemed twice.
    let replay = http
        .post(format!("{base}/oauth/exchange"))
        .header("x-internal-secret", SECRET)
        .json(&json!({ "code": "4/0Ab", "state": state, "code_verifier": verifier }))
        .send()
        .await
        .unwrap();
    assert_eq!(replay.status(), 400);

    // ── Discovery ────────────────────────────────────────────────────────
    let hierarchy: Value = http
        .get(format!("{base}/accounts/client-42"))
        .header("x-internal-secret", SECRET)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(hierarchy["data"]["manager"]["id"], "222");
    assert_eq!(hierarchy["data"]["children"][0]["id"], "333");
    assert_eq!(hierarchy["data"]["children"][0]["parent_manager_id"], "222");

    let connection: Value = http
        .get(format!("{base}/oauth/connections/client-42"))
        .header("x-internal-secret", SECRET)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(connection["data"]["manager_account_id"], "222");

    let quota: Value = http
        .get(format!("{base}/quota"))
        .header("x-internal-secret", SECRET)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // list + two detail lookups + child listing
    assert_eq!(quota["data"]["daily_operations"]["used"], 4);
    assert_eq!(quota["data"]["hourly_reports"]["used"], 3);

    // ── Disconnect ───────────────────────────────────────────────────────
    let deleted = http
        .delete(format!("{base}/oauth/connections/client-42"))
        .header("x-internal-secret", SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let gone = http
        .get(format!("{base}/oauth/connections/client-42"))
        .header("x-internal-secret", SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn test_denied_consent_rolls_back_authorization() {
    let upstream = MockServer::start().await;
    let (base, app) = spawn_gateway_with_state(&upstream).await;
    let http = reqwest::Client::new();

    let started: Value = http
        .post(format!("{base}/oauth/start"))
        .header("x-internal-secret", SECRET)
        .json(&json!({ "owner_id": "client-9" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let state = started["data"]["state"].as_str().unwrap().to_string();
    assert_eq!(app.tokens.state("client-9"), CredentialState::Authorizing);

    let denied = http
        .post(format!("{base}/oauth/exchange"))
        .header("x-internal-secret", SECRET)
        .json(&json!({
            "state": state,
            "error": "access_denied",
            "error_description": "The user denied access",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), 400);

    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"]["code"], "auth_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("access_denied"));
    assert_eq!(app.tokens.state("client-9"), CredentialState::Unauthenticated);
    assert!(upstream.received_requests().await.unwrap().is_empty());
}
