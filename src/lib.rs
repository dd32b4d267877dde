pub mod api;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod oauth;
pub mod orchestrator;
pub mod providers;
pub mod store;
pub mod token;

pub use config::Config;
pub use error::GatewayError;

use std::sync::Arc;

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn store::CredentialStore>,
    pub tokens: Arc<token::TokenManager>,
    pub auth_flow: oauth::AuthFlow,
    pub orchestrator: Arc<orchestrator::Orchestrator>,
    pub discovery: discovery::AccountDiscovery,
}

impl AppState {
    /// Wire the services together. Spawns the orchestrator worker, so this
    /// must run inside a tokio runtime.
    pub fn build(
        config: Config,
        store: Arc<dyn store::CredentialStore>,
        provider: Arc<dyn providers::OAuthProvider>,
        transport: Arc<dyn executor::ApiTransport>,
    ) -> Result<Self, GatewayError> {
        let crypto = Arc::new(crypto::CryptoEngine::new(&config.master_key, &config.hmac_secret)?);

        let tokens = Arc::new(token::TokenManager::new(
            provider.clone(),
            store.clone(),
            crypto.clone(),
            config.refresh_buffer,
        ));

        let auth_flow = oauth::AuthFlow::new(
            provider.clone(),
            crypto,
            config.redirect_uri.clone(),
            config.scopes.clone(),
            config.state_ttl,
        );

        let orchestrator = Arc::new(orchestrator::Orchestrator::start(
            config.orchestrator.clone(),
            config.quota.clone(),
            tokens.clone(),
            transport,
        ));

        let discovery =
            discovery::AccountDiscovery::new(orchestrator.clone(), store.clone(), provider.id());

        Ok(Self {
            config,
            store,
            tokens,
            auth_flow,
            orchestrator,
            discovery,
        })
    }
}

pub type SharedState = Arc<AppState>;
