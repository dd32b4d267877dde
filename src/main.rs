use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use ads_gateway::executor::GoogleAdsExecutor;
use ads_gateway::providers::GoogleAdsProvider;
use ads_gateway::store::{self, PgCredentialStore};
use ads_gateway::{api, AppState, Config, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ads_gateway=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("ads-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    let credentials = PgCredentialStore::new(&config.database_url).await?;
    credentials.migrate().await?;
    info!("Database connected and migrated");

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

    let addr = format!("{}:{}", config.host, config.port);
    let daemon_interval = config.refresh_daemon_interval;

    let state: SharedState = Arc::new(AppState::build(
        config,
        Arc::new(credentials),
        provider,
        transport,
    )?);
    info!(
        daily = state.config.quota.daily_operations,
        qps = state.config.quota.qps_per_account,
        hourly_reports = state.config.quota.hourly_reports,
        "Quota limits configured"
    );

    tokio::spawn(store::refresh_daemon(state.tokens.clone(), daemon_interval));

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready");
    axum::serve(listener, app).await?;

    Ok(())
}
