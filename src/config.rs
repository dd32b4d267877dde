use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

pub const ADWORDS_SCOPE: &str = "https://www.googleapis.com/auth/adwords";

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    /// Shared secret for internal service calls (`x-internal-secret`).
    pub auth_service_secret: String,

    // ── Database (PostgreSQL, shared with the dashboard) ───────────────
    pub database_url: String,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// 32-byte base64-encoded master key for AES-256-GCM encryption.
    pub master_key: String,
    /// 32-byte base64-encoded HMAC key for state parameter signing.
    pub hmac_secret: String,

    // ── OAuth ───────────────────────────────────────────────────────────
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub endpoints: OAuthEndpoints,
    pub state_ttl: Duration,
    pub refresh_buffer: Duration,
    pub refresh_daemon_interval: Duration,

    // ── Google Ads API ──────────────────────────────────────────────────
    pub developer_token: String,
    pub api_base_url: String,
    pub api_version: String,

    // ── Orchestration ───────────────────────────────────────────────────
    pub quota: QuotaConfig,
    pub orchestrator: OrchestratorConfig,
}

/// OAuth endpoints. Platform-defined, so they live in configuration.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize_url: String,
    pub token_url: String,
    pub revoke_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token_url: "https://oauth2.googleapis.com/token".into(),
            revoke_url: "https://oauth2.googleapis.com/revoke".into(),
        }
    }
}

/// Limits for the three quota dimensions.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Operations per developer token per 24 hours.
    pub daily_operations: u32,
    /// Requests per second, bucketed per target account.
    pub qps_per_account: u32,
    /// Report-class operations per developer token per hour.
    pub hourly_reports: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_operations: 15_000,
            qps_per_account: 5,
            hourly_reports: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on queued submissions before `try_submit` reports `QueueFull`.
    pub queue_capacity: usize,
    /// Delay before a quota-blocked request is considered again.
    pub quota_retry_delay: Duration,
    /// Quota reschedules allowed before the request fails permanently.
    pub quota_max_retries: u32,
    /// Total dispatch attempts for requests failing with transient errors.
    pub transient_max_attempts: u32,
    pub transient_backoff_base: Duration,
}

impl QuotaConfig {
    /// Minimum spacing between two dispatches, derived from the QPS limit.
    pub fn min_dispatch_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.qps_per_account.max(1)))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            quota_retry_delay: Duration::from_secs(1),
            quota_max_retries: 120,
            transient_max_attempts: 3,
            transient_backoff_base: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let quota_defaults = QuotaConfig::default();
        let orchestrator_defaults = OrchestratorConfig::default();
        let endpoint_defaults = OAuthEndpoints::default();

        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("PORT", 8430)?,
            auth_service_secret: std::env::var("AUTH_SERVICE_SECRET")
                .context("AUTH_SERVICE_SECRET is required for service-to-service auth")?,

            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL is required (PostgreSQL connection string)")?,
            master_key: std::env::var("MASTER_KEY")
                .context("MASTER_KEY is required (32 bytes, base64)")?,
            hmac_secret: std::env::var("HMAC_SECRET")
                .context("HMAC_SECRET is required (32 bytes, base64)")?,

            client_id: std::env::var("GOOGLE_ADS_CLIENT_ID")
                .context("GOOGLE_ADS_CLIENT_ID is required")?,
            client_secret: std::env::var("GOOGLE_ADS_CLIENT_SECRET")
                .context("GOOGLE_ADS_CLIENT_SECRET is required")?,
            redirect_uri: std::env::var("GOOGLE_ADS_REDIRECT_URI")
                .context("GOOGLE_ADS_REDIRECT_URI is required")?,
            scopes: std::env::var("GOOGLE_ADS_SCOPES")
                .map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
                .unwrap_or_else(|_| vec![ADWORDS_SCOPE.to_string()]),
            endpoints: OAuthEndpoints {
                authorize_url: std::env::var("GOOGLE_OAUTH_AUTHORIZE_URL")
                    .unwrap_or(endpoint_defaults.authorize_url),
                token_url: std::env::var("GOOGLE_OAUTH_TOKEN_URL")
                    .unwrap_or(endpoint_defaults.token_url),
                revoke_url: std::env::var("GOOGLE_OAUTH_REVOKE_URL")
                    .unwrap_or(endpoint_defaults.revoke_url),
            },
            state_ttl: Duration::from_secs(env_parse("OAUTH_STATE_TTL_SECS", 600)?),
            refresh_buffer: Duration::from_secs(env_parse("TOKEN_REFRESH_BUFFER_SECS", 300)?),
            refresh_daemon_interval: Duration::from_secs(env_parse(
                "REFRESH_DAEMON_INTERVAL_SECS",
                300,
            )?),

            developer_token: std::env::var("GOOGLE_ADS_DEVELOPER_TOKEN")
                .context("GOOGLE_ADS_DEVELOPER_TOKEN is required")?,
            api_base_url: std::env::var("GOOGLE_ADS_API_BASE_URL")
                .unwrap_or_else(|_| "https://googleads.googleapis.com".into()),
            api_version: std::env::var("GOOGLE_ADS_API_VERSION").unwrap_or_else(|_| "v17".into()),

            quota: QuotaConfig {
                daily_operations: env_parse("QUOTA_DAILY_OPERATIONS", quota_defaults.daily_operations)?,
                qps_per_account: env_parse("QUOTA_QPS_PER_ACCOUNT", quota_defaults.qps_per_account)?,
                hourly_reports: env_parse("QUOTA_HOURLY_REPORTS", quota_defaults.hourly_reports)?,
            },
            orchestrator: OrchestratorConfig {
                queue_capacity: env_parse("QUEUE_CAPACITY", orchestrator_defaults.queue_capacity)?,
                quota_retry_delay: Duration::from_millis(env_parse("QUOTA_RETRY_DELAY_MS", 1000)?),
                quota_max_retries: env_parse("QUOTA_MAX_RETRIES", orchestrator_defaults.quota_max_retries)?,
                transient_max_attempts: env_parse(
                    "TRANSIENT_MAX_ATTEMPTS",
                    orchestrator_defaults.transient_max_attempts,
                )?,
                transient_backoff_base: Duration::from_millis(env_parse("TRANSIENT_BACKOFF_BASE_MS", 500)?),
            },
        })
    }
}

/// Read an optional numeric variable, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("Invalid {name}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_defaults_match_basic_access_tier() {
        let quota = QuotaConfig::default();
        assert_eq!(quota.daily_operations, 15_000);
        assert_eq!(quota.qps_per_account, 5);
        assert_eq!(quota.hourly_reports, 1_000);
    }

    #[test]
    fn test_min_dispatch_interval_follows_qps() {
        let quota = QuotaConfig { qps_per_account: 5, ..QuotaConfig::default() };
        assert_eq!(quota.min_dispatch_interval(), Duration::from_millis(200));

        let quota = QuotaConfig { qps_per_account: 0, ..QuotaConfig::default() };
        assert_eq!(quota.min_dispatch_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_orchestrator_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.quota_retry_delay, Duration::from_millis(1000));
        assert_eq!(config.transient_max_attempts, 3);
    }
}
