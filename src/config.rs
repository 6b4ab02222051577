//! Application configuration.
//!
//! Single struct loaded from the environment at startup and passed through a
//! context struct built in `main`. No module-level globals.

use std::env;

/// How equal-`updated_at` metadata conflicts are resolved between clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTiebreaker {
    /// Lexicographically greater `origin` wins. Deterministic across replicas.
    OriginLex,
    /// The server's stored value wins.
    ServerWins,
}

impl SyncTiebreaker {
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "server_wins" | "server" => Self::ServerWins,
            _ => Self::OriginLex,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub database_path: String,
    pub session_secret: Option<String>,
    pub jwt_secret: Option<String>,
    pub primary_ai_key: Option<String>,
    pub secondary_ai_key: Option<String>,
    pub weather_base_url: String,
    pub external_calls_disabled: bool,
    pub max_connections: usize,
    pub heartbeat_interval_ms: u64,
    pub pairing_cache_max: usize,
    pub pairing_cache_ttl_ms: u64,
    pub provider_timeout_ms: u64,
    pub weather_timeout_ms: u64,
    pub metrics_window: usize,
    pub sync_tiebreaker: SyncTiebreaker,
    pub applied_ops_retention_days: i64,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

fn env_secret(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            listen_port: env_parse("SOMMOS_PORT", 3001),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./sommos.db".to_string()),
            session_secret: env_secret("SESSION_SECRET"),
            jwt_secret: env_secret("JWT_SECRET"),
            primary_ai_key: env_secret("DEEPSEEK_API_KEY"),
            secondary_ai_key: env_secret("OPENAI_API_KEY"),
            weather_base_url: env::var("WEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://archive-api.open-meteo.com".to_string()),
            external_calls_disabled: env_bool("EXTERNAL_CALLS_DISABLED", false),
            max_connections: env_parse("MAX_WS_CONNECTIONS", 1000),
            heartbeat_interval_ms: env_parse("HEARTBEAT_INTERVAL_MS", 30_000),
            pairing_cache_max: env_parse("PAIRING_CACHE_MAX", 10_000),
            pairing_cache_ttl_ms: env_parse("PAIRING_CACHE_TTL_MS", 900_000),
            provider_timeout_ms: env_parse("PROVIDER_TIMEOUT_MS", 30_000),
            weather_timeout_ms: env_parse("WEATHER_TIMEOUT_MS", 10_000),
            metrics_window: env_parse("METRICS_WINDOW", 100),
            sync_tiebreaker: SyncTiebreaker::parse(
                &env::var("SYNC_TIEBREAKER").unwrap_or_default(),
            ),
            applied_ops_retention_days: env_parse("APPLIED_OPS_RETENTION_DAYS", 7).max(7),
        })
    }

    /// Test fixture: defaults with an explicit database path, no outbound calls.
    pub fn for_tests(database_path: &str) -> Self {
        Self {
            listen_port: 0,
            database_path: database_path.to_string(),
            session_secret: None,
            jwt_secret: None,
            primary_ai_key: None,
            secondary_ai_key: None,
            weather_base_url: "https://archive-api.open-meteo.com".to_string(),
            external_calls_disabled: true,
            max_connections: 16,
            heartbeat_interval_ms: 30_000,
            pairing_cache_max: 100,
            pairing_cache_ttl_ms: 900_000,
            provider_timeout_ms: 100,
            weather_timeout_ms: 100,
            metrics_window: 100,
            sync_tiebreaker: SyncTiebreaker::OriginLex,
            applied_ops_retention_days: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiebreaker_parse() {
        assert_eq!(SyncTiebreaker::parse("server_wins"), SyncTiebreaker::ServerWins);
        assert_eq!(SyncTiebreaker::parse(""), SyncTiebreaker::OriginLex);
        assert_eq!(SyncTiebreaker::parse("origin_lex"), SyncTiebreaker::OriginLex);
    }
}
