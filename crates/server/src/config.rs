// Server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own tuning vars — this module
// covers the core server settings.

use std::net::SocketAddr;
use std::time::Duration;

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// PostgreSQL connection string. When unset the server runs on the
    /// in-memory session store (development / tests only).
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `codehive_server=debug`).
    pub log_filter: String,
    /// Interval between platform-stats recompute/broadcast cycles.
    pub stats_interval: Duration,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CODEHIVE_HOST` | `0.0.0.0` |
    /// | `CODEHIVE_PORT` | `8080` |
    /// | `CODEHIVE_DATABASE_URL` | *(none — in-memory store)* |
    /// | `CODEHIVE_CORS_ORIGINS` | *(none — cors.rs uses dev defaults)* |
    /// | `CODEHIVE_LOG_FILTER` | `info` |
    /// | `CODEHIVE_STATS_INTERVAL_SECS` | `30` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("CODEHIVE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("CODEHIVE_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("CODEHIVE_DATABASE_URL").ok();
        let cors_origins = env("CODEHIVE_CORS_ORIGINS").ok();
        let log_filter = env("CODEHIVE_LOG_FILTER").unwrap_or_else(|_| "info".into());

        let stats_interval_secs = env("CODEHIVE_STATS_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(30);

        Self {
            listen_addr,
            database_url,
            cors_origins,
            log_filter,
            stats_interval: Duration::from_secs(stats_interval_secs),
        }
    }
}
