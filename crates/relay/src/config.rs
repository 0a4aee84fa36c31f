// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The hub tunables (queue depth, keepalive cadence, read
// deadline) are derived into a `HubConfig` so tests can build hubs without
// touching the environment.

use std::{net::SocketAddr, time::Duration};

use crate::auth::join_token::DEFAULT_JOIN_TOKEN_TTL_SECONDS;

pub const DEV_JOIN_TOKEN_SECRET: &str = "tandem_local_development_join_secret_32_chars";
pub const DEV_ACCESS_TOKEN_SECRET: &str = "tandem_local_development_access_secret_32chars";
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 40_000;
pub const DEFAULT_DATA_SEND_TIMEOUT_MS: u64 = 250;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 65_536;
pub const DEFAULT_CHANGE_CHANNEL: &str = "tandem_changes";

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HMAC secret for short-lived join tokens.
    pub join_token_secret: String,
    /// HMAC secret for the long-lived primary access tokens.
    pub access_token_secret: String,
    pub join_token_ttl_secs: i64,
    /// Base URL for WebSocket connections (e.g. `ws://localhost:8080`).
    pub ws_base_url: String,
    pub outbound_queue_capacity: usize,
    pub keepalive_interval: Duration,
    pub read_timeout: Duration,
    pub data_send_timeout: Duration,
    pub max_frame_bytes: usize,
    /// PostgreSQL connection string. Selects the Postgres store and feed.
    pub database_url: Option<String>,
    /// `LISTEN` channel carrying change batches.
    pub change_channel: String,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    /// Log filter directive (e.g. `info`, `tandem_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines instead of the human-readable format.
    pub log_json: bool,
}

/// Tunables for a single [`crate::hub::Hub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub join_token_ttl: Duration,
    pub outbound_queue_capacity: usize,
    pub keepalive_interval: Duration,
    pub read_timeout: Duration,
    pub data_send_timeout: Duration,
    pub ws_base_url: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            join_token_ttl: Duration::from_secs(DEFAULT_JOIN_TOKEN_TTL_SECONDS as u64),
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            keepalive_interval: Duration::from_millis(DEFAULT_KEEPALIVE_INTERVAL_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            data_send_timeout: Duration::from_millis(DEFAULT_DATA_SEND_TIMEOUT_MS),
            ws_base_url: "ws://localhost:8080".to_string(),
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `TANDEM_RELAY_HOST` | `0.0.0.0` |
    /// | `TANDEM_RELAY_PORT` | `8080` |
    /// | `TANDEM_RELAY_JOIN_TOKEN_SECRET` | dev-only placeholder |
    /// | `TANDEM_RELAY_ACCESS_TOKEN_SECRET` | dev-only placeholder |
    /// | `TANDEM_RELAY_JOIN_TOKEN_TTL_SECS` | `60` |
    /// | `TANDEM_RELAY_WS_BASE_URL` | `ws://{host}:{port}` |
    /// | `TANDEM_RELAY_OUTBOUND_QUEUE_CAPACITY` | `16` |
    /// | `TANDEM_RELAY_KEEPALIVE_INTERVAL_MS` | `15000` |
    /// | `TANDEM_RELAY_READ_TIMEOUT_MS` | `40000` |
    /// | `TANDEM_RELAY_DATA_SEND_TIMEOUT_MS` | `250` |
    /// | `TANDEM_RELAY_MAX_FRAME_BYTES` | `65536` |
    /// | `TANDEM_RELAY_DATABASE_URL` | *(none: in-memory store and feed)* |
    /// | `TANDEM_RELAY_CHANGE_CHANNEL` | `tandem_changes` |
    /// | `TANDEM_RELAY_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `TANDEM_RELAY_LOG_FILTER` | `info` |
    /// | `TANDEM_RELAY_LOG_FORMAT` | `text` (`json` for JSON lines) |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|v| v.trim().parse::<u64>().ok());

        let host = env("TANDEM_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("TANDEM_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let join_token_secret = env("TANDEM_RELAY_JOIN_TOKEN_SECRET")
            .unwrap_or_else(|_| DEV_JOIN_TOKEN_SECRET.into());
        let access_token_secret = env("TANDEM_RELAY_ACCESS_TOKEN_SECRET")
            .unwrap_or_else(|_| DEV_ACCESS_TOKEN_SECRET.into());

        let join_token_ttl_secs = parsed("TANDEM_RELAY_JOIN_TOKEN_TTL_SECS")
            .filter(|secs| *secs > 0)
            .map(|secs| secs as i64)
            .unwrap_or(DEFAULT_JOIN_TOKEN_TTL_SECONDS);

        let ws_base_url = env("TANDEM_RELAY_WS_BASE_URL")
            .unwrap_or_else(|_| format!("ws://{listen_addr}"));

        let outbound_queue_capacity = parsed("TANDEM_RELAY_OUTBOUND_QUEUE_CAPACITY")
            .filter(|capacity| *capacity > 0)
            .map(|capacity| capacity as usize)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);

        let keepalive_interval = Duration::from_millis(
            parsed("TANDEM_RELAY_KEEPALIVE_INTERVAL_MS")
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL_MS),
        );
        // The deadline must outlive at least one keepalive round trip.
        let read_timeout = Duration::from_millis(
            parsed("TANDEM_RELAY_READ_TIMEOUT_MS").unwrap_or(DEFAULT_READ_TIMEOUT_MS),
        )
        .max(keepalive_interval * 2);

        let data_send_timeout = Duration::from_millis(
            parsed("TANDEM_RELAY_DATA_SEND_TIMEOUT_MS").unwrap_or(DEFAULT_DATA_SEND_TIMEOUT_MS),
        );
        let max_frame_bytes = parsed("TANDEM_RELAY_MAX_FRAME_BYTES")
            .filter(|bytes| *bytes > 0)
            .map(|bytes| bytes as usize)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let database_url = env("TANDEM_RELAY_DATABASE_URL").ok();
        let change_channel =
            env("TANDEM_RELAY_CHANGE_CHANNEL").unwrap_or_else(|_| DEFAULT_CHANGE_CHANNEL.into());
        let cors_origins = env("TANDEM_RELAY_CORS_ORIGINS").ok();
        let log_filter = env("TANDEM_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("TANDEM_RELAY_LOG_FORMAT")
            .map(|format| format.trim().eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self {
            listen_addr,
            join_token_secret,
            access_token_secret,
            join_token_ttl_secs,
            ws_base_url,
            outbound_queue_capacity,
            keepalive_interval,
            read_timeout,
            data_send_timeout,
            max_frame_bytes,
            database_url,
            change_channel,
            cors_origins,
            log_filter,
            log_json,
        }
    }

    /// Returns true when either token secret is a development placeholder.
    pub fn uses_dev_secrets(&self) -> bool {
        self.join_token_secret == DEV_JOIN_TOKEN_SECRET
            || self.access_token_secret == DEV_ACCESS_TOKEN_SECRET
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            join_token_ttl: Duration::from_secs(self.join_token_ttl_secs as u64),
            outbound_queue_capacity: self.outbound_queue_capacity,
            keepalive_interval: self.keepalive_interval,
            read_timeout: self.read_timeout,
            data_send_timeout: self.data_send_timeout,
            ws_base_url: self.ws_base_url.clone(),
        }
    }
}
