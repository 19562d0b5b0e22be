//! Relay Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection_limit::MAX_CONNECTIONS_LIMIT;
use crate::offline_queue::DEFAULT_OFFLINE_TTL;
use crate::router::{DeliveryPolicy, DEFAULT_DELIVERY_TIMEOUT};
use crate::storage::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on for WebSocket upgrades.
    pub listen_addr: SocketAddr,
    /// Address for the health/metrics HTTP server.
    pub metrics_addr: SocketAddr,
    /// Optional bearer token protecting `/metrics`.
    pub metrics_token: Option<String>,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum inbound frame size in bytes.
    pub max_message_size: usize,
    /// Offline queue retention in seconds, refreshed on every enqueue.
    pub offline_ttl_secs: u64,
    /// Cleanup interval in seconds.
    pub cleanup_interval_secs: u64,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Idle timeout in seconds. Zero leaves silent connections to the transport.
    pub idle_timeout_secs: u64,
    /// Time allowed for the WebSocket upgrade handshake.
    pub handshake_timeout_secs: u64,
    /// Per-session outbound buffer (messages).
    pub session_buffer: usize,
    /// Queue messages whose live delivery fails.
    pub delivery_fallback: bool,
    /// Seconds a route waits for a backed-up recipient before giving up.
    pub delivery_timeout_secs: u64,
    /// Shared secret for verifying connection tokens.
    pub jwt_secret: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            metrics_token: None,
            max_connections: 1000,
            max_message_size: 64 * 1024,
            offline_ttl_secs: DEFAULT_OFFLINE_TTL.as_secs(), // 7 days
            cleanup_interval_secs: 3600,                     // 1 hour
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            idle_timeout_secs: 0,
            handshake_timeout_secs: 10,
            session_buffer: 64,
            delivery_fallback: false,
            delivery_timeout_secs: DEFAULT_DELIVERY_TIMEOUT.as_secs(),
            jwt_secret: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Ok(val) = std::env::var(name) {
        match val.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!("Ignoring invalid {}={:?}", name, val),
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_parse("RELAY_LISTEN_ADDR", &mut config.listen_addr);
        env_parse("RELAY_METRICS_ADDR", &mut config.metrics_addr);
        env_parse("RELAY_MAX_CONNECTIONS", &mut config.max_connections);
        env_parse("RELAY_MAX_MESSAGE_SIZE", &mut config.max_message_size);
        env_parse("RELAY_OFFLINE_TTL_SECS", &mut config.offline_ttl_secs);
        env_parse("RELAY_CLEANUP_INTERVAL", &mut config.cleanup_interval_secs);
        env_parse("RELAY_IDLE_TIMEOUT", &mut config.idle_timeout_secs);
        env_parse("RELAY_HANDSHAKE_TIMEOUT", &mut config.handshake_timeout_secs);
        env_parse("RELAY_SESSION_BUFFER", &mut config.session_buffer);
        env_parse("RELAY_DELIVERY_TIMEOUT", &mut config.delivery_timeout_secs);

        if config.max_connections > MAX_CONNECTIONS_LIMIT {
            tracing::warn!(
                "RELAY_MAX_CONNECTIONS={} exceeds the supported maximum; using {}",
                config.max_connections,
                MAX_CONNECTIONS_LIMIT
            );
            config.max_connections = MAX_CONNECTIONS_LIMIT;
        }

        if let Ok(val) = std::env::var("RELAY_STORAGE_BACKEND") {
            config.storage_backend = StorageBackend::from_name(&val);
        }

        if let Ok(val) = std::env::var("RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("RELAY_DELIVERY_FALLBACK") {
            config.delivery_fallback = val == "true" || val == "1";
        }

        config.metrics_token = std::env::var("RELAY_METRICS_TOKEN").ok();
        config.jwt_secret = std::env::var("RELAY_JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty());

        config
    }

    /// Returns the offline retention window as a Duration.
    pub fn offline_ttl(&self) -> Duration {
        Duration::from_secs(self.offline_ttl_secs)
    }

    /// Returns the cleanup interval as a Duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Returns the idle timeout, if one is configured.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Returns the handshake timeout as a Duration.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Returns the wait for a backed-up recipient as a Duration.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    /// Returns the routing policy for failed live deliveries.
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        if self.delivery_fallback {
            DeliveryPolicy::FallbackToQueue
        } else {
            DeliveryPolicy::LiveOnly
        }
    }
}
