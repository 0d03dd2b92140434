//! Configuration management for the flowkeeper engine
//!
//! Handles the read API bind address, the SQLite store and the dispatch
//! worker parameters (leases, batch sizes, polling, TTLs).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Read API server configuration
    pub server: ServerConfig,
    /// Store configuration
    pub database: DatabaseConfig,
    /// Dispatch worker configuration
    pub worker: WorkerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// SQLite store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. "sqlite://data/flowkeeper.db"
    pub url: String,
    /// Upper bound on pooled connections
    pub max_connections: u32,
    /// How long a writer waits on the database lock before failing
    pub busy_timeout_secs: u64,
}

/// Dispatch loop and lease parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Lease owner recorded in `leased_by` / `processing_on`
    pub id: String,
    /// Number of flows processed concurrently by this worker
    pub pool_size: usize,
    /// How long a flow lock is held before another worker may take it over
    pub flow_lease_secs: u64,
    /// Lease on a leased flow processing request
    pub processing_lease_secs: u64,
    /// Max flow processing requests leased per poll
    pub batch_limit: usize,
    /// Backoff between empty polls
    pub poll_interval_ms: u64,
    /// Lease on message handler requests
    pub handler_lease_secs: u64,
    /// Max message handler requests leased per poll
    pub handler_batch_limit: usize,
    /// Client messages leased more than this many times are dropped
    pub client_message_ttl: u32,
    /// Bound on joining a loop at shutdown
    pub shutdown_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn flow_lease(&self) -> Duration {
        Duration::from_secs(self.flow_lease_secs)
    }

    pub fn processing_lease(&self) -> Duration {
        Duration::from_secs(self.processing_lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handler_lease(&self) -> Duration {
        Duration::from_secs(self.handler_lease_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Read an environment variable, falling back when unset or unparsable
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWKEEPER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("FLOWKEEPER_PORT", 3005),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWKEEPER_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowkeeper.db".to_string()),
                max_connections: env_or("FLOWKEEPER_DB_MAX_CONNECTIONS", 8),
                busy_timeout_secs: env_or("FLOWKEEPER_DB_BUSY_TIMEOUT_SECS", 30),
            },
            worker: WorkerConfig {
                id: std::env::var("FLOWKEEPER_WORKER_ID")
                    .unwrap_or_else(|_| format!("worker-{}", uuid::Uuid::new_v4())),
                pool_size: env_or("FLOWKEEPER_POOL_SIZE", 8),
                flow_lease_secs: env_or("FLOWKEEPER_FLOW_LEASE_SECS", 600),
                processing_lease_secs: env_or("FLOWKEEPER_PROCESSING_LEASE_SECS", 600),
                batch_limit: env_or("FLOWKEEPER_BATCH_LIMIT", 50),
                poll_interval_ms: env_or("FLOWKEEPER_POLL_INTERVAL_MS", 1000),
                handler_lease_secs: env_or("FLOWKEEPER_HANDLER_LEASE_SECS", 600),
                handler_batch_limit: env_or("FLOWKEEPER_HANDLER_BATCH_LIMIT", 100),
                client_message_ttl: env_or("FLOWKEEPER_CLIENT_MESSAGE_TTL", 5),
                shutdown_timeout_secs: env_or("FLOWKEEPER_SHUTDOWN_TIMEOUT_SECS", 30),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        // Unset keys and unparsable values both use the default
        assert_eq!(env_or("FLOWKEEPER_TEST_SURELY_UNSET", 7u32), 7);
        std::env::set_var("FLOWKEEPER_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_or("FLOWKEEPER_TEST_GARBAGE_PORT", 3005u16), 3005);
        std::env::remove_var("FLOWKEEPER_TEST_GARBAGE_PORT");
    }

    #[test]
    fn test_worker_durations() {
        let config = Config::default();
        assert_eq!(
            config.worker.flow_lease(),
            Duration::from_secs(config.worker.flow_lease_secs)
        );
        assert_eq!(
            config.worker.poll_interval(),
            Duration::from_millis(config.worker.poll_interval_ms)
        );
        assert!(config.worker.id.starts_with("worker-") || std::env::var("FLOWKEEPER_WORKER_ID").is_ok());
    }
}
