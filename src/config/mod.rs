/// Configuration management for portero
///
/// All knobs arrive as command line flags; this module owns the validated
/// runtime form and the conversions into the per-node proxy options.
use std::time::Duration;

use crate::core::NodeOptions;
use crate::pool::PoolOptions;

/// Runtime configuration for the proxy fleet.
#[derive(Debug, Clone)]
pub struct Config {
    /// Comma-separated seed addresses of the replica set.
    pub addrs: String,
    /// Expected replica set name; when non-empty, seeds reporting another
    /// set are ignored during discovery.
    pub replica_name: String,
    /// Listener ports are allocated from this inclusive range.
    pub port_start: u16,
    pub port_end: u16,
    /// Deadline for a single message to be proxied.
    pub message_timeout: Duration,
    /// How long a client connection may idle between requests.
    pub client_idle_timeout: Duration,
    /// How long an upstream stays pinned awaiting a follow-up getLastError.
    pub get_last_error_timeout: Duration,
    /// Upstream pool size per mongo node.
    pub max_connections: usize,
    /// Idle upstream connections kept around by eviction.
    pub min_idle_connections: usize,
    /// Idle age after which surplus upstream connections are closed.
    pub server_idle_timeout: Duration,
    /// Concurrency for closing upstream connections in the background.
    pub server_close_pool_size: usize,
    /// Drop in-flight clients when a topology change restarts the fleet.
    pub hard_restart: bool,
    /// Inspect every query document, not just `.$cmd` collections.
    pub proxy_all_queries: bool,
    /// Arm a topology restart when an upstream dial exhausts its retries.
    pub restart_on_dial_failure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addrs: "localhost:27017".to_string(),
            replica_name: String::new(),
            port_start: 6000,
            port_end: 6010,
            message_timeout: Duration::from_secs(2 * 60),
            client_idle_timeout: Duration::from_secs(60 * 60),
            get_last_error_timeout: Duration::from_secs(60),
            max_connections: 100,
            min_idle_connections: 5,
            server_idle_timeout: Duration::from_secs(5 * 60),
            server_close_pool_size: 5,
            hard_restart: true,
            proxy_all_queries: false,
            restart_on_dial_failure: false,
        }
    }
}

impl Config {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addrs.trim().is_empty() {
            return Err(ConfigError::Validation(
                "addrs cannot be empty".to_string(),
            ));
        }
        if self.port_start > self.port_end {
            return Err(ConfigError::Validation(format!(
                "port range {}-{} is inverted",
                self.port_start, self.port_end
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Validation(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.server_close_pool_size == 0 {
            return Err(ConfigError::Validation(
                "server_close_pool_size must be greater than 0".to_string(),
            ));
        }
        for (name, value) in [
            ("message_timeout", self.message_timeout),
            ("client_idle_timeout", self.client_idle_timeout),
            ("get_last_error_timeout", self.get_last_error_timeout),
            ("server_idle_timeout", self.server_idle_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Validation(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }

    /// The seed addresses, split and trimmed.
    pub fn seed_addrs(&self) -> Vec<String> {
        self.addrs
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Options handed to each per-node proxy.
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            message_timeout: self.message_timeout,
            client_idle_timeout: self.client_idle_timeout,
            get_last_error_timeout: self.get_last_error_timeout,
            pool: PoolOptions {
                max: self.max_connections,
                min_idle: self.min_idle_connections,
                idle_timeout: self.server_idle_timeout,
                close_pool_size: self.server_close_pool_size,
            },
            restart_on_dial_failure: self.restart_on_dial_failure,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("validation error: {0}")]
    Validation(String),
}
