//! Signal controller configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default peer signaling bind address.
pub const DEFAULT_SIGNAL_BIND_ADDRESS: &str = "0.0.0.0:8443";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default region used for relay selection.
pub const DEFAULT_REGION: &str = "local";

/// Default interval between reconciliation sweeps.
pub const DEFAULT_RECONCILE_INTERVAL_SECONDS: u64 = 10;

/// Default time to wait for any cluster RPC.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 10_000;

/// Default lease on this node's service registry record.
pub const DEFAULT_NODE_LEASE_TTL_SECONDS: u64 = 10;

/// Default cap on concurrently dispatched requests.
pub const DEFAULT_MAX_INFLIGHT_REQUESTS: usize = 1024;

/// Default node id prefix.
pub const DEFAULT_NODE_ID_PREFIX: &str = "sc";

/// Signal controller configuration.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (service registry and location store).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// Unique identifier for this node.
    pub node_id: String,

    /// Region this node and its preferred relays live in.
    pub region: String,

    /// Peer signaling listener (default: "0.0.0.0:8443").
    pub signal_bind_address: String,

    /// Health and metrics listener (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    pub reconcile_interval: Duration,

    pub rpc_timeout: Duration,

    pub node_lease_ttl: Duration,

    pub max_inflight_requests: usize,

    /// Run a location registry service inside this process.
    pub embed_location_service: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("node_id", &self.node_id)
            .field("region", &self.region)
            .field("signal_bind_address", &self.signal_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("node_lease_ttl", &self.node_lease_ttl)
            .field("max_inflight_requests", &self.max_inflight_requests)
            .field("embed_location_service", &self.embed_location_service)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`Config::from_vars`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `REDIS_URL` is absent and
    /// `ConfigError::InvalidValue` for unparseable or zero numeric values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let signal_bind_address = vars
            .get("SC_SIGNAL_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNAL_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let region = vars
            .get("SC_REGION")
            .cloned()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let reconcile_interval = Duration::from_secs(positive(
            vars,
            "SC_RECONCILE_INTERVAL_SECONDS",
            DEFAULT_RECONCILE_INTERVAL_SECONDS,
        )?);
        let rpc_timeout =
            Duration::from_millis(positive(vars, "SC_RPC_TIMEOUT_MS", DEFAULT_RPC_TIMEOUT_MS)?);
        let node_lease_ttl = Duration::from_secs(positive(
            vars,
            "SC_NODE_LEASE_TTL_SECONDS",
            DEFAULT_NODE_LEASE_TTL_SECONDS,
        )?);
        let max_inflight_requests = positive(
            vars,
            "SC_MAX_INFLIGHT_REQUESTS",
            DEFAULT_MAX_INFLIGHT_REQUESTS,
        )?;

        let embed_location_service = match vars.get("SC_EMBED_LOCATION_SERVICE") {
            None => true,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "SC_EMBED_LOCATION_SERVICE must be a boolean, got '{raw}'"
                    )))
                }
            },
        };

        // Generate node ID
        let node_id = vars.get("SC_NODE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_NODE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            node_id,
            region,
            signal_bind_address,
            health_bind_address,
            reconcile_interval,
            rpc_timeout,
            node_lease_ttl,
            max_inflight_requests,
            embed_location_service,
        })
    }
}

/// Parse an optional numeric variable that must be greater than zero.
fn positive<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default,
{
    let Some(raw) = vars.get(name) else {
        return Ok(default);
    };
    let value: T = raw
        .parse()
        .map_err(|_| ConfigError::InvalidValue(format!("{name} must be a number, got '{raw}'")))?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(value)
}
