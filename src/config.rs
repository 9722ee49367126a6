//! Daemon-level configuration (C12 ambient), read once at process start.
//!
//! Follows the prior tool's `config.rs` shape: small `env_required` /
//! `env_parse_or` / `env_bool` helpers feeding a single typed, validated
//! struct, with `thiserror`-based errors mapped to exit code 1.

use std::env;

use crate::client::ClientConfig;
use crate::errors::ConfigError;

/// Well-known default listen port, used when `LOADGEND_PORT` is unset.
pub const DEFAULT_PORT: u16 = 7077;

/// Daemon-wide configuration. Per-run knobs (run profile, request spec,
/// retention) arrive over the HTTP API instead and are not part of this
/// struct.
#[derive(Debug, Clone)]
pub struct Config {
    /// `None` means "use `DEFAULT_PORT`, falling back to an OS-assigned
    /// free port if that's taken" (§6 Environment).
    pub listen_port: Option<u16>,
    pub skip_tls_verify: bool,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub default_worker_count: usize,
    pub default_concurrency_per_worker: usize,
}

fn env_parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(default)
}

impl Config {
    /// Loads and validates configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_port = match env::var("LOADGEND_PORT") {
            Ok(val) => Some(val.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                var: "LOADGEND_PORT".into(),
                message: e.to_string(),
            })?),
            Err(_) => None,
        };

        let skip_tls_verify = env_bool("SKIP_TLS_VERIFY", false);
        let client_cert_path = env::var("CLIENT_CERT_PATH").ok();
        let client_key_path = env::var("CLIENT_KEY_PATH").ok();

        let default_worker_count = env_parse_or(
            "DEFAULT_WORKER_COUNT",
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        )?;
        let default_concurrency_per_worker: usize =
            env_parse_or("DEFAULT_CONCURRENCY_PER_WORKER", 64)?;

        let config = Config {
            listen_port,
            skip_tls_verify,
            client_cert_path,
            client_key_path,
            default_worker_count,
            default_concurrency_per_worker,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match (&self.client_cert_path, &self.client_key_path) {
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::IncompleteMtls),
            _ => Ok(()),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            skip_tls_verify: self.skip_tls_verify,
            client_cert_path: self.client_cert_path.clone(),
            client_key_path: self.client_key_path.clone(),
            pool_config: crate::connection_pool::PoolConfig::default(),
        }
    }
}
