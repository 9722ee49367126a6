//! Builds the per-worker `reqwest::Client` each worker issues transfers
//! through, wiring in the shared DNS cache, optional mTLS identity and
//! connection-pool tuning.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use reqwest::Client;

use crate::connection_pool::PoolConfig;
use crate::dns_cache::SharedDnsCache;

/// Configuration for building a worker's HTTP client. One `ClientConfig`
/// is shared (cloned) across all workers in a run; the DNS cache is
/// process-wide and handed in by reference.
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub skip_tls_verify: bool,
    pub client_cert_path: Option<String>,
    pub client_key_path: Option<String>,
    pub pool_config: PoolConfig,
}

/// Builds a reqwest HTTP client wired to the process-wide DNS cache.
pub fn build_client(
    config: &ClientConfig,
    dns_cache: SharedDnsCache,
) -> Result<Client, Box<dyn std::error::Error + Send + Sync>> {
    let mut builder = Client::builder().dns_resolver(Arc::new(dns_cache));

    builder = configure_mtls(
        builder,
        config.client_cert_path.as_deref(),
        config.client_key_path.as_deref(),
    )?;

    builder = config.pool_config.apply_to_builder(builder);

    let client = if config.skip_tls_verify {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?
    } else {
        builder.build()?
    };

    Ok(client)
}

fn configure_mtls(
    mut builder: reqwest::ClientBuilder,
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> Result<reqwest::ClientBuilder, Box<dyn std::error::Error + Send + Sync>> {
    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut cert_file = File::open(cert_path)
                .map_err(|e| format!("failed to open client certificate '{cert_path}': {e}"))?;
            let mut cert_pem = Vec::new();
            cert_file.read_to_end(&mut cert_pem)?;

            let mut key_file = File::open(key_path)
                .map_err(|e| format!("failed to open client key '{key_path}': {e}"))?;
            let mut key_pem = Vec::new();
            key_file.read_to_end(&mut key_pem)?;

            let mut cert_cursor = std::io::Cursor::new(cert_pem.as_slice());
            let certs: Vec<_> = rustls_pemfile::certs(&mut cert_cursor).collect();
            if certs.is_empty() {
                return Err(format!("no PEM certificates found in {cert_path}").into());
            }

            let mut key_cursor = std::io::Cursor::new(key_pem.as_slice());
            let keys: Vec<_> = rustls_pemfile::pkcs8_private_keys(&mut key_cursor).collect();
            if keys.is_empty() {
                return Err(format!(
                    "no PKCS#8 private keys found in '{key_path}'; ensure PEM-encoded PKCS#8"
                )
                .into());
            }

            let mut combined = Vec::new();
            combined.extend_from_slice(&cert_pem);
            if !cert_pem.ends_with(b"\n") && !key_pem.starts_with(b"\n") {
                combined.push(b'\n');
            }
            combined.extend_from_slice(&key_pem);

            let identity = reqwest::Identity::from_pem(&combined)
                .map_err(|e| format!("failed to build identity from PEM (cert+key): {e}"))?;

            builder = builder.identity(identity);
        }
        (Some(_), None) => {
            return Err("CLIENT_CERT_PATH is set but CLIENT_KEY_PATH is missing for mTLS".into());
        }
        (None, Some(_)) => {
            return Err("CLIENT_KEY_PATH is set but CLIENT_CERT_PATH is missing for mTLS".into());
        }
        (None, None) => {}
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_plain_client_with_no_mtls() {
        let config = ClientConfig::default();
        let client = build_client(&config, SharedDnsCache::new());
        assert!(client.is_ok());
    }

    #[test]
    fn mtls_with_only_cert_path_is_an_error() {
        let config = ClientConfig {
            client_cert_path: Some("/nonexistent/cert.pem".into()),
            ..Default::default()
        };
        let result = build_client(&config, SharedDnsCache::new());
        assert!(result.is_err());
    }
}
