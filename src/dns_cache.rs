//! Process-wide DNS cache (C3) and its `reqwest::dns::Resolve` binding.
//!
//! `reqwest::ClientBuilder::resolve()` fixes one hostname/address pair at
//! client-build time, which does not fit a cache populated *during* a run.
//! Instead the cache backs a custom resolver installed once via
//! `ClientBuilder::dns_resolver()`: every lookup consults the cache first
//! and falls back to `hickory-resolver` on a miss, populating the cache
//! with the result.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, warn};

#[derive(Clone)]
enum CacheEntry {
    Addrs(Vec<SocketAddr>),
    Error,
}

/// Thread-safe, read-mostly hostname -> resolved-address-list map. Lookups
/// take a shared lock; insertions take an exclusive lock. No expiry within
/// a run; call [`DnsCache::clear`] between runs.
pub struct DnsCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    resolver: TokioAsyncResolver,
}

impl DnsCache {
    pub fn new() -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            entries: RwLock::new(HashMap::new()),
            resolver,
        }
    }

    /// Pre-resolved override for `host:port`, suitable for handing to the
    /// I/O layer so the transfer skips the system resolver. Returns `None`
    /// (no override, fall back to normal resolution) on a cache/resolve
    /// miss.
    pub fn override_for(&self, host: &str, port: u16) -> Option<Vec<SocketAddr>> {
        if let Some(entry) = self.entries.read().unwrap().get(host) {
            return match entry {
                CacheEntry::Addrs(addrs) => Some(
                    addrs
                        .iter()
                        .map(|a| SocketAddr::new(a.ip(), port))
                        .collect(),
                ),
                CacheEntry::Error => None,
            };
        }
        None
    }

    async fn resolve_and_cache(&self, host: &str) -> Option<Vec<SocketAddr>> {
        if let Some(entry) = self.entries.read().unwrap().get(host) {
            return match entry {
                CacheEntry::Addrs(addrs) => Some(addrs.clone()),
                CacheEntry::Error => None,
            };
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let addrs: Vec<SocketAddr> = lookup
                    .iter()
                    .map(|ip| SocketAddr::new(ip, 0))
                    .collect();
                debug!(host, count = addrs.len(), "resolved and cached host");
                self.entries
                    .write()
                    .unwrap()
                    .insert(host.to_string(), CacheEntry::Addrs(addrs.clone()));
                Some(addrs)
            }
            Err(e) => {
                warn!(host, error = %e, "dns resolution failed, no override applied");
                self.entries
                    .write()
                    .unwrap()
                    .insert(host.to_string(), CacheEntry::Error);
                None
            }
        }
    }

    /// Clears all cached entries. A run is short-lived; entries have no
    /// expiry within one, so this is the only way to drop stale data
    /// between runs.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `DnsCache` is installed behind an `Arc` via [`SharedDnsCache`] so both
/// the daemon's process-wide handle and reqwest's `dyn Resolve` trait
/// object (which requires `'static`) can own a reference.
#[derive(Clone)]
pub struct SharedDnsCache(pub Arc<DnsCache>);

impl SharedDnsCache {
    pub fn new() -> Self {
        Self(Arc::new(DnsCache::new()))
    }
}

impl Default for SharedDnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for SharedDnsCache {
    type Target = DnsCache;
    fn deref(&self) -> &DnsCache {
        &self.0
    }
}

impl Resolve for SharedDnsCache {
    fn resolve(&self, name: Name) -> Resolving {
        let cache = self.0.clone();
        Box::pin(async move {
            let host = name.as_str().to_string();
            match cache.resolve_and_cache(&host).await {
                Some(addrs) => {
                    let iter: Addrs = Box::new(addrs.into_iter());
                    Ok(iter)
                }
                None => Err(format!("dns resolution failed for {host}").into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_starts_empty() {
        let cache = DnsCache::new();
        assert_eq!(cache.len(), 0);
        assert!(cache.override_for("example.com", 443).is_none());
    }

    #[tokio::test]
    async fn resolving_localhost_populates_the_cache() {
        let cache = DnsCache::new();
        let addrs = cache.resolve_and_cache("localhost").await;
        assert!(addrs.is_some());
        assert_eq!(cache.len(), 1);

        // Subsequent transfers to the same hostname observe the cached
        // override without another resolver round-trip.
        let override_addrs = cache.override_for("localhost", 8080);
        assert!(override_addrs.is_some());
        assert!(override_addrs.unwrap().iter().all(|a| a.port() == 8080));
    }

    #[tokio::test]
    async fn clear_drops_all_entries() {
        let cache = DnsCache::new();
        cache.resolve_and_cache("localhost").await;
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
