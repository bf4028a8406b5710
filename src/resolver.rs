//! Hostname resolution behind a swappable [`Resolver`] seam.
//!
//! [`SystemResolver`] resolves through the OS (`tokio::net::lookup_host`)
//! and keeps a small TTL cache so the validator and the connection pinning
//! in [`crate::safe_dns`] observe the same answer for a host.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

pub type Resolving = Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, ResolveError>> + Send>>;

/// Resolves a hostname to the addresses a connection would use.
pub trait Resolver: Send + Sync {
    fn resolve(&self, host: &str) -> Resolving;
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("DNS resolution failed for {host}: {reason}")]
    Failed { host: String, reason: String },
    #[error("DNS resolution returned no addresses for {0}")]
    NoAddresses(String),
}

/// Parse a host that is already a numeric address (`[::1]` included).
pub fn literal_address(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse::<IpAddr>().ok()
}

struct DnsCacheEntry {
    addrs: Arc<Vec<IpAddr>>,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Lightweight DNS cache with TTL + capacity bounds.
pub struct DnsCache {
    ttl: Duration,
    capacity: usize,
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn enabled(&self) -> bool {
        self.capacity > 0 && !self.ttl.is_zero()
    }

    pub async fn get(&self, host: &str) -> Option<Arc<Vec<IpAddr>>> {
        if !self.enabled() {
            return None;
        }
        let key = host.to_ascii_lowercase();
        let now = Instant::now();

        // Fast path: read lock for cache hit
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if entry.expires_at > now => return Some(Arc::clone(&entry.addrs)),
                None => return None,
                Some(_) => {} // expired, fall through to evict
            }
        }

        let mut entries = self.entries.write().await;
        entries.remove(&key);
        None
    }

    pub async fn insert(&self, host: &str, addrs: Arc<Vec<IpAddr>>) {
        if !self.enabled() || addrs.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.expires_at > now);
        while entries.len() >= self.capacity {
            let oldest_key = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            match oldest_key {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
        entries.insert(
            host.to_ascii_lowercase(),
            DnsCacheEntry {
                addrs,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }
}

/// OS resolver with caching. Failed lookups are never cached.
pub struct SystemResolver {
    cache: Arc<DnsCache>,
}

impl SystemResolver {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            cache: Arc::new(DnsCache::new(ttl, capacity)),
        }
    }
}

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str) -> Resolving {
        if let Some(ip) = literal_address(host) {
            return Box::pin(async move { Ok::<_, ResolveError>(vec![ip]) });
        }

        let cache = Arc::clone(&self.cache);
        let host = host.to_string();
        Box::pin(async move {
            if let Some(addrs) = cache.get(&host).await {
                return Ok((*addrs).clone());
            }

            let resolved: Vec<IpAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| ResolveError::Failed {
                    host: host.clone(),
                    reason: e.to_string(),
                })?
                .map(|addr| addr.ip())
                .collect();

            if resolved.is_empty() {
                return Err(ResolveError::NoAddresses(host));
            }

            debug!(host = %host, count = resolved.len(), "resolved host");
            let addrs = Arc::new(resolved);
            cache.insert(&host, Arc::clone(&addrs)).await;
            Ok((*addrs).clone())
        })
    }
}
