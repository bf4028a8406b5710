//! DNS resolver for reqwest that only hands out validated public addresses.
//!
//! The validator and this resolver share one [`Resolver`] (and therefore one
//! DNS cache), so reqwest connects to the same answer the validator judged.
//! A second lookup that now points somewhere internal is refused here
//! instead of being connected to.

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::warn;

use crate::classify::classify;
use crate::resolver::Resolver;
use crate::validator::Rejection;

pub struct SafeDnsResolver {
    resolver: Arc<dyn Resolver>,
}

impl SafeDnsResolver {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }
}

impl Resolve for SafeDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let resolver = Arc::clone(&self.resolver);
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolver
                .resolve(&host)
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?;

            if let Some(&addr) = addrs.iter().find(|ip| !classify(**ip).is_public()) {
                let class = classify(addr);
                warn!(
                    host = %host,
                    addr = %addr,
                    class = %class,
                    "connect-time resolution refused"
                );
                return Err(Box::new(Rejection::DnsRebindingDetected { host, addr, class })
                    as Box<dyn std::error::Error + Send + Sync>);
            }

            // Port 0 is replaced with the URL's port by the connector.
            let socket_addrs: Vec<SocketAddr> =
                addrs.into_iter().map(|ip| SocketAddr::new(ip, 0)).collect();
            Ok(Box::new(socket_addrs.into_iter()) as Addrs)
        })
    }
}
