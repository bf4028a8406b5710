//! URL safety validation (SSRF + DNS rebinding).
//!
//! Validation runs in two layers:
//!
//! - [`HostPolicy::inspect`] performs the synchronous checks (scheme,
//!   hostname presence, local-name denylist, literal address class). It is
//!   cheap enough to run inside the transport's redirect policy for every
//!   hop.
//! - [`UrlValidator::validate`] adds DNS resolution for domain names and
//!   rejects the URL when any resolved address is not public.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::classify::{classify, AddressClassification};
use crate::resolver::Resolver;

pub const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Hostnames that always name the local machine.
pub const DENIED_HOSTNAMES: &[&str] = &["localhost", "localhost.localdomain"];

/// Why a URL was refused. Every variant is permanent and never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    #[error("scheme '{scheme}' is not allowed (http and https only)")]
    InvalidScheme { scheme: String },
    #[error("URL has no hostname")]
    MissingHostname,
    #[error("hostname '{host}' refers to the local machine")]
    BlockedHostnameLiteral { host: String },
    #[error("address {addr} is {class}")]
    BlockedAddress {
        addr: IpAddr,
        class: AddressClassification,
    },
    #[error("{host} resolved to {addr} ({class})")]
    DnsRebindingDetected {
        host: String,
        addr: IpAddr,
        class: AddressClassification,
    },
    #[error("URL could not be parsed: {detail}")]
    Malformed { detail: String },
}

/// Outcome of [`UrlValidator::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Allowed,
    Rejected(Rejection),
}

impl ValidationVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Self::Allowed => Ok(()),
            Self::Rejected(rejection) => Err(rejection),
        }
    }
}

/// Host portion of a URL that passed the synchronous checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTarget {
    /// Literal public address; nothing left to resolve.
    Address(IpAddr),
    /// Domain name that still needs a DNS check.
    Domain(String),
}

/// Parse a raw URL string, mapping parser failures onto the rejection
/// taxonomy.
pub fn parse_url(raw: &str) -> Result<Url, Rejection> {
    match Url::parse(raw.trim()) {
        Ok(url) => Ok(url),
        Err(url::ParseError::RelativeUrlWithoutBase) => Err(Rejection::InvalidScheme {
            scheme: String::new(),
        }),
        Err(url::ParseError::EmptyHost) => Err(Rejection::MissingHostname),
        Err(e) => Err(Rejection::Malformed {
            detail: e.to_string(),
        }),
    }
}

/// Static, read-only host rules shared by the validator and the redirect
/// policy.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    denied_hosts: Arc<HashSet<String>>,
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

impl HostPolicy {
    /// Build a policy denying [`DENIED_HOSTNAMES`] plus `extra` names.
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let denied_hosts = DENIED_HOSTNAMES
            .iter()
            .map(|h| h.to_string())
            .chain(extra.into_iter().map(|h| normalize_host(h.as_ref())))
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            denied_hosts: Arc::new(denied_hosts),
        }
    }

    pub fn is_denied(&self, host: &str) -> bool {
        self.denied_hosts.contains(&normalize_host(host))
    }

    /// Scheme, hostname, denylist and literal-address checks.
    pub fn inspect(&self, url: &Url) -> Result<HostTarget, Rejection> {
        let scheme = url.scheme();
        if !ALLOWED_SCHEMES.contains(&scheme) {
            return Err(Rejection::InvalidScheme {
                scheme: scheme.to_string(),
            });
        }

        let host = match url.host() {
            Some(host) => host,
            None => return Err(Rejection::MissingHostname),
        };

        let addr = match host {
            Host::Ipv4(v4) => IpAddr::V4(v4),
            Host::Ipv6(v6) => IpAddr::V6(v6),
            Host::Domain(name) => {
                if name.is_empty() {
                    return Err(Rejection::MissingHostname);
                }
                if self.is_denied(name) {
                    return Err(Rejection::BlockedHostnameLiteral {
                        host: name.to_string(),
                    });
                }
                return Ok(HostTarget::Domain(name.to_string()));
            }
        };

        let class = classify(addr);
        if !class.is_public() {
            return Err(Rejection::BlockedAddress { addr, class });
        }
        Ok(HostTarget::Address(addr))
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Full validator: [`HostPolicy`] plus DNS rebinding defense.
pub struct UrlValidator {
    policy: HostPolicy,
    resolver: Arc<dyn Resolver>,
}

impl UrlValidator {
    pub fn new(policy: HostPolicy, resolver: Arc<dyn Resolver>) -> Self {
        Self { policy, resolver }
    }

    pub fn policy(&self) -> &HostPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> Arc<dyn Resolver> {
        Arc::clone(&self.resolver)
    }

    /// Validate a raw URL string.
    pub async fn validate(&self, raw: &str) -> ValidationVerdict {
        match parse_url(raw) {
            Ok(url) => self.validate_url(&url).await,
            Err(rejection) => {
                warn!(reason = %rejection, "URL rejected");
                ValidationVerdict::Rejected(rejection)
            }
        }
    }

    /// Validate an already parsed URL.
    pub async fn validate_url(&self, url: &Url) -> ValidationVerdict {
        let verdict = match self.check(url).await {
            Ok(()) => ValidationVerdict::Allowed,
            Err(rejection) => ValidationVerdict::Rejected(rejection),
        };
        if let ValidationVerdict::Rejected(ref rejection) = verdict {
            warn!(
                host = url.host_str().unwrap_or_default(),
                reason = %rejection,
                "URL rejected"
            );
        }
        verdict
    }

    async fn check(&self, url: &Url) -> Result<(), Rejection> {
        let host = match self.policy.inspect(url)? {
            HostTarget::Address(_) => return Ok(()),
            HostTarget::Domain(host) => host,
        };

        let addrs = match self.resolver.resolve(&host).await {
            Ok(addrs) => addrs,
            Err(e) => {
                // Inconclusive: the transport will surface a real connect error.
                debug!(host = %host, error = %e, "DNS resolution failed, continuing");
                return Ok(());
            }
        };

        for addr in addrs {
            let class = classify(addr);
            if !class.is_public() {
                return Err(Rejection::DnsRebindingDetected { host, addr, class });
            }
        }
        Ok(())
    }
}
