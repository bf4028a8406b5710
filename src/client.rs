//! High-level API client built on the executor.
//!
//! A [`FetchClient`] holds only immutable settings plus shared collaborators,
//! so one instance can serve any number of concurrent calls.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use crate::clock::{Clock, TokioClock};
use crate::envelope::{Body, ResponseEnvelope};
use crate::error::FetchError;
use crate::executor::{BackoffPolicy, Executor};
use crate::rate_limit::TokenBucket;
use crate::request::{
    Method, RequestSpec, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RETRIES,
    DEFAULT_READ_TIMEOUT,
};
use crate::resolver::{Resolver, SystemResolver};
use crate::transport::{ReqwestTransport, Transport, DEFAULT_MAX_BODY_BYTES};
use crate::validator::{HostPolicy, UrlValidator};

pub const DEFAULT_USER_AGENT: &str = concat!("safe-fetch/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_DNS_CACHE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_DNS_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub per_sec: f64,
    pub burst: u32,
}

/// Immutable client configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    /// Prefix for relative endpoints passed to the API helpers.
    pub base_url: Option<String>,
    pub user_agent: String,
    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_redirects: u32,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub dns_cache_ttl: Duration,
    pub dns_cache_capacity: usize,
    pub max_body_bytes: usize,
    /// Hostnames refused in addition to the built-in local names.
    pub denied_hosts: Vec<String>,
    pub rate_limit: Option<RateLimit>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            bearer_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            dns_cache_ttl: DEFAULT_DNS_CACHE_TTL,
            dns_cache_capacity: DEFAULT_DNS_CACHE_CAPACITY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            denied_hosts: Vec::new(),
            rate_limit: None,
        }
    }
}

pub struct FetchClient {
    settings: FetchSettings,
    base_url: Option<Url>,
    executor: Executor,
    limiter: Option<TokenBucket>,
}

impl FetchClient {
    /// Production wiring: system DNS with cache, reqwest transport, tokio
    /// clock. The validator and the transport share one resolver.
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver::new(
            settings.dns_cache_ttl,
            settings.dns_cache_capacity,
        ));
        let policy = HostPolicy::new(&settings.denied_hosts);
        let validator = Arc::new(UrlValidator::new(policy.clone(), Arc::clone(&resolver)));
        let transport = Arc::new(ReqwestTransport::new(
            resolver,
            policy,
            settings.max_body_bytes,
        ));
        Self::with_parts(settings, validator, transport, Arc::new(TokioClock))
    }

    pub fn with_parts(
        settings: FetchSettings,
        validator: Arc<UrlValidator>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FetchError> {
        let base_url = settings
            .base_url
            .as_deref()
            .map(parse_base)
            .transpose()?;
        let limiter = settings
            .rate_limit
            .map(|limit| TokenBucket::new(limit.burst, limit.per_sec, Arc::clone(&clock)));
        let executor = Executor::new(validator, transport, clock, settings.backoff);

        info!(
            base_url = base_url.as_ref().map(Url::as_str).unwrap_or("-"),
            max_retries = settings.max_retries,
            max_redirects = settings.max_redirects,
            rate_limited = limiter.is_some(),
            "fetch client ready"
        );

        Ok(Self {
            settings,
            base_url,
            executor,
            limiter,
        })
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Start a request to an absolute URL carrying this client's limits
    /// and identity headers.
    pub fn request(&self, method: Method, url: impl Into<String>) -> RequestSpec {
        let mut spec = RequestSpec::new(method, url)
            .timeouts(self.settings.connect_timeout, self.settings.read_timeout)
            .max_redirects(self.settings.max_redirects)
            .max_retries(self.settings.max_retries)
            .default_header("user-agent", self.settings.user_agent.as_str());
        if let Some(token) = &self.settings.bearer_token {
            spec = spec.default_header("authorization", format!("Bearer {token}"));
        }
        spec
    }

    /// Run a fully built request through the rate limiter and executor.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<ResponseEnvelope, FetchError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }
        self.executor.execute(spec).await
    }

    /// Resolve `endpoint` against the base URL.
    pub fn endpoint_url(&self, endpoint: &str) -> Result<Url, FetchError> {
        match &self.base_url {
            Some(base) => base
                .join(endpoint.trim_start_matches('/'))
                .map_err(|e| FetchError::InvalidRequest(format!("endpoint {endpoint}: {e}"))),
            None => Url::parse(endpoint)
                .map_err(|e| FetchError::InvalidRequest(format!("endpoint {endpoint}: {e}"))),
        }
    }

    fn api_request(&self, method: Method, url: Url) -> RequestSpec {
        self.request(method, url.as_str())
            .default_header("content-type", "application/json")
    }

    pub async fn get(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<ResponseEnvelope, FetchError> {
        let mut url = self.endpoint_url(endpoint)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        self.execute(&self.api_request(Method::Get, url)).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.send_json(Method::Post, endpoint, body).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.send_json(Method::Put, endpoint, body).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseEnvelope, FetchError> {
        self.send_json(Method::Patch, endpoint, body).await
    }

    pub async fn delete(&self, endpoint: &str) -> Result<ResponseEnvelope, FetchError> {
        let url = self.endpoint_url(endpoint)?;
        self.execute(&self.api_request(Method::Delete, url)).await
    }

    async fn send_json(
        &self,
        method: Method,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<ResponseEnvelope, FetchError> {
        let url = self.endpoint_url(endpoint)?;
        let spec = self.api_request(method, url).json(body);
        self.execute(&spec).await
    }

    /// GET a page and return its text. Non-2xx responses are errors.
    pub async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        let envelope = self
            .execute(&self.request(Method::Get, url))
            .await?
            .error_for_status()?;
        debug!(status = envelope.status, final_url = %envelope.final_url, "page fetched");
        Ok(match envelope.body {
            Body::Raw(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            body => body.text().unwrap_or_default(),
        })
    }
}

fn parse_base(raw: &str) -> Result<Url, FetchError> {
    // A trailing slash makes `join` append instead of replacing the last
    // path segment.
    Url::parse(&format!("{}/", raw.trim_end_matches('/')))
        .map_err(|e| FetchError::InvalidRequest(format!("base URL {raw}: {e}")))
}
