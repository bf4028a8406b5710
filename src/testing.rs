//! Test doubles for the resolver, transport and clock seams.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::clock::{Clock, Sleeping};
use crate::request::RequestSpec;
use crate::resolver::{literal_address, ResolveError, Resolver, Resolving};
use crate::transport::{Sending, Transport, TransportError, TransportResponse};

/// Resolver answering from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
    default: Option<Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer for any host not listed explicitly.
    pub fn with_default(mut self, addrs: Vec<IpAddr>) -> Self {
        self.default = Some(addrs);
        self
    }

    pub fn with_host(mut self, host: &str, addrs: &[&str]) -> Self {
        let addrs = addrs.iter().map(|a| a.parse().unwrap()).collect();
        self.hosts.insert(host.to_ascii_lowercase(), addrs);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str) -> Resolving {
        let answer = match literal_address(host) {
            Some(ip) => Ok(vec![ip]),
            None => self
                .hosts
                .get(&host.to_ascii_lowercase())
                .or(self.default.as_ref())
                .cloned()
                .ok_or_else(|| ResolveError::Failed {
                    host: host.to_string(),
                    reason: "no such host".to_string(),
                }),
        };
        Box::pin(async move { answer })
    }
}

pub fn response(status: u16, body: &str, final_url: &str) -> TransportResponse {
    TransportResponse {
        status,
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: Bytes::from(body.to_string()),
        final_url: final_url.to_string(),
    }
}

/// Transport replaying queued outcomes per request URL.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<HashMap<String, VecDeque<Result<TransportResponse, TransportError>>>>,
    calls: Mutex<Vec<RequestSpec>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, url: &str, outcome: Result<TransportResponse, TransportError>) {
        self.script
            .lock()
            .entry(url.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Queue `status` served from `url` itself.
    pub fn push_status(&self, url: &str, status: u16, body: &str) {
        self.push(url, Ok(response(status, body, url)));
    }

    pub fn calls(&self) -> Vec<RequestSpec> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

impl Transport for ScriptedTransport {
    fn send<'a>(&'a self, spec: &'a RequestSpec) -> Sending<'a> {
        self.calls.lock().push(spec.clone());
        let outcome = self
            .script
            .lock()
            .get_mut(&spec.url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(TransportError::Connect(format!("unscripted {}", spec.url))));
        Box::pin(async move {
            tokio::task::yield_now().await;
            outcome
        })
    }
}

/// Clock whose sleeps complete immediately and advance virtual time.
pub struct ManualClock {
    start: Instant,
    elapsed: Mutex<Duration>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: Mutex::new(Vec::new()),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock()
    }

    fn sleep(&self, duration: Duration) -> Sleeping {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
