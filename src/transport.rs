//! HTTP transport collaborator.
//!
//! [`Transport`] is the seam the executor drives; [`ReqwestTransport`] is
//! the production implementation. It always verifies TLS certificates,
//! ignores proxy environment variables, follows redirects up to the
//! request's cap while running [`HostPolicy::inspect`] on every hop, and
//! pins connections to validated addresses via [`SafeDnsResolver`].

use std::collections::HashMap;
use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use thiserror::Error;
use tracing::debug;

use crate::request::{Method, RequestBody, RequestSpec};
use crate::resolver::Resolver;
use crate::safe_dns::SafeDnsResolver;
use crate::validator::{HostPolicy, Rejection};

/// Default cap on a buffered response body (10 MB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Distinct timeout/redirect profiles kept alive at once.
pub const MAX_CACHED_CLIENTS: usize = 16;

/// A response that completed at the transport level, any status.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// URL after following redirects.
    pub final_url: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("failed to read response body: {0}")]
    Body(String),
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("more than {max} redirects")]
    TooManyRedirects { max: u32 },
    /// Redirect hop or connect-time address refused by the URL policy.
    #[error("target blocked: {0}")]
    Blocked(Rejection),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Connection, timeout and body-read failures may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::Body(_))
    }
}

pub type Sending<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, TransportError>> + Send + 'a>>;

pub trait Transport: Send + Sync {
    /// Perform one attempt of `spec`, following redirects.
    fn send<'a>(&'a self, spec: &'a RequestSpec) -> Sending<'a>;
}

/// Raised from the redirect policy when the hop count exceeds the cap.
#[derive(Debug, Error)]
#[error("more than {max} redirects")]
struct RedirectLimit {
    max: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    connect_timeout: Duration,
    read_timeout: Duration,
    max_redirects: u32,
}

impl ClientKey {
    fn of(spec: &RequestSpec) -> Self {
        Self {
            connect_timeout: spec.connect_timeout,
            read_timeout: spec.read_timeout,
            max_redirects: spec.max_redirects,
        }
    }
}

/// reqwest-backed transport. Clients are built lazily per distinct
/// timeout/redirect combination and reused afterwards. At most
/// [`MAX_CACHED_CLIENTS`] profiles are cached; a new profile beyond that
/// flushes the cache.
pub struct ReqwestTransport {
    dns: Arc<SafeDnsResolver>,
    policy: HostPolicy,
    max_body_bytes: usize,
    clients: Mutex<HashMap<ClientKey, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(resolver: Arc<dyn Resolver>, policy: HostPolicy, max_body_bytes: usize) -> Self {
        Self {
            dns: Arc::new(SafeDnsResolver::new(resolver)),
            policy,
            max_body_bytes,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, spec: &RequestSpec) -> Result<reqwest::Client, TransportError> {
        let key = ClientKey::of(spec);
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .dns_resolver(Arc::clone(&self.dns))
            .connect_timeout(key.connect_timeout)
            .read_timeout(key.read_timeout)
            .redirect(redirect_policy(self.policy.clone(), key.max_redirects))
            .no_proxy()
            .build()
            .map_err(|e| TransportError::InvalidRequest(error_chain(&e)))?;
        if clients.len() >= MAX_CACHED_CLIENTS {
            debug!(cached = clients.len(), "client cache full, flushing");
            clients.clear();
        }
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn send_inner(&self, spec: &RequestSpec) -> Result<TransportResponse, TransportError> {
        let client = self.client_for(spec)?;
        let mut req = client.request(to_reqwest_method(spec.method), &spec.url);

        for (name, value) in &spec.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header {name}: {e}")))?;
            req = req.header(name, value);
        }

        match &spec.body {
            Some(RequestBody::Bytes(bytes)) => req = req.body(bytes.clone()),
            Some(RequestBody::Json(value)) => req = req.json(value),
            None => {}
        }

        let resp = req.send().await.map_err(map_reqwest_error)?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let limit = self.max_body_bytes;
        if resp.content_length().is_some_and(|len| len > limit as u64) {
            return Err(TransportError::BodyTooLarge { limit });
        }

        let mut body = BytesMut::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            if body.len() + chunk.len() > limit {
                return Err(TransportError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(status, final_url = %final_url, bytes = body.len(), "transport response");

        Ok(TransportResponse {
            status,
            headers,
            body: body.freeze(),
            final_url,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(&'a self, spec: &'a RequestSpec) -> Sending<'a> {
        Box::pin(self.send_inner(spec))
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// Redirect policy: hop cap first, then the synchronous host checks.
fn redirect_policy(policy: HostPolicy, max_redirects: u32) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects as usize {
            return attempt.error(RedirectLimit { max: max_redirects });
        }
        match policy.inspect(attempt.url()) {
            Ok(_) => {
                debug!(
                    to = %attempt.url(),
                    hop = attempt.previous().len(),
                    "following redirect"
                );
                attempt.follow()
            }
            Err(rejection) => attempt.error(rejection),
        }
    })
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if let Some(rejection) = find_cause::<Rejection>(&err) {
        return TransportError::Blocked(rejection.clone());
    }
    if let Some(limit) = find_cause::<RedirectLimit>(&err) {
        return TransportError::TooManyRedirects { max: limit.max };
    }

    // Query strings may carry credentials; keep them out of messages.
    let err = err.without_url();
    let detail = error_chain(&err);
    if err.is_timeout() {
        TransportError::Timeout(detail)
    } else if err.is_builder() {
        TransportError::InvalidRequest(detail)
    } else if err.is_body() || err.is_decode() {
        TransportError::Body(detail)
    } else {
        TransportError::Connect(detail)
    }
}

fn find_cause<'e, T: StdError + 'static>(err: &'e (dyn StdError + 'static)) -> Option<&'e T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Render an error and its sources as `outer: inner: root`.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let msg = e.to_string();
        if !out.contains(&msg) {
            out.push_str(": ");
            out.push_str(&msg);
        }
        current = e.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::AddressClassification;
    use crate::testing::StaticResolver;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP/1.1 response per accepted connection.
    async fn serve(responses: Vec<String>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for response in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                sock.write_all(response.as_bytes()).await.unwrap();
                let _ = sock.shutdown().await;
            }
        });
        addr
    }

    fn ok_json(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
    }

    fn redirect_to(location: &str) -> String {
        format!(
            "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        )
    }

    fn transport() -> ReqwestTransport {
        transport_with(StaticResolver::new())
    }

    fn transport_with(resolver: StaticResolver) -> ReqwestTransport {
        ReqwestTransport::new(Arc::new(resolver), HostPolicy::default(), DEFAULT_MAX_BODY_BYTES)
    }

    #[tokio::test]
    async fn test_reads_status_headers_and_body() {
        let addr = serve(vec![ok_json(r#"{"ok":true}"#)]).await;
        let url = format!("http://{addr}/data");
        let spec = RequestSpec::get(&url).header("X-Trace", "abc");
        let resp = transport().send(&spec).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, Bytes::from_static(br#"{"ok":true}"#));
        assert_eq!(resp.final_url, url);
        assert!(resp
            .headers
            .iter()
            .any(|(n, v)| n == "content-type" && v == "application/json"));
    }

    #[tokio::test]
    async fn test_redirect_to_localhost_is_blocked() {
        let addr = serve(vec![redirect_to("http://localhost/admin")]).await;
        let spec = RequestSpec::get(format!("http://{addr}/start"));
        let err = transport().send(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Blocked(Rejection::BlockedHostnameLiteral { .. })
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_redirect_to_metadata_is_blocked() {
        let addr = serve(vec![redirect_to("http://169.254.169.254/latest/meta-data/")]).await;
        let spec = RequestSpec::get(format!("http://{addr}/start"));
        match transport().send(&spec).await {
            Err(TransportError::Blocked(Rejection::BlockedAddress { class, .. })) => {
                assert_eq!(class, AddressClassification::CloudMetadata)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_limit() {
        let addr = serve(vec![redirect_to("http://93.184.216.34/next")]).await;
        let spec = RequestSpec::get(format!("http://{addr}/start")).max_redirects(0);
        assert_eq!(
            transport().send(&spec).await.unwrap_err(),
            TransportError::TooManyRedirects { max: 0 }
        );
    }

    #[tokio::test]
    async fn test_body_limit() {
        let addr = serve(vec![ok_json(r#"{"payload":"0123456789abcdef"}"#)]).await;
        let small =
            ReqwestTransport::new(Arc::new(StaticResolver::new()), HostPolicy::default(), 8);
        let spec = RequestSpec::get(format!("http://{addr}/big"));
        assert_eq!(
            small.send(&spec).await.unwrap_err(),
            TransportError::BodyTooLarge { limit: 8 }
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let spec = RequestSpec::get(format!("http://{addr}/"))
            .timeouts(Duration::from_secs(2), Duration::from_secs(2));
        let err = transport().send(&spec).await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }

    #[tokio::test]
    async fn test_invalid_header_is_not_retryable() {
        let spec = RequestSpec::get("http://93.184.216.34/").header("bad header", "x");
        let err = transport().send(&spec).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_internal_answer_at_connect_is_blocked() {
        let resolver = StaticResolver::new().with_host("rebind.test", &["10.1.2.3"]);
        let spec = RequestSpec::get("http://rebind.test:8080/");
        let err = transport_with(resolver).send(&spec).await.unwrap_err();
        match &err {
            TransportError::Blocked(Rejection::DnsRebindingDetected { host, class, .. }) => {
                assert_eq!(host, "rebind.test");
                assert_eq!(*class, AddressClassification::Private);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_redirect_to_internal_name_is_blocked_at_connect() {
        let addr = serve(vec![redirect_to("http://internal.test:8080/admin")]).await;
        let resolver = StaticResolver::new().with_host("internal.test", &["192.168.1.1"]);
        let spec = RequestSpec::get(format!("http://{addr}/start"));
        match transport_with(resolver).send(&spec).await {
            Err(TransportError::Blocked(Rejection::DnsRebindingDetected { host, addr, .. })) => {
                assert_eq!(host, "internal.test");
                assert_eq!(addr, "192.168.1.1".parse::<std::net::IpAddr>().unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unresolvable_name_is_retryable_connect() {
        let spec = RequestSpec::get("http://nowhere.test/");
        let err = transport().send(&spec).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_client_cache_is_bounded() {
        let t = transport();
        for i in 0..(MAX_CACHED_CLIENTS as u64 + 4) {
            let spec = RequestSpec::get("http://93.184.216.34/")
                .timeouts(Duration::from_millis(1000 + i), Duration::from_secs(1));
            t.client_for(&spec).unwrap();
            assert!(t.clients.lock().len() <= MAX_CACHED_CLIENTS);
        }
        let reused = RequestSpec::get("http://93.184.216.34/")
            .timeouts(Duration::from_millis(1000), Duration::from_secs(1));
        t.client_for(&reused).unwrap();
        t.client_for(&reused).unwrap();
        assert!(t.clients.lock().contains_key(&ClientKey::of(&reused)));
    }
}
