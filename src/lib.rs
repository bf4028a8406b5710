//! Hardened outbound HTTP fetching.
//!
//! Every request URL is checked against an SSRF policy before any network
//! I/O: scheme allowlist, local hostname denylist, address classification
//! of literal hosts, and classification of every DNS answer. The transport
//! connects only to addresses that passed, gates each redirect hop, and the
//! URL a response finally came from is validated again before the response
//! is handed back.

pub mod app;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod rate_limit;
pub mod request;
pub mod resolver;
pub mod safe_dns;
pub mod transport;
pub mod validator;

#[cfg(test)]
mod testing;

pub use classify::{classify, AddressClassification};
pub use client::{FetchClient, FetchSettings, RateLimit};
pub use envelope::{Body, ResponseEnvelope};
pub use error::{FetchError, LastFailure};
pub use executor::{BackoffPolicy, Executor};
pub use request::{Method, RequestSpec};
pub use validator::{HostPolicy, Rejection, UrlValidator, ValidationVerdict};
