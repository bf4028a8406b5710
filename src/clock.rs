//! Time source used by backoff and rate limiting.
//!
//! Both suspend the calling task; routing those waits through [`Clock`]
//! lets tests observe every sleep without waiting in real time.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

pub type Sleeping = Pin<Box<dyn Future<Output = ()> + Send>>;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> Sleeping;
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleeping {
        Box::pin(tokio::time::sleep(duration))
    }
}
