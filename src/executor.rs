//! Retrying request executor.
//!
//! One call to [`Executor::execute`] is one sequential unit of work:
//! validate, send, re-validate the URL the response came from, then either
//! return, back off and retry, or give up. All per-call state lives in a
//! [`RetryState`] on the call's own stack.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::envelope::ResponseEnvelope;
use crate::error::{FetchError, LastFailure};
use crate::request::RequestSpec;
use crate::transport::Transport;
use crate::validator::{UrlValidator, ValidationVerdict};

pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Exponential backoff: `unit * 2^attempt`, optionally capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub unit: Duration,
    /// Uncapped when `None`.
    pub max: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unit: DEFAULT_BACKOFF_UNIT,
            max: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the failed attempt with 0-based index `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 2_u32.saturating_pow(attempt);
        let delay = self.unit.saturating_mul(multiplier);
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Progress of one `execute` call.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts already made.
    pub attempt: u32,
    pub last: Option<LastFailure>,
    /// Total time spent in backoff.
    pub waited: Duration,
}

enum Outcome {
    Done(ResponseEnvelope),
    Retry(LastFailure),
}

pub struct Executor {
    validator: Arc<UrlValidator>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl Executor {
    pub fn new(
        validator: Arc<UrlValidator>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            validator,
            transport,
            clock,
            backoff,
        }
    }

    pub fn validator(&self) -> &UrlValidator {
        &self.validator
    }

    /// Run `spec` to a final envelope or a typed failure.
    ///
    /// Responses below 500 are returned as-is, 4xx included. Rejections
    /// and non-retryable transport errors end the call immediately.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<ResponseEnvelope, FetchError> {
        self.validator.validate(&spec.url).await.into_result()?;

        let limit = spec.attempt_limit();
        let mut state = RetryState::default();

        loop {
            let attempt = state.attempt;
            state.attempt += 1;
            debug!(method = %spec.method, attempt = state.attempt, limit, "sending request");

            let failure = match self.attempt(spec, state.attempt).await? {
                Outcome::Done(envelope) => {
                    debug!(
                        status = envelope.status,
                        attempts = envelope.attempts,
                        "request finished"
                    );
                    return Ok(envelope);
                }
                Outcome::Retry(failure) => failure,
            };

            if state.attempt >= limit {
                warn!(
                    attempts = state.attempt,
                    waited_ms = state.waited.as_millis() as u64,
                    last = %failure,
                    "retries exhausted"
                );
                return Err(FetchError::ExhaustedRetries {
                    attempts: state.attempt,
                    last: failure,
                });
            }

            let delay = self.backoff.delay(attempt);
            warn!(
                attempt = state.attempt,
                limit,
                delay_ms = delay.as_millis() as u64,
                failure = %failure,
                "request failed, retrying"
            );
            self.clock.sleep(delay).await;
            state.waited += delay;
            state.last = Some(failure);
        }
    }

    async fn attempt(&self, spec: &RequestSpec, attempts: u32) -> Result<Outcome, FetchError> {
        let response = match self.transport.send(spec).await {
            Ok(response) => response,
            Err(err) if err.is_retryable() => {
                return Ok(Outcome::Retry(LastFailure::Transport(err)));
            }
            Err(err) => return Err(err.into()),
        };

        // Redirects may have landed somewhere internal even with a 2xx.
        if let ValidationVerdict::Rejected(rejection) =
            self.validator.validate(&response.final_url).await
        {
            warn!(status = response.status, reason = %rejection, "final URL rejected");
            return Err(FetchError::Rejected(rejection));
        }

        let envelope = ResponseEnvelope::build(response, attempts);
        if envelope.status >= 500 {
            Ok(Outcome::Retry(LastFailure::Status(Box::new(envelope))))
        } else {
            Ok(Outcome::Done(envelope))
        }
    }
}
