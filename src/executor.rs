//! Authenticated request execution with rate-limit retries.
//!
//! Every API call goes through [`Executor::execute`], which:
//!
//! 1. attaches a bearer token obtained from the [`Authenticator`],
//! 2. retries replayable requests answered with HTTP 429 after a jittered
//!    exponential backoff,
//! 3. normalizes any other unexpected status into an [`ApiError`](crate::error::ApiError).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::{Client, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;
use crate::config::ClientConfig;
use crate::error::{CloudDriveError, InvalidStatus, Result};
use crate::request::RequestData;

/// Cap on the backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 16;

enum Attempt {
    Success(Response),
    Status(InvalidStatus),
}

/// Sends requests on behalf of all services of one account.
///
/// Clones share the transport, credentials and jitter generator.
#[derive(Clone)]
pub struct Executor {
    http: Client,
    auth: Authenticator,
    max_retries: u32,
    backoff_unit: Duration,
    request_timeout: Option<Duration>,
    jitter: Arc<Mutex<StdRng>>,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(http: Client, auth: Authenticator, config: &ClientConfig) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            http,
            auth,
            max_retries: config.max_retries.max(1),
            backoff_unit: config.backoff_unit,
            request_timeout: config.request_timeout,
            jitter: Arc::new(Mutex::new(rng)),
            cancel: CancellationToken::new(),
        }
    }

    /// A copy of this executor whose calls abort when `token` is cancelled.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    pub fn auth(&self) -> &Authenticator {
        &self.auth
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Read a whole response body, aborting if the call is cancelled meanwhile.
    pub(crate) async fn read_body(&self, response: Response) -> Result<Vec<u8>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CloudDriveError::Cancelled),
            body = response.bytes() => Ok(body?.into()),
        }
    }

    /// Execute a request against the service rooted at `base`.
    ///
    /// Requests with a stream body get exactly one attempt.
    pub async fn execute(&self, base: &str, mut request: RequestData) -> Result<Response> {
        let retries = if request.is_replayable() {
            self.max_retries
        } else {
            1
        };

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CloudDriveError::Cancelled);
            }

            let current = match request.replay() {
                Some(copy) => copy,
                None => std::mem::take(&mut request),
            };

            debug!(
                method = %current.method,
                url = %current.url(base),
                attempt,
                "Sending request"
            );

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CloudDriveError::Cancelled),
                outcome = self.send(base, current) => outcome?,
            };

            let raw = match outcome {
                Attempt::Success(response) => {
                    if attempt > 0 {
                        info!(attempt, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Attempt::Status(raw) => raw,
            };

            if raw.got != StatusCode::TOO_MANY_REQUESTS {
                debug!(status = raw.got.as_u16(), "Unexpected response status");
                return Err(raw.into());
            }

            if attempt + 1 >= retries {
                warn!(attempts = attempt + 1, "429 retry limit exhausted");
                return Err(raw.into());
            }

            let delay = self.backoff(attempt);
            info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Received 429, backing off"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CloudDriveError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    async fn send(&self, base: &str, request: RequestData) -> Result<Attempt> {
        let token = self.auth.valid_token().await?;
        let expected = request.expected_status.clone();

        let response = request
            .into_builder(&self.http, base, &token, self.request_timeout)?
            .send()
            .await?;

        let status = response.status();
        if expected.contains(&status) {
            return Ok(Attempt::Success(response));
        }

        let headers = response.headers().clone();
        let content = match response.text().await {
            Ok(content) => content,
            Err(e) => {
                debug!(status = status.as_u16(), error = %e, "Failed to read error body");
                String::new()
            }
        };
        Ok(Attempt::Status(InvalidStatus {
            expected,
            got: status,
            content,
            headers,
        }))
    }

    /// Random delay in `[0, backoff_unit * 2^attempt)`.
    fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_unit * (1u32 << attempt.min(MAX_BACKOFF_SHIFT));
        let ceiling_nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        if ceiling_nanos == 0 {
            return Duration::ZERO;
        }

        let mut rng = self.jitter.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_nanos(rng.gen_range(0..ceiling_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Credentials;
    use chrono::Utc;

    fn executor(config: &ClientConfig) -> Executor {
        let auth = Authenticator::new(Credentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost".to_string(),
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        });
        Executor::new(Client::new(), auth, config)
    }

    #[test]
    fn test_backoff_within_ceiling() {
        let exec = executor(&ClientConfig::default());
        for attempt in 0..6 {
            let delay = exec.backoff(attempt);
            assert!(delay < Duration::from_secs(1u64 << attempt));
        }
    }

    #[test]
    fn test_backoff_deterministic_with_seed() {
        let config = ClientConfig::default().with_jitter_seed(42);
        let a = executor(&config);
        let b = executor(&config);
        let first: Vec<_> = (0..5).map(|n| a.backoff(n)).collect();
        let second: Vec<_> = (0..5).map(|n| b.backoff(n)).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_zero_max_retries_still_attempts_once() {
        let exec = executor(&ClientConfig::default().with_max_retries(0));
        assert_eq!(exec.max_retries(), 1);
    }

    #[test]
    fn test_zero_backoff_unit() {
        let exec = executor(&ClientConfig::default().with_backoff_unit(Duration::ZERO));
        assert_eq!(exec.backoff(3), Duration::ZERO);
    }
}
