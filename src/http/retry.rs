use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{CancelReason, CancellationPhase, LLMError};

use super::{DynHttpTransport, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport, find_header};

/// Extracts the `Retry-After` header (in seconds) if present.
///
/// Providers occasionally instruct clients to wait before re-sending requests. When the
/// header is numeric this helper parses it into a [`Duration`]. HTTP-date values are
/// ignored because vendors primarily use the numeric form.
pub(crate) fn retry_after_from_headers(headers: &HashMap<String, String>) -> Option<Duration> {
    find_header(headers, "retry-after")
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff settings for [`RetryingTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        Duration::from_millis(millis as u64).min(self.max_backoff)
    }

    fn retryable_status(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    fn retryable_error(err: &LLMError) -> bool {
        matches!(err, LLMError::Transport { .. } | LLMError::Timeout { .. })
    }
}

/// Re-sends requests that failed with connection errors, timeouts or retryable statuses.
///
/// Aborted requests are never retried, and the backoff sleep ends early when the
/// request's cancellation token fires.
pub struct RetryingTransport {
    inner: DynHttpTransport,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(inner: DynHttpTransport, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn wait(&self, request: &HttpRequest, delay: Duration) -> Result<(), LLMError> {
        match &request.cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(LLMError::cancelled(
                        CancellationPhase::Execution,
                        CancelReason::Caller,
                    )),
                    _ = tokio::time::sleep(delay) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }

    fn delay_for(&self, attempt: u32, headers: Option<&HashMap<String, String>>) -> Duration {
        headers
            .and_then(retry_after_from_headers)
            .unwrap_or_else(|| self.policy.backoff(attempt))
    }
}

#[async_trait]
impl HttpTransport for RetryingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let mut attempt = 1;
        loop {
            let result = self.inner.send(request.clone()).await;
            let exhausted = attempt >= self.policy.max_attempts || request.is_cancelled();
            let delay = match &result {
                Ok(response) if RetryPolicy::retryable_status(response.status) && !exhausted => {
                    warn!(
                        url = %request.url,
                        status = response.status,
                        attempt,
                        "retrying request after retryable status"
                    );
                    Some(self.delay_for(attempt, Some(&response.headers)))
                }
                Err(err) if RetryPolicy::retryable_error(err) && !exhausted => {
                    warn!(url = %request.url, error = %err, attempt, "retrying request after transport failure");
                    Some(self.delay_for(attempt, None))
                }
                _ => None,
            };
            let Some(delay) = delay else {
                return result;
            };
            self.wait(&request, delay).await?;
            attempt += 1;
        }
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let mut attempt = 1;
        loop {
            let result = self.inner.send_stream(request.clone()).await;
            let exhausted = attempt >= self.policy.max_attempts || request.is_cancelled();
            let delay = match &result {
                Ok(response) if RetryPolicy::retryable_status(response.status) && !exhausted => {
                    warn!(
                        url = %request.url,
                        status = response.status,
                        attempt,
                        "retrying stream request after retryable status"
                    );
                    Some(self.delay_for(attempt, Some(&response.headers)))
                }
                Err(err) if RetryPolicy::retryable_error(err) && !exhausted => {
                    warn!(url = %request.url, error = %err, attempt, "retrying stream request after transport failure");
                    Some(self.delay_for(attempt, None))
                }
                _ => None,
            };
            let Some(delay) = delay else {
                return result;
            };
            self.wait(&request, delay).await?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio_util::sync::CancellationToken;

    struct FlakyTransport {
        calls: AtomicUsize,
        statuses: Vec<u16>,
    }

    #[async_trait]
    impl HttpTransport for FlakyTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, LLMError> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            let status = self.statuses.get(index).copied().unwrap_or(200);
            Ok(HttpResponse {
                status,
                headers: HashMap::from([("retry-after".to_string(), "0".to_string())]),
                body: Vec::new(),
            })
        }

        async fn send_stream(&self, _request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(LLMError::cancelled(CancellationPhase::Streaming, CancelReason::Caller))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }

    #[test]
    fn parses_numeric_retry_after() {
        let headers = HashMap::from([("Retry-After".to_string(), " 7 ".to_string())]);
        assert_eq!(retry_after_from_headers(&headers), Some(Duration::from_secs(7)));
        let headers = HashMap::from([("Retry-After".to_string(), "Wed, 21 Oct".to_string())]);
        assert_eq!(retry_after_from_headers(&headers), None);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let inner = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            statuses: vec![503, 429, 200],
        });
        let transport = RetryingTransport::new(inner.clone(), policy());
        let response = transport
            .send(HttpRequest::post_json("http://example.com", Vec::new()))
            .await
            .expect("send");
        assert_eq!(response.status, 200);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let inner = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            statuses: vec![500, 500, 500, 500],
        });
        let transport = RetryingTransport::new(inner.clone(), policy());
        let response = transport
            .send(HttpRequest::post_json("http://example.com", Vec::new()))
            .await
            .expect("send");
        assert_eq!(response.status, 500);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_aborts_or_cancelled_requests() {
        let inner = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            statuses: vec![503, 503],
        });
        let transport = RetryingTransport::new(inner.clone(), policy());

        let err = transport
            .send_stream(HttpRequest::post_json("http://example.com", Vec::new()))
            .await
            .expect_err("aborted");
        assert!(matches!(err, LLMError::Cancelled { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let token = CancellationToken::new();
        token.cancel();
        let response = transport
            .send(HttpRequest::post_json("http://example.com", Vec::new()).with_cancellation(token))
            .await
            .expect("send");
        assert_eq!(response.status, 503);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
