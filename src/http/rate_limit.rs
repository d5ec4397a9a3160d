use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CancelReason, CancellationPhase, LLMError};

use super::{DynHttpTransport, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};

/// 限流粒度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// 每个 provider 共享一个配额
    #[default]
    Provider,
    /// 每个 provider:model 组合独立配额
    ProviderModel,
}

/// 两次请求之间的最长间隔
pub const MAX_REQUEST_INTERVAL: Duration = Duration::from_secs(86_400 * 365);

/// 速率对应的请求间隔；非正速率不限流，过小的速率截断到 [`MAX_REQUEST_INTERVAL`]
pub fn request_interval(max_requests_per_second: f64) -> Duration {
    if max_requests_per_second > 0.0 {
        Duration::try_from_secs_f64(max_requests_per_second.recip())
            .map_or(MAX_REQUEST_INTERVAL, |interval| interval.min(MAX_REQUEST_INTERVAL))
    } else {
        Duration::ZERO
    }
}

/// 按作用域把请求间隔拉开到 `1 / max_requests_per_second`
pub struct RateLimitedTransport {
    inner: DynHttpTransport,
    interval: Duration,
    scope: RateLimitScope,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RateLimitedTransport {
    pub fn new(inner: DynHttpTransport, max_requests_per_second: f64, scope: RateLimitScope) -> Self {
        Self {
            inner,
            interval: request_interval(max_requests_per_second),
            scope,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    fn key(&self, request: &HttpRequest) -> String {
        match (&request.route, self.scope) {
            (Some(route), RateLimitScope::Provider) => route.provider.clone(),
            (Some(route), RateLimitScope::ProviderModel) => {
                format!("{}:{}", route.provider, route.model)
            }
            (None, _) => String::new(),
        }
    }

    /// 预约下一个可用时间片，返回需要等待的时长
    async fn reserve(&self, key: String) -> Duration {
        let now = Instant::now();
        let mut slots = self.next_slot.lock().await;
        let slot = slots.entry(key).or_insert(now);
        let start = (*slot).max(now);
        *slot = start.checked_add(self.interval).unwrap_or(start);
        start - now
    }

    async fn acquire(&self, request: &HttpRequest) -> Result<(), LLMError> {
        let key = self.key(request);
        let wait = self.reserve(key.clone()).await;
        if wait.is_zero() {
            return Ok(());
        }
        debug!(scope = %key, wait_ms = wait.as_millis() as u64, "rate limiter delaying request");
        match &request.cancellation {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(LLMError::cancelled(
                        CancellationPhase::Execution,
                        CancelReason::Caller,
                    )),
                    _ = tokio::time::sleep(wait) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(wait).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl HttpTransport for RateLimitedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        self.acquire(&request).await?;
        self.inner.send(request).await
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        self.acquire(&request).await?;
        self.inner.send_stream(request).await
    }
}
