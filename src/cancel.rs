use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, CancellationPhase, LLMError};
use crate::stream::DeltaStream;
use crate::types::StreamDelta;

/// 单次调用的取消范围：计时器与调用方令牌任一触发即取消
///
/// 计时器在 drop 时释放，无论调用以何种方式结束。
#[derive(Debug)]
pub struct CallScope {
    token: CancellationToken,
    timeout: Option<Duration>,
    timed_out: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl CallScope {
    /// 必须在 tokio 运行时内调用
    pub fn new(caller: Option<&CancellationToken>, timeout: Option<Duration>) -> Self {
        let token = caller.map_or_else(CancellationToken::new, CancellationToken::child_token);
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = timeout.map(|after| {
            let token = token.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                timed_out.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });
        Self {
            token,
            timeout,
            timed_out,
            timer,
        }
    }

    /// 合并后的令牌，传给 transport 与工具
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 取消来源；计时器触发时为 Timeout
    pub fn reason(&self) -> CancelReason {
        match self.timeout {
            Some(after) if self.timed_out.load(Ordering::SeqCst) => CancelReason::Timeout(after),
            _ => CancelReason::Caller,
        }
    }

    /// 已取消时返回对应阶段的错误
    pub fn check(&self, phase: CancellationPhase) -> Result<(), LLMError> {
        if self.token.is_cancelled() {
            Err(LLMError::cancelled(phase, self.reason()))
        } else {
            Ok(())
        }
    }

    /// 将下层上报的取消错误改写为真实来源
    pub fn classify(&self, err: LLMError) -> LLMError {
        match err {
            LLMError::Cancelled { phase, partial, .. } => LLMError::Cancelled {
                phase,
                reason: self.reason(),
                partial,
            },
            other => other,
        }
    }

    /// 读取下一个增量，或在取消时返回 `Streaming` 阶段的错误
    ///
    /// 已缓冲的增量同样受取消约束。
    pub async fn next_delta(
        &self,
        stream: &mut DeltaStream,
    ) -> Option<Result<StreamDelta, LLMError>> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Some(Err(LLMError::cancelled(
                CancellationPhase::Streaming,
                self.reason(),
            ))),
            item = stream.next() => item.map(|item| item.map_err(|err| self.classify(err))),
        }
    }

    /// 把流绑定到本范围：取消后产出一次错误并结束，流释放时计时器一并释放
    pub fn guard_stream(self, inner: DeltaStream) -> DeltaStream {
        let scope = self;
        Box::pin(stream! {
            let mut inner = inner;
            while let Some(item) = scope.next_delta(&mut inner).await {
                let failed = item.is_err();
                yield item;
                if failed {
                    break;
                }
            }
        })
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timer_cancels_with_timeout_reason() {
        let scope = CallScope::new(None, Some(Duration::from_millis(20)));
        scope.token().cancelled().await;
        assert_eq!(scope.reason(), CancelReason::Timeout(Duration::from_millis(20)));
        match scope.check(CancellationPhase::Execution) {
            Err(err) => assert!(err.is_timeout()),
            Ok(()) => panic!("expected cancellation"),
        }
    }

    #[tokio::test]
    async fn caller_token_propagates() {
        let caller = CancellationToken::new();
        let scope = CallScope::new(Some(&caller), Some(Duration::from_secs(30)));
        assert!(scope.check(CancellationPhase::Execution).is_ok());
        caller.cancel();
        assert!(scope.is_cancelled());
        assert_eq!(scope.reason(), CancelReason::Caller);

        let err = scope.classify(LLMError::cancelled(
            CancellationPhase::Streaming,
            CancelReason::Caller,
        ));
        assert_eq!(err.cancellation_phase(), Some(CancellationPhase::Streaming));
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn timer_is_released_on_drop() {
        let caller = CancellationToken::new();
        let token = {
            let scope = CallScope::new(Some(&caller), Some(Duration::from_millis(20)));
            scope.token().clone()
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_cancelled());
        assert!(!caller.is_cancelled());
    }

    fn delta(sequence: u64) -> StreamDelta {
        StreamDelta {
            id: "r1".to_string(),
            sequence,
            delta: Default::default(),
            finished: false,
            usage: None,
            termination: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn buffered_deltas_stop_after_cancellation() {
        let caller = CancellationToken::new();
        let scope = CallScope::new(Some(&caller), None);
        let inner: DeltaStream = Box::pin(futures_util::stream::iter((0..4).map(|i| Ok(delta(i)))));
        let mut guarded = scope.guard_stream(inner);

        let first = guarded.next().await.expect("first item").expect("first delta");
        assert_eq!(first.sequence, 0);
        caller.cancel();
        match guarded.next().await {
            Some(Err(err)) => {
                assert_eq!(err.cancellation_phase(), Some(CancellationPhase::Streaming));
                assert!(!err.is_timeout());
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(guarded.next().await.is_none());
    }

    #[tokio::test]
    async fn next_delta_reports_timer_as_timeout() {
        let scope = CallScope::new(None, Some(Duration::from_millis(10)));
        let mut inner: DeltaStream = Box::pin(futures_util::stream::pending());
        match scope.next_delta(&mut inner).await {
            Some(Err(err)) => assert!(err.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_abort_is_reclassified() {
        let scope = CallScope::new(None, Some(Duration::from_millis(10)));
        scope.token().cancelled().await;
        let err = scope.classify(LLMError::cancelled(
            CancellationPhase::Execution,
            CancelReason::Caller,
        ));
        assert!(matches!(
            err,
            LLMError::Cancelled {
                reason: CancelReason::Timeout(_),
                ..
            }
        ));
    }
}
