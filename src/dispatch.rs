use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{CancelReason, CancellationPhase, LLMError};
use crate::http::{DynHttpTransport, HttpRequest};
use crate::provider::{
    DynProviderPlugin, ProviderSession, RawProviderError, RequestTarget, TerminationSubject,
};
use crate::stream::DeltaStream;
use crate::types::{CapabilityDescriptor, ChatRequest, ChatResponse, UnifiedTerminationSignal};

/// 已解析的一次供应商往返所需的全部信息
#[derive(Clone)]
pub(crate) struct Dispatcher {
    pub plugin: DynProviderPlugin,
    pub session: ProviderSession,
    pub transport: DynHttpTransport,
    /// `provider:model` 完整 id
    pub model_id: String,
    /// 发给供应商的模型名
    pub model: String,
    pub capabilities: CapabilityDescriptor,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("provider", &self.plugin.id())
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn provider(&self) -> &'static str {
        self.plugin.id()
    }

    fn prepare(
        &self,
        request: &ChatRequest,
        stream: bool,
        token: &CancellationToken,
    ) -> Result<HttpRequest, LLMError> {
        if token.is_cancelled() {
            return Err(LLMError::cancelled(
                CancellationPhase::Execution,
                CancelReason::Caller,
            ));
        }
        let target = RequestTarget {
            model: &self.model,
            stream,
            capabilities: &self.capabilities,
        };
        let http = self
            .plugin
            .translate_request(&self.session, request, target)?
            .with_route(self.provider(), &self.model)
            .with_cancellation(token.clone());
        Ok(http)
    }

    /// 非流式调用
    pub async fn invoke(
        &self,
        request: &ChatRequest,
        token: &CancellationToken,
    ) -> Result<ChatResponse, LLMError> {
        let operation = "chat";
        let http = self
            .prepare(request, false, token)
            .map_err(|err| self.report(operation, None, err))?;
        let response = self
            .transport
            .send(http)
            .await
            .map_err(|err| self.normalize(operation, RawProviderError::Transport(err)))?;
        if !response.is_success() {
            let raw = RawProviderError::Http {
                status: response.status,
                headers: response.headers,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            };
            return Err(self.normalize(operation, raw));
        }
        let parsed = self
            .plugin
            .parse_response(response)
            .map_err(|err| self.report(operation, None, err))?;
        debug!(
            provider = self.provider(),
            model = %self.model_id,
            finish_reason = ?parsed.finish_reason,
            "response parsed"
        );
        Ok(parsed)
    }

    /// 流式调用；非 2xx 时读取完整错误体后归一化
    pub async fn open_stream(
        &self,
        request: &ChatRequest,
        token: &CancellationToken,
    ) -> Result<DeltaStream, LLMError> {
        let operation = "stream";
        let http = self
            .prepare(request, true, token)
            .map_err(|err| self.report(operation, None, err))?;
        let response = self
            .transport
            .send_stream(http)
            .await
            .map_err(|err| self.normalize(operation, RawProviderError::Transport(err)))?;
        if !response.is_success() {
            let response = response
                .into_response()
                .await
                .map_err(|err| self.normalize(operation, RawProviderError::Transport(err)))?;
            let raw = RawProviderError::Http {
                status: response.status,
                headers: response.headers,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            };
            return Err(self.normalize(operation, raw));
        }
        Ok(self.plugin.parse_stream(response))
    }

    pub fn termination(&self, response: &ChatResponse) -> UnifiedTerminationSignal {
        self.plugin
            .detect_termination(TerminationSubject::Response(response))
    }

    fn normalize(&self, operation: &str, raw: RawProviderError) -> LLMError {
        let description = match &raw {
            RawProviderError::Http { status, body, .. } => format!("status {status}: {body}"),
            RawProviderError::Transport(err) => err.to_string(),
            RawProviderError::StreamEvent(value) => value.to_string(),
        };
        let normalized = self.plugin.normalize_error(raw);
        self.report(operation, Some(description), normalized)
    }

    fn report(&self, operation: &str, raw: Option<String>, err: LLMError) -> LLMError {
        if matches!(err, LLMError::Cancelled { .. }) {
            debug!(provider = self.provider(), model = %self.model_id, operation, "call cancelled");
        } else {
            error!(
                provider = self.provider(),
                model = %self.model_id,
                operation,
                raw = raw.as_deref().unwrap_or(""),
                kind = ?err.kind(),
                error = %err,
                "provider call failed"
            );
        }
        err
    }
}
