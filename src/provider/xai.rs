use crate::config::ProviderConfig;
use crate::error::LLMError;
use crate::http::{HttpRequest, HttpResponse, HttpStreamResponse};
use crate::provider::openai::{OpenAiPlugin, XAI_DIALECT};
use crate::provider::{
    ProviderPlugin, ProviderSession, RawProviderError, RequestTarget, TerminationSubject,
};
use crate::stream::DeltaStream;
use crate::types::{CapabilityDescriptor, ChatRequest, ChatResponse, UnifiedTerminationSignal};

/// xAI Grok 插件，复用 OpenAI 兼容协议，不接受文档输入
#[derive(Debug)]
pub struct XaiPlugin {
    inner: OpenAiPlugin,
}

impl Default for XaiPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl XaiPlugin {
    pub fn new() -> Self {
        Self {
            inner: OpenAiPlugin::with_dialect(&XAI_DIALECT),
        }
    }
}

impl ProviderPlugin for XaiPlugin {
    fn id(&self) -> &'static str {
        self.inner.id()
    }

    fn version(&self) -> &'static str {
        self.inner.version()
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_structured_output: false,
            ..self.inner.capabilities()
        }
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<ProviderSession, LLMError> {
        self.inner.initialize(config)
    }

    fn translate_request(
        &self,
        session: &ProviderSession,
        request: &ChatRequest,
        target: RequestTarget<'_>,
    ) -> Result<HttpRequest, LLMError> {
        self.inner.translate_request(session, request, target)
    }

    fn parse_response(&self, response: HttpResponse) -> Result<ChatResponse, LLMError> {
        self.inner.parse_response(response)
    }

    fn parse_stream(&self, response: HttpStreamResponse) -> DeltaStream {
        self.inner.parse_stream(response)
    }

    fn normalize_error(&self, error: RawProviderError) -> LLMError {
        self.inner.normalize_error(error)
    }

    fn detect_termination(&self, subject: TerminationSubject<'_>) -> UnifiedTerminationSignal {
        self.inner.detect_termination(subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentPart, DocumentContent, MediaSource, Message, Role};

    #[test]
    fn uses_xai_endpoint_and_rejects_documents() {
        let plugin = XaiPlugin::new();
        assert_eq!(plugin.id(), "xai");
        let caps = plugin.capabilities();
        assert!(!caps.supports_document_input);

        let session = plugin
            .initialize(&ProviderConfig::api_key("xai-key"))
            .expect("session");
        let target = RequestTarget {
            model: "grok-2",
            stream: false,
            capabilities: &caps,
        };
        let request = ChatRequest::new("xai:grok-2", vec![Message::user("hi")]).with_max_tokens(10);
        let http = plugin
            .translate_request(&session, &request, target)
            .expect("translate");
        assert_eq!(http.url, "https://api.x.ai/v1/chat/completions");
        assert_eq!(http.json_body().expect("body")["max_tokens"], serde_json::json!(10));

        let document = Message::new(
            Role::User,
            vec![ContentPart::Document(DocumentContent {
                source: MediaSource::FileId {
                    file_id: "file-1".into(),
                },
                title: None,
            })],
        );
        let request = ChatRequest::new("xai:grok-2", vec![document]);
        assert!(matches!(
            plugin.translate_request(&session, &request, target),
            Err(LLMError::Validation { .. })
        ));
    }
}
