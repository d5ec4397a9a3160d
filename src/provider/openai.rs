mod error;
mod request;
mod response;
mod stream;
mod types;

use std::collections::HashMap;

use crate::config::ProviderConfig;
use crate::error::LLMError;
use crate::http::{HttpRequest, HttpResponse, HttpStreamResponse};
use crate::provider::{
    ProviderPlugin, ProviderSession, RawProviderError, RequestTarget, TerminationSubject,
    decode_json, delta_termination, require_secret, resolve_base_url,
};
use crate::stream::{DeltaStream, decode_stream};
use crate::types::{CapabilityDescriptor, ChatRequest, ChatResponse, UnifiedTerminationSignal};

pub(crate) use error::normalize_openai_error;
use request::build_openai_body;
use response::{map_response, termination_for};
use stream::OpenAiDecoder;
use types::OpenAiChatResponse;

/// OpenAI 兼容协议的差异点
#[derive(Debug)]
pub(crate) struct Dialect {
    pub(crate) provider: &'static str,
    pub(crate) version: &'static str,
    pub(crate) default_base_url: &'static str,
    /// 是否接受文档输入
    pub(crate) documents: bool,
    pub(crate) max_tokens_field: &'static str,
}

pub(crate) const OPENAI_DIALECT: Dialect = Dialect {
    provider: "openai",
    version: "v1",
    default_base_url: "https://api.openai.com",
    documents: true,
    max_tokens_field: "max_completion_tokens",
};

pub(crate) const XAI_DIALECT: Dialect = Dialect {
    provider: "xai",
    version: "v1",
    default_base_url: "https://api.x.ai",
    documents: false,
    max_tokens_field: "max_tokens",
};

/// OpenAI Chat Completions 插件
#[derive(Debug)]
pub struct OpenAiPlugin {
    dialect: &'static Dialect,
}

impl Default for OpenAiPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiPlugin {
    pub fn new() -> Self {
        Self {
            dialect: &OPENAI_DIALECT,
        }
    }

    pub(crate) fn with_dialect(dialect: &'static Dialect) -> Self {
        Self { dialect }
    }

    fn build_headers(&self, config: &ProviderConfig) -> Result<HashMap<String, String>, LLMError> {
        let secret = require_secret(self.dialect.provider, config)?;
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {secret}"));
        headers.insert("Accept".to_string(), "application/json".to_string());
        if let Some(org) = config.extra_str("organization") {
            headers.insert("OpenAI-Organization".to_string(), org.to_string());
        }
        if let Some(project) = config.extra_str("project") {
            headers.insert("OpenAI-Project".to_string(), project.to_string());
        }
        headers.extend(config.headers.clone());
        Ok(headers)
    }
}

impl ProviderPlugin for OpenAiPlugin {
    fn id(&self) -> &'static str {
        self.dialect.provider
    }

    fn version(&self) -> &'static str {
        self.dialect.version
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_stream: true,
            supports_image_input: true,
            supports_document_input: self.dialect.documents,
            supports_tools: true,
            supports_structured_output: true,
            supports_parallel_tool_calls: true,
        }
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<ProviderSession, LLMError> {
        Ok(ProviderSession {
            provider: self.dialect.provider,
            base_url: resolve_base_url(self.dialect.provider, config, self.dialect.default_base_url)?,
            headers: self.build_headers(config)?,
            timeout: config.timeout(),
            extra: config.extra.clone(),
        })
    }

    fn translate_request(
        &self,
        session: &ProviderSession,
        request: &ChatRequest,
        target: RequestTarget<'_>,
    ) -> Result<HttpRequest, LLMError> {
        let body = build_openai_body(request, target, self.dialect)?;
        let mut http = HttpRequest::json(session.endpoint("/v1", "/chat/completions"), &body)?
            .with_headers(session.headers.clone())
            .with_timeout(session.timeout);
        if target.stream {
            http.headers
                .insert("Accept".to_string(), "text/event-stream".to_string());
        }
        Ok(http)
    }

    fn parse_response(&self, response: HttpResponse) -> Result<ChatResponse, LLMError> {
        let parsed: OpenAiChatResponse = decode_json(self.dialect.provider, &response)?;
        map_response(parsed, self.dialect.provider)
    }

    fn parse_stream(&self, response: HttpStreamResponse) -> DeltaStream {
        decode_stream(
            response.body,
            self.dialect.provider,
            OpenAiDecoder::new(self.dialect.provider),
        )
    }

    fn normalize_error(&self, error: RawProviderError) -> LLMError {
        normalize_openai_error(self.dialect.provider, error)
    }

    fn detect_termination(&self, subject: TerminationSubject<'_>) -> UnifiedTerminationSignal {
        match subject {
            TerminationSubject::Response(response) => {
                termination_for(response.raw_finish_reason.as_deref())
            }
            TerminationSubject::Delta(delta) => delta_termination(delta, "finish_reason"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[test]
    fn initialize_builds_auth_headers() {
        let plugin = OpenAiPlugin::new();
        let config = ProviderConfig::api_key("sk-test")
            .with_extra("organization", serde_json::json!("org-1"))
            .with_timeout_ms(1500);
        let session = plugin.initialize(&config).expect("session");
        assert_eq!(
            session.headers.get("Authorization").map(String::as_str),
            Some("Bearer sk-test")
        );
        assert_eq!(
            session.headers.get("OpenAI-Organization").map(String::as_str),
            Some("org-1")
        );
        assert_eq!(session.timeout, Some(std::time::Duration::from_millis(1500)));

        let caps = plugin.capabilities();
        let request = ChatRequest::new("openai:gpt-4o", vec![Message::user("hi")]);
        let http = plugin
            .translate_request(
                &session,
                &request,
                RequestTarget {
                    model: "gpt-4o",
                    stream: true,
                    capabilities: &caps,
                },
            )
            .expect("translate");
        assert_eq!(http.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(http.headers.get("Accept").map(String::as_str), Some("text/event-stream"));
        let body = http.json_body().expect("json body");
        assert_eq!(body["model"], serde_json::json!("gpt-4o"));
    }

    #[test]
    fn initialize_requires_credential() {
        let plugin = OpenAiPlugin::new();
        let config = ProviderConfig::new(crate::config::Credential::None);
        assert!(matches!(plugin.initialize(&config), Err(LLMError::Auth { .. })));
    }
}
