mod error;
mod request;
mod response;
mod stream;
mod types;

use std::collections::HashMap;

use crate::config::{Credential, ProviderConfig};
use crate::error::LLMError;
use crate::http::{HttpRequest, HttpResponse, HttpStreamResponse};
use crate::provider::{
    ProviderPlugin, ProviderSession, RawProviderError, RequestTarget, TerminationSubject,
    decode_json, delta_termination, require_secret, resolve_base_url,
};
use crate::stream::{DeltaStream, decode_stream};
use crate::types::{CapabilityDescriptor, ChatRequest, ChatResponse, UnifiedTerminationSignal};

use error::normalize_anthropic_error;
use request::build_anthropic_body;
use response::{map_response, termination_for};
use stream::AnthropicDecoder;
use types::AnthropicMessageResponse;

const PROVIDER_ID: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";

/// Anthropic Messages 插件（兼容 Claude 3.x Messages API）
#[derive(Debug, Default)]
pub struct AnthropicPlugin;

impl AnthropicPlugin {
    pub fn new() -> Self {
        Self
    }

    fn build_headers(config: &ProviderConfig) -> Result<HashMap<String, String>, LLMError> {
        let secret = require_secret(PROVIDER_ID, config)?;
        let mut headers = HashMap::new();
        match &config.credential {
            Credential::Bearer { .. } => {
                headers.insert("Authorization".to_string(), format!("Bearer {secret}"));
            }
            Credential::ApiKey { header, .. } => {
                let name = header.as_deref().unwrap_or("x-api-key");
                headers.insert(name.to_string(), secret);
            }
            Credential::None => {}
        }
        headers.insert(
            "anthropic-version".to_string(),
            config
                .extra_str("version")
                .unwrap_or(DEFAULT_VERSION)
                .to_string(),
        );
        // 逗号分隔的 beta 列表
        if let Some(beta) = config.extra_str("beta") {
            headers.insert("anthropic-beta".to_string(), beta.to_string());
        }
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.extend(config.headers.clone());
        Ok(headers)
    }
}

impl ProviderPlugin for AnthropicPlugin {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn version(&self) -> &'static str {
        DEFAULT_VERSION
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_stream: true,
            supports_image_input: true,
            supports_document_input: true,
            supports_tools: true,
            supports_structured_output: false,
            supports_parallel_tool_calls: true,
        }
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<ProviderSession, LLMError> {
        Ok(ProviderSession {
            provider: PROVIDER_ID,
            base_url: resolve_base_url(PROVIDER_ID, config, DEFAULT_BASE_URL)?,
            headers: Self::build_headers(config)?,
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
        let body = build_anthropic_body(request, target)?;
        let mut http = HttpRequest::json(session.endpoint("/v1", "/messages"), &body)?
            .with_headers(session.headers.clone())
            .with_timeout(session.timeout);
        if target.stream {
            http.headers
                .insert("Accept".to_string(), "text/event-stream".to_string());
        }
        Ok(http)
    }

    fn parse_response(&self, response: HttpResponse) -> Result<ChatResponse, LLMError> {
        let parsed: AnthropicMessageResponse = decode_json(PROVIDER_ID, &response)?;
        map_response(parsed, PROVIDER_ID)
    }

    fn parse_stream(&self, response: HttpStreamResponse) -> DeltaStream {
        decode_stream(response.body, PROVIDER_ID, AnthropicDecoder::new(PROVIDER_ID))
    }

    fn normalize_error(&self, error: RawProviderError) -> LLMError {
        normalize_anthropic_error(PROVIDER_ID, error)
    }

    fn detect_termination(&self, subject: TerminationSubject<'_>) -> UnifiedTerminationSignal {
        match subject {
            TerminationSubject::Response(response) => {
                termination_for(response.raw_finish_reason.as_deref())
            }
            TerminationSubject::Delta(delta) => delta_termination(delta, "stop_reason"),
        }
    }
}
