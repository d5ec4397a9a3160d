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

use error::normalize_gemini_error;
use request::build_gemini_body;
use response::{map_response, termination_for};
use stream::GeminiDecoder;
use types::GeminiGenerateContentResponse;

const PROVIDER_ID: &str = "gemini";
const API_VERSION: &str = "v1beta";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Google Gemini generateContent 插件
#[derive(Debug, Default)]
pub struct GeminiPlugin;

impl GeminiPlugin {
    pub fn new() -> Self {
        Self
    }

    fn build_headers(config: &ProviderConfig) -> Result<HashMap<String, String>, LLMError> {
        let secret = require_secret(PROVIDER_ID, config)?;
        let mut headers = HashMap::new();
        match &config.credential {
            // Vertex / OAuth 场景
            Credential::Bearer { .. } => {
                headers.insert("Authorization".to_string(), format!("Bearer {secret}"));
            }
            Credential::ApiKey { header, .. } => {
                let name = header.as_deref().unwrap_or("x-goog-api-key");
                headers.insert(name.to_string(), secret);
            }
            Credential::None => {}
        }
        headers.insert("Accept".to_string(), "application/json".to_string());
        headers.extend(config.headers.clone());
        Ok(headers)
    }
}

impl ProviderPlugin for GeminiPlugin {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn version(&self) -> &'static str {
        API_VERSION
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            supports_stream: true,
            supports_image_input: true,
            supports_document_input: true,
            supports_tools: true,
            supports_structured_output: true,
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
        let body = build_gemini_body(request, target)?;
        let path = if target.stream {
            format!("/models/{}:streamGenerateContent?alt=sse", target.model)
        } else {
            format!("/models/{}:generateContent", target.model)
        };
        let mut http = HttpRequest::json(session.endpoint("/v1beta", &path), &body)?
            .with_headers(session.headers.clone())
            .with_timeout(session.timeout);
        if target.stream {
            http.headers
                .insert("Accept".to_string(), "text/event-stream".to_string());
        }
        Ok(http)
    }

    fn parse_response(&self, response: HttpResponse) -> Result<ChatResponse, LLMError> {
        let parsed: GeminiGenerateContentResponse = decode_json(PROVIDER_ID, &response)?;
        map_response(parsed, PROVIDER_ID)
    }

    fn parse_stream(&self, response: HttpStreamResponse) -> DeltaStream {
        decode_stream(response.body, PROVIDER_ID, GeminiDecoder::new(PROVIDER_ID))
    }

    fn normalize_error(&self, error: RawProviderError) -> LLMError {
        normalize_gemini_error(PROVIDER_ID, error)
    }

    fn detect_termination(&self, subject: TerminationSubject<'_>) -> UnifiedTerminationSignal {
        match subject {
            TerminationSubject::Response(response) => {
                termination_for(response.raw_finish_reason.as_deref())
            }
            TerminationSubject::Delta(delta) => delta_termination(delta, "finishReason"),
        }
    }
}
