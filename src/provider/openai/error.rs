use serde::Deserialize;
use serde_json::Value;

use crate::error::{LLMError, classify_status};
use crate::provider::{RawProviderError, retry_hint};

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<InnerError>,
}

#[derive(Deserialize)]
struct InnerError {
    message: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    code: Option<Value>,
}

impl InnerError {
    fn describe(&self) -> String {
        let mut message = self
            .message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        if let Some(code) = &self.code {
            message = format!("{message} ({code})");
        }
        message
    }

    fn code_str(&self) -> Option<&str> {
        self.code.as_ref().and_then(Value::as_str)
    }
}

/// OpenAI 兼容错误 -> 统一错误
pub(crate) fn normalize_openai_error(provider: &'static str, error: RawProviderError) -> LLMError {
    let retry_after = retry_hint(&error);
    match error {
        RawProviderError::Http { status, body, .. } => {
            let Some(inner) = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.error)
            else {
                return classify_status(provider, status, format!("status {status}: {body}"), retry_after);
            };
            let message = inner.describe();
            match (inner.kind.as_deref(), inner.code_str()) {
                (_, Some("rate_limit_exceeded")) | (_, Some("insufficient_quota")) => {
                    LLMError::RateLimit {
                        message,
                        retry_after,
                    }
                }
                (_, Some("invalid_api_key")) => LLMError::Auth { message },
                _ => classify_status(provider, status, message, retry_after),
            }
        }
        RawProviderError::StreamEvent(value) => {
            let inner: Option<InnerError> = serde_json::from_value(value.clone()).ok();
            let Some(inner) = inner else {
                return LLMError::provider(provider, format!("stream error: {value}"));
            };
            let message = inner.describe();
            match inner.kind.as_deref() {
                Some("invalid_request_error") => LLMError::Validation { message },
                Some("authentication_error") => LLMError::Auth { message },
                Some("rate_limit_error") | Some("rate_limit_exceeded") => LLMError::RateLimit {
                    message,
                    retry_after: None,
                },
                _ => LLMError::provider(provider, message),
            }
        }
        RawProviderError::Transport(err) => err,
    }
}
