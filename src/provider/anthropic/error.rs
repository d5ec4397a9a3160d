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
    #[serde(rename = "type")]
    kind: Option<String>,
    message: Option<String>,
}

impl InnerError {
    fn describe(&self) -> String {
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        match &self.kind {
            Some(kind) => format!("{message} ({kind})"),
            None => message,
        }
    }
}

/// Anthropic 错误 -> 统一错误
///
/// `error.type` 比状态码更精确，优先使用；无法识别时回落到状态码分类。
pub(crate) fn normalize_anthropic_error(provider: &'static str, error: RawProviderError) -> LLMError {
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
            match inner.kind.as_deref() {
                Some("authentication_error") | Some("permission_error") => LLMError::Auth { message },
                Some("rate_limit_error") => LLMError::RateLimit {
                    message,
                    retry_after,
                },
                Some("invalid_request_error") | Some("not_found_error") | Some("request_too_large") => {
                    LLMError::Validation { message }
                }
                Some("timeout_error") => LLMError::Timeout { message },
                Some("overloaded_error") | Some("api_error") => LLMError::Provider {
                    provider,
                    message,
                    status: Some(status),
                },
                _ => classify_status(provider, status, message, retry_after),
            }
        }
        RawProviderError::StreamEvent(value) => normalize_stream_error(provider, value),
        RawProviderError::Transport(err) => err,
    }
}

fn normalize_stream_error(provider: &'static str, value: Value) -> LLMError {
    let Ok(inner) = serde_json::from_value::<InnerError>(value.clone()) else {
        return LLMError::provider(provider, format!("stream error: {value}"));
    };
    let message = inner.describe();
    match inner.kind.as_deref() {
        Some("authentication_error") | Some("permission_error") => LLMError::Auth { message },
        Some("rate_limit_error") => LLMError::RateLimit {
            message,
            retry_after: None,
        },
        Some("invalid_request_error") => LLMError::Validation { message },
        Some("timeout_error") => LLMError::Timeout { message },
        _ => LLMError::provider(provider, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn http(status: u16, body: &str, headers: &[(&str, &str)]) -> RawProviderError {
        RawProviderError::Http {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            body: body.to_string(),
        }
    }

    #[test]
    fn parse_auth_and_rate_limit_errors() {
        let body = r#"{
  "type": "error",
  "error": {
    "type": "authentication_error",
    "message": "invalid x-api-key"
  }
}"#;
        match normalize_anthropic_error("anthropic", http(401, body, &[])) {
            LLMError::Auth { message } => {
                assert!(message.contains("invalid x-api-key"));
                assert!(message.contains("authentication_error"));
            }
            other => panic!("expected Auth error, got {other:?}"),
        }

        let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"Too many requests"}}"#;
        match normalize_anthropic_error("anthropic", http(429, body, &[("retry-after", "2")])) {
            LLMError::RateLimit {
                message,
                retry_after,
            } => {
                assert!(message.contains("Too many requests"));
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected RateLimit error, got {other:?}"),
        }
    }

    #[test]
    fn overloaded_and_fallback_are_provider_errors() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        match normalize_anthropic_error("anthropic", http(529, body, &[])) {
            LLMError::Provider {
                provider, status, ..
            } => {
                assert_eq!(provider, "anthropic");
                assert_eq!(status, Some(529));
            }
            other => panic!("expected Provider error, got {other:?}"),
        }

        match normalize_anthropic_error("anthropic", http(500, "not a json", &[])) {
            LLMError::Provider { message, .. } => {
                assert!(message.contains("status 500: not a json"));
            }
            other => panic!("expected Provider fallback error, got {other:?}"),
        }

        let err = normalize_anthropic_error(
            "anthropic",
            http(
                400,
                r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#,
                &[],
            ),
        );
        assert!(matches!(err, LLMError::Validation { .. }));
    }

    #[test]
    fn stream_error_events() {
        let err = normalize_anthropic_error(
            "anthropic",
            RawProviderError::StreamEvent(
                serde_json::json!({"type": "overloaded_error", "message": "Overloaded"}),
            ),
        );
        match err {
            LLMError::Provider { message, status, .. } => {
                assert!(message.contains("Overloaded"));
                assert_eq!(status, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
