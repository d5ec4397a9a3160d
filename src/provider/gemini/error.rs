use std::time::Duration;

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
    status: Option<String>,
    #[serde(default)]
    details: Vec<Value>,
}

impl InnerError {
    fn describe(&self) -> String {
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        match self.status.as_deref().filter(|status| !status.is_empty()) {
            Some(status) => format!("{message} ({status})"),
            None => message,
        }
    }

    /// google.rpc.RetryInfo 中的 retryDelay，例如 `"30s"`
    fn retry_delay(&self) -> Option<Duration> {
        self.details.iter().find_map(|detail| {
            let kind = detail.get("@type").and_then(Value::as_str)?;
            if !kind.ends_with("google.rpc.RetryInfo") {
                return None;
            }
            parse_duration(detail.get("retryDelay")?.as_str()?)
        })
    }

    /// google.rpc.ErrorInfo 中的 reason，例如 `API_KEY_INVALID`
    fn reason(&self) -> Option<&str> {
        self.details
            .iter()
            .find_map(|detail| detail.get("reason").and_then(Value::as_str))
    }

    fn classify(
        &self,
        provider: &'static str,
        status: Option<u16>,
        retry_after: Option<Duration>,
    ) -> Option<LLMError> {
        let message = self.describe();
        if self.reason() == Some("API_KEY_INVALID") {
            return Some(LLMError::Auth { message });
        }
        let err = match self.status.as_deref()? {
            "UNAUTHENTICATED" | "PERMISSION_DENIED" => LLMError::Auth { message },
            "RESOURCE_EXHAUSTED" => LLMError::RateLimit {
                message,
                retry_after: retry_after.or_else(|| self.retry_delay()),
            },
            "INVALID_ARGUMENT" | "NOT_FOUND" | "FAILED_PRECONDITION" | "OUT_OF_RANGE" => {
                LLMError::Validation { message }
            }
            "DEADLINE_EXCEEDED" => LLMError::Timeout { message },
            "UNAVAILABLE" | "INTERNAL" | "UNKNOWN" => LLMError::Provider {
                provider,
                message,
                status,
            },
            _ => return None,
        };
        Some(err)
    }
}

fn parse_duration(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Gemini 错误 -> 统一错误
pub(crate) fn normalize_gemini_error(provider: &'static str, error: RawProviderError) -> LLMError {
    let retry_after = retry_hint(&error);
    match error {
        RawProviderError::Http { status, body, .. } => {
            let Some(inner) = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|parsed| parsed.error)
            else {
                return classify_status(provider, status, format!("status {status}: {body}"), retry_after);
            };
            let retry_after = retry_after.or_else(|| inner.retry_delay());
            inner
                .classify(provider, Some(status), retry_after)
                .unwrap_or_else(|| classify_status(provider, status, inner.describe(), retry_after))
        }
        RawProviderError::StreamEvent(value) => {
            match serde_json::from_value::<InnerError>(value.clone()) {
                Ok(inner) => inner
                    .classify(provider, None, None)
                    .unwrap_or_else(|| LLMError::provider(provider, inner.describe())),
                Err(_) => LLMError::provider(provider, format!("stream error: {value}")),
            }
        }
        RawProviderError::Transport(err) => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn http(status: u16, body: &str) -> RawProviderError {
        RawProviderError::Http {
            status,
            headers: HashMap::new(),
            body: body.to_string(),
        }
    }

    #[test]
    fn resource_exhausted_reads_retry_info() {
        let body = r#"{
  "error": {
    "code": 429,
    "message": "quota exhausted",
    "status": "RESOURCE_EXHAUSTED",
    "details": [
      {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "30s"}
    ]
  }
}"#;
        match normalize_gemini_error("gemini", http(429, body)) {
            LLMError::RateLimit {
                message,
                retry_after,
            } => {
                assert!(message.contains("RESOURCE_EXHAUSTED"));
                assert_eq!(retry_after, Some(Duration::from_secs(30)));
            }
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[test]
    fn invalid_key_and_deadline() {
        let body = r#"{"error": {"code": 400, "message": "API key not valid", "status": "INVALID_ARGUMENT",
            "details": [{"@type": "type.googleapis.com/google.rpc.ErrorInfo", "reason": "API_KEY_INVALID"}]}}"#;
        assert!(matches!(
            normalize_gemini_error("gemini", http(400, body)),
            LLMError::Auth { .. }
        ));

        let body = r#"{"error": {"code": 504, "message": "deadline", "status": "DEADLINE_EXCEEDED"}}"#;
        assert!(matches!(
            normalize_gemini_error("gemini", http(504, body)),
            LLMError::Timeout { .. }
        ));

        match normalize_gemini_error("gemini", http(503, "upstream connect error")) {
            LLMError::Provider { message, status, .. } => {
                assert_eq!(status, Some(503));
                assert!(message.contains("status 503: upstream connect error"));
            }
            other => panic!("expected Provider fallback, got {other:?}"),
        }
    }

    #[test]
    fn parses_fractional_delays() {
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("soon"), None);
    }
}
