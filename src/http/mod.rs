//! Minimal HTTP abstraction shared by every provider plugin.
//!
//! Plugins only produce [`HttpRequest`] values and consume [`HttpResponse`] /
//! [`HttpStreamResponse`] values; the concrete client lives behind [`HttpTransport`] so
//! tests can swap in an in-memory transport and the client can stack decorators such as
//! retry and rate limiting.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::LLMError;

pub mod interceptor;
pub mod rate_limit;
pub mod reqwest;
pub mod retry;

pub use interceptor::{HttpInterceptor, InterceptedTransport, StaticHeaders};
pub use rate_limit::{MAX_REQUEST_INTERVAL, RateLimitScope, RateLimitedTransport, request_interval};
pub use retry::{RetryPolicy, RetryingTransport};

/// Enumerates HTTP methods understood by the lightweight transport abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

/// Provider and model a request is addressed to.
///
/// Decorators use it to key rate limits and to label logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteTag {
    pub provider: String,
    pub model: String,
}

/// Minimal HTTP request representation shared across providers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    /// Aborts the in-flight request, including body streaming, when fired.
    pub cancellation: Option<CancellationToken>,
    pub route: Option<RouteTag>,
}

impl HttpRequest {
    /// Builds a POST request with a JSON request body.
    ///
    /// The helper sets the `Content-Type` header to `application/json` and stores the
    /// provided buffer as the body.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Some(body),
            timeout: None,
            cancellation: None,
            route: None,
        }
    }

    /// Serializes `body` to JSON and builds a POST request.
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Validation`] if serialization fails.
    pub fn json<T: Serialize>(url: impl Into<String>, body: &T) -> Result<Self, LLMError> {
        let payload = serde_json::to_vec(body)
            .map_err(|err| LLMError::validation(format!("failed to serialize request: {err}")))?;
        Ok(Self::post_json(url, payload))
    }

    /// Merges extra headers into the request, replacing existing values.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::HashMap;
    /// use kotoba::http::HttpRequest;
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec())
    ///     .with_headers(HashMap::from([("Authorization".into(), "Bearer test".into())]));
    /// assert_eq!(request.headers.get("Authorization"), Some(&"Bearer test".to_string()));
    /// assert!(request.headers.contains_key("Content-Type"));
    /// ```
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_route(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.route = Some(RouteTag {
            provider: provider.into(),
            model: model.into(),
        });
        self
    }

    /// Returns true once the attached cancellation token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// Parses the body as JSON, for tests and interceptors that inspect payloads.
    pub fn json_body(&self) -> Option<serde_json::Value> {
        self.body
            .as_deref()
            .and_then(|bytes| serde_json::from_slice(bytes).ok())
    }
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Converts the body into a UTF-8 string.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba::http::HttpResponse;
    ///
    /// let response = HttpResponse { status: 200, headers: Default::default(), body: b"ok".to_vec() };
    /// assert_eq!(response.into_string().unwrap(), "ok");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`LLMError::Transport`] when the body cannot be interpreted as UTF-8.
    pub fn into_string(self) -> Result<String, LLMError> {
        String::from_utf8(self.body).map_err(|err| LLMError::transport(err.to_string()))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// HTTP response that carries a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

impl HttpStreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Drains the body into memory. Used to read error payloads of failed streaming calls.
    pub async fn into_response(self) -> Result<HttpResponse, LLMError> {
        use futures_util::StreamExt;

        let mut body = Vec::new();
        let mut stream = self.body;
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(HttpResponse {
            status: self.status,
            headers: self.headers,
            body,
        })
    }
}

impl std::fmt::Debug for HttpStreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LLMError>> + Send>>;

pub(crate) fn find_header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Transport abstraction used to decouple providers from the concrete HTTP client.
///
/// Implementations map connection failures to [`LLMError::Transport`], client-side
/// timeouts to [`LLMError::Timeout`] and aborts through [`HttpRequest::cancellation`] to
/// [`LLMError::Cancelled`]. Non-2xx statuses are returned as responses, not errors.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    ///
    /// # Examples
    ///
    /// ```
    /// # use async_trait::async_trait;
    /// # use kotoba::http::{HttpTransport, HttpRequest, HttpResponse, HttpStreamResponse};
    /// # use kotoba::error::LLMError;
    /// # use futures_util::stream;
    /// struct MemoryTransport;
    ///
    /// #[async_trait]
    /// impl HttpTransport for MemoryTransport {
    ///     async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
    ///         Ok(HttpResponse { status: 200, headers: request.headers, body: b"ok".to_vec() })
    ///     }
    ///     async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
    ///         Ok(HttpStreamResponse { status: 200, headers: request.headers, body: Box::pin(stream::empty()) })
    ///     }
    /// }
    ///
    /// # tokio::runtime::Runtime::new().unwrap().block_on(async {
    /// let response = MemoryTransport
    ///     .send(HttpRequest::post_json("https://example.com", br"{}".to_vec()))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(response.status, 200);
    /// # });
    /// ```
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError>;

    /// Sends a request and returns a streaming body.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde::ser;

    /// Body type that intentionally fails serialization.
    struct NonSerializableBody;

    impl Serialize for NonSerializableBody {
        fn serialize<S>(&self, _serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            Err(ser::Error::custom("intentional serialization failure for test"))
        }
    }

    #[test]
    fn json_request_returns_validation_on_serde_error() {
        match HttpRequest::json("http://example.com", &NonSerializableBody) {
            Err(LLMError::Validation { message }) => {
                assert!(
                    message.contains("failed to serialize request"),
                    "unexpected validation message: {message}"
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn request_builders_stamp_route_and_cancellation() {
        let token = CancellationToken::new();
        let request = HttpRequest::json("http://example.com", &serde_json::json!({"a": 1}))
            .expect("serialize")
            .with_route("openai", "gpt-4o")
            .with_cancellation(token.clone());
        assert_eq!(request.json_body(), Some(serde_json::json!({"a": 1})));
        assert_eq!(request.route.as_ref().map(|r| r.provider.as_str()), Some("openai"));
        assert!(!request.is_cancelled());
        token.cancel();
        assert!(request.is_cancelled());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse {
            status: 429,
            headers: HashMap::from([("Retry-After".to_string(), "3".to_string())]),
            body: Vec::new(),
        };
        assert_eq!(response.header("retry-after"), Some("3"));
        assert!(!response.is_success());
    }
}
