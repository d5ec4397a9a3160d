use std::collections::HashMap;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;

use crate::error::{CancelReason, CancellationPhase, LLMError};

use super::{
    DynHttpTransport, HttpBodyStream, HttpMethod, HttpRequest, HttpResponse, HttpStreamResponse,
    HttpTransport,
};

/// 基于 reqwest 的默认 HttpTransport
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// 使用自定义 reqwest::Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 创建默认配置
    pub fn default_client() -> Result<Self, LLMError> {
        Client::builder()
            .build()
            .map(Self::new)
            .map_err(|err| LLMError::transport(format!("failed to create reqwest client: {err}")))
    }

    fn method(method: HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }

    fn build_request(&self, request: &mut HttpRequest) -> Result<reqwest::RequestBuilder, LLMError> {
        let method = Self::method(request.method);
        let mut builder = self.client.request(method, &request.url);

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        for (name, value) in request.headers.drain() {
            let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| LLMError::transport(format!("invalid header name: {err}")))?;
            let header_value = reqwest::header::HeaderValue::from_str(&value).map_err(|err| {
                LLMError::transport(format!("invalid header value for {header_name}: {err}"))
            })?;
            builder = builder.header(header_name, header_value);
        }

        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        Ok(builder)
    }

    fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    /// reqwest 错误 -> 统一错误；超时单独归类
    fn map_error(err: reqwest::Error) -> LLMError {
        if err.is_timeout() {
            LLMError::Timeout {
                message: err.to_string(),
            }
        } else {
            LLMError::transport(err.to_string())
        }
    }

    async fn execute(
        &self,
        mut request: HttpRequest,
    ) -> Result<(reqwest::Response, Option<CancellationToken>), LLMError> {
        let token = request.cancellation.take();
        let builder = self.build_request(&mut request)?;
        let response = match &token {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return Err(aborted(CancellationPhase::Execution));
                    }
                    result = builder.send() => result.map_err(Self::map_error)?,
                }
            }
            None => builder.send().await.map_err(Self::map_error)?,
        };
        Ok((response, token))
    }
}

/// 传输层中止；真实原因由调用方的 CallScope 重新归类
fn aborted(phase: CancellationPhase) -> LLMError {
    LLMError::cancelled(phase, CancelReason::Caller)
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let (response, token) = self.execute(request).await?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let body = match token {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(aborted(CancellationPhase::Execution)),
                    bytes = response.bytes() => bytes.map_err(Self::map_error)?,
                }
            }
            None => response.bytes().await.map_err(Self::map_error)?,
        }
        .to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let (response, token) = self.execute(request).await?;

        let status = response.status().as_u16();
        let headers = Self::headers_to_map(response.headers());
        let mut chunks = response.bytes_stream();
        let token = token.unwrap_or_default();
        // 取消后停止读取并丢弃连接
        let body: HttpBodyStream = Box::pin(stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        yield Err(aborted(CancellationPhase::Streaming));
                        break;
                    }
                    next = chunks.next() => next,
                };
                match next {
                    Some(Ok(bytes)) => yield Ok(bytes.to_vec()),
                    Some(Err(err)) => {
                        yield Err(Self::map_error(err));
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// 便捷构造线程安全 Transport
pub fn default_dyn_transport() -> Result<DynHttpTransport, LLMError> {
    Ok(Arc::new(ReqwestTransport::default_client()?))
}
