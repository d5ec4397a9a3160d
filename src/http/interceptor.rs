use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::LLMError;

use super::{DynHttpTransport, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport, RouteTag};

/// 请求前后的钩子
#[async_trait]
pub trait HttpInterceptor: Send + Sync {
    /// 发送前调用，可修改请求头；返回错误则中止请求
    async fn before_request(&self, _request: &mut HttpRequest) -> Result<(), LLMError> {
        Ok(())
    }

    /// 收到响应头后调用
    async fn after_response(
        &self,
        _route: Option<&RouteTag>,
        _status: u16,
        _headers: &HashMap<String, String>,
    ) {
    }
}

/// 为每个请求补充固定请求头；请求中已有的同名头不会被覆盖
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders {
    headers: HashMap<String, String>,
}

impl StaticHeaders {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl HttpInterceptor for StaticHeaders {
    async fn before_request(&self, request: &mut HttpRequest) -> Result<(), LLMError> {
        for (name, value) in &self.headers {
            let present = request
                .headers
                .keys()
                .any(|key| key.eq_ignore_ascii_case(name));
            if !present {
                request.headers.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

/// 按注册顺序执行拦截器的 Transport 装饰器
pub struct InterceptedTransport {
    inner: DynHttpTransport,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
}

impl InterceptedTransport {
    pub fn new(inner: DynHttpTransport, interceptors: Vec<Arc<dyn HttpInterceptor>>) -> Self {
        Self {
            inner,
            interceptors,
        }
    }

    async fn prepare(&self, mut request: HttpRequest) -> Result<HttpRequest, LLMError> {
        for interceptor in &self.interceptors {
            interceptor.before_request(&mut request).await?;
        }
        Ok(request)
    }

    async fn observe(&self, route: Option<&RouteTag>, status: u16, headers: &HashMap<String, String>) {
        for interceptor in &self.interceptors {
            interceptor.after_response(route, status, headers).await;
        }
    }
}

#[async_trait]
impl HttpTransport for InterceptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        let request = self.prepare(request).await?;
        let route = request.route.clone();
        let response = self.inner.send(request).await?;
        self.observe(route.as_ref(), response.status, &response.headers)
            .await;
        Ok(response)
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let request = self.prepare(request).await?;
        let route = request.route.clone();
        let response = self.inner.send_stream(request).await?;
        self.observe(route.as_ref(), response.status, &response.headers)
            .await;
        Ok(response)
    }
}
