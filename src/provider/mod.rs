use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::LLMError;
use crate::http::{HttpRequest, HttpResponse, HttpStreamResponse, retry::retry_after_from_headers};
use crate::stream::DeltaStream;
use crate::types::{
    CapabilityDescriptor, ChatRequest, ChatResponse, StreamDelta, UnifiedTerminationSignal,
};

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod xai;

pub use anthropic::AnthropicPlugin;
pub use gemini::GeminiPlugin;
pub use openai::OpenAiPlugin;
pub use xai::XaiPlugin;

/// 初始化后缓存的供应商会话
#[derive(Debug, Clone)]
pub struct ProviderSession {
    pub provider: &'static str,
    pub base_url: String,
    /// 已包含鉴权信息的请求头
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub extra: HashMap<String, Value>,
}

impl ProviderSession {
    /// 拼接 base_url 与路径，容忍 base_url 已带版本前缀
    pub fn endpoint(&self, version_prefix: &str, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if base.ends_with(version_prefix) {
            format!("{base}{path}")
        } else {
            format!("{base}{version_prefix}{path}")
        }
    }

    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

/// 单次翻译的目标信息
#[derive(Debug, Clone, Copy)]
pub struct RequestTarget<'a> {
    /// 去掉 provider 前缀后的模型名
    pub model: &'a str,
    pub stream: bool,
    pub capabilities: &'a CapabilityDescriptor,
}

/// 交给 normalize_error 的原始错误
#[derive(Debug)]
pub enum RawProviderError {
    /// 非 2xx 响应
    Http {
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },
    /// 传输层错误
    Transport(LLMError),
    /// 流中的错误事件
    StreamEvent(Value),
}

/// detect_termination 的输入
#[derive(Debug, Clone, Copy)]
pub enum TerminationSubject<'a> {
    Response(&'a ChatResponse),
    Delta(&'a StreamDelta),
}

/// 供应商插件契约 所有供应商实现该接口即可接入
///
/// 插件不持有可变状态，初始化结果由调用方缓存在 [`ProviderSession`] 中。
pub trait ProviderPlugin: Send + Sync {
    /// 插件 id，例如 `openai`
    fn id(&self) -> &'static str;

    /// 插件协议版本
    fn version(&self) -> &'static str;

    /// 描述支持的能力范围
    fn capabilities(&self) -> CapabilityDescriptor;

    /// 校验配置并生成会话
    fn initialize(&self, config: &ProviderConfig) -> Result<ProviderSession, LLMError>;

    /// 统一请求 -> 供应商 HTTP 请求；不支持的内容必须报错而不是丢弃
    fn translate_request(
        &self,
        session: &ProviderSession,
        request: &ChatRequest,
        target: RequestTarget<'_>,
    ) -> Result<HttpRequest, LLMError>;

    /// 解析完整的非流式响应
    fn parse_response(&self, response: HttpResponse) -> Result<ChatResponse, LLMError>;

    /// 将流式响应包装为惰性增量序列
    fn parse_stream(&self, response: HttpStreamResponse) -> DeltaStream;

    /// 供应商错误 -> 统一错误分类
    fn normalize_error(&self, error: RawProviderError) -> LLMError;

    /// 判断响应或增量是否已结束
    fn detect_termination(&self, subject: TerminationSubject<'_>) -> UnifiedTerminationSignal;

    fn is_terminal(&self, subject: TerminationSubject<'_>) -> bool {
        self.detect_termination(subject).should_terminate
    }
}

/// 线程安全插件句柄
pub type DynProviderPlugin = Arc<dyn ProviderPlugin>;

/// 增量自带判定；无判定时按 finished 标志降级
pub(crate) fn delta_termination(delta: &StreamDelta, field: &str) -> UnifiedTerminationSignal {
    match &delta.termination {
        Some(signal) => signal.clone(),
        None if delta.finished => UnifiedTerminationSignal::finished_without_status(field),
        None => UnifiedTerminationSignal::continuing(field),
    }
}

/// 读取必需的密钥
pub(crate) fn require_secret(provider: &'static str, config: &ProviderConfig) -> Result<String, LLMError> {
    config
        .credential
        .secret()
        .map(str::to_string)
        .ok_or_else(|| LLMError::Auth {
            message: format!("provider {provider} requires a credential"),
        })
}

/// 校验可选 base_url
pub(crate) fn resolve_base_url(
    provider: &'static str,
    config: &ProviderConfig,
    default: &str,
) -> Result<String, LLMError> {
    let base = config.base_url.as_deref().unwrap_or(default).trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(LLMError::config(
            format!("{provider}.base_url"),
            format!("`{base}` is not an http(s) URL"),
        ));
    }
    Ok(base.trim_end_matches('/').to_string())
}

/// Http 错误的 retry-after 提示
pub(crate) fn retry_hint(error: &RawProviderError) -> Option<Duration> {
    match error {
        RawProviderError::Http { headers, .. } => retry_after_from_headers(headers),
        _ => None,
    }
}

/// 解析 JSON 响应体
pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(
    provider: &'static str,
    response: &HttpResponse,
) -> Result<T, LLMError> {
    serde_json::from_slice(&response.body).map_err(|err| {
        LLMError::provider(provider, format!("failed to parse response: {err}"))
    })
}
