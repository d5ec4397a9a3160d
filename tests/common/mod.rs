//! 集成测试共用的脚本化 Transport、计数插件与工具

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures_util::stream;
use kotoba::client::LLMClientBuilder;
use kotoba::config::{DEFAULT_CONFIG_NAME, ProviderConfig};
use kotoba::error::{CancelReason, CancellationPhase, LLMError};
use kotoba::http::{HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};
use kotoba::provider::{
    OpenAiPlugin, ProviderPlugin, ProviderSession, RawProviderError, RequestTarget,
    TerminationSubject,
};
use kotoba::registry::ModelInfo;
use kotoba::stream::DeltaStream;
use kotoba::tools::{DynToolHandler, ToolError, tool_fn};
use kotoba::types::{
    CapabilityDescriptor, ChatRequest, ChatResponse, ToolCall, ToolCallMetadata, ToolDefinition,
    UnifiedTerminationSignal,
};
use kotoba::LLMClient;
use serde_json::{Map, Value, json};

pub const MODEL: &str = "openai:gpt-4o";
pub const ECHO_TOOL: &str = "e2e_echo_tool";

/// 预先排好的上游回复
#[derive(Debug, Clone)]
pub enum Reply {
    Json(u16, Value),
    /// 每个元素是一帧 `data:` 负载，末尾自动追加 `[DONE]`
    Sse(Vec<Value>),
    /// 直到请求被取消才返回
    Hang,
}

/// 按顺序回放回复并记录收到的请求
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    /// 第 `index` 个请求的 JSON 请求体
    pub fn body(&self, index: usize) -> Value {
        self.requests()
            .get(index)
            .and_then(HttpRequest::json_body)
            .expect("recorded request body")
    }

    fn next(&self, request: &HttpRequest) -> Reply {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| {
                Reply::Json(500, json!({"error": {"message": "script exhausted", "type": "server_error"}}))
            })
    }
}

async fn hang(request: &HttpRequest) -> LLMError {
    match &request.cancellation {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
    LLMError::cancelled(CancellationPhase::Execution, CancelReason::Caller)
}

fn sse_body(frames: &[Value]) -> Vec<Vec<u8>> {
    let mut chunks: Vec<Vec<u8>> = frames
        .iter()
        .map(|frame| format!("data: {frame}\n\n").into_bytes())
        .collect();
    chunks.push(b"data: [DONE]\n\n".to_vec());
    chunks
}

fn json_headers() -> HashMap<String, String> {
    HashMap::from([("content-type".to_string(), "application/json".to_string())])
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        match self.next(&request) {
            Reply::Json(status, body) => Ok(HttpResponse {
                status,
                headers: json_headers(),
                body: serde_json::to_vec(&body).expect("encode reply"),
            }),
            Reply::Sse(_) => Err(LLMError::transport("scripted SSE reply for a non-streaming call")),
            Reply::Hang => Err(hang(&request).await),
        }
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        match self.next(&request) {
            Reply::Sse(frames) => Ok(HttpStreamResponse {
                status: 200,
                headers: HashMap::from([(
                    "content-type".to_string(),
                    "text/event-stream".to_string(),
                )]),
                body: Box::pin(stream::iter(sse_body(&frames).into_iter().map(Ok))),
            }),
            Reply::Json(status, body) => {
                let bytes = serde_json::to_vec(&body).expect("encode reply");
                Ok(HttpStreamResponse {
                    status,
                    headers: json_headers(),
                    body: Box::pin(stream::iter(vec![Ok(bytes)])),
                })
            }
            Reply::Hang => Err(hang(&request).await),
        }
    }
}

/// 统计 initialize 次数的 OpenAI 插件
#[derive(Default)]
pub struct CountingPlugin {
    inner: OpenAiPlugin,
    initializations: AtomicUsize,
}

impl CountingPlugin {
    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }
}

impl ProviderPlugin for CountingPlugin {
    fn id(&self) -> &'static str {
        self.inner.id()
    }

    fn version(&self) -> &'static str {
        self.inner.version()
    }

    fn capabilities(&self) -> CapabilityDescriptor {
        self.inner.capabilities()
    }

    fn initialize(&self, config: &ProviderConfig) -> Result<ProviderSession, LLMError> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        self.inner.initialize(config)
    }

    fn translate_request(
        &self,
        session: &ProviderSession,
        request: &ChatRequest,
        target: RequestTarget<'_>,
    ) -> Result<HttpRequest, LLMError> {
        self.inner.translate_request(session, request, target)
    }

    fn parse_response(&self, response: HttpResponse) -> Result<ChatResponse, LLMError> {
        self.inner.parse_response(response)
    }

    fn parse_stream(&self, response: HttpStreamResponse) -> DeltaStream {
        self.inner.parse_stream(response)
    }

    fn normalize_error(&self, error: RawProviderError) -> LLMError {
        self.inner.normalize_error(error)
    }

    fn detect_termination(&self, subject: TerminationSubject<'_>) -> UnifiedTerminationSignal {
        self.inner.detect_termination(subject)
    }
}

/// 指向脚本 Transport 的 Builder，已注册测试模型与默认配置
pub fn builder(transport: &Arc<ScriptedTransport>) -> LLMClientBuilder {
    LLMClient::builder()
        .transport(transport.clone())
        .register_model(ModelInfo::new(MODEL, "openai"))
        .provider_config(
            "openai",
            DEFAULT_CONFIG_NAME,
            ProviderConfig::api_key("sk-test").with_base_url("http://mock.local"),
        )
}

/// 构造一条回显工具调用
pub fn echo_tool_call(message: &str) -> ToolCall {
    let now = Utc::now();
    let mut parameters = Map::new();
    parameters.insert("message".to_string(), Value::String(message.to_string()));
    ToolCall {
        id: format!("test_call_{}", now.timestamp_millis()),
        name: ECHO_TOOL.to_string(),
        parameters,
        metadata: Some(ToolCallMetadata {
            provider_id: "test".to_string(),
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            context_id: None,
        }),
    }
}

pub fn echo_definition() -> ToolDefinition {
    ToolDefinition::new(
        ECHO_TOOL,
        "Echoes the message back",
        json!({
            "type": "object",
            "properties": {"message": {"type": "string"}},
            "required": ["message"]
        }),
    )
}

/// 回显处理器，同时记录收到的消息
pub fn echo_handler(seen: Arc<Mutex<Vec<String>>>) -> DynToolHandler {
    tool_fn(move |params| {
        let seen = seen.clone();
        async move {
            let message = params
                .get("message")
                .and_then(Value::as_str)
                .ok_or_else(|| ToolError::with_code("INVALID_ARGUMENTS", "missing message"))?
                .to_string();
            seen.lock().expect("seen lock").push(message.clone());
            Ok::<Value, ToolError>(json!({ "echo": message }))
        }
    })
}

pub fn openai_text(id: &str, text: &str) -> Value {
    json!({
        "id": id,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
    })
}

/// 工具调用回复；`calls` 为 (id, name, arguments)
pub fn openai_tool_calls(id: &str, calls: &[(&str, &str, Value)]) -> Value {
    let tool_calls: Vec<Value> = calls
        .iter()
        .map(|(call_id, name, arguments)| {
            json!({
                "id": call_id,
                "type": "function",
                "function": {"name": name, "arguments": arguments.to_string()}
            })
        })
        .collect();
    json!({
        "id": id,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": null, "tool_calls": tool_calls},
            "finish_reason": "tool_calls"
        }],
        "usage": {"prompt_tokens": 12, "completion_tokens": 8, "total_tokens": 20}
    })
}

/// 文本流帧，最后一帧携带 finish_reason 与 usage
pub fn openai_text_frames(id: &str, fragments: &[&str]) -> Vec<Value> {
    let mut frames: Vec<Value> = fragments
        .iter()
        .map(|fragment| json!({"id": id, "choices": [{"index": 0, "delta": {"content": fragment}}]}))
        .collect();
    frames.push(json!({"id": id, "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}));
    frames.push(json!({"id": id, "choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 6, "total_tokens": 10}}));
    frames
}

/// 单个工具调用的流帧，参数按片段拆开
pub fn openai_tool_frames(id: &str, call_id: &str, name: &str, fragments: &[&str]) -> Vec<Value> {
    let mut frames = vec![json!({"id": id, "choices": [{"index": 0, "delta": {"tool_calls": [
        {"index": 0, "id": call_id, "type": "function", "function": {"name": name, "arguments": ""}}
    ]}}]})];
    for fragment in fragments {
        frames.push(json!({"id": id, "choices": [{"index": 0, "delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": fragment}}
        ]}}]}));
    }
    frames.push(json!({"id": id, "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}));
    frames.push(json!({"id": id, "choices": [], "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}}));
    frames
}
