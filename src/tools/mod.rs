//! Tool registration, validation and execution.
//!
//! Handlers implement [`ToolHandler`] and are registered in a [`ToolRegistry`] together with
//! their [`ToolDefinition`]. The [`ToolRouter`] executes [`ToolCall`] values with a
//! per-call timeout and converts every handler outcome into a [`ToolResult`]: only a
//! cancellation escapes as an error.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt, TryStreamExt, stream};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CancelReason, CancellationPhase, LLMError};
use crate::types::{ToolCall, ToolDefinition, ToolResult};

mod discovery;
mod schema;

pub use discovery::{DiscoveredTool, ToolServerConnector, discover_all};
pub use schema::{BasicSchemaValidator, SchemaValidator};

/// 工具不存在
pub const TOOL_NOT_FOUND: &str = "TOOL_NOT_FOUND";
/// 工具执行超时
pub const TIMEOUT: &str = "TIMEOUT";
/// 处理器未给出错误码时的默认值
pub const EXECUTION_ERROR: &str = "EXECUTION_ERROR";

/// 工具处理器返回的错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: String,
    pub message: String,
}

impl ToolError {
    /// 使用默认错误码 `EXECUTION_ERROR`
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(EXECUTION_ERROR, message)
    }

    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// 工具处理器
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use kotoba::tools::{ToolError, ToolHandler};
/// use kotoba::types::ToolCall;
/// use serde_json::{Value, json};
///
/// struct Echo;
///
/// #[async_trait]
/// impl ToolHandler for Echo {
///     async fn call(&self, call: &ToolCall) -> Result<Value, ToolError> {
///         Ok(json!({ "echo": call.parameters.get("message") }))
///     }
/// }
/// ```
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &ToolCall) -> Result<Value, ToolError>;
}

/// 线程安全处理器句柄
pub type DynToolHandler = Arc<dyn ToolHandler>;

struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, call: &ToolCall) -> Result<Value, ToolError> {
        (self.0)(call.parameters.clone()).await
    }
}

/// 闭包 -> 处理器，闭包接收调用参数
///
/// # Examples
///
/// ```
/// use kotoba::tools::tool_fn;
/// use serde_json::json;
///
/// let handler = tool_fn(|params| async move {
///     Ok(json!({ "sum": params.len() }))
/// });
/// # let _ = handler;
/// ```
pub fn tool_fn<F, Fut>(f: F) -> DynToolHandler
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    Arc::new(FnTool(f))
}

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    handler: DynToolHandler,
}

/// 工具表，保持注册顺序
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具会被替换
    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: DynToolHandler,
    ) -> Result<(), LLMError> {
        BasicSchemaValidator.validate(std::slice::from_ref(&definition))?;
        let entry = RegisteredTool {
            definition,
            handler,
        };
        match self.index.get(&entry.definition.name) {
            Some(&slot) => {
                debug!(tool = %entry.definition.name, "replacing registered tool");
                self.tools[slot] = entry;
            }
            None => {
                self.index
                    .insert(entry.definition.name.clone(), self.tools.len());
                self.tools.push(entry);
            }
        }
        Ok(())
    }

    pub fn handler(&self, name: &str) -> Option<DynToolHandler> {
        self.index
            .get(name)
            .map(|&slot| self.tools[slot].handler.clone())
    }

    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&slot| &self.tools[slot].definition)
    }

    /// 按注册顺序返回全部定义
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|tool| tool.definition.clone())
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools
            .iter()
            .map(|tool| tool.definition.name.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// 按名称路由工具调用
#[derive(Debug, Clone)]
pub struct ToolRouter {
    registry: ToolRegistry,
    default_timeout: Duration,
}

impl ToolRouter {
    pub fn new(registry: ToolRegistry, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 执行单个调用
    ///
    /// 未知工具、超时和处理器错误都返回失败的 [`ToolResult`]；只有取消会返回错误。
    pub async fn execute(
        &self,
        call: &ToolCall,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<ToolResult, LLMError> {
        if token.is_cancelled() {
            return Err(LLMError::cancelled(
                CancellationPhase::ToolCalls,
                CancelReason::Caller,
            ));
        }
        let Some(handler) = self.registry.handler(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "tool is not registered");
            return Ok(ToolResult::failure(
                call,
                TOOL_NOT_FOUND,
                format!("tool `{}` is not registered", call.name),
            ));
        };

        let limit = timeout.unwrap_or(self.default_timeout);
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(LLMError::cancelled(CancellationPhase::ToolCalls, CancelReason::Caller));
            }
            outcome = tokio::time::timeout(limit, handler.call(call)) => outcome,
        };

        let result = match outcome {
            Ok(Ok(value)) => ToolResult::success(call, value),
            Ok(Err(err)) => {
                debug!(tool = %call.name, call_id = %call.id, code = %err.code, "tool returned an error");
                ToolResult::failure(call, err.code, err.message)
            }
            Err(_) => {
                warn!(tool = %call.name, call_id = %call.id, timeout_ms = limit.as_millis() as u64, "tool timed out");
                ToolResult::failure(
                    call,
                    TIMEOUT,
                    format!("tool `{}` timed out after {}ms", call.name, limit.as_millis()),
                )
            }
        };
        Ok(result)
    }

    /// 并发执行一批调用，最多同时运行 `max_concurrency` 个；结果按调用顺序返回
    pub async fn execute_batch(
        &self,
        calls: &[ToolCall],
        max_concurrency: usize,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<Vec<ToolResult>, LLMError> {
        let pending: Vec<BoxFuture<'_, Result<ToolResult, LLMError>>> = calls
            .iter()
            .map(|call| self.execute(call, timeout, token).boxed())
            .collect();
        stream::iter(pending)
            .buffered(max_concurrency.max(1))
            .try_collect()
            .await
    }
}
