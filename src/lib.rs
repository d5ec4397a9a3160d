//! LLM 多供应商统一调用库：统一请求/响应、流式增量、工具路由与多轮代理循环

pub mod agent;
pub mod cancel;
pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod http;
pub mod provider;
pub mod registry;
pub mod stream;
pub mod tools;
pub mod types;

pub use agent::{ConversationContext, LoopStop, MultiTurnOptions, MultiTurnResult, StreamingState, ToolStrategy};
pub use client::{LLMClient, LLMClientBuilder};
pub use config::{ClientConfig, Credential, ProviderConfig};
pub use error::{CancelReason, CancellationPhase, ErrorKind, LLMError};
pub use provider::{DynProviderPlugin, ProviderPlugin};
pub use registry::{ModelFilter, ModelInfo};
pub use stream::DeltaStream;
pub use tools::{ToolError, ToolHandler, tool_fn};
pub use types::*;
