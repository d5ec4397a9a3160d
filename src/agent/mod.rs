//! Multi-turn agent loop.
//!
//! Each iteration sends the accumulated history to the provider, executes the tool calls
//! found in the reply and appends both the assistant message and the tool results before
//! the next round. The loop ends on a reply without tool calls, on the iteration or
//! elapsed-time limit, or on cancellation. A cancelled loop surfaces the history gathered
//! so far through [`LLMError::partial_context`].

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cancel::CallScope;
use crate::dispatch::Dispatcher;
use crate::error::{CancellationPhase, LLMError};
use crate::stream::collect_stream;
use crate::tools::{EXECUTION_ERROR, ToolRouter};
use crate::types::{
    ChatRequest, ChatResponse, Message, TokenEstimator, TokenUsage, ToolCall, ToolResult,
};

pub(crate) mod stream;

fn default_max_iterations() -> u32 {
    10
}

/// 工具执行策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolStrategy {
    /// 逐个执行并追加
    #[default]
    Sequential,
    /// 最多同时执行 `max_concurrency` 个，结果按调用顺序追加
    Parallel { max_concurrency: usize },
}

/// 多轮执行选项
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kotoba::agent::{MultiTurnOptions, ToolStrategy};
///
/// let options = MultiTurnOptions::default()
///     .with_max_iterations(4)
///     .with_max_duration(Duration::from_secs(60))
///     .parallel(3);
/// assert_eq!(options.max_iterations, 4);
/// assert_eq!(options.strategy, ToolStrategy::Parallel { max_concurrency: 3 });
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiTurnOptions {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// 整个循环的耗时上限
    #[serde(default)]
    pub max_duration_ms: Option<u64>,
    #[serde(default)]
    pub strategy: ToolStrategy,
    /// 每轮以流式方式请求
    #[serde(default)]
    pub stream: bool,
    /// 工具失败时中止循环
    #[serde(default)]
    pub abort_on_tool_error: bool,
    /// 单个工具调用超时，缺省使用路由器默认值
    #[serde(default)]
    pub tool_timeout_ms: Option<u64>,
}

impl Default for MultiTurnOptions {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_duration_ms: None,
            strategy: ToolStrategy::default(),
            stream: false,
            abort_on_tool_error: false,
            tool_timeout_ms: None,
        }
    }
}

impl MultiTurnOptions {
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration_ms = Some(max_duration.as_millis() as u64);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn parallel(mut self, max_concurrency: usize) -> Self {
        self.strategy = ToolStrategy::Parallel { max_concurrency };
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn abort_on_tool_error(mut self) -> Self {
        self.abort_on_tool_error = true;
        self
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_ms.map(Duration::from_millis)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> Result<(), LLMError> {
        if self.max_iterations == 0 {
            return Err(LLMError::validation("multi_turn.max_iterations must be at least 1"));
        }
        if let ToolStrategy::Parallel { max_concurrency: 0 } = self.strategy {
            return Err(LLMError::validation(
                "multi_turn.strategy.max_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

/// 循环所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingState {
    #[default]
    Idle,
    Streaming,
    Paused,
    ToolExecution,
    Resuming,
}

/// 一次工具执行的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub call: ToolCall,
    pub result: ToolResult,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// 多轮对话的累积状态；历史只追加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    history: Vec<Message>,
    /// 正在进行或最近完成的轮次，从 1 开始
    pub current_iteration: u32,
    /// 允许的最大轮次
    pub total_iterations: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub streaming_state: StreamingState,
    pub tool_execution_history: Vec<ToolExecutionRecord>,
    pub estimated_tokens_used: usize,
}

impl ConversationContext {
    pub fn new(history: Vec<Message>, total_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            history,
            current_iteration: 0,
            total_iterations,
            started_at: now,
            last_activity_at: now,
            streaming_state: StreamingState::Idle,
            tool_execution_history: Vec::new(),
            estimated_tokens_used: 0,
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn push(&mut self, message: Message) {
        self.history.push(message);
        self.last_activity_at = Utc::now();
    }

    pub(crate) fn transition(&mut self, next: StreamingState) {
        if self.streaming_state != next {
            debug!(
                iteration = self.current_iteration,
                from = ?self.streaming_state,
                to = ?next,
                "agent state transition"
            );
            self.streaming_state = next;
        }
    }

    pub(crate) fn record(&mut self, record: ToolExecutionRecord) {
        self.tool_execution_history.push(record);
        self.last_activity_at = Utc::now();
    }
}

/// 循环结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStop {
    /// 模型不再请求工具
    NaturalCompletion,
    MaxIterations,
    MaxDuration,
}

/// 多轮执行结果
#[derive(Debug, Clone)]
pub struct MultiTurnResult {
    /// 最后一条助手消息
    pub message: Message,
    pub context: ConversationContext,
    pub stop: LoopStop,
    /// 各轮用量之和
    pub usage: TokenUsage,
}

/// 驱动多轮工具执行
#[derive(Debug, Clone)]
pub(crate) struct AgentLoop {
    dispatcher: Dispatcher,
    router: ToolRouter,
    options: MultiTurnOptions,
}

impl AgentLoop {
    pub(crate) fn new(dispatcher: Dispatcher, router: ToolRouter, options: MultiTurnOptions) -> Self {
        Self {
            dispatcher,
            router,
            options,
        }
    }

    /// 去掉多轮选项与调用方令牌；未声明工具时使用已注册的工具
    pub(crate) fn prepare_request(&self, request: &ChatRequest) -> ChatRequest {
        let mut request = request.clone();
        request.multi_turn = None;
        request.cancellation = None;
        if request.tools.is_empty() {
            request.tools = self.router.registry().definitions();
        }
        request
    }

    /// 是否还能开始下一轮
    pub(crate) fn limit_reached(&self, context: &ConversationContext, started: Instant) -> Option<LoopStop> {
        if context.current_iteration >= self.options.max_iterations {
            return Some(LoopStop::MaxIterations);
        }
        if let Some(max) = self.options.max_duration() {
            if started.elapsed() >= max {
                return Some(LoopStop::MaxDuration);
            }
        }
        None
    }

    pub(crate) async fn run(
        &self,
        request: &ChatRequest,
        scope: &CallScope,
    ) -> Result<MultiTurnResult, LLMError> {
        let provider = self.dispatcher.provider();
        let estimator = TokenEstimator::for_provider(provider);
        let mut request = self.prepare_request(request);
        let mut context = ConversationContext::new(request.messages.clone(), self.options.max_iterations);
        let mut usage = TokenUsage::default();
        let mut last_message = None;
        let started = Instant::now();
        info!(
            provider,
            model = %self.dispatcher.model_id,
            max_iterations = self.options.max_iterations,
            strategy = ?self.options.strategy,
            "agent loop started"
        );

        let stop = loop {
            if let Some(stop) = self.limit_reached(&context, started) {
                break stop;
            }
            scope
                .check(CancellationPhase::Execution)
                .map_err(|err| err.with_partial(&context))?;

            context.current_iteration += 1;
            let iteration = context.current_iteration;
            context.transition(if self.options.stream {
                StreamingState::Streaming
            } else {
                StreamingState::Idle
            });
            let response = self
                .send(&request, scope)
                .await
                .map_err(|err| scope.classify(err).with_partial(&context))?;
            if let Some(turn_usage) = &response.usage {
                usage.accumulate(turn_usage);
            }
            let calls: Vec<ToolCall> = response.tool_calls().cloned().collect();
            let message = response.into_message();
            context.push(message.clone());
            last_message = Some(message);

            if calls.is_empty() {
                context.transition(StreamingState::Idle);
                break LoopStop::NaturalCompletion;
            }

            context.transition(StreamingState::ToolExecution);
            let results = self
                .execute_calls(&calls, iteration, &mut context, scope)
                .await?;
            for result in results {
                context.push(Message::tool_result(result));
            }
            context.transition(StreamingState::Resuming);
            context.estimated_tokens_used = estimator.estimate_messages(context.history()).total;
            request.messages = context.history().to_vec();
        };

        context.transition(StreamingState::Idle);
        info!(
            provider,
            model = %self.dispatcher.model_id,
            iterations = context.current_iteration,
            stop = ?stop,
            "agent loop finished"
        );
        Ok(MultiTurnResult {
            message: last_message.unwrap_or_else(|| Message::assistant("")),
            context,
            stop,
            usage,
        })
    }

    async fn send(&self, request: &ChatRequest, scope: &CallScope) -> Result<ChatResponse, LLMError> {
        if self.options.stream {
            let deltas = self.dispatcher.open_stream(request, scope.token()).await?;
            collect_stream(deltas, self.dispatcher.provider()).await
        } else {
            self.dispatcher.invoke(request, scope.token()).await
        }
    }

    /// 按策略执行工具并写入执行记录；返回的结果与 `calls` 顺序一致
    pub(crate) async fn execute_calls(
        &self,
        calls: &[ToolCall],
        iteration: u32,
        context: &mut ConversationContext,
        scope: &CallScope,
    ) -> Result<Vec<ToolResult>, LLMError> {
        let records = match self.options.strategy {
            ToolStrategy::Sequential => {
                let mut records = Vec::with_capacity(calls.len());
                for call in calls {
                    let record = self
                        .timed_execute(call, iteration, scope)
                        .await
                        .map_err(|err| scope.classify(err).with_partial(&*context))?;
                    context.record(record.clone());
                    self.check_failure(&record)?;
                    records.push(record);
                }
                records
            }
            ToolStrategy::Parallel { max_concurrency } => {
                let pending: Vec<BoxFuture<'_, (usize, Result<ToolExecutionRecord, LLMError>)>> =
                    calls
                        .iter()
                        .enumerate()
                        .map(|(index, call)| {
                            let execution = self.timed_execute(call, iteration, scope);
                            async move { (index, execution.await) }.boxed()
                        })
                        .collect();
                let mut completed =
                    futures_util::stream::iter(pending).buffer_unordered(max_concurrency.max(1));
                let mut slots: Vec<Option<ToolExecutionRecord>> = calls.iter().map(|_| None).collect();
                let mut interrupted = None;
                while let Some((index, outcome)) = completed.next().await {
                    match outcome {
                        Ok(record) => slots[index] = Some(record),
                        Err(err) => {
                            interrupted = Some(err);
                            break;
                        }
                    }
                }
                drop(completed);

                // 已完成的调用按原顺序入账，取消时也保留
                let records: Vec<ToolExecutionRecord> = slots.into_iter().flatten().collect();
                for record in &records {
                    context.record(record.clone());
                }
                if let Some(err) = interrupted {
                    return Err(scope.classify(err).with_partial(&*context));
                }
                for record in &records {
                    self.check_failure(record)?;
                }
                records
            }
        };
        Ok(records.into_iter().map(|record| record.result).collect())
    }

    async fn timed_execute(
        &self,
        call: &ToolCall,
        iteration: u32,
        scope: &CallScope,
    ) -> Result<ToolExecutionRecord, LLMError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self
            .router
            .execute(call, self.options.tool_timeout(), scope.token())
            .await?;
        debug!(
            iteration,
            tool = %call.name,
            call_id = %call.id,
            success = result.success,
            "tool executed"
        );
        Ok(ToolExecutionRecord {
            call: call.clone(),
            result,
            iteration,
            started_at,
            duration: clock.elapsed(),
        })
    }

    fn check_failure(&self, record: &ToolExecutionRecord) -> Result<(), LLMError> {
        if !self.options.abort_on_tool_error || record.result.success {
            return Ok(());
        }
        let (code, message) = record
            .result
            .error
            .as_ref()
            .map(|err| (err.code.clone(), err.message.clone()))
            .unwrap_or_else(|| (EXECUTION_ERROR.to_string(), "tool failed".to_string()));
        Err(LLMError::ToolExecution {
            tool: record.call.name.clone(),
            code,
            message,
        })
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) fn options(&self) -> &MultiTurnOptions {
        &self.options
    }
}
