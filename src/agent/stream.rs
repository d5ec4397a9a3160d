//! Streaming variant of the agent loop.
//!
//! Deltas are forwarded as they arrive. When a delta seals tool calls, forwarding pauses
//! while the tools run and resumes with that same delta, which then carries the results in
//! its `toolResults` metadata. Sequence numbers and the delta id stay continuous across
//! iterations, and only the last iteration's terminal delta is marked `finished`.

use std::collections::HashMap;
use std::time::Instant;

use async_stream::try_stream;
use serde_json::Value;
use tracing::info;

use crate::cancel::CallScope;
use crate::error::CancellationPhase;
use crate::stream::DeltaStream;
use crate::types::{
    ChatRequest, ContentPart, Message, Role, StreamDelta, TokenEstimator, TokenUsage, ToolCall,
    ToolResult,
};

use super::{AgentLoop, ConversationContext, StreamingState};

/// 单轮流式回复的累积内容
#[derive(Default)]
struct TurnBuffer {
    id: Option<String>,
    text: String,
    calls: Vec<ToolCall>,
    results: Vec<ToolResult>,
    usage: Option<TokenUsage>,
}

impl TurnBuffer {
    fn absorb(&mut self, delta: &StreamDelta) {
        if self.id.is_none() && !delta.id.is_empty() {
            self.id = Some(delta.id.clone());
        }
        for part in &delta.delta.content {
            match part {
                ContentPart::Text(fragment) => self.text.push_str(&fragment.text),
                ContentPart::ToolCall(call) => self.calls.push(call.clone()),
                _ => {}
            }
        }
        if delta.usage.is_some() {
            self.usage = delta.usage.clone();
        }
    }

    /// 助手消息与随后的工具结果消息
    fn into_messages(self) -> Vec<Message> {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentPart::text(self.text));
        }
        content.extend(self.calls.into_iter().map(ContentPart::ToolCall));
        let mut assistant = Message::new(Role::Assistant, content);
        assistant.id = self.id;
        let mut messages = vec![assistant];
        messages.extend(self.results.into_iter().map(Message::tool_result));
        messages
    }
}

fn annotate(delta: &mut StreamDelta, key: &str, value: Value) {
    delta
        .metadata
        .get_or_insert_with(HashMap::new)
        .insert(key.to_string(), value);
}

/// 流式多轮执行；`scope` 随流一起释放
pub(crate) fn run_streaming(agent: AgentLoop, request: ChatRequest, scope: CallScope) -> DeltaStream {
    Box::pin(try_stream! {
        let provider = agent.dispatcher().provider();
        let estimator = TokenEstimator::for_provider(provider);
        let mut request = agent.prepare_request(&request);
        let mut context = ConversationContext::new(request.messages.clone(), agent.options().max_iterations);
        let started = Instant::now();
        let mut sequence: u64 = 0;
        let mut stream_id: Option<String> = None;
        info!(
            provider,
            model = %agent.dispatcher().model_id,
            max_iterations = agent.options().max_iterations,
            "streaming agent loop started"
        );

        loop {
            scope
                .check(CancellationPhase::Streaming)
                .map_err(|err| err.with_partial(&context))?;
            context.current_iteration += 1;
            let iteration = context.current_iteration;
            context.transition(StreamingState::Streaming);

            let mut inner = agent
                .dispatcher()
                .open_stream(&request, scope.token())
                .await
                .map_err(|err| scope.classify(err).with_partial(&context))?;
            let mut turn = TurnBuffer::default();
            let mut resume = false;

            while let Some(item) = scope.next_delta(&mut inner).await {
                let mut delta = item.map_err(|err| err.with_partial(&context))?;
                turn.absorb(&delta);

                let calls: Vec<ToolCall> = delta.tool_calls().cloned().collect();
                if !calls.is_empty() {
                    context.transition(StreamingState::Paused);
                    context.transition(StreamingState::ToolExecution);
                    let results = agent
                        .execute_calls(&calls, iteration, &mut context, &scope)
                        .await?;
                    if let Ok(value) = serde_json::to_value(&results) {
                        annotate(&mut delta, "toolResults", value);
                    }
                    turn.results.extend(results);
                    context.transition(StreamingState::Resuming);
                }

                let terminal = delta.finished;
                if terminal {
                    resume = !turn.results.is_empty()
                        && agent.limit_reached(&context, started).is_none();
                    if resume {
                        delta.finished = false;
                        if let Some(signal) = delta.termination.take() {
                            if let Ok(value) = serde_json::to_value(&signal) {
                                annotate(&mut delta, "turnTermination", value);
                            }
                        }
                    }
                }

                if stream_id.is_none() && !delta.id.is_empty() {
                    stream_id = Some(delta.id.clone());
                }
                delta.id = stream_id.clone().unwrap_or_default();
                delta.sequence = sequence;
                sequence += 1;
                annotate(&mut delta, "iteration", Value::from(iteration));
                context.transition(StreamingState::Streaming);
                yield delta;

                if terminal {
                    break;
                }
            }

            for message in turn.into_messages() {
                context.push(message);
            }
            context.estimated_tokens_used = estimator.estimate_messages(context.history()).total;
            if !resume {
                break;
            }
            request.messages = context.history().to_vec();
        }

        context.transition(StreamingState::Idle);
        info!(
            provider,
            iterations = context.current_iteration,
            tool_calls = context.tool_execution_history.len(),
            "streaming agent loop finished"
        );
    })
}
