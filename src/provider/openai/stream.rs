use crate::error::LLMError;
use crate::provider::RawProviderError;
use crate::stream::{FrameDecoder, SseFrame, StreamState, parse_frame};
use crate::types::{ContentPart, StreamDelta};

use super::error::normalize_openai_error;
use super::response::{convert_usage, termination_for};
use super::types::{OpenAiStreamChunk, OpenAiToolCallDelta};

/// Chat Completions 流解码器
///
/// 工具调用按 index 绑定到首次出现的 id；`finish_reason` 封口工具调用，
/// 携带 usage 的帧或 `[DONE]` 结束流。
pub(crate) struct OpenAiDecoder {
    provider: &'static str,
    finish_reason: Option<String>,
}

impl OpenAiDecoder {
    pub(crate) fn new(provider: &'static str) -> Self {
        Self {
            provider,
            finish_reason: None,
        }
    }

    fn apply_tool_delta(&self, delta: &OpenAiToolCallDelta, state: &mut StreamState) {
        let index = delta.index.unwrap_or(0);
        let name = delta.function.as_ref().and_then(|f| f.name.as_deref());
        let id = match delta.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                state.tool_calls.begin(id, name);
                state.tool_calls.bind_index(index, id);
                id.to_string()
            }
            None => match state.tool_calls.id_for_index(index) {
                Some(id) => {
                    state.tool_calls.begin(&id, name);
                    id
                }
                None => {
                    let id = format!("call_{index}");
                    state.tool_calls.begin(&id, name);
                    state.tool_calls.bind_index(index, &id);
                    id
                }
            },
        };
        if let Some(fragment) = delta.function.as_ref().and_then(|f| f.arguments.as_deref()) {
            state.tool_calls.append(&id, fragment);
        }
    }

    fn finish(&self, state: &mut StreamState) -> StreamDelta {
        state.finish(termination_for(self.finish_reason.as_deref()))
    }
}

impl FrameDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: SseFrame, state: &mut StreamState) -> Result<Vec<StreamDelta>, LLMError> {
        let Some(chunk) = parse_frame::<OpenAiStreamChunk>(&frame, self.provider) else {
            return Ok(Vec::new());
        };
        if let Some(error) = chunk.error {
            return Err(normalize_openai_error(
                self.provider,
                RawProviderError::StreamEvent(error),
            ));
        }
        if let Some(id) = chunk.id.as_deref() {
            state.observe_response_id(id);
        }

        let mut deltas = Vec::new();
        for choice in chunk.choices.iter().filter(|choice| choice.index == 0) {
            if let Some(delta) = &choice.delta {
                if let Some(text) = delta.content.as_deref().filter(|text| !text.is_empty()) {
                    deltas.push(state.text(text));
                }
                for tool_delta in delta.tool_calls.iter().flatten() {
                    self.apply_tool_delta(tool_delta, state);
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
                let sealed = state.tool_calls.seal_all(self.provider);
                if !sealed.is_empty() {
                    deltas.push(state.delta(sealed.into_iter().map(ContentPart::ToolCall).collect()));
                }
            }
        }

        if let Some(usage) = chunk.usage {
            state.record_usage(convert_usage(usage));
            deltas.push(self.finish(state));
        }
        Ok(deltas)
    }

    fn on_sentinel(&mut self, state: &mut StreamState) -> Vec<StreamDelta> {
        vec![self.finish(state)]
    }

    fn on_eof(&mut self, state: &mut StreamState) -> Vec<StreamDelta> {
        if self.finish_reason.is_some() {
            return vec![self.finish(state)];
        }
        tracing::warn!(provider = self.provider, "stream ended without finish_reason or [DONE]");
        vec![state.finish(
            termination_for(None).with_message("stream ended without a terminal event"),
        )]
    }
}
