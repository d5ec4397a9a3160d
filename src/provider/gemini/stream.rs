use crate::error::LLMError;
use crate::provider::RawProviderError;
use crate::stream::{FrameDecoder, SseFrame, StreamState, parse_frame};
use crate::types::{ContentPart, StreamDelta};

use super::error::normalize_gemini_error;
use super::response::{candidate_parts, convert_usage, termination_for};
use super::types::GeminiGenerateContentResponse;

/// streamGenerateContent 解码器
///
/// 每帧都是完整的 GenerateContentResponse；functionCall 整块到达，直接封口。
/// 候选带 finishReason 时结束流。
pub(crate) struct GeminiDecoder {
    provider: &'static str,
}

impl GeminiDecoder {
    pub(crate) fn new(provider: &'static str) -> Self {
        Self { provider }
    }
}

impl FrameDecoder for GeminiDecoder {
    fn decode(&mut self, frame: SseFrame, state: &mut StreamState) -> Result<Vec<StreamDelta>, LLMError> {
        let Some(chunk) = parse_frame::<GeminiGenerateContentResponse>(&frame, self.provider) else {
            return Ok(Vec::new());
        };
        if let Some(error) = chunk.error {
            return Err(normalize_gemini_error(
                self.provider,
                RawProviderError::StreamEvent(error),
            ));
        }
        if let Some(id) = chunk.response_id.as_deref() {
            state.observe_response_id(id);
        }
        if let Some(usage) = &chunk.usage_metadata {
            state.record_usage(convert_usage(usage));
        }

        let mut deltas = Vec::new();
        let Some(candidate) = chunk
            .candidates
            .into_iter()
            .find(|candidate| candidate.index.unwrap_or(0) == 0)
        else {
            if let Some(blocked) = chunk.prompt_feedback.and_then(|f| f.block_reason) {
                deltas.push(state.finish(termination_for(Some(&blocked))));
            }
            return Ok(deltas);
        };

        let finish_reason = candidate.finish_reason.clone();
        let mut calls = Vec::new();
        for part in candidate_parts(candidate, self.provider) {
            match part {
                ContentPart::Text(text) => deltas.push(state.text(&text.text)),
                call @ ContentPart::ToolCall(_) => calls.push(call),
                _ => {}
            }
        }
        if !calls.is_empty() {
            deltas.push(state.delta(calls));
        }
        if let Some(reason) = finish_reason {
            deltas.push(state.finish(termination_for(Some(&reason))));
        }
        Ok(deltas)
    }
}
