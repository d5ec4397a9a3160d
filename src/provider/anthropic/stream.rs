use crate::error::LLMError;
use crate::provider::RawProviderError;
use crate::stream::{FrameDecoder, SseFrame, StreamState, parse_frame};
use crate::types::{ContentPart, StreamDelta};

use super::error::normalize_anthropic_error;
use super::response::{convert_usage, termination_for};
use super::types::{AnthropicBlockDelta, AnthropicStreamEvent, AnthropicUsage};

/// Messages 事件流解码器
///
/// 工具调用按 content block index 绑定；`content_block_stop` 封口对应调用，
/// `message_stop` 结束流。
pub(crate) struct AnthropicDecoder {
    provider: &'static str,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

impl AnthropicDecoder {
    pub(crate) fn new(provider: &'static str) -> Self {
        Self {
            provider,
            stop_reason: None,
            usage: AnthropicUsage::default(),
        }
    }

    fn record_usage(&mut self, usage: AnthropicUsage, state: &mut StreamState) {
        self.usage.merge(usage);
        state.record_usage(convert_usage(&self.usage));
    }

    fn finish(&self, state: &mut StreamState) -> StreamDelta {
        state.finish(termination_for(self.stop_reason.as_deref()))
    }
}

impl FrameDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: SseFrame, state: &mut StreamState) -> Result<Vec<StreamDelta>, LLMError> {
        let Some(event) = parse_frame::<AnthropicStreamEvent>(&frame, self.provider) else {
            return Ok(Vec::new());
        };

        let mut deltas = Vec::new();
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(id) = message.id.as_deref() {
                    state.observe_response_id(id);
                }
                if let Some(usage) = message.usage {
                    self.record_usage(usage, state);
                }
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block.kind.as_str() {
                "tool_use" => {
                    let id = content_block
                        .id
                        .filter(|id| !id.is_empty())
                        .unwrap_or_else(|| format!("toolu_{index}"));
                    state.tool_calls.begin(&id, content_block.name.as_deref());
                    state.tool_calls.bind_index(index, &id);
                }
                "text" => {
                    if let Some(text) = content_block.text.as_deref().filter(|text| !text.is_empty()) {
                        deltas.push(state.text(text));
                    }
                }
                _ => {}
            },
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => match delta {
                AnthropicBlockDelta::TextDelta { text } => {
                    if !text.is_empty() {
                        deltas.push(state.text(&text));
                    }
                }
                AnthropicBlockDelta::InputJsonDelta { partial_json } => {
                    let id = state
                        .tool_calls
                        .id_for_index(index)
                        .unwrap_or_else(|| format!("toolu_{index}"));
                    state.tool_calls.append(&id, &partial_json);
                    state.tool_calls.bind_index(index, &id);
                }
                AnthropicBlockDelta::Other => {}
            },
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if let Some(id) = state.tool_calls.id_for_index(index) {
                    if let Some(call) = state.tool_calls.seal(&id, self.provider) {
                        deltas.push(state.delta(vec![ContentPart::ToolCall(call)]));
                    }
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(reason);
                } else if delta.stop_sequence.is_some() {
                    self.stop_reason = Some("stop_sequence".to_string());
                }
                if let Some(usage) = usage {
                    self.record_usage(usage, state);
                }
            }
            AnthropicStreamEvent::MessageStop => deltas.push(self.finish(state)),
            AnthropicStreamEvent::Error { error } => {
                return Err(normalize_anthropic_error(
                    self.provider,
                    RawProviderError::StreamEvent(error),
                ));
            }
            AnthropicStreamEvent::Ping | AnthropicStreamEvent::Unknown => {}
        }
        Ok(deltas)
    }

    fn on_eof(&mut self, state: &mut StreamState) -> Vec<StreamDelta> {
        if self.stop_reason.is_some() {
            return vec![self.finish(state)];
        }
        tracing::warn!(provider = self.provider, "stream ended without message_stop");
        vec![state.finish(
            termination_for(None).with_message("stream ended without a terminal event"),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::decode_stream;
    use crate::types::{Confidence, TerminationReason};
    use futures_util::{StreamExt, stream};
    use serde_json::{Value, json};

    fn sse(events: &[Value]) -> Vec<u8> {
        let mut out = String::new();
        for event in events {
            let name = event["type"].as_str().unwrap_or("message");
            out.push_str(&format!("event: {name}\ndata: {event}\n\n"));
        }
        out.into_bytes()
    }

    async fn decode(body: Vec<u8>) -> Vec<Result<StreamDelta, LLMError>> {
        decode_stream(
            Box::pin(stream::iter(vec![Ok(body)])),
            "anthropic",
            AnthropicDecoder::new("anthropic"),
        )
        .collect()
        .await
    }

    #[tokio::test]
    async fn text_and_tool_use_events() {
        let body = sse(&[
            json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 11, "output_tokens": 1}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
            json!({"type": "ping"}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Checking"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "content_block_start", "index": 1, "content_block": {"type": "tool_use", "id": "toolu_7", "name": "weather", "input": {}}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"city\": "}}),
            json!({"type": "content_block_delta", "index": 1, "delta": {"type": "input_json_delta", "partial_json": "\"Lima\"}"}}),
            json!({"type": "content_block_stop", "index": 1}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 25}}),
            json!({"type": "message_stop"}),
        ]);

        let deltas: Vec<StreamDelta> = decode(body)
            .await
            .into_iter()
            .map(|delta| delta.expect("delta"))
            .collect();
        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|delta| delta.id == "msg_1"));
        assert_eq!(deltas[0].text(), "Checking");
        assert!(deltas[1].completes_tool_call());
        let call = deltas[1].tool_calls().next().expect("call");
        assert_eq!(call.id, "toolu_7");
        assert_eq!(call.name, "weather");
        assert_eq!(call.parameters["city"], json!("Lima"));

        let last = &deltas[2];
        assert!(last.finished);
        let usage = last.usage.as_ref().expect("usage");
        assert_eq!(usage.prompt_tokens, Some(11));
        assert_eq!(usage.completion_tokens, Some(25));
        let signal = last.termination.as_ref().expect("signal");
        assert_eq!(signal.reason, TerminationReason::NaturalCompletion);
        assert_eq!(signal.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn error_event_raises() {
        let body = sse(&[
            json!({"type": "message_start", "message": {"id": "msg_2"}}),
            json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}}),
        ]);
        let items = decode(body).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(LLMError::Provider { .. })));
    }

    #[tokio::test]
    async fn truncated_stream_is_low_confidence() {
        let mut body = sse(&[
            json!({"type": "message_start", "message": {"id": "msg_3"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hel"}}),
        ]);
        body.extend_from_slice(b"data: {not json}\n\n");
        let deltas: Vec<StreamDelta> = decode(body)
            .await
            .into_iter()
            .map(|delta| delta.expect("delta"))
            .collect();
        assert_eq!(deltas.len(), 2);
        let last = &deltas[1];
        assert!(last.finished);
        assert_eq!(
            last.termination.as_ref().map(|s| s.confidence),
            Some(Confidence::Low)
        );
    }
}
