use std::collections::HashMap;

use serde_json::Value;

use crate::error::LLMError;
use crate::stream::arguments_from_value;
use crate::types::{
    ChatResponse, Confidence, ContentPart, FinishReason, Message, ProviderMetadata, Role,
    TerminationReason, TokenUsage, ToolCall, ToolCallMetadata, UnifiedTerminationSignal,
};

use super::types::{AnthropicContentBlock, AnthropicMessageResponse, AnthropicUsage};

pub(crate) fn map_response(
    resp: AnthropicMessageResponse,
    provider: &'static str,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();

    let mut content = Vec::new();
    for (index, block) in resp.content.into_iter().enumerate() {
        if let Some(part) = convert_content_block(block, index, provider) {
            content.push(part);
        }
    }
    let mut message = Message::new(Role::Assistant, content);
    message.id = resp.id.clone();

    let mut raw_finish_reason = resp.stop_reason;
    if raw_finish_reason.is_none() && resp.stop_sequence.is_some() {
        raw_finish_reason = Some("stop_sequence".to_string());
    }

    Ok(ChatResponse {
        message,
        usage: resp.usage.as_ref().map(convert_usage),
        finish_reason: raw_finish_reason.as_deref().map(convert_finish_reason),
        raw_finish_reason,
        model: resp.model,
        provider: ProviderMetadata {
            provider: provider.to_string(),
            request_id: resp.id,
            endpoint: None,
            raw,
        },
    })
}

fn convert_content_block(
    block: AnthropicContentBlock,
    index: usize,
    provider: &'static str,
) -> Option<ContentPart> {
    match block.kind.as_str() {
        "text" => block
            .text
            .filter(|text| !text.is_empty())
            .map(ContentPart::text),
        "tool_use" => Some(ContentPart::ToolCall(ToolCall {
            id: block.id.unwrap_or_else(|| format!("toolu_{index}")),
            name: block.name.unwrap_or_default(),
            parameters: arguments_from_value(block.input.unwrap_or(Value::Null)),
            metadata: Some(ToolCallMetadata::now(provider, None)),
        })),
        // thinking / redacted_thinking 不进入统一消息
        _ => None,
    }
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "pause_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "stop_sequence" => FinishReason::StopSequence,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

/// stop_reason -> 终止判定
pub(crate) fn termination_for(reason: Option<&str>) -> UnifiedTerminationSignal {
    let Some(raw) = reason else {
        return UnifiedTerminationSignal::finished_without_status("stop_reason");
    };
    let (reason, confidence) = match raw {
        "end_turn" | "tool_use" | "pause_turn" => {
            (TerminationReason::NaturalCompletion, Confidence::High)
        }
        "max_tokens" => (TerminationReason::TokenLimitReached, Confidence::High),
        "stop_sequence" => (TerminationReason::StopSequence, Confidence::High),
        "refusal" => (TerminationReason::ContentFiltered, Confidence::High),
        _ => (TerminationReason::Unknown, Confidence::Medium),
    };
    UnifiedTerminationSignal::terminal(reason, confidence, "stop_reason", Some(raw))
}

pub(crate) fn convert_usage(usage: &AnthropicUsage) -> TokenUsage {
    let mut details = HashMap::new();
    if let Some(value) = usage.cache_creation_input_tokens {
        details.insert("cache_creation_input_tokens".to_string(), Value::from(value));
    }
    if let Some(value) = usage.cache_read_input_tokens {
        details.insert("cache_read_input_tokens".to_string(), Value::from(value));
    }
    let total_tokens = match (usage.input_tokens, usage.output_tokens) {
        (None, None) => None,
        (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
    };
    TokenUsage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        reasoning_tokens: None,
        total_tokens,
        details: if details.is_empty() {
            None
        } else {
            Some(details)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_text_tool_use_and_usage() {
        let resp: AnthropicMessageResponse = serde_json::from_value(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_9", "name": "weather", "input": {"city": "Kyoto"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 12, "cache_read_input_tokens": 4}
        }))
        .expect("fixture");

        let mapped = map_response(resp, "anthropic").expect("map");
        assert_eq!(mapped.message.id.as_deref(), Some("msg_01"));
        assert_eq!(mapped.message.content.len(), 2);
        assert_eq!(mapped.message.text(), "Let me check.");
        let call = mapped.tool_calls().next().expect("call");
        assert_eq!(call.id, "toolu_9");
        assert_eq!(call.parameters["city"], json!("Kyoto"));
        assert_eq!(mapped.finish_reason, Some(FinishReason::ToolCalls));
        let usage = mapped.usage.expect("usage");
        assert_eq!(usage.total_tokens, Some(32));
        assert_eq!(
            usage.details.and_then(|d| d.get("cache_read_input_tokens").cloned()),
            Some(json!(4))
        );
    }

    #[test]
    fn termination_table() {
        let cases = [
            (Some("end_turn"), TerminationReason::NaturalCompletion, Confidence::High),
            (Some("tool_use"), TerminationReason::NaturalCompletion, Confidence::High),
            (Some("pause_turn"), TerminationReason::NaturalCompletion, Confidence::High),
            (Some("max_tokens"), TerminationReason::TokenLimitReached, Confidence::High),
            (Some("stop_sequence"), TerminationReason::StopSequence, Confidence::High),
            (Some("refusal"), TerminationReason::ContentFiltered, Confidence::High),
            (Some("brand_new"), TerminationReason::Unknown, Confidence::Medium),
            (None, TerminationReason::Unknown, Confidence::Low),
        ];
        for (raw, reason, confidence) in cases {
            let signal = termination_for(raw);
            assert!(signal.should_terminate);
            assert_eq!(signal.reason, reason, "raw {raw:?}");
            assert_eq!(signal.confidence, confidence, "raw {raw:?}");
            assert_eq!(signal.provider_specific.original_field, "stop_reason");
        }
    }
}
