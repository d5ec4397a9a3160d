use std::collections::HashMap;

use serde_json::Value;

use crate::error::LLMError;
use crate::stream::parse_tool_arguments;
use crate::types::{
    ChatResponse, Confidence, ContentPart, FinishReason, Message, ProviderMetadata, Role,
    TerminationReason, TokenUsage, ToolCall, ToolCallMetadata, UnifiedTerminationSignal,
};

use super::types::{OpenAiChatResponse, OpenAiMessageContent, OpenAiResponseMessage, OpenAiUsage};

pub(crate) fn map_response(
    resp: OpenAiChatResponse,
    provider: &'static str,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();
    // 仅取第一个 choice，n > 1 不在支持范围内
    let choice = resp
        .choices
        .into_iter()
        .min_by_key(|choice| choice.index)
        .ok_or_else(|| LLMError::provider(provider, "response contains no choices"))?;

    let content = match choice.message {
        Some(message) => convert_response_message(message, provider),
        None => Vec::new(),
    };
    let mut message = Message::new(Role::Assistant, content);
    message.id = resp.id.clone();

    Ok(ChatResponse {
        message,
        usage: resp.usage.map(convert_usage),
        finish_reason: choice.finish_reason.as_deref().map(convert_finish_reason),
        raw_finish_reason: choice.finish_reason,
        model: resp.model,
        provider: ProviderMetadata {
            provider: provider.to_string(),
            request_id: resp.id,
            endpoint: None,
            raw,
        },
    })
}

fn convert_response_message(message: OpenAiResponseMessage, provider: &'static str) -> Vec<ContentPart> {
    let mut content = Vec::new();
    match message.content {
        Some(OpenAiMessageContent::Text(text)) if !text.is_empty() => {
            content.push(ContentPart::text(text));
        }
        Some(OpenAiMessageContent::Parts(parts)) => {
            content.extend(
                parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .filter(|text| !text.is_empty())
                    .map(ContentPart::text),
            );
        }
        _ => {}
    }
    if let Some(refusal) = message.refusal.filter(|text| !text.is_empty()) {
        content.push(ContentPart::text(refusal));
    }
    for (index, call) in message.tool_calls.unwrap_or_default().into_iter().enumerate() {
        let (name, arguments) = call
            .function
            .map(|f| (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()))
            .unwrap_or_default();
        content.push(ContentPart::ToolCall(ToolCall {
            id: call.id.unwrap_or_else(|| format!("call_{index}")),
            parameters: parse_tool_arguments(&arguments, provider, &name),
            name,
            metadata: Some(ToolCallMetadata::now(provider, None)),
        }));
    }
    content
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

/// finish_reason -> 终止判定
pub(crate) fn termination_for(reason: Option<&str>) -> UnifiedTerminationSignal {
    let Some(raw) = reason else {
        return UnifiedTerminationSignal::finished_without_status("finish_reason");
    };
    let (reason, confidence) = match raw {
        "stop" | "tool_calls" | "function_call" => {
            (TerminationReason::NaturalCompletion, Confidence::High)
        }
        "length" => (TerminationReason::TokenLimitReached, Confidence::High),
        "content_filter" => (TerminationReason::ContentFiltered, Confidence::High),
        _ => (TerminationReason::Unknown, Confidence::Medium),
    };
    UnifiedTerminationSignal::terminal(reason, confidence, "finish_reason", Some(raw))
}

pub(crate) fn convert_usage(usage: OpenAiUsage) -> TokenUsage {
    let reasoning_tokens = usage
        .completion_tokens_details
        .as_ref()
        .and_then(|details| details.get("reasoning_tokens"))
        .and_then(Value::as_u64);
    let mut details = HashMap::new();
    if let Some(value) = usage.prompt_tokens_details {
        details.insert("prompt_tokens_details".to_string(), value);
    }
    if let Some(value) = usage.completion_tokens_details {
        details.insert("completion_tokens_details".to_string(), value);
    }
    TokenUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        reasoning_tokens,
        total_tokens: usage.total_tokens,
        details: if details.is_empty() {
            None
        } else {
            Some(details)
        },
    }
}
