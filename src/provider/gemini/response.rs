use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::error::LLMError;
use crate::stream::arguments_from_value;
use crate::types::{
    ChatResponse, Confidence, ContentPart, FinishReason, Message, ProviderMetadata, Role,
    TerminationReason, TokenUsage, ToolCall, ToolCallMetadata, UnifiedTerminationSignal,
};

use super::types::{GeminiCandidate, GeminiFunctionCall, GeminiGenerateContentResponse, GeminiUsageMetadata};

/// 安全过滤类 finishReason
const SAFETY_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
    "IMAGE_SAFETY",
    "LANGUAGE",
];

pub(crate) fn map_response(
    resp: GeminiGenerateContentResponse,
    provider: &'static str,
) -> Result<ChatResponse, LLMError> {
    let raw = serde_json::to_value(&resp).ok();
    let usage = resp.usage_metadata.as_ref().map(convert_usage);

    let candidate = resp
        .candidates
        .into_iter()
        .min_by_key(|candidate| candidate.index.unwrap_or(0));
    let (content, raw_finish_reason) = match candidate {
        Some(candidate) => {
            let reason = candidate.finish_reason.clone();
            (candidate_parts(candidate, provider), reason)
        }
        None => {
            // 提示被拦截时没有候选
            let blocked = resp
                .prompt_feedback
                .and_then(|feedback| feedback.block_reason)
                .ok_or_else(|| LLMError::provider(provider, "response contains no candidates"))?;
            (Vec::new(), Some(blocked))
        }
    };

    let has_tool_calls = content
        .iter()
        .any(|part| matches!(part, ContentPart::ToolCall(_)));
    let finish_reason = raw_finish_reason.as_deref().map(|reason| {
        match convert_finish_reason(reason) {
            // Gemini 在函数调用时同样返回 STOP
            FinishReason::Stop if has_tool_calls => FinishReason::ToolCalls,
            other => other,
        }
    });

    let mut message = Message::new(Role::Assistant, content);
    message.id = resp.response_id.clone();

    Ok(ChatResponse {
        message,
        usage,
        finish_reason,
        raw_finish_reason,
        model: resp.model_version,
        provider: ProviderMetadata {
            provider: provider.to_string(),
            request_id: resp.response_id,
            endpoint: None,
            raw,
        },
    })
}

/// 候选中的文本与函数调用；思考摘要不进入统一消息
pub(crate) fn candidate_parts(candidate: GeminiCandidate, provider: &'static str) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for part in candidate.content.map(|content| content.parts).unwrap_or_default() {
        if part.thought == Some(true) {
            continue;
        }
        if let Some(text) = part.text.filter(|text| !text.is_empty()) {
            parts.push(ContentPart::text(text));
        }
        if let Some(call) = part.function_call {
            parts.push(ContentPart::ToolCall(convert_function_call(call, provider)));
        }
    }
    parts
}

/// 完整的 functionCall；缺少 id 时生成 `call_<uuid>`
pub(crate) fn convert_function_call(call: GeminiFunctionCall, provider: &'static str) -> ToolCall {
    ToolCall {
        id: call
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
        name: call.name,
        parameters: arguments_from_value(call.args),
        metadata: Some(ToolCallMetadata::now(provider, None)),
    }
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "MALFORMED_FUNCTION_CALL" => FinishReason::Error,
        other if SAFETY_REASONS.contains(&other) => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

/// finishReason -> 终止判定
pub(crate) fn termination_for(reason: Option<&str>) -> UnifiedTerminationSignal {
    let Some(raw) = reason else {
        return UnifiedTerminationSignal::finished_without_status("finishReason");
    };
    let (reason, confidence) = match raw {
        "STOP" => (TerminationReason::NaturalCompletion, Confidence::High),
        "MAX_TOKENS" => (TerminationReason::TokenLimitReached, Confidence::High),
        "MALFORMED_FUNCTION_CALL" => (TerminationReason::Error, Confidence::High),
        other if SAFETY_REASONS.contains(&other) => {
            (TerminationReason::ContentFiltered, Confidence::High)
        }
        _ => (TerminationReason::Unknown, Confidence::Medium),
    };
    UnifiedTerminationSignal::terminal(reason, confidence, "finishReason", Some(raw))
}

pub(crate) fn convert_usage(usage: &GeminiUsageMetadata) -> TokenUsage {
    let mut details = HashMap::new();
    if let Some(value) = usage.cached_content_token_count {
        details.insert("cached_content_token_count".to_string(), Value::from(value));
    }
    if let Some(value) = usage.tool_use_prompt_token_count {
        details.insert("tool_use_prompt_token_count".to_string(), Value::from(value));
    }
    TokenUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        reasoning_tokens: usage.thoughts_token_count,
        total_tokens: usage.total_token_count,
        details: if details.is_empty() {
            None
        } else {
            Some(details)
        },
    }
}
