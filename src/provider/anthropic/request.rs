use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::provider::RequestTarget;
use crate::types::{
    ChatRequest, ContentPart, DocumentContent, ImageContent, MediaSource, Message,
    ReasoningEffort, ReasoningOptions, ResponseFormat, Role, TextContent, ToolChoice,
    ToolDefinition, ToolResult,
};

pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;

/// 构建 Anthropic Messages 请求体
pub(crate) fn build_anthropic_body(
    request: &ChatRequest,
    target: RequestTarget<'_>,
) -> Result<Value, LLMError> {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));

    // 1. system 折叠为顶层 system，其余进入 messages
    let mut system_texts = Vec::new();
    let mut turns: Vec<Map<String, Value>> = Vec::new();
    let mut previous_was_tool = false;
    for message in &request.messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_texts.push(text);
                }
                previous_was_tool = false;
            }
            Role::Tool => {
                let blocks: Vec<Value> = message.tool_results().map(convert_tool_result).collect();
                // 连续的工具结果合并进同一个 user 回合
                match turns.last_mut().filter(|_| previous_was_tool) {
                    Some(last) => {
                        if let Some(Value::Array(content)) = last.get_mut("content") {
                            content.extend(blocks);
                        }
                    }
                    None => turns.push(turn("user", blocks)),
                }
                previous_was_tool = true;
            }
            Role::User | Role::Assistant => {
                turns.push(convert_message(message, target)?);
                previous_was_tool = false;
            }
        }
    }

    if turns.is_empty() {
        return Err(LLMError::validation(
            "Anthropic Messages request requires at least one user/assistant message",
        ));
    }
    body.insert(
        "messages".to_string(),
        Value::Array(turns.into_iter().map(Value::Object).collect()),
    );
    if !system_texts.is_empty() {
        body.insert("system".to_string(), Value::String(system_texts.join("\n\n")));
    }

    // 2. 采样与生成控制参数
    body.insert(
        "max_tokens".to_string(),
        Value::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    let options = &request.options;
    if let Some(top_p) = options.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if !options.stop_sequences.is_empty() {
        body.insert("stop_sequences".to_string(), json!(options.stop_sequences));
    }

    // 3. thinking
    if let Some(thinking) = options.reasoning.as_ref().and_then(build_thinking) {
        body.insert("thinking".to_string(), thinking);
    }

    // 4. tools 与 tool_choice
    if !request.tools.is_empty() {
        if !target.capabilities.supports_tools {
            return Err(LLMError::validation(format!(
                "model {} does not support tools",
                target.model
            )));
        }
        body.insert("tools".to_string(), Value::Array(convert_tools(&request.tools)));
    }
    if let Some(choice) = &request.tool_choice {
        body.insert(
            "tool_choice".to_string(),
            convert_tool_choice(choice, options.parallel_tool_calls.unwrap_or(true)),
        );
    }

    match &request.response_format {
        None | Some(ResponseFormat::Text) => {}
        Some(_) => {
            return Err(LLMError::validation(
                "anthropic does not support structured response formats",
            ));
        }
    }

    // 5. 透传额外字段
    for (k, v) in &options.extra {
        body.insert(k.clone(), v.clone());
    }

    body.insert("stream".to_string(), Value::Bool(target.stream));
    Ok(Value::Object(body))
}

fn turn(role: &str, content: Vec<Value>) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("role".to_string(), Value::String(role.to_string()));
    obj.insert("content".to_string(), Value::Array(content));
    obj
}

fn convert_message(
    message: &Message,
    target: RequestTarget<'_>,
) -> Result<Map<String, Value>, LLMError> {
    let mut blocks = Vec::with_capacity(message.content.len());
    for part in &message.content {
        blocks.push(convert_content_part(part, message.role, target)?);
    }
    if blocks.is_empty() {
        return Err(LLMError::validation(
            "message must contain at least one content part",
        ));
    }
    Ok(turn(message.role.as_str(), blocks))
}

fn convert_content_part(
    part: &ContentPart,
    role: Role,
    target: RequestTarget<'_>,
) -> Result<Value, LLMError> {
    match part {
        ContentPart::Text(TextContent { text }) => Ok(json!({"type": "text", "text": text})),
        ContentPart::Code(code) => Ok(json!({"type": "text", "text": code.to_markdown()})),
        ContentPart::Image(image) => convert_image(image, target),
        ContentPart::Document(document) => convert_document(document, target),
        ContentPart::ToolCall(call) if role == Role::Assistant => Ok(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": Value::Object(call.parameters.clone())
        })),
        ContentPart::ToolCall(_) => Err(LLMError::validation(
            "tool calls are only valid on assistant messages",
        )),
        ContentPart::ToolResult(_) => Err(LLMError::validation(
            "tool results must be sent with the tool role",
        )),
    }
}

fn convert_image(image: &ImageContent, target: RequestTarget<'_>) -> Result<Value, LLMError> {
    if !target.capabilities.supports_image_input {
        return Err(LLMError::validation(format!(
            "model {} does not accept image input",
            target.model
        )));
    }
    let source = match &image.source {
        MediaSource::Url { url } => json!({"type": "url", "url": url}),
        MediaSource::Base64 { data, mime_type } => json!({
            "type": "base64",
            "media_type": mime_type.as_deref().unwrap_or("image/png"),
            "data": data
        }),
        MediaSource::FileId { .. } => {
            return Err(LLMError::validation("anthropic does not accept file-id images"));
        }
    };
    Ok(json!({"type": "image", "source": source}))
}

fn convert_document(
    document: &DocumentContent,
    target: RequestTarget<'_>,
) -> Result<Value, LLMError> {
    if !target.capabilities.supports_document_input {
        return Err(LLMError::validation(format!(
            "model {} does not accept document input",
            target.model
        )));
    }
    let source = match &document.source {
        MediaSource::Base64 { data, mime_type } => json!({
            "type": "base64",
            "media_type": mime_type.as_deref().unwrap_or("application/pdf"),
            "data": data
        }),
        MediaSource::Url { url } => json!({"type": "url", "url": url}),
        MediaSource::FileId { .. } => {
            return Err(LLMError::validation(
                "anthropic does not accept file-id documents",
            ));
        }
    };
    let mut block = Map::new();
    block.insert("type".to_string(), Value::String("document".to_string()));
    block.insert("source".to_string(), source);
    if let Some(title) = &document.title {
        block.insert("title".to_string(), Value::String(title.clone()));
    }
    Ok(Value::Object(block))
}

fn convert_tool_result(result: &ToolResult) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": result.call_id,
        "content": result.output_text(),
        "is_error": !result.success
    })
}

fn build_thinking(reasoning: &ReasoningOptions) -> Option<Value> {
    let budget = reasoning.budget_tokens.or_else(|| {
        reasoning.effort.map(|effort| match effort {
            ReasoningEffort::Low => 1024,
            ReasoningEffort::Medium => 4096,
            ReasoningEffort::High => 16384,
        })
    })?;
    Some(json!({"type": "enabled", "budget_tokens": budget}))
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut obj = Map::new();
            obj.insert("name".to_string(), Value::String(tool.name.clone()));
            if let Some(description) = &tool.description {
                obj.insert(
                    "description".to_string(),
                    Value::String(description.clone()),
                );
            }
            obj.insert("input_schema".to_string(), tool.input_schema.clone());
            Value::Object(obj)
        })
        .collect()
}

fn convert_tool_choice(choice: &ToolChoice, parallel: bool) -> Value {
    let mut obj = match choice {
        ToolChoice::Auto => json!({"type": "auto"}),
        ToolChoice::Any => json!({"type": "any"}),
        ToolChoice::None => return json!({"type": "none"}),
        ToolChoice::Tool { name } => json!({"type": "tool", "name": name}),
    };
    if !parallel {
        if let Value::Object(map) = &mut obj {
            map.insert("disable_parallel_tool_use".to_string(), Value::Bool(true));
        }
    }
    obj
}
