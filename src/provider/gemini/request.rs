use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::provider::RequestTarget;
use crate::types::{
    ChatRequest, ContentPart, DocumentContent, ImageContent, MediaSource, Message,
    ReasoningEffort, ResponseFormat, Role, TextContent, ToolChoice, ToolDefinition, ToolResult,
};

/// 构建 Gemini generateContent 请求体
pub(crate) fn build_gemini_body(
    request: &ChatRequest,
    target: RequestTarget<'_>,
) -> Result<Value, LLMError> {
    let mut body = Map::new();

    // 1. system -> systemInstruction，其余 -> contents
    let mut system_parts = Vec::new();
    let mut contents: Vec<Map<String, Value>> = Vec::new();
    let mut previous_was_tool = false;
    for message in &request.messages {
        match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(json!({ "text": text }));
                }
                previous_was_tool = false;
            }
            Role::Tool => {
                let parts: Vec<Value> = message.tool_results().map(convert_tool_result).collect();
                // 同一轮的 functionResponse 放在同一个 content 中
                match contents.last_mut().filter(|_| previous_was_tool) {
                    Some(last) => {
                        if let Some(Value::Array(existing)) = last.get_mut("parts") {
                            existing.extend(parts);
                        }
                    }
                    None => contents.push(content("user", parts)),
                }
                previous_was_tool = true;
            }
            Role::User | Role::Assistant => {
                contents.push(convert_message(message, target)?);
                previous_was_tool = false;
            }
        }
    }
    if contents.is_empty() {
        return Err(LLMError::validation(
            "Gemini request requires at least one user/assistant message",
        ));
    }
    body.insert(
        "contents".to_string(),
        Value::Array(contents.into_iter().map(Value::Object).collect()),
    );
    if !system_parts.is_empty() {
        body.insert(
            "systemInstruction".to_string(),
            json!({ "parts": system_parts }),
        );
    }

    // 2. generationConfig
    let generation_config = build_generation_config(request, target)?;
    if !generation_config.is_empty() {
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
    }

    // 3. 工具与 toolConfig
    if !request.tools.is_empty() {
        if !target.capabilities.supports_tools {
            return Err(LLMError::validation(format!(
                "model {} does not support tools",
                target.model
            )));
        }
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": convert_tools(&request.tools) }]),
        );
    }
    if let Some(choice) = &request.tool_choice {
        body.insert("toolConfig".to_string(), convert_tool_choice(choice));
    }

    // 4. 额外配置（如 safetySettings、cachedContent 等）透传到顶层
    for (k, v) in &request.options.extra {
        body.insert(k.clone(), v.clone());
    }

    Ok(Value::Object(body))
}

fn content(role: &str, parts: Vec<Value>) -> Map<String, Value> {
    let mut obj = Map::new();
    obj.insert("role".to_string(), Value::String(role.to_string()));
    obj.insert("parts".to_string(), Value::Array(parts));
    obj
}

fn convert_message(
    message: &Message,
    target: RequestTarget<'_>,
) -> Result<Map<String, Value>, LLMError> {
    // assistant 映射为 Gemini 的 model
    let role = match message.role {
        Role::Assistant => "model",
        _ => "user",
    };
    let mut parts = Vec::with_capacity(message.content.len());
    for part in &message.content {
        parts.push(convert_content_part(part, message.role, target)?);
    }
    if parts.is_empty() {
        return Err(LLMError::validation(
            "message must contain at least one content part",
        ));
    }
    Ok(content(role, parts))
}

fn convert_content_part(
    part: &ContentPart,
    role: Role,
    target: RequestTarget<'_>,
) -> Result<Value, LLMError> {
    match part {
        ContentPart::Text(TextContent { text }) => Ok(json!({ "text": text })),
        ContentPart::Code(code) => Ok(json!({ "text": code.to_markdown() })),
        ContentPart::Image(image) => convert_image(image, target),
        ContentPart::Document(document) => convert_document(document, target),
        ContentPart::ToolCall(call) if role == Role::Assistant => Ok(json!({
            "functionCall": {
                "name": call.name,
                "args": Value::Object(call.parameters.clone())
            }
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
    Ok(media_part(&image.source, "image/jpeg"))
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
    Ok(media_part(&document.source, "application/pdf"))
}

/// base64 -> inlineData；url / file id -> fileData
fn media_part(source: &MediaSource, default_mime: &str) -> Value {
    match source {
        MediaSource::Base64 { data, mime_type } => json!({
            "inlineData": {
                "mimeType": mime_type.as_deref().unwrap_or(default_mime),
                "data": data
            }
        }),
        MediaSource::Url { url } => json!({
            "fileData": { "mimeType": default_mime, "fileUri": url }
        }),
        MediaSource::FileId { file_id } => json!({
            "fileData": { "mimeType": default_mime, "fileUri": file_id }
        }),
    }
}

fn convert_tool_result(result: &ToolResult) -> Value {
    json!({
        "functionResponse": {
            "name": result.tool_name,
            "response": result.output_value()
        }
    })
}

fn build_generation_config(
    request: &ChatRequest,
    target: RequestTarget<'_>,
) -> Result<Map<String, Value>, LLMError> {
    let mut config = Map::new();
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    let options = &request.options;
    if let Some(top_p) = options.top_p {
        config.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(penalty) = options.presence_penalty {
        config.insert("presencePenalty".to_string(), Value::from(penalty));
    }
    if let Some(penalty) = options.frequency_penalty {
        config.insert("frequencyPenalty".to_string(), Value::from(penalty));
    }
    if !options.stop_sequences.is_empty() {
        config.insert("stopSequences".to_string(), json!(options.stop_sequences));
    }
    if let Some(reasoning) = &options.reasoning {
        let budget = reasoning.budget_tokens.or_else(|| {
            reasoning.effort.map(|effort| match effort {
                ReasoningEffort::Low => 1024,
                ReasoningEffort::Medium => 8192,
                ReasoningEffort::High => 24576,
            })
        });
        if let Some(budget) = budget {
            config.insert(
                "thinkingConfig".to_string(),
                json!({ "thinkingBudget": budget }),
            );
        }
    }
    match &request.response_format {
        None | Some(ResponseFormat::Text) => {}
        Some(format) => {
            if !target.capabilities.supports_structured_output {
                return Err(LLMError::validation(format!(
                    "model {} does not support structured output",
                    target.model
                )));
            }
            config.insert(
                "responseMimeType".to_string(),
                Value::String("application/json".to_string()),
            );
            if let ResponseFormat::JsonSchema { schema, .. } = format {
                config.insert("responseSchema".to_string(), schema.clone());
            }
        }
    }
    Ok(config)
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
            obj.insert("parameters".to_string(), tool.input_schema.clone());
            Value::Object(obj)
        })
        .collect()
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    let config = match choice {
        ToolChoice::Auto => json!({ "mode": "AUTO" }),
        ToolChoice::Any => json!({ "mode": "ANY" }),
        ToolChoice::None => json!({ "mode": "NONE" }),
        ToolChoice::Tool { name } => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
    };
    json!({ "functionCallingConfig": config })
}
