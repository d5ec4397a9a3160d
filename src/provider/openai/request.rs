use serde_json::{Map, Value, json};

use crate::error::LLMError;
use crate::provider::RequestTarget;
use crate::types::{
    ChatRequest, CodeContent, ContentPart, DocumentContent, ImageContent, ImageDetail, MediaSource,
    Message, ResponseFormat, Role, TextContent, ToolCall, ToolChoice, ToolDefinition, ToolResult,
};

use super::Dialect;

pub(crate) fn build_openai_body(
    request: &ChatRequest,
    target: RequestTarget<'_>,
    dialect: &Dialect,
) -> Result<Value, LLMError> {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(target.model.to_string()));
    body.insert(
        "messages".to_string(),
        Value::Array(convert_messages(&request.messages, target, dialect)?),
    );
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        body.insert(dialect.max_tokens_field.to_string(), Value::from(max_tokens));
    }
    let options = &request.options;
    if let Some(top_p) = options.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(penalty) = options.presence_penalty {
        body.insert("presence_penalty".to_string(), Value::from(penalty));
    }
    if let Some(penalty) = options.frequency_penalty {
        body.insert("frequency_penalty".to_string(), Value::from(penalty));
    }
    if !options.stop_sequences.is_empty() {
        body.insert("stop".to_string(), json!(options.stop_sequences));
    }
    if let Some(effort) = options.reasoning.as_ref().and_then(|r| r.effort) {
        body.insert(
            "reasoning_effort".to_string(),
            Value::String(effort.as_str().to_string()),
        );
    }
    if !request.tools.is_empty() {
        if !target.capabilities.supports_tools {
            return Err(LLMError::validation(format!(
                "model {} does not support tools",
                target.model
            )));
        }
        body.insert("tools".to_string(), Value::Array(convert_tools(&request.tools)));
        if let Some(parallel) = options.parallel_tool_calls {
            body.insert("parallel_tool_calls".to_string(), Value::from(parallel));
        }
    }
    if let Some(choice) = &request.tool_choice {
        body.insert("tool_choice".to_string(), convert_tool_choice(choice));
    }
    if let Some(format) = &request.response_format {
        body.insert(
            "response_format".to_string(),
            convert_response_format(format),
        );
    }
    for (k, v) in &options.extra {
        body.insert(k.clone(), v.clone());
    }
    body.insert("stream".to_string(), Value::Bool(target.stream));
    if target.stream {
        body.insert("stream_options".to_string(), json!({"include_usage": true}));
    }
    Ok(Value::Object(body))
}

fn convert_messages(
    messages: &[Message],
    target: RequestTarget<'_>,
    dialect: &Dialect,
) -> Result<Vec<Value>, LLMError> {
    let mut converted = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::Tool {
            // 每个工具结果单独成为一条 tool 消息
            for result in message.tool_results() {
                converted.push(convert_tool_result(result));
            }
            continue;
        }
        converted.push(convert_message(message, target, dialect)?);
    }
    Ok(converted)
}

fn convert_message(
    message: &Message,
    target: RequestTarget<'_>,
    dialect: &Dialect,
) -> Result<Value, LLMError> {
    let mut obj = Map::new();
    obj.insert(
        "role".to_string(),
        Value::String(message.role.as_str().to_string()),
    );

    let mut content_parts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in &message.content {
        match part {
            ContentPart::ToolCall(call) => tool_calls.push(convert_tool_call(call)?),
            ContentPart::ToolResult(_) => {
                return Err(LLMError::validation(format!(
                    "{} messages cannot carry tool results",
                    message.role.as_str()
                )));
            }
            other => content_parts.push(convert_content_part(other, target, dialect)?),
        }
    }

    let content = if content_parts.is_empty() {
        Value::Null
    } else if message.role == Role::System {
        // system 只接受纯文本
        let text = content_parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        Value::String(text)
    } else {
        Value::Array(content_parts)
    };
    obj.insert("content".to_string(), content);
    if !tool_calls.is_empty() {
        obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
    }
    Ok(Value::Object(obj))
}

fn convert_content_part(
    part: &ContentPart,
    target: RequestTarget<'_>,
    dialect: &Dialect,
) -> Result<Value, LLMError> {
    match part {
        ContentPart::Text(TextContent { text }) => Ok(json!({"type": "text", "text": text})),
        ContentPart::Code(code) => Ok(json!({"type": "text", "text": CodeContent::to_markdown(code)})),
        ContentPart::Image(image) => convert_image(image, target, dialect),
        ContentPart::Document(document) => convert_document(document, dialect),
        ContentPart::ToolCall(_) | ContentPart::ToolResult(_) => Err(LLMError::validation(
            "tool content must use dedicated fields",
        )),
    }
}

fn convert_image(
    image: &ImageContent,
    target: RequestTarget<'_>,
    dialect: &Dialect,
) -> Result<Value, LLMError> {
    if !target.capabilities.supports_image_input {
        return Err(LLMError::validation(format!(
            "model {} does not accept image input",
            target.model
        )));
    }
    let detail = match image.detail {
        Some(ImageDetail::Low) => "low",
        Some(ImageDetail::High) => "high",
        Some(ImageDetail::Auto) | None => "auto",
    };
    let url = match &image.source {
        MediaSource::Url { url } => url.clone(),
        MediaSource::Base64 { data, mime_type } => {
            let mime = mime_type.as_deref().unwrap_or("image/png");
            format!("data:{mime};base64,{data}")
        }
        MediaSource::FileId { .. } => {
            return Err(LLMError::validation(format!(
                "{} does not accept file-id images",
                dialect.provider
            )));
        }
    };
    Ok(json!({
        "type": "image_url",
        "image_url": { "url": url, "detail": detail }
    }))
}

fn convert_document(document: &DocumentContent, dialect: &Dialect) -> Result<Value, LLMError> {
    if !dialect.documents {
        return Err(LLMError::validation(format!(
            "{} does not accept document input",
            dialect.provider
        )));
    }
    match &document.source {
        MediaSource::Base64 { data, mime_type } => {
            let mime = mime_type.as_deref().unwrap_or("application/pdf");
            let mut file = Map::new();
            file.insert(
                "file_data".to_string(),
                Value::String(format!("data:{mime};base64,{data}")),
            );
            file.insert(
                "filename".to_string(),
                Value::String(document.title.clone().unwrap_or_else(|| "document".to_string())),
            );
            Ok(json!({"type": "file", "file": Value::Object(file)}))
        }
        MediaSource::FileId { file_id } => Ok(json!({
            "type": "file",
            "file": { "file_id": file_id }
        })),
        MediaSource::Url { .. } => Err(LLMError::validation(format!(
            "{} does not accept document URLs",
            dialect.provider
        ))),
    }
}

fn convert_tool_call(call: &ToolCall) -> Result<Value, LLMError> {
    let arguments = serde_json::to_string(&call.parameters)
        .map_err(|err| LLMError::validation(format!("invalid tool arguments: {err}")))?;
    Ok(json!({
        "id": call.id,
        "type": "function",
        "function": {
            "name": call.name,
            "arguments": arguments
        }
    }))
}

fn convert_tool_result(result: &ToolResult) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": result.call_id,
        "content": result.output_text()
    })
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut function = Map::new();
            function.insert("name".to_string(), Value::String(tool.name.clone()));
            if let Some(description) = &tool.description {
                function.insert(
                    "description".to_string(),
                    Value::String(description.clone()),
                );
            }
            function.insert("parameters".to_string(), tool.input_schema.clone());
            json!({"type": "function", "function": Value::Object(function)})
        })
        .collect()
}

fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::Any => Value::String("required".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        ToolChoice::Tool { name } => json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

fn convert_response_format(format: &ResponseFormat) -> Value {
    match format {
        ResponseFormat::Text => json!({"type": "text"}),
        ResponseFormat::JsonObject => json!({"type": "json_object"}),
        ResponseFormat::JsonSchema { name, schema } => json!({
            "type": "json_schema",
            "json_schema": { "name": name, "schema": schema }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::openai::{OPENAI_DIALECT, XAI_DIALECT};
    use crate::types::{CapabilityDescriptor, ToolCallMetadata};

    fn target<'a>(capabilities: &'a CapabilityDescriptor, stream: bool) -> RequestTarget<'a> {
        RequestTarget {
            model: "gpt-4o",
            stream,
            capabilities,
        }
    }

    #[test]
    fn builds_streaming_body_with_tools_and_results() {
        let caps = CapabilityDescriptor::default();
        let call = ToolCall {
            id: "call_1".into(),
            name: "weather".into(),
            parameters: Map::from_iter([("city".to_string(), json!("Paris"))]),
            metadata: Some(ToolCallMetadata::now("openai", None)),
        };
        let mut assistant = Message::new(Role::Assistant, vec![ContentPart::ToolCall(call.clone())]);
        assistant.id = Some("chatcmpl-1".into());
        let request = ChatRequest::new(
            "openai:gpt-4o",
            vec![
                Message::system("be brief"),
                Message::user("weather?"),
                assistant,
                Message::tool_result(ToolResult::success(&call, json!({"temp": 20}))),
            ],
        )
        .with_tools(vec![ToolDefinition::new(
            "weather",
            "look up weather",
            json!({"type": "object"}),
        )])
        .with_tool_choice(ToolChoice::Any)
        .with_max_tokens(64);

        let body = build_openai_body(&request, target(&caps, true), &OPENAI_DIALECT).expect("body");
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["max_completion_tokens"], json!(64));
        assert_eq!(body["tool_choice"], json!("required"));
        assert_eq!(body["tools"][0]["function"]["name"], json!("weather"));

        let messages = body["messages"].as_array().expect("messages");
        assert_eq!(messages[0]["content"], json!("be brief"));
        assert_eq!(messages[2]["content"], Value::Null);
        assert_eq!(
            messages[2]["tool_calls"][0]["function"]["arguments"],
            json!("{\"city\":\"Paris\"}")
        );
        assert_eq!(messages[3]["role"], json!("tool"));
        assert_eq!(messages[3]["tool_call_id"], json!("call_1"));
        assert_eq!(messages[3]["content"], json!("{\"temp\":20}"));
    }

    #[test]
    fn rejects_unsupported_content() {
        let caps = CapabilityDescriptor::default();
        let document = ContentPart::Document(DocumentContent {
            source: MediaSource::Base64 {
                data: "AAAA".into(),
                mime_type: None,
            },
            title: None,
        });
        let request = ChatRequest::new(
            "xai:grok",
            vec![Message::new(Role::User, vec![document])],
        );
        assert!(matches!(
            build_openai_body(&request, target(&caps, false), &XAI_DIALECT),
            Err(LLMError::Validation { .. })
        ));
        let body = build_openai_body(&request, target(&caps, false), &OPENAI_DIALECT).expect("body");
        assert_eq!(body["messages"][0]["content"][0]["type"], json!("file"));

        let no_images = CapabilityDescriptor {
            supports_image_input: false,
            ..CapabilityDescriptor::default()
        };
        let image = ContentPart::Image(ImageContent {
            source: MediaSource::Url {
                url: "https://example.com/a.png".into(),
            },
            detail: None,
        });
        let request = ChatRequest::new("openai:gpt", vec![Message::new(Role::User, vec![image])]);
        assert!(matches!(
            build_openai_body(&request, target(&no_images, false), &OPENAI_DIALECT),
            Err(LLMError::Validation { .. })
        ));
    }

    #[test]
    fn code_is_rendered_as_fenced_text() {
        let caps = CapabilityDescriptor::default();
        let code = ContentPart::Code(CodeContent {
            language: Some("py".into()),
            code: "print(1)".into(),
        });
        let request = ChatRequest::new("openai:gpt", vec![Message::new(Role::User, vec![code])]);
        let body = build_openai_body(&request, target(&caps, false), &OPENAI_DIALECT).expect("body");
        assert_eq!(
            body["messages"][0]["content"][0]["text"],
            json!("```py\nprint(1)\n```")
        );
        assert!(body.get("stream_options").is_none());
    }
}
