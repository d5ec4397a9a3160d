//! Shared data structures modeling multimodal chat requests, responses and stream deltas.
//!
//! These types normalize provider-specific payloads so the rest of the crate can stay
//! agnostic of individual API differences.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agent::MultiTurnOptions;

mod estimate;
pub mod termination;

pub use estimate::{TokenEstimate, TokenEstimator, TokenizerFamily};
pub use termination::{Confidence, ProviderSpecific, TerminationReason, UnifiedTerminationSignal};

/// Chat role understood by every provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Normalized chat message shared across providers.
///
/// Each message bundles a [`Role`] and a sequence of [`ContentPart`] entries so callers
/// can mix text, images, documents, code and tool directives in a single turn. Messages
/// are treated as immutable once appended to a conversation.
///
/// # Examples
///
/// ```
/// # use kotoba::types::{ContentPart, ImageContent, MediaSource, Message, Role};
/// let mut msg = Message::user("Describe this image");
/// msg.content.push(ContentPart::Image(ImageContent {
///     source: MediaSource::Url { url: "https://example.com/img.png".into() },
///     detail: None,
/// }));
/// assert_eq!(msg.role, Role::User);
/// assert_eq!(msg.content.len(), 2);
/// assert_eq!(msg.text(), "Describe this image");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Optional message identifier, usually the vendor response id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Role associated with this message.
    pub role: Role,
    /// Multimodal content parts provided in order.
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Citations or grounding sources reported by the provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    /// Arbitrary metadata such as usage or finish reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            id: None,
            role,
            content,
            timestamp: None,
            sources: Vec::new(),
            metadata: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Wraps a tool result as a tool-role message used for continuation.
    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(Role::Tool, vec![ContentPart::ToolResult(result)])
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Concatenates every text part in order.
    pub fn text(&self) -> String {
        let mut buffer = String::new();
        for part in &self.content {
            if let ContentPart::Text(TextContent { text }) = part {
                buffer.push_str(text);
            }
        }
        buffer
    }

    /// Tool calls embedded in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    /// Tool results embedded in this message.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(|part| match part {
            ContentPart::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub(crate) fn insert_metadata(&mut self, key: &str, value: Value) {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), value);
    }
}

/// Citation attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: Option<String>,
    pub title: Option<String>,
}

/// Multimodal content part covering text, media, code and tool handoffs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content variant.
    Text(TextContent),
    /// Image content variant.
    Image(ImageContent),
    /// Document (PDF, plain text, ...) variant.
    Document(DocumentContent),
    /// Source code snippet.
    Code(CodeContent),
    /// Tool invocation emitted by the assistant.
    ToolCall(ToolCall),
    /// Tool execution result authored by the tool role.
    ToolResult(ToolResult),
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text(TextContent { text: text.into() })
    }
}

/// Textual content payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    /// Plain UTF-8 text.
    pub text: String,
}

/// Image payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContent {
    /// Source describing where the image bytes come from.
    pub source: MediaSource,
    /// Optional detail hint, honored by OpenAI-style vendors.
    #[serde(default)]
    pub detail: Option<ImageDetail>,
}

/// Document payload such as a PDF.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentContent {
    pub source: MediaSource,
    /// Title or file name shown to the model.
    #[serde(default)]
    pub title: Option<String>,
}

/// Code snippet with an optional language tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeContent {
    #[serde(default)]
    pub language: Option<String>,
    pub code: String,
}

impl CodeContent {
    /// Renders the snippet as a fenced markdown block.
    pub fn to_markdown(&self) -> String {
        format!(
            "```{}\n{}\n```",
            self.language.as_deref().unwrap_or_default(),
            self.code
        )
    }
}

/// Source for image and document inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MediaSource {
    /// Public URL accessible by the provider.
    Url { url: String },
    /// Base64-encoded inline payload.
    Base64 {
        data: String,
        mime_type: Option<String>,
    },
    /// Provider-managed file identifier.
    FileId { file_id: String },
}

/// Detail preset requested for image inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDetail {
    Low,
    High,
    Auto,
}

/// Function tool exposed to the model.
///
/// `input_schema` is a JSON Schema object describing the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: Some(description.into()),
            input_schema,
        }
    }
}

/// Tool invocation requested by the model.
///
/// Created once a response or stream accumulation completes a call and consumed exactly
/// once by the tool router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier unique within one response.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ToolCallMetadata>,
}

/// Provenance of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMetadata {
    pub provider_id: String,
    /// ISO-8601 creation time.
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl ToolCallMetadata {
    pub fn now(provider_id: impl Into<String>, context_id: Option<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            timestamp: iso_timestamp(Utc::now()),
            context_id,
        }
    }
}

/// Formats a timestamp as RFC 3339 with millisecond precision and a `Z` suffix.
pub(crate) fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Outcome of one tool call; exactly one per [`ToolCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    /// Name of the tool that produced this result. Gemini requires it on continuation.
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

/// Error reported by a failed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub code: String,
    pub message: String,
}

impl ToolResult {
    pub fn success(call: &ToolCall, result: Value) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(call: &ToolCall, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            success: false,
            result: None,
            error: Some(ToolErrorInfo {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Text representation sent back to vendors that only accept strings.
    pub fn output_text(&self) -> String {
        match (&self.result, &self.error) {
            (Some(Value::String(text)), _) if self.success => text.clone(),
            (Some(value), _) if self.success => value.to_string(),
            (_, Some(error)) => format!("error [{}]: {}", error.code, error.message),
            _ => String::new(),
        }
    }

    /// JSON object representation used by vendors with structured tool responses.
    pub fn output_value(&self) -> Value {
        if self.success {
            match &self.result {
                Some(Value::Object(map)) => Value::Object(map.clone()),
                Some(other) => serde_json::json!({ "result": other }),
                None => serde_json::json!({}),
            }
        } else {
            serde_json::json!({ "error": self.error })
        }
    }
}

/// Unified chat request.
///
/// `model` must carry the `provider:model` prefix, for example `openai:gpt-4o`.
///
/// # Examples
///
/// ```
/// # use kotoba::types::{ChatRequest, Message};
/// let request = ChatRequest::new("anthropic:claude-3-5-sonnet", vec![Message::user("hi")])
///     .with_max_tokens(256)
///     .with_provider_config("team-a");
/// assert_eq!(request.provider_config.as_deref(), Some("team-a"));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation messages in chronological order.
    pub messages: Vec<Message>,
    /// Provider-qualified model id.
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Tools advertised to the model.
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Remaining sampling and vendor options.
    #[serde(default)]
    pub options: ChatOptions,
    /// Named provider configuration; the `default` configuration when absent.
    #[serde(default)]
    pub provider_config: Option<String>,
    /// Enables the multi-turn agent loop.
    #[serde(default)]
    pub multi_turn: Option<MultiTurnOptions>,
    /// Caller-owned cancellation token.
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_provider_config(mut self, name: impl Into<String>) -> Self {
        self.provider_config = Some(name.into());
        self
    }

    pub fn with_multi_turn(mut self, options: MultiTurnOptions) -> Self {
        self.multi_turn = Some(options);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Sampling and vendor-specific options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub presence_penalty: Option<f32>,
    #[serde(default)]
    pub frequency_penalty: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub reasoning: Option<ReasoningOptions>,
    /// Extra top-level body fields forwarded verbatim.
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// Reasoning / thinking controls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningOptions {
    #[serde(default)]
    pub effort: Option<ReasoningEffort>,
    /// Token budget for vendors with explicit thinking budgets.
    #[serde(default)]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// How the model may pick tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    /// The model must call some tool.
    Any,
    None,
    Tool { name: String },
}

/// Requested output format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    Text,
    JsonObject,
    JsonSchema { name: String, schema: Value },
}

/// Parsed non-streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Assistant message, including tool calls as [`ContentPart::ToolCall`].
    pub message: Message,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<FinishReason>,
    /// Finish reason exactly as the vendor reported it.
    pub raw_finish_reason: Option<String>,
    /// Effective model identifier reported by the provider.
    pub model: Option<String>,
    pub provider: ProviderMetadata,
}

impl ChatResponse {
    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.message.tool_calls()
    }

    /// Returns the message with usage, finish reason and provider info folded into metadata.
    pub fn into_message(self) -> Message {
        let mut message = self.message;
        message.insert_metadata("providerId", Value::String(self.provider.provider));
        if let Some(usage) = &self.usage {
            if let Ok(value) = serde_json::to_value(usage) {
                message.insert_metadata("usage", value);
            }
        }
        if let Some(reason) = &self.finish_reason {
            if let Ok(value) = serde_json::to_value(reason) {
                message.insert_metadata("finishReason", value);
            }
        }
        if let Some(model) = self.model {
            message.insert_metadata("model", Value::String(model));
        }
        message
    }
}

/// Metadata about the provider invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderMetadata {
    pub provider: String,
    pub request_id: Option<String>,
    pub endpoint: Option<String>,
    /// Raw vendor payload for debugging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

/// One incremental fragment of a streamed response.
///
/// Text fragments must be concatenated in `sequence` order to reconstruct the final
/// message. A delta that seals a tool call carries it as [`ContentPart::ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Vendor response id, frozen at the first value seen.
    pub id: String,
    /// Strictly increasing position within the outer stream.
    pub sequence: u64,
    pub delta: PartialMessage,
    pub finished: bool,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    /// Termination verdict, present on the terminal delta.
    #[serde(default)]
    pub termination: Option<UnifiedTerminationSignal>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, Value>>,
}

impl StreamDelta {
    pub fn text(&self) -> String {
        let mut buffer = String::new();
        for part in &self.delta.content {
            if let ContentPart::Text(TextContent { text }) = part {
                buffer.push_str(text);
            }
        }
        buffer
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.delta.content.iter().filter_map(|part| match part {
            ContentPart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    /// Whether this delta seals at least one tool call.
    pub fn completes_tool_call(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}

/// Partial message carried by a [`StreamDelta`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialMessage {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Vec<ContentPart>,
}

/// Token usage metrics collected from the provider.
///
/// # Examples
///
/// ```
/// # use kotoba::types::TokenUsage;
/// let mut total = TokenUsage::default();
/// total.accumulate(&TokenUsage {
///     prompt_tokens: Some(1200),
///     completion_tokens: Some(200),
///     total_tokens: Some(1400),
///     ..TokenUsage::default()
/// });
/// total.accumulate(&TokenUsage {
///     prompt_tokens: Some(10),
///     completion_tokens: Some(5),
///     total_tokens: Some(15),
///     ..TokenUsage::default()
/// });
/// assert_eq!(total.total_tokens, Some(1415));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    /// Vendor-specific counters such as cache reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Value>>,
}

impl TokenUsage {
    /// Adds another usage block into this one, field by field.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        fn add(slot: &mut Option<u64>, value: Option<u64>) {
            if let Some(value) = value {
                *slot = Some(slot.unwrap_or(0) + value);
            }
        }
        add(&mut self.prompt_tokens, other.prompt_tokens);
        add(&mut self.completion_tokens, other.completion_tokens);
        add(&mut self.reasoning_tokens, other.reasoning_tokens);
        add(&mut self.total_tokens, other.total_tokens);
    }
}

/// Normalized stop reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    StopSequence,
    Error,
    Other(String),
}

/// Capabilities of a provider or model.
///
/// Translators consult it to reject content a model cannot accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub supports_stream: bool,
    pub supports_image_input: bool,
    pub supports_document_input: bool,
    pub supports_tools: bool,
    pub supports_structured_output: bool,
    pub supports_parallel_tool_calls: bool,
}

impl Default for CapabilityDescriptor {
    fn default() -> Self {
        Self {
            supports_stream: true,
            supports_image_input: true,
            supports_document_input: true,
            supports_tools: true,
            supports_structured_output: false,
            supports_parallel_tool_calls: false,
        }
    }
}
