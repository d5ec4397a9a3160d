//! Server-Sent-Event scanning and the shared delta state machine.
//!
//! [`SseScanner`] turns a raw body into frames. Each vendor plugs a [`FrameDecoder`] into
//! [`decode_stream`], which owns the cross-frame [`StreamState`]: the frozen response id,
//! per-call tool argument buffers and the last usage block.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::LLMError;
use crate::http::HttpBodyStream;
use crate::types::{
    ChatResponse, ContentPart, FinishReason, Message, PartialMessage, ProviderMetadata, Role,
    StreamDelta, TerminationReason, TokenUsage, ToolCall, ToolCallMetadata,
    UnifiedTerminationSignal,
};

/// Lazy, single-pass sequence of unified deltas.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta, LLMError>> + Send>>;

/// One SSE frame: the optional `event:` name and the joined `data:` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Standardized SSE event yielded by [`SseScanner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Frame(SseFrame),
    /// Terminal marker reported via `[DONE]`.
    Done,
}

/// Splits a provider body into [`SseEvent`] values.
///
/// Frames that are not valid UTF-8 are skipped with a debug log.
pub struct SseScanner {
    body: HttpBodyStream,
    buffer: Vec<u8>,
    data_lines: Vec<Vec<u8>>,
    event_name: Option<String>,
    pending: VecDeque<SseEvent>,
    provider: &'static str,
    stream_closed: bool,
    done_received: bool,
}

impl SseScanner {
    pub fn new(body: HttpBodyStream, provider: &'static str) -> Self {
        Self {
            body,
            buffer: Vec::new(),
            data_lines: Vec::new(),
            event_name: None,
            pending: VecDeque::new(),
            provider,
            stream_closed: false,
            done_received: false,
        }
    }

    fn handle_line(&mut self, line: Vec<u8>) {
        if let Some(rest) = line.strip_prefix(b"data:") {
            let data = rest.strip_prefix(b" ").unwrap_or(rest);
            self.data_lines.push(data.to_vec());
        } else if let Some(rest) = line.strip_prefix(b"event:") {
            let name = String::from_utf8_lossy(rest).trim().to_string();
            self.event_name = Some(name);
        }
        // id: / retry: / 注释行忽略
    }

    fn flush_event(&mut self) {
        let event = self.event_name.take();
        if self.data_lines.is_empty() {
            return;
        }

        let mut joined = Vec::new();
        for (idx, mut segment) in self.data_lines.drain(..).enumerate() {
            if idx > 0 {
                joined.push(b'\n');
            }
            joined.append(&mut segment);
        }
        if joined.is_empty() {
            return;
        }

        let data = match String::from_utf8(joined) {
            Ok(data) => data,
            Err(err) => {
                debug!(provider = self.provider, error = %err, "skipping SSE frame with invalid UTF-8");
                return;
            }
        };

        if data.trim() == "[DONE]" {
            if !self.done_received {
                self.done_received = true;
                self.pending.push_back(SseEvent::Done);
            }
        } else if !self.done_received {
            self.pending.push_back(SseEvent::Frame(SseFrame { event, data }));
        }
    }

    fn drain_line(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
        buffer.iter().position(|b| *b == b'\n').map(|pos| {
            let mut line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            line
        })
    }
}

impl Stream for SseScanner {
    type Item = Result<SseEvent, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        if this.done_received || this.stream_closed {
            return Poll::Ready(None);
        }

        loop {
            match this.body.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.buffer.extend_from_slice(&bytes);
                    while let Some(line) = Self::drain_line(&mut this.buffer) {
                        if line.is_empty() {
                            this.flush_event();
                        } else {
                            this.handle_line(line);
                        }
                    }
                    if let Some(event) = this.pending.pop_front() {
                        return Poll::Ready(Some(Ok(event)));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    this.stream_closed = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    this.stream_closed = true;
                    if !this.buffer.is_empty() {
                        let line = std::mem::take(&mut this.buffer);
                        this.handle_line(line);
                    }
                    this.flush_event();
                    return Poll::Ready(this.pending.pop_front().map(Ok));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Parses a frame payload, skipping it with a debug log when it is not valid JSON.
pub(crate) fn parse_frame<T: DeserializeOwned>(frame: &SseFrame, provider: &'static str) -> Option<T> {
    match serde_json::from_str(&frame.data) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(provider, error = %err, event = ?frame.event, "skipping unparseable stream frame");
            None
        }
    }
}

/// Converts a raw argument string into a JSON object.
///
/// Empty input becomes `{}`, non-object JSON is wrapped as `{"input": value}` and invalid
/// JSON is kept verbatim under `input`.
pub fn parse_tool_arguments(raw: &str, provider: &str, tool: &str) -> Map<String, Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Map::new();
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        Ok(other) => Map::from_iter([("input".to_string(), other)]),
        Err(err) => {
            warn!(provider, tool, error = %err, "tool arguments are not valid JSON");
            Map::from_iter([("input".to_string(), Value::String(raw.to_string()))])
        }
    }
}

/// Normalizes already-parsed arguments the same way as [`parse_tool_arguments`].
pub(crate) fn arguments_from_value(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => Map::from_iter([("input".to_string(), other)]),
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    name: String,
    arguments: String,
}

/// Accumulates tool-call fragments keyed by call id, in first-seen order.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    order: Vec<String>,
    entries: HashMap<String, PartialToolCall>,
    index_to_id: HashMap<usize, String>,
}

impl ToolCallAccumulator {
    /// Registers a call; a later non-empty name overrides an empty one.
    pub fn begin(&mut self, id: &str, name: Option<&str>) {
        if !self.entries.contains_key(id) {
            self.order.push(id.to_string());
        }
        let entry = self.entries.entry(id.to_string()).or_default();
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            entry.name = name.to_string();
        }
    }

    /// Appends an argument fragment. Fragments are concatenated, never replaced.
    pub fn append(&mut self, id: &str, fragment: &str) {
        if !self.entries.contains_key(id) {
            self.begin(id, None);
        }
        if let Some(entry) = self.entries.get_mut(id) {
            entry.arguments.push_str(fragment);
        }
    }

    /// Maps a vendor block/slot index to a call id.
    pub fn bind_index(&mut self, index: usize, id: &str) {
        self.index_to_id.insert(index, id.to_string());
    }

    pub fn id_for_index(&self, index: usize) -> Option<String> {
        self.index_to_id.get(&index).cloned()
    }

    pub fn arguments(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|entry| entry.arguments.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Completes one call and removes it from the buffer.
    pub fn seal(&mut self, id: &str, provider: &'static str) -> Option<ToolCall> {
        let entry = self.entries.remove(id)?;
        self.order.retain(|existing| existing != id);
        self.index_to_id.retain(|_, existing| existing != id);
        Some(ToolCall {
            id: id.to_string(),
            parameters: parse_tool_arguments(&entry.arguments, provider, &entry.name),
            name: entry.name,
            metadata: Some(ToolCallMetadata::now(provider, None)),
        })
    }

    /// Completes every pending call in first-seen order.
    pub fn seal_all(&mut self, provider: &'static str) -> Vec<ToolCall> {
        let order = std::mem::take(&mut self.order);
        order
            .iter()
            .filter_map(|id| self.seal(id, provider))
            .collect()
    }
}

/// Cross-frame state shared by every vendor decoder.
#[derive(Debug)]
pub struct StreamState {
    provider: &'static str,
    response_id: Option<String>,
    pub(crate) tool_calls: ToolCallAccumulator,
    usage: Option<TokenUsage>,
    sequence: u64,
    role_sent: bool,
}

impl StreamState {
    pub fn new(provider: &'static str) -> Self {
        Self {
            provider,
            response_id: None,
            tool_calls: ToolCallAccumulator::default(),
            usage: None,
            sequence: 0,
            role_sent: false,
        }
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    /// Records the response id; only the first value is kept.
    pub fn observe_response_id(&mut self, id: &str) {
        if self.response_id.is_none() && !id.is_empty() {
            self.response_id = Some(id.to_string());
        }
    }

    pub fn response_id(&self) -> Option<&str> {
        self.response_id.as_deref()
    }

    /// Keeps the most recent usage block.
    pub fn record_usage(&mut self, usage: TokenUsage) {
        self.usage = Some(usage);
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }

    /// Builds a non-terminal delta.
    pub fn delta(&mut self, content: Vec<ContentPart>) -> StreamDelta {
        let role = if self.role_sent {
            None
        } else {
            self.role_sent = true;
            Some(Role::Assistant)
        };
        let sequence = self.sequence;
        self.sequence += 1;
        StreamDelta {
            id: self.response_id.clone().unwrap_or_default(),
            sequence,
            delta: PartialMessage { role, content },
            finished: false,
            usage: None,
            termination: None,
            metadata: None,
        }
    }

    pub fn text(&mut self, text: &str) -> StreamDelta {
        self.delta(vec![ContentPart::text(text)])
    }

    /// Builds the terminal delta, sealing leftover tool calls and attaching the last usage.
    pub fn finish(&mut self, signal: UnifiedTerminationSignal) -> StreamDelta {
        let leftovers = self.tool_calls.seal_all(self.provider);
        let mut delta = self.delta(leftovers.into_iter().map(ContentPart::ToolCall).collect());
        delta.finished = signal.should_terminate;
        delta.usage = self.usage.clone();
        delta.termination = Some(signal);
        delta
    }
}

/// Vendor-specific frame interpretation plugged into [`decode_stream`].
pub(crate) trait FrameDecoder: Send + 'static {
    /// Interprets one frame. A returned delta with `finished = true` ends the stream.
    fn decode(&mut self, frame: SseFrame, state: &mut StreamState) -> Result<Vec<StreamDelta>, LLMError>;

    /// Called on the `[DONE]` sentinel.
    fn on_sentinel(&mut self, state: &mut StreamState) -> Vec<StreamDelta> {
        vec![state.finish(UnifiedTerminationSignal::terminal(
            TerminationReason::NaturalCompletion,
            crate::types::Confidence::Medium,
            "[DONE]",
            None,
        ))]
    }

    /// Called when the body ends without a terminal marker.
    fn on_eof(&mut self, state: &mut StreamState) -> Vec<StreamDelta> {
        warn!(provider = state.provider(), "stream ended without a terminal event");
        vec![state.finish(
            UnifiedTerminationSignal::finished_without_status("eof")
                .with_message("stream ended without a terminal event"),
        )]
    }
}

struct DecodedStream<D> {
    scanner: SseScanner,
    decoder: D,
    state: StreamState,
    pending: VecDeque<StreamDelta>,
    terminated: bool,
}

impl<D: FrameDecoder> DecodedStream<D> {
    fn enqueue(&mut self, deltas: Vec<StreamDelta>) {
        for delta in deltas {
            if self.terminated {
                break;
            }
            if delta.finished {
                self.terminated = true;
            }
            self.pending.push_back(delta);
        }
    }
}

impl<D: FrameDecoder + Unpin> Stream for DecodedStream<D> {
    type Item = Result<StreamDelta, LLMError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(delta) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(delta)));
            }
            if this.terminated {
                return Poll::Ready(None);
            }
            match this.scanner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(SseEvent::Frame(frame)))) => {
                    match this.decoder.decode(frame, &mut this.state) {
                        Ok(deltas) => this.enqueue(deltas),
                        Err(err) => {
                            this.terminated = true;
                            return Poll::Ready(Some(Err(err)));
                        }
                    }
                }
                Poll::Ready(Some(Ok(SseEvent::Done))) => {
                    let deltas = this.decoder.on_sentinel(&mut this.state);
                    this.enqueue(deltas);
                    this.terminated = true;
                }
                Poll::Ready(Some(Err(err))) => {
                    this.terminated = true;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(None) => {
                    let deltas = this.decoder.on_eof(&mut this.state);
                    this.enqueue(deltas);
                    this.terminated = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Runs a vendor decoder over an SSE body.
pub(crate) fn decode_stream<D>(body: HttpBodyStream, provider: &'static str, decoder: D) -> DeltaStream
where
    D: FrameDecoder + Unpin,
{
    Box::pin(DecodedStream {
        scanner: SseScanner::new(body, provider),
        decoder,
        state: StreamState::new(provider),
        pending: VecDeque::new(),
        terminated: false,
    })
}

/// Folds a delta stream into a single response.
///
/// Text is concatenated in order, sealed tool calls are kept, and the last usage block and
/// termination verdict win.
pub async fn collect_stream(mut stream: DeltaStream, provider: &str) -> Result<ChatResponse, LLMError> {
    let mut id = None;
    let mut text = String::new();
    let mut parts = Vec::new();
    let mut usage = None;
    let mut termination: Option<UnifiedTerminationSignal> = None;

    while let Some(delta) = stream.next().await {
        let delta = delta?;
        if id.is_none() && !delta.id.is_empty() {
            id = Some(delta.id.clone());
        }
        for part in delta.delta.content {
            match part {
                ContentPart::Text(fragment) => text.push_str(&fragment.text),
                other => parts.push(other),
            }
        }
        if delta.usage.is_some() {
            usage = delta.usage;
        }
        if delta.termination.is_some() {
            termination = delta.termination;
        }
        if delta.finished {
            break;
        }
    }

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentPart::text(text));
    }
    content.extend(parts);
    let has_tool_calls = content
        .iter()
        .any(|part| matches!(part, ContentPart::ToolCall(_)));

    let finish_reason = termination.as_ref().and_then(|signal| match signal.reason {
        TerminationReason::NaturalCompletion if has_tool_calls => Some(FinishReason::ToolCalls),
        TerminationReason::NaturalCompletion => Some(FinishReason::Stop),
        TerminationReason::TokenLimitReached => Some(FinishReason::Length),
        TerminationReason::StopSequence => Some(FinishReason::StopSequence),
        TerminationReason::ContentFiltered => Some(FinishReason::ContentFilter),
        TerminationReason::Error => Some(FinishReason::Error),
        TerminationReason::Unknown => None,
    });

    let mut message = Message::new(Role::Assistant, content);
    message.id = id.clone();

    Ok(ChatResponse {
        message,
        usage,
        finish_reason,
        raw_finish_reason: termination.and_then(|signal| signal.provider_specific.original_value),
        model: None,
        provider: ProviderMetadata {
            provider: provider.to_string(),
            request_id: id,
            endpoint: None,
            raw: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use futures_util::stream;
    use serde_json::json;

    use super::*;

    fn build_body(chunks: Vec<Result<Vec<u8>, LLMError>>) -> HttpBodyStream {
        Box::pin(stream::iter(chunks))
    }

    #[tokio::test]
    async fn scanner_emits_frames_and_done() {
        let chunks = vec![
            Ok(b"event: message_start\ndata: {\"text\":\"hi\"}\n\n".to_vec()),
            Ok(b"data: [DONE]\n\n".to_vec()),
            Ok(b"data: {\"late\":true}\n\n".to_vec()),
        ];
        let mut scanner = SseScanner::new(build_body(chunks), "test_provider");

        let first = scanner.next().await.expect("event").expect("ok");
        assert_eq!(
            first,
            SseEvent::Frame(SseFrame {
                event: Some("message_start".into()),
                data: "{\"text\":\"hi\"}".into(),
            })
        );
        assert_eq!(scanner.next().await.expect("event").expect("ok"), SseEvent::Done);
        assert!(scanner.next().await.is_none());
    }

    #[tokio::test]
    async fn scanner_joins_multiline_and_split_chunks() {
        let chunks = vec![
            Ok(b"data: line one\r\n".to_vec()),
            Ok(b"data: line ".to_vec()),
            Ok(b"two\n\n".to_vec()),
        ];
        let mut scanner = SseScanner::new(build_body(chunks), "test_provider");
        let event = scanner.next().await.expect("event").expect("ok");
        assert_eq!(
            event,
            SseEvent::Frame(SseFrame {
                event: None,
                data: "line one\nline two".into(),
            })
        );
        assert!(scanner.next().await.is_none());
    }

    #[tokio::test]
    async fn scanner_skips_invalid_utf8_frames() {
        let chunks = vec![Ok(b"data: \xff\n\ndata: ok\n\n".to_vec())];
        let mut scanner = SseScanner::new(build_body(chunks), "test_provider");
        let event = scanner.next().await.expect("event").expect("ok");
        assert_eq!(
            event,
            SseEvent::Frame(SseFrame {
                event: None,
                data: "ok".into(),
            })
        );
    }

    #[test]
    fn tool_arguments_follow_fallback_rules() {
        assert!(parse_tool_arguments("", "p", "t").is_empty());
        assert_eq!(
            Value::Object(parse_tool_arguments(r#"{"a":1}"#, "p", "t")),
            json!({"a": 1})
        );
        assert_eq!(
            Value::Object(parse_tool_arguments("[1,2]", "p", "t")),
            json!({"input": [1, 2]})
        );
        assert_eq!(
            Value::Object(parse_tool_arguments("{\"a\":", "p", "t")),
            json!({"input": "{\"a\":"})
        );
    }

    #[test]
    fn accumulator_concatenates_fragments_per_id() {
        let mut acc = ToolCallAccumulator::default();
        acc.begin("call_a", Some("weather"));
        acc.bind_index(0, "call_a");
        acc.begin("call_b", Some("time"));
        acc.append("call_a", "{\"city\":");
        acc.append("call_b", "{}");
        acc.append("call_a", "\"Paris\"}");
        assert_eq!(acc.id_for_index(0).as_deref(), Some("call_a"));
        assert_eq!(acc.arguments("call_a"), Some("{\"city\":\"Paris\"}"));

        let sealed = acc.seal_all("test");
        assert_eq!(sealed.len(), 2);
        assert_eq!(sealed[0].id, "call_a");
        assert_eq!(sealed[0].parameters["city"], json!("Paris"));
        assert_eq!(sealed[1].name, "time");
        assert!(acc.is_empty());
    }

    struct EchoDecoder;

    impl FrameDecoder for EchoDecoder {
        fn decode(
            &mut self,
            frame: SseFrame,
            state: &mut StreamState,
        ) -> Result<Vec<StreamDelta>, LLMError> {
            let Some(value) = parse_frame::<Value>(&frame, "test") else {
                return Ok(Vec::new());
            };
            if let Some(id) = value["id"].as_str() {
                state.observe_response_id(id);
            }
            if value.get("usage").is_some() {
                state.record_usage(TokenUsage {
                    total_tokens: value["usage"].as_u64(),
                    ..TokenUsage::default()
                });
            }
            Ok(value["text"]
                .as_str()
                .map(|text| vec![state.text(text)])
                .unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn decoded_stream_freezes_id_and_finishes_on_eof() {
        let body = build_body(vec![Ok(concat!(
            "data: {\"id\":\"first\",\"text\":\"Hel\"}\n\n",
            "data: not json\n\n",
            "data: {\"id\":\"second\",\"text\":\"lo\",\"usage\":3}\n\n",
            "data: {\"usage\":9}\n\n",
        )
        .as_bytes()
        .to_vec())]);
        let deltas: Vec<_> = decode_stream(body, "test", EchoDecoder)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|delta| delta.expect("ok"))
            .collect();

        assert_eq!(deltas.len(), 3);
        assert!(deltas.iter().all(|delta| delta.id == "first"));
        assert_eq!(
            deltas.iter().map(|d| d.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let last = deltas.last().expect("terminal");
        assert!(last.finished);
        assert_eq!(last.usage.as_ref().and_then(|u| u.total_tokens), Some(9));
        let signal = last.termination.as_ref().expect("signal");
        assert_eq!(signal.confidence, crate::types::Confidence::Low);
    }

    #[tokio::test]
    async fn collect_stream_folds_text_and_usage() {
        let body = build_body(vec![Ok(concat!(
            "data: {\"id\":\"r1\",\"text\":\"Hel\"}\n\n",
            "data: {\"text\":\"lo\",\"usage\":4}\n\n",
            "data: [DONE]\n\n",
        )
        .as_bytes()
        .to_vec())]);
        let response = collect_stream(decode_stream(body, "test", EchoDecoder), "test")
            .await
            .expect("collect");
        assert_eq!(response.message.text(), "Hello");
        assert_eq!(response.message.id.as_deref(), Some("r1"));
        assert_eq!(response.usage.and_then(|u| u.total_tokens), Some(4));
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn body_errors_end_the_stream() {
        let body = build_body(vec![
            Ok(b"data: {\"text\":\"a\"}\n\n".to_vec()),
            Err(LLMError::transport("connection reset")),
        ]);
        let items: Vec<_> = decode_stream(body, "test", EchoDecoder).collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(LLMError::Transport { .. })));
    }
}
