use std::collections::HashMap;

use super::{ChatRequest, ContentPart, ImageContent, ImageDetail, Message, ResponseFormat};

/// Groups provider families that share similar tokenization characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerFamily {
    /// OpenAI-style tokenizer with ~4 ASCII chars per token. xAI shares it.
    OpenAI,
    /// Anthropic Claude models follow OpenAI-like heuristics for mixed locales.
    Anthropic,
    /// Google Gemini tokenizes English slightly more aggressively (~4.5 chars/token).
    Gemini,
}

impl TokenizerFamily {
    /// Picks the family for a provider plugin id, falling back to OpenAI heuristics.
    pub fn for_provider(provider_id: &str) -> Self {
        match provider_id {
            "anthropic" => TokenizerFamily::Anthropic,
            "gemini" => TokenizerFamily::Gemini,
            _ => TokenizerFamily::OpenAI,
        }
    }
}

/// Estimates token counts using provider-specific heuristics.
///
/// The counts are approximate but deterministic. The agent loop uses them to track
/// how large a conversation has grown between iterations.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    family: TokenizerFamily,
}

impl TokenEstimator {
    pub fn new(family: TokenizerFamily) -> Self {
        Self { family }
    }

    pub fn for_provider(provider_id: &str) -> Self {
        Self::new(TokenizerFamily::for_provider(provider_id))
    }

    pub fn family(&self) -> TokenizerFamily {
        self.family
    }

    /// Estimates the number of tokens for a piece of text.
    pub fn estimate_text(&self, text: &str) -> usize {
        let mut total_chars = 0usize;
        let mut ascii_chars = 0usize;
        for ch in text.chars() {
            total_chars += 1;
            if ch.is_ascii() {
                ascii_chars += 1;
            }
        }
        if total_chars == 0 {
            return 0;
        }

        let ascii_ratio = ascii_chars as f64 / total_chars as f64;
        let chars_per_token = match self.family {
            TokenizerFamily::OpenAI | TokenizerFamily::Anthropic => 2.0 + 2.0 * ascii_ratio,
            TokenizerFamily::Gemini => 4.5,
        };
        ((total_chars as f64) / chars_per_token).ceil() as usize
    }

    /// Estimates the tokens of a message list with a per-role breakdown.
    ///
    /// # Examples
    ///
    /// ```
    /// # use kotoba::types::{Message, TokenEstimator, TokenizerFamily};
    /// let messages = vec![Message::system("You are terse"), Message::user("Explain enums")];
    /// let estimate = TokenEstimator::new(TokenizerFamily::OpenAI).estimate_messages(&messages);
    /// assert!(estimate.total > 0);
    /// assert!(estimate.by_role.contains_key("system"));
    /// ```
    pub fn estimate_messages(&self, messages: &[Message]) -> TokenEstimate {
        const OVERHEAD_PER_MESSAGE: usize = 4;

        let mut total = 0usize;
        let mut by_role: HashMap<String, usize> = HashMap::new();
        for message in messages {
            let tokens = OVERHEAD_PER_MESSAGE
                + message
                    .content
                    .iter()
                    .map(|part| self.estimate_content_part(part))
                    .sum::<usize>();
            *by_role.entry(message.role.as_str().to_string()).or_insert(0) += tokens;
            total += tokens;
        }

        TokenEstimate {
            total,
            by_role,
            overhead: OVERHEAD_PER_MESSAGE * messages.len(),
        }
    }

    /// Estimates the tokens for an entire chat request, including tools and output format.
    pub fn estimate_request(&self, request: &ChatRequest) -> TokenEstimate {
        let mut estimate = self.estimate_messages(&request.messages);
        estimate.total += request.tools.len() * 50;
        if let Some(format) = &request.response_format {
            estimate.total += self.estimate_response_format(format);
        }
        estimate
    }

    fn estimate_content_part(&self, part: &ContentPart) -> usize {
        match part {
            ContentPart::Text(text) => self.estimate_text(&text.text),
            ContentPart::Image(image) => self.estimate_image_tokens(image),
            ContentPart::Document(_) => 1000,
            ContentPart::Code(code) => self.estimate_text(&code.code),
            ContentPart::ToolCall(call) => {
                self.estimate_text(&serde_json::to_string(call).unwrap_or_default())
            }
            ContentPart::ToolResult(result) => self.estimate_text(&result.output_text()),
        }
    }

    fn estimate_image_tokens(&self, image: &ImageContent) -> usize {
        let base = match self.family {
            TokenizerFamily::Gemini => 600,
            _ => 760,
        };
        match image.detail {
            Some(ImageDetail::High) => base * 2,
            _ => base,
        }
    }

    fn estimate_response_format(&self, format: &ResponseFormat) -> usize {
        match format {
            ResponseFormat::JsonObject => 20,
            ResponseFormat::JsonSchema { schema, .. } => self.estimate_text(&schema.to_string()),
            ResponseFormat::Text => 0,
        }
    }
}

/// Token estimate breakdown.
#[derive(Debug, Clone)]
pub struct TokenEstimate {
    /// Estimated total tokens in the payload.
    pub total: usize,
    /// Breakdown aggregated by chat role.
    pub by_role: HashMap<String, usize>,
    /// Per-message framing overhead used in the calculation.
    pub overhead: usize,
}
