//! Structured verdict on whether and why a response or stream has ended.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FinishReason;

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    NaturalCompletion,
    TokenLimitReached,
    StopSequence,
    Error,
    ContentFiltered,
    Unknown,
}

/// How sure a plugin is about its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Vendor field the verdict was derived from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpecific {
    pub original_field: String,
    pub original_value: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

/// Termination verdict computed per response or delta.
///
/// Only `should_terminate` drives control flow; the other fields are diagnostics.
///
/// # Examples
///
/// ```
/// # use kotoba::types::{Confidence, TerminationReason, UnifiedTerminationSignal};
/// let signal = UnifiedTerminationSignal::finished_without_status("finish_reason");
/// assert!(signal.should_terminate);
/// assert_eq!(signal.reason, TerminationReason::Unknown);
/// assert_eq!(signal.confidence, Confidence::Low);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedTerminationSignal {
    pub should_terminate: bool,
    pub reason: TerminationReason,
    pub confidence: Confidence,
    pub provider_specific: ProviderSpecific,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl UnifiedTerminationSignal {
    /// Terminal verdict for a recognized or unrecognized vendor value.
    pub fn terminal(
        reason: TerminationReason,
        confidence: Confidence,
        field: &str,
        value: Option<&str>,
    ) -> Self {
        Self {
            should_terminate: true,
            reason,
            confidence,
            provider_specific: ProviderSpecific {
                original_field: field.to_string(),
                original_value: value.map(str::to_string),
                metadata: HashMap::new(),
            },
            message: None,
        }
    }

    /// Non-terminal verdict for frames that keep the stream open.
    pub fn continuing(field: &str) -> Self {
        Self {
            should_terminate: false,
            reason: TerminationReason::Unknown,
            confidence: Confidence::High,
            provider_specific: ProviderSpecific {
                original_field: field.to_string(),
                original_value: None,
                metadata: HashMap::new(),
            },
            message: None,
        }
    }

    /// A finished flag without any status: still terminal, at low confidence.
    pub fn finished_without_status(field: &str) -> Self {
        Self::terminal(TerminationReason::Unknown, Confidence::Low, field, None)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.provider_specific
            .metadata
            .insert(key.to_string(), value);
        self
    }

    /// Verdict derived from an already-normalized finish reason.
    pub fn from_finish_reason(reason: Option<&FinishReason>, raw: Option<&str>, field: &str) -> Self {
        let (reason, confidence) = match reason {
            Some(FinishReason::Stop) | Some(FinishReason::ToolCalls) => {
                (TerminationReason::NaturalCompletion, Confidence::High)
            }
            Some(FinishReason::Length) => (TerminationReason::TokenLimitReached, Confidence::High),
            Some(FinishReason::StopSequence) => (TerminationReason::StopSequence, Confidence::High),
            Some(FinishReason::ContentFilter) => {
                (TerminationReason::ContentFiltered, Confidence::High)
            }
            Some(FinishReason::Error) => (TerminationReason::Error, Confidence::High),
            Some(FinishReason::Other(_)) => (TerminationReason::Unknown, Confidence::Medium),
            None => (TerminationReason::Unknown, Confidence::Low),
        };
        Self::terminal(reason, confidence, field, raw)
    }
}
