use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::ConversationContext;

/// Aggregates every failure mode exposed by the unified LLM client.
///
/// Vendor errors are normalized into the first seven variants by each provider plugin, so
/// callers can decide whether to retry, fall back to another provider, or surface an
/// actionable message without knowing which vendor produced the failure.
#[derive(Debug, Error)]
pub enum LLMError {
    /// Network, connection, TLS, DNS or abort failures below the HTTP layer.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Reports invalid or missing credentials (401/403).
    #[error("auth failure: {message}")]
    Auth { message: String },
    /// Indicates that the provider throttled the request (429).
    #[error("rate limited: {message}")]
    RateLimit {
        /// Raw message returned by the upstream provider.
        message: String,
        /// Optional wait duration suggested by the provider before retrying.
        retry_after: Option<Duration>,
    },
    /// Signals malformed input or an unknown resource (400/404-class).
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// Upstream gateway timeouts (408/504) or transport-level timeouts.
    #[error("request timed out: {message}")]
    Timeout { message: String },
    /// Wraps 5xx and unclassified vendor errors.
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Plugin id, such as `openai`.
        provider: &'static str,
        /// Human-readable error message returned by the provider.
        message: String,
        /// HTTP status when the error came from a response.
        status: Option<u16>,
    },
    /// Raised when the caller token or the client timer cancels a call.
    #[error("request cancelled during {phase}: {reason}")]
    Cancelled {
        /// Where execution was when the cancellation was observed.
        phase: CancellationPhase,
        /// Who triggered the cancellation.
        reason: CancelReason,
        /// Conversation snapshot accumulated by an interrupted agent loop.
        partial: Option<Box<ConversationContext>>,
    },
    /// Raised when building or resolving configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
    /// A tool failed while the agent loop was configured to abort on tool errors.
    #[error("tool {tool} failed ({code}): {message}")]
    ToolExecution {
        tool: String,
        code: String,
        message: String,
    },
}

/// Taxonomy class of an [`LLMError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Auth,
    RateLimit,
    Validation,
    Timeout,
    Provider,
    Cancellation,
    Configuration,
    Tool,
}

/// Execution phase in which a cancellation was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationPhase {
    Initialization,
    Execution,
    ToolCalls,
    Streaming,
    Cleanup,
}

impl CancellationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationPhase::Initialization => "initialization",
            CancellationPhase::Execution => "execution",
            CancellationPhase::ToolCalls => "tool_calls",
            CancellationPhase::Streaming => "streaming",
            CancellationPhase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for CancellationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller-supplied token fired.
    Caller,
    /// The per-call timer elapsed.
    Timeout(Duration),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => f.write_str("cancelled by caller"),
            CancelReason::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
        }
    }
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba::error::LLMError;
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert!(matches!(err, LLMError::Transport { .. }));
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Provider`] without an HTTP status.
    ///
    /// # Examples
    ///
    /// ```
    /// use kotoba::error::LLMError;
    ///
    /// let err = LLMError::provider("openai", "bad JSON payload");
    /// assert!(matches!(err, LLMError::Provider { provider: "openai", status: None, .. }));
    /// ```
    pub fn provider<T: Into<String>>(provider: &'static str, message: T) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            status: None,
        }
    }

    /// Creates an [`LLMError::Validation`].
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::InvalidConfig`].
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Creates an [`LLMError::Cancelled`] without partial progress.
    pub fn cancelled(phase: CancellationPhase, reason: CancelReason) -> Self {
        Self::Cancelled {
            phase,
            reason,
            partial: None,
        }
    }

    /// Returns the taxonomy class of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LLMError::Transport { .. } => ErrorKind::Transport,
            LLMError::Auth { .. } => ErrorKind::Auth,
            LLMError::RateLimit { .. } => ErrorKind::RateLimit,
            LLMError::Validation { .. } => ErrorKind::Validation,
            LLMError::Timeout { .. } => ErrorKind::Timeout,
            LLMError::Provider { .. } => ErrorKind::Provider,
            LLMError::Cancelled { .. } => ErrorKind::Cancellation,
            LLMError::InvalidConfig { .. } => ErrorKind::Configuration,
            LLMError::ToolExecution { .. } => ErrorKind::Tool,
        }
    }

    /// Whether re-sending the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LLMError::RateLimit { .. } | LLMError::Timeout { .. } | LLMError::Transport { .. } => {
                true
            }
            LLMError::Provider { status, .. } => status.is_none_or(|code| code >= 500),
            _ => false,
        }
    }

    /// True for upstream timeouts and for cancellations triggered by the client timer.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            LLMError::Timeout { .. }
                | LLMError::Cancelled {
                    reason: CancelReason::Timeout(_),
                    ..
                }
        )
    }

    /// Phase of a cancellation error.
    pub fn cancellation_phase(&self) -> Option<CancellationPhase> {
        match self {
            LLMError::Cancelled { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether an interrupted agent loop left partial progress on this error.
    pub fn partial_completion(&self) -> bool {
        matches!(
            self,
            LLMError::Cancelled {
                partial: Some(_),
                ..
            }
        )
    }

    /// Partial conversation captured when an agent loop was cancelled.
    pub fn partial_context(&self) -> Option<&ConversationContext> {
        match self {
            LLMError::Cancelled {
                partial: Some(context),
                ..
            } => Some(context),
            _ => None,
        }
    }

    /// Attaches a conversation snapshot to cancellation errors; other variants pass through.
    pub(crate) fn with_partial(self, context: &ConversationContext) -> Self {
        match self {
            LLMError::Cancelled { phase, reason, .. } => LLMError::Cancelled {
                phase,
                reason,
                partial: Some(Box::new(context.clone())),
            },
            other => other,
        }
    }
}

/// Maps an HTTP status onto the fixed taxonomy.
///
/// Vendor normalizers call this after extracting the message and retry hint, then refine
/// the result with vendor error-type strings where those are more precise.
pub(crate) fn classify_status(
    provider: &'static str,
    status: u16,
    message: String,
    retry_after: Option<Duration>,
) -> LLMError {
    match status {
        401 | 403 => LLMError::Auth { message },
        429 => LLMError::RateLimit {
            message,
            retry_after,
        },
        400 | 404 | 409 | 413 | 422 => LLMError::Validation { message },
        408 | 504 => LLMError::Timeout { message },
        _ => LLMError::Provider {
            provider,
            message,
            status: Some(status),
        },
    }
}
