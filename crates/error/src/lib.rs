//! # sluice-error
//!
//! Unified error type for the Sluice query router.
//!
//! Every error that crosses the submission boundary carries:
//! - A stable numeric code (SLUICE-XXXX)
//! - Structured JSON context
//! - An optional hint, and for breaker rejections a retry-after delay

mod code;
mod context;
mod convert;

pub use code::{ErrorCategory, ErrorCode};
pub use context::ErrorContext;
pub use convert::find_closest_match;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The unified error type for all Sluice operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SluiceError {
    /// Numeric error code (e.g., "SLUICE-1004")
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Structured context for programmatic handling
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<ErrorContext>,

    /// Suggestion for the caller
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,

    /// Query or request correlation id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl SluiceError {
    /// Create a new error with code and message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: None,
            hint: None,
            trace_id: None,
        }
    }

    /// Add structured context
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Add a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Add trace ID for correlation
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Store-side execution failure, tagged transient or permanent.
    pub fn execution(store: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::new(ErrorCode::ExecutionFailed, message).with_context(ErrorContext::Execution {
            store: store.into(),
            transient,
            attempts: 1,
        })
    }

    pub fn cancelled(query_id: impl Into<String>) -> Self {
        let query_id = query_id.into();
        Self::new(
            ErrorCode::QueryCancelled,
            format!("Query {} was cancelled", query_id),
        )
        .with_trace_id(query_id)
    }

    /// Whether the failure is worth retrying for an idempotent read.
    ///
    /// Pool exhaustion, connect and execution timeouts are always transient.
    /// Store failures carry their own classification in the context.
    pub fn is_retryable(&self) -> bool {
        match self.code {
            ErrorCode::PoolExhausted
            | ErrorCode::ConnectionTimeout
            | ErrorCode::ExecutionTimeout => true,
            ErrorCode::ExecutionFailed => matches!(
                self.context,
                Some(ErrorContext::Execution {
                    transient: true,
                    ..
                })
            ),
            _ => false,
        }
    }

    /// Delay after which a breaker rejection may succeed.
    pub fn retry_after(&self) -> Option<Duration> {
        match &self.context {
            Some(ErrorContext::CircuitOpen { retry_after_ms, .. }) => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            _ => None,
        }
    }

    /// Cancellations are excluded from failure metrics.
    pub fn is_cancellation(&self) -> bool {
        self.code == ErrorCode::QueryCancelled
    }

    /// Serialize to JSON for API responses
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::warn!("Failed to serialize SluiceError: {}", e);
            format!(
                r#"{{"code":"{}","message":"Serialization failed"}}"#,
                self.code
            )
        })
    }

    /// Serialize to pretty JSON for logging
    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.to_json())
    }
}

impl fmt::Display for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, " (Hint: {})", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for SluiceError {}

/// Result type alias for Sluice operations
pub type Result<T> = std::result::Result<T, SluiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sluice_error_builder() {
        let err = SluiceError::new(ErrorCode::StoreNotFound, "Store not found")
            .with_hint("Check the stores section")
            .with_trace_id("12345");

        assert_eq!(err.code, ErrorCode::StoreNotFound);
        assert_eq!(err.message, "Store not found");
        assert_eq!(err.hint, Some("Check the stores section".to_string()));
        assert_eq!(err.trace_id, Some("12345".to_string()));
        assert!(err.context.is_none());
    }

    #[test]
    fn test_display_implementation() {
        let err = SluiceError::new(ErrorCode::PoolExhausted, "No connection available")
            .with_hint("Raise max_connections");

        assert_eq!(
            err.to_string(),
            "[SLUICE-1004] No connection available (Hint: Raise max_connections)"
        );

        let err_no_hint = SluiceError::internal("Crash");
        assert_eq!(err_no_hint.to_string(), "[SLUICE-5003] Crash");
    }

    #[test]
    fn test_retry_classification() {
        assert!(SluiceError::new(ErrorCode::PoolExhausted, "x").is_retryable());
        assert!(SluiceError::new(ErrorCode::ExecutionTimeout, "x").is_retryable());
        assert!(SluiceError::execution("oltp", "connection reset", true).is_retryable());
        assert!(!SluiceError::execution("oltp", "syntax error", false).is_retryable());
        assert!(!SluiceError::new(ErrorCode::CircuitOpen, "x").is_retryable());
        assert!(!SluiceError::cancelled("q1").is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = SluiceError::new(ErrorCode::CircuitOpen, "open").with_context(
            ErrorContext::CircuitOpen {
                breaker: "olap".to_string(),
                retry_after_ms: 1500,
            },
        );
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(SluiceError::internal("x").retry_after(), None);
    }

    #[test]
    fn test_json_output() {
        let err = SluiceError::new(ErrorCode::PoolExhausted, "Too many connections");
        let json = err.to_json();

        assert!(json.contains("\"code\":\"SLUICE-1004\""));
        assert!(json.contains("\"message\":\"Too many connections\""));
    }
}
