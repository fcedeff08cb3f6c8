use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Logical operation that produced the error (e.g., "user_lookup", "health_probe")
    pub operation: Option<String>,
    /// Additional context about the error (e.g., underlying driver message)
    pub details: Option<String>,
    /// Source of the error (e.g., "retry_executor", "health_monitor")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Unified error type for the resilience layer.
///
/// The taxonomy distinguishes errors the retry executor may re-attempt
/// (transient, timeout) from those it must surface immediately.
#[derive(Debug, Error)]
pub enum Error {
    /// A failure matching a transient signature; eligible for retry.
    #[error("transient connection error: {message}{}", format_context(.context))]
    Transient {
        message: String,
        context: ErrorContext,
    },

    /// An attempt exceeded its allotted time.
    #[error("operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Fast-fail while the circuit breaker is open. Does not consume a retry attempt.
    #[error("circuit breaker open{}", .retry_after_ms.map(|ms| format!(" (retry after {}ms)", ms)).unwrap_or_default())]
    CircuitOpen { retry_after_ms: Option<u64> },

    /// All reconnection attempts were exhausted.
    #[error("connection recovery exhausted after {attempts} attempts{}", .last_error.as_deref().map(|e| format!(": {}", e)).unwrap_or_default())]
    RecoveryExhausted {
        attempts: u32,
        last_error: Option<String>,
    },

    /// Anything else; surfaced on first occurrence without retry.
    #[error("non-retryable error: {message}{}", format_context(.context))]
    NonRetryable {
        message: String,
        context: ErrorContext,
    },

    #[error("configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    /// The call was cancelled before it settled.
    #[error("operation '{operation}' cancelled")]
    Cancelled { operation: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref op) = ctx.operation {
        parts.push(format!("operation: {}", op));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

/// Lowercased substrings identifying transient driver failures.
///
/// These cover the usual socket-level shapes a pooled database client
/// reports when the server restarts or the network flaps.
pub const TRANSIENT_SIGNATURES: &[&str] = &[
    "connection refused",
    "not found",
    "timed out",
    "reset",
    "broken pipe",
    "connection lost",
];

impl Error {
    /// Create a new transient error with structured context
    pub fn transient_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Transient {
            message: msg.into(),
            context,
        }
    }

    /// Create a new non-retryable error with structured context
    pub fn non_retryable_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::NonRetryable {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transient { context, .. }
            | Error::NonRetryable { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether this error is classified as transient and eligible for retry.
    ///
    /// `Transient` and `Timeout` are always retryable. I/O errors are
    /// retryable when their kind matches a connection-level failure, and any
    /// message-bearing error is checked against [`TRANSIENT_SIGNATURES`].
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient { .. } | Error::Timeout { .. } => true,
            Error::CircuitOpen { .. }
            | Error::RecoveryExhausted { .. }
            | Error::Configuration { .. }
            | Error::Cancelled { .. } => false,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::NotFound
            ),
            Error::NonRetryable { message, .. } => {
                let m = message.to_lowercase();
                TRANSIENT_SIGNATURES.iter().any(|sig| m.contains(sig))
            }
            Error::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_is_retryable() {
        let err = Error::transient_with_context("connection lost", ErrorContext::new());
        assert!(err.is_transient());
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = Error::Timeout {
            operation: "query".into(),
            timeout_ms: 500,
        };
        assert!(err.is_transient());
    }

    #[test]
    fn test_circuit_open_is_not_retryable() {
        let err = Error::CircuitOpen {
            retry_after_ms: Some(1000),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_io_kind_classification() {
        let refused = Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(refused.is_transient());

        let perm = Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(!perm.is_transient());
    }

    #[test]
    fn test_signature_match_on_opaque_error() {
        let err = Error::non_retryable_with_context(
            "driver: Connection reset by peer",
            ErrorContext::new(),
        );
        assert!(err.is_transient());

        let err =
            Error::non_retryable_with_context("syntax error near SELECT", ErrorContext::new());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_context_formatting() {
        let err = Error::transient_with_context(
            "connection lost",
            ErrorContext::new()
                .with_operation("user_lookup")
                .with_source("retry_executor"),
        );
        let msg = err.to_string();
        assert!(msg.contains("operation: user_lookup"));
        assert!(msg.contains("source: retry_executor"));
    }
}
