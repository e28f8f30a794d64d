//! Error types for transaction facade operations
//!
//! None of these ever reach a facade caller. They are produced on the
//! internal `try_*` paths and handed to `capture_exception`, which turns
//! them into telemetry.

use thiserror::Error;

use crate::propagation::PropagationError;
use crate::sink::{Severity, SinkError};

/// Main error type for facade operations
#[derive(Error, Debug)]
pub enum TransactionError {
    /// A required argument was empty or whitespace
    #[error("{argument} cannot be null or empty")]
    InvalidArgument { argument: &'static str },

    /// Span capture was called without work to run
    #[error("Work to execute in span '{span}' cannot be null")]
    MissingWork { span: String },

    /// Bulk payload ingestion received nothing to record
    #[error("add_message_payload_to_transaction: {reason} - Transaction: {transaction}, Type: {transaction_type}")]
    EmptyPayload {
        reason: &'static str,
        transaction: String,
        transaction_type: String,
    },

    /// Incoming tracing token could not be decoded
    #[error("Invalid distributed tracing data: {0}")]
    Propagation(#[from] PropagationError),

    /// The backend sink rejected an operation
    #[error("Backend sink error: {0}")]
    Sink(#[from] SinkError),

    /// A custom context value could not be serialized
    #[error("Failed to serialize custom context '{key}': {source}")]
    CustomContext {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Caller-supplied work panicked inside a span
    #[error("Work executed in span '{span}' panicked: {message}")]
    WorkPanicked { span: String, message: String },
}

impl TransactionError {
    /// Variant name, used as the exception kind in telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            TransactionError::InvalidArgument { .. } => "InvalidArgument",
            TransactionError::MissingWork { .. } => "MissingWork",
            TransactionError::EmptyPayload { .. } => "EmptyPayload",
            TransactionError::Propagation(_) => "Propagation",
            TransactionError::Sink(_) => "Sink",
            TransactionError::CustomContext { .. } => "CustomContext",
            TransactionError::WorkPanicked { .. } => "WorkPanicked",
        }
    }

    /// Diagnostic conditions are warnings; everything else is an error.
    pub fn severity(&self) -> Severity {
        match self {
            TransactionError::EmptyPayload { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }

    /// Check if this error came from caller misuse rather than the backend
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            TransactionError::InvalidArgument { .. }
                | TransactionError::MissingWork { .. }
                | TransactionError::EmptyPayload { .. }
        )
    }
}

/// Result type alias for facade-internal operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Render a panic payload as text.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::TransactionId;

    #[test]
    fn test_error_display() {
        let err = TransactionError::InvalidArgument {
            argument: "Span name",
        };
        assert_eq!(err.to_string(), "Span name cannot be null or empty");

        let err = TransactionError::EmptyPayload {
            reason: "Labels dictionary is empty",
            transaction: "Checkout".to_string(),
            transaction_type: "messaging".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "add_message_payload_to_transaction: Labels dictionary is empty - Transaction: Checkout, Type: messaging"
        );
    }

    #[test]
    fn test_severity_and_kind() {
        let warning = TransactionError::EmptyPayload {
            reason: "Labels dictionary is null",
            transaction: "Unknown".to_string(),
            transaction_type: "request".to_string(),
        };
        assert_eq!(warning.severity(), Severity::Warning);
        assert_eq!(warning.kind(), "EmptyPayload");

        let sink = TransactionError::from(SinkError::UnknownTransaction(TransactionId(7)));
        assert_eq!(sink.severity(), Severity::Error);
        assert_eq!(sink.kind(), "Sink");
        assert!(!sink.is_validation_error());
    }

    #[test]
    fn test_is_validation_error() {
        assert!(TransactionError::MissingWork {
            span: "db".to_string()
        }
        .is_validation_error());
        assert!(!TransactionError::from(PropagationError::Empty).is_validation_error());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(42_u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
