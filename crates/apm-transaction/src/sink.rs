//! Backend sink abstraction
//!
//! The facade never talks to an APM agent directly. Everything it records
//! goes through the `BackendSink` trait, which keeps the transport
//! (batching, flushing, sampling, wire protocol) out of this crate.
//!
//! Sinks are shared, globally synchronized resources: one sink serves every
//! facade instance in the process, so implementations must be `Send + Sync`.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ambient;
use crate::error::TransactionError;
use crate::propagation::{PropagationError, TraceParent};

/// Identifier of a transaction inside a sink. Doubles as the W3C parent-id
/// when the transaction is propagated downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

/// Identifier of a span inside a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpanId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Errors a sink may raise. The facade captures them and never lets them
/// reach its caller.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TransactionId),

    #[error("Unknown span: {0}")]
    UnknownSpan(SpanId),

    #[error("Transaction already ended: {0}")]
    TransactionEnded(TransactionId),

    #[error("Span limit of {limit} reached for transaction {transaction}")]
    SpanLimitExceeded {
        transaction: TransactionId,
        limit: usize,
    },

    #[error("Sink not available: {0}")]
    Unavailable(String),

    #[error("Sink error: {0}")]
    Other(String),
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;

/// How loud a captured exception is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Diagnostic condition; nothing failed mechanically.
    Warning,
    Error,
}

/// An error as handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionReport {
    /// Short type or variant name, e.g. `InvalidArgument` or `io::Error`.
    pub kind: String,
    pub message: String,
    /// `source()` chain, outermost first, excluding the error itself.
    pub causes: Vec<String>,
    pub severity: Severity,
    pub captured_at: DateTime<Utc>,
}

impl ExceptionReport {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            causes: Vec::new(),
            severity,
            captured_at: Utc::now(),
        }
    }

    /// Build a report from any error, walking its source chain.
    ///
    /// `TransactionError`s keep their variant name and severity; anything
    /// else is reported as a plain `Error`.
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        let (kind, severity) = match error.downcast_ref::<TransactionError>() {
            Some(err) => (err.kind().to_string(), err.severity()),
            None => ("Error".to_string(), Severity::Error),
        };

        let mut report = Self::new(kind, error.to_string(), severity);
        report.causes = source_chain(error.source());
        report
    }

    /// Build a report from work that failed inside a span. `kind` is the
    /// short name of the caller's error type.
    pub fn from_anyhow(kind: impl Into<String>, error: &anyhow::Error) -> Self {
        let mut report = Self::new(kind, error.to_string(), Severity::Error);
        report.causes = error.chain().skip(1).map(|e| e.to_string()).collect();
        report
    }
}

fn source_chain(mut next: Option<&(dyn StdError + 'static)>) -> Vec<String> {
    let mut causes = Vec::new();
    while let Some(err) = next {
        causes.push(err.to_string());
        next = err.source();
    }
    causes
}

/// Short, module-less name of a type, e.g. `std::io::Error` -> `Error`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// External APM client the facade records into.
///
/// All methods are synchronous: sinks are expected to buffer internally and
/// never block on network I/O from the caller's thread.
///
/// # Error Handling
///
/// Every method may fail. The facade routes failures through
/// `capture_exception`, so a sink must not assume its errors surface to the
/// application.
pub trait BackendSink: Send + Sync {
    /// Open a root transaction.
    fn start_transaction(&self, name: &str, transaction_type: &str) -> SinkResult<TransactionId>;

    /// Open a transaction causally linked to an upstream trace parent.
    fn start_child_transaction(
        &self,
        name: &str,
        transaction_type: &str,
        parent: &TraceParent,
    ) -> SinkResult<TransactionId>;

    /// Transaction the sink considers ambient for the calling task, if any.
    ///
    /// Default implementation reads the task-local scope set by
    /// [`ambient::scope`].
    fn current_transaction(&self) -> Option<TransactionId> {
        ambient::current()
    }

    /// Finalize a transaction and flush its timing.
    fn end_transaction(&self, transaction: TransactionId) -> SinkResult<()>;

    /// Display name of a transaction, if the sink knows it.
    fn transaction_name(&self, transaction: TransactionId) -> Option<String>;

    fn set_label(&self, transaction: TransactionId, key: &str, value: &str) -> SinkResult<()>;

    fn set_result(&self, transaction: TransactionId, result: &str) -> SinkResult<()>;

    fn set_custom_context(
        &self,
        transaction: TransactionId,
        key: &str,
        value: serde_json::Value,
    ) -> SinkResult<()>;

    fn capture_exception(
        &self,
        transaction: TransactionId,
        report: &ExceptionReport,
    ) -> SinkResult<()>;

    fn start_span(
        &self,
        transaction: TransactionId,
        name: &str,
        span_type: &str,
    ) -> SinkResult<SpanId>;

    fn set_span_label(&self, span: SpanId, key: &str, value: &str) -> SinkResult<()>;

    fn end_span(&self, span: SpanId) -> SinkResult<()>;

    /// Trace parent that downstream services should continue from.
    fn outgoing_trace_parent(&self, transaction: TransactionId) -> SinkResult<TraceParent>;

    /// Decode an incoming tracing token. Must not panic on malformed input.
    fn decode_trace_parent(&self, token: &str) -> Result<TraceParent, PropagationError> {
        token.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Error, Debug)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_report_walks_source_chain() {
        let err = Outer {
            inner: std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"),
        };
        let report = ExceptionReport::from_error(&err);

        assert_eq!(report.kind, "Error");
        assert_eq!(report.message, "outer failure");
        assert_eq!(report.causes, vec!["disk on fire".to_string()]);
        assert_eq!(report.severity, Severity::Error);
    }

    #[test]
    fn test_report_keeps_transaction_error_kind() {
        let err = TransactionError::InvalidArgument {
            argument: "Label key",
        };
        let report = ExceptionReport::from_error(&err);
        assert_eq!(report.kind, "InvalidArgument");
        assert_eq!(report.message, "Label key cannot be null or empty");
    }

    #[test]
    fn test_report_from_anyhow() {
        let err = anyhow::anyhow!("root cause").context("while querying orders");
        let report = ExceptionReport::from_anyhow("QueryError", &err);
        assert_eq!(report.kind, "QueryError");
        assert_eq!(report.message, "while querying orders");
        assert_eq!(report.causes, vec!["root cause".to_string()]);
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<std::io::Error>(), "Error");
        assert_eq!(short_type_name::<SinkError>(), "SinkError");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[test]
    fn test_ids_display_as_hex() {
        assert_eq!(TransactionId(255).to_string(), "00000000000000ff");
        assert_eq!(SpanId(1).to_string(), "0000000000000001");
    }
}
