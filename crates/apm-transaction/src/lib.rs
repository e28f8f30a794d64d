//! Transaction facade for APM backends.
//!
//! This crate lets instrumented code open, enrich, and close a logical unit
//! of work (a *transaction*) without ever failing because of telemetry.
//!
//! # Layout
//!
//! ```text
//! TransactionFacade (ApmTransaction)
//!   ├─ labels        flatten Serialize values into string labels
//!   ├─ propagation   W3C traceparent codec
//!   └─ BackendSink   external APM client (InMemorySink for tests and demos)
//!        └─ ambient  task-local "current transaction" scope
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use apm_transaction::{ApmTransaction, InMemorySink, TransactionFacade};
//!
//! let sink = Arc::new(InMemorySink::new());
//! let mut facade = ApmTransaction::new(sink.clone());
//!
//! facade.start_transaction("Checkout", None, "request");
//! facade.add_label("cart_id", Some("42"), "request");
//! facade.capture_span("db.query", None, Some(|| Ok::<(), std::io::Error>(())), "db");
//! facade.end_transaction();
//!
//! let tx = sink.transactions().remove(0);
//! assert_eq!(tx.label("cart_id"), Some("42"));
//! ```

pub mod ambient;
pub mod config;
pub mod error;
pub mod labels;
pub mod memory;
pub mod propagation;
pub mod sink;
pub mod transaction;

pub use config::{ApmConfig, ApmConfigBuilder, ConfigError, LogLevel};
pub use error::{Result, TransactionError};
pub use labels::{Labels, ToLabels};
pub use memory::{InMemorySink, RecordStatus, RecordedSpan, RecordedTransaction};
pub use propagation::{PropagationError, TraceParent, TRACEPARENT_HEADER};
pub use sink::{BackendSink, ExceptionReport, Severity, SinkError, SinkResult, SpanId, TransactionId};
pub use transaction::{
    ApmTransaction, TransactionFacade, TransactionOptions, DEFAULT_TRANSACTION_NAME,
    DEFAULT_TRANSACTION_TYPE, INIT_TRANSACTION_NAME,
};
