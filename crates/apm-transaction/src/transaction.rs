//! Transaction facade
//!
//! `ApmTransaction` owns at most one current transaction handle and turns
//! every enrichment call into calls on a [`BackendSink`]. It is meant to live
//! for one logical unit of work (one request, one consumed message) and is
//! not shared across concurrent contexts.
//!
//! # Error Handling
//!
//! No facade operation returns an error or panics because of the sink. Each
//! fallible operation runs through a `try_*` method; the public wrapper logs
//! the failure with `tracing::warn!` and records it on the current
//! transaction through `capture_exception`. Failures inside
//! `capture_exception` itself are dropped.
//!
//! Errors and panics raised by work passed to `capture_span` /
//! `capture_span_async` are recorded the same way and never re-raised.

use std::error::Error as StdError;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::Instrument;

use crate::config::ApmConfig;
use crate::error::{panic_message, Result, TransactionError};
use crate::labels::Labels;
use crate::sink::{
    short_type_name, BackendSink, ExceptionReport, SinkResult, SpanId, TransactionId,
};

/// Type used when a blank type is given and nothing else is configured.
pub const DEFAULT_TRANSACTION_TYPE: &str = "messaging";

/// Fallback for blank names in `start_transaction`.
pub const DEFAULT_TRANSACTION_NAME: &str = "default";

/// Name of transactions opened lazily by `init_current_transaction`.
pub const INIT_TRANSACTION_NAME: &str = "Default";

pub const WARNING_REASON_LABEL: &str = "warning_reason";
pub const WARNING_METHOD_LABEL: &str = "warning_method";
pub const WARNING_TRANSACTION_TYPE_LABEL: &str = "warning_transaction_type";

const PAYLOAD_METHOD: &str = "add_message_payload_to_transaction";

/// Facade behavior knobs
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Type used when an operation receives a blank type
    pub default_type: String,
    /// Empty the slot on `end_transaction` instead of keeping the ended handle
    pub clear_on_end: bool,
    /// Labels set on every transaction this facade opens
    pub global_labels: Labels,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            default_type: DEFAULT_TRANSACTION_TYPE.to_string(),
            clear_on_end: false,
            global_labels: Labels::new(),
        }
    }
}

impl From<&ApmConfig> for TransactionOptions {
    fn from(config: &ApmConfig) -> Self {
        let default_type = match non_blank(&config.default_transaction_type) {
            Some(t) => t.to_string(),
            None => DEFAULT_TRANSACTION_TYPE.to_string(),
        };
        Self {
            default_type,
            clear_on_end: config.clear_on_end,
            global_labels: config.global_labels.clone(),
        }
    }
}

/// Operations exposed to instrumented code.
///
/// Every method is infallible from the caller's point of view.
#[async_trait]
pub trait TransactionFacade: Send {
    /// Open the current transaction, optionally continuing an upstream
    /// trace. No-op when a transaction is already current.
    fn start_transaction(&mut self, name: &str, tracing_data: Option<&str>, transaction_type: &str);

    /// Adopt the sink's ambient transaction, or open a `"Default"` one.
    fn init_current_transaction(&mut self, transaction_type: &str);

    /// Finalize the current transaction in the sink.
    fn end_transaction(&mut self);

    /// Record an error on the current transaction. No-op without one.
    fn capture_exception(&self, error: &(dyn StdError + 'static));

    /// Run `work` inside a span of the current transaction.
    fn capture_span<F, E>(
        &mut self,
        name: &str,
        labels: Option<&Labels>,
        work: Option<F>,
        span_type: &str,
    ) where
        F: FnOnce() -> std::result::Result<(), E>,
        E: Into<anyhow::Error>;

    /// Async counterpart of [`TransactionFacade::capture_span`].
    async fn capture_span_async<F, Fut, E>(
        &mut self,
        name: &str,
        labels: Option<&Labels>,
        work: Option<F>,
        span_type: &str,
    ) where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<(), E>> + Send,
        E: Into<anyhow::Error> + Send;

    fn add_label(&mut self, key: &str, value: Option<&str>, transaction_type: &str);

    fn add_labels(&mut self, labels: Option<&Labels>, transaction_type: &str);

    /// Set every entry of a message payload as a label. An absent or empty
    /// payload is recorded as a warning instead.
    fn add_message_payload_to_transaction(&mut self, labels: Option<&Labels>, transaction_type: &str);

    fn set_transaction_result(&self, result: Option<&str>);

    fn set_custom_context<T: Serialize + ?Sized>(&self, key: &str, value: Option<&T>);

    /// Token downstream services pass to `start_transaction`.
    fn outgoing_distributed_tracing_data(&self) -> Option<String>;

    /// `true` while the slot holds a handle, ended or not.
    fn has_active_transaction(&self) -> bool;

    /// Forget the current handle without finalizing it.
    fn clear_current_transaction(&mut self);
}

/// Facade over a shared [`BackendSink`].
pub struct ApmTransaction {
    sink: Arc<dyn BackendSink>,
    options: TransactionOptions,
    current: Option<TransactionId>,
}

impl ApmTransaction {
    pub fn new(sink: Arc<dyn BackendSink>) -> Self {
        Self::with_options(sink, TransactionOptions::default())
    }

    pub fn with_options(sink: Arc<dyn BackendSink>, options: TransactionOptions) -> Self {
        Self {
            sink,
            options,
            current: None,
        }
    }

    pub fn from_config(sink: Arc<dyn BackendSink>, config: &ApmConfig) -> Self {
        Self::with_options(sink, TransactionOptions::from(config))
    }

    /// Handle in the slot, if any
    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.current
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn sink(&self) -> &Arc<dyn BackendSink> {
        &self.sink
    }

    fn resolve_type(&self, transaction_type: &str) -> String {
        non_blank(transaction_type)
            .unwrap_or(&self.options.default_type)
            .to_string()
    }

    /// Log a swallowed failure and record it on the current transaction.
    fn report(&self, error: TransactionError, operation: &'static str) {
        tracing::warn!(
            operation,
            transaction = ?self.current,
            error = %error,
            "APM operation failed"
        );
        self.capture_exception(&error);
    }

    fn forward_report(&self, report: &ExceptionReport) {
        let Some(transaction) = self.current else {
            tracing::debug!(kind = %report.kind, "No current transaction, exception dropped");
            return;
        };
        if let Err(e) = self.sink.capture_exception(transaction, report) {
            tracing::debug!(
                transaction = %transaction,
                error = %e,
                "Failed to capture exception, dropped"
            );
        }
    }

    fn apply_global_labels(&self, transaction: TransactionId) {
        for (key, value) in &self.options.global_labels {
            let Some(key) = non_blank(key) else { continue };
            if let Err(e) = self.sink.set_label(transaction, key, value) {
                self.report(e.into(), "apply_global_labels");
            }
        }
    }

    fn try_start_transaction(
        &mut self,
        name: &str,
        tracing_data: Option<&str>,
        transaction_type: &str,
    ) -> Result<()> {
        if let Some(current) = self.current {
            tracing::debug!(transaction = %current, "Transaction already current, start ignored");
            return Ok(());
        }

        let name = non_blank(name).unwrap_or(DEFAULT_TRANSACTION_NAME);
        let transaction_type = self.resolve_type(transaction_type);

        // Failures that should be recorded once a transaction exists.
        let mut deferred: Option<TransactionError> = None;

        let parent = match tracing_data.and_then(non_blank) {
            Some(token) => match self.sink.decode_trace_parent(token) {
                Ok(parent) => Some(parent),
                Err(e) => {
                    deferred = Some(e.into());
                    None
                }
            },
            None => None,
        };

        let started = match parent {
            Some(parent) => {
                match self
                    .sink
                    .start_child_transaction(name, &transaction_type, &parent)
                {
                    Ok(id) => Ok(id),
                    Err(e) => {
                        deferred = Some(e.into());
                        self.sink.start_transaction(name, &transaction_type)
                    }
                }
            }
            None => self.sink.start_transaction(name, &transaction_type),
        };

        let transaction = match started {
            Ok(id) => id,
            Err(e) => {
                // Nothing to record it on.
                if let Some(error) = deferred {
                    tracing::warn!(
                        name = %name,
                        kind = error.kind(),
                        error = %error,
                        "Upstream trace context dropped, transaction not started"
                    );
                }
                return Err(e.into());
            }
        };

        self.current = Some(transaction);
        tracing::debug!(
            transaction = %transaction,
            name = %name,
            transaction_type = %transaction_type,
            "Transaction started"
        );
        self.apply_global_labels(transaction);

        if let Some(error) = deferred {
            self.report(error, "start_transaction");
        }
        Ok(())
    }

    fn try_init_current_transaction(&mut self, transaction_type: &str) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }

        if let Some(ambient) = self.sink.current_transaction() {
            tracing::debug!(transaction = %ambient, "Adopted ambient transaction");
            self.current = Some(ambient);
            return Ok(());
        }

        let transaction_type = self.resolve_type(transaction_type);
        let transaction = self
            .sink
            .start_transaction(INIT_TRANSACTION_NAME, &transaction_type)?;
        self.current = Some(transaction);
        self.apply_global_labels(transaction);
        Ok(())
    }

    fn try_end_transaction(&self) -> Result<()> {
        match self.current {
            Some(transaction) => Ok(self.sink.end_transaction(transaction)?),
            None => {
                tracing::debug!("No current transaction to end");
                Ok(())
            }
        }
    }

    fn try_add_label(&self, key: &str, value: Option<&str>) -> Result<()> {
        let key = non_blank(key).ok_or(TransactionError::InvalidArgument {
            argument: "Label key",
        })?;
        if let Some(transaction) = self.current {
            self.sink
                .set_label(transaction, key, value.unwrap_or_default())?;
        }
        Ok(())
    }

    fn try_add_message_payload(
        &self,
        labels: Option<&Labels>,
        transaction_type: &str,
    ) -> Result<()> {
        let labels = match labels {
            Some(labels) if !labels.is_empty() => labels,
            other => {
                let reason = if other.is_none() {
                    "Labels dictionary is null"
                } else {
                    "Labels dictionary is empty"
                };
                if let Some(transaction) = self.current {
                    self.sink.set_label(transaction, WARNING_REASON_LABEL, reason)?;
                    self.sink
                        .set_label(transaction, WARNING_METHOD_LABEL, PAYLOAD_METHOD)?;
                    self.sink.set_label(
                        transaction,
                        WARNING_TRANSACTION_TYPE_LABEL,
                        transaction_type,
                    )?;
                }
                let transaction = self
                    .current
                    .and_then(|id| self.sink.transaction_name(id))
                    .unwrap_or_else(|| "Unknown".to_string());
                return Err(TransactionError::EmptyPayload {
                    reason,
                    transaction,
                    transaction_type: transaction_type.to_string(),
                });
            }
        };

        let Some(transaction) = self.current else {
            return Ok(());
        };
        // Keys are applied untrimmed; the first sink failure stops the rest.
        for (key, value) in labels.iter().filter(|(k, _)| !k.trim().is_empty()) {
            self.sink.set_label(transaction, key, value)?;
        }
        Ok(())
    }

    fn try_set_custom_context<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: Option<&T>,
    ) -> Result<()> {
        let (Some(transaction), Some(key), Some(value)) = (self.current, non_blank(key), value)
        else {
            return Ok(());
        };
        let value = serde_json::to_value(value).map_err(|source| TransactionError::CustomContext {
            key: key.to_string(),
            source,
        })?;
        self.sink.set_custom_context(transaction, key, value)?;
        Ok(())
    }

    /// Open a span and apply its labels. A sink failure is recorded and the
    /// returned guard is detached, so the work still runs.
    fn open_span(&self, name: &str, labels: Option<&Labels>, span_type: &str) -> SpanGuard {
        let Some(transaction) = self.current else {
            return SpanGuard::detached(self.sink.clone());
        };

        let span = match self
            .sink
            .start_span(transaction, name, &self.resolve_type(span_type))
        {
            Ok(span) => span,
            Err(e) => {
                self.report(e.into(), "capture_span");
                return SpanGuard::detached(self.sink.clone());
            }
        };

        for (key, value) in labels.into_iter().flatten() {
            let Some(key) = non_blank(key) else { continue };
            if let Err(e) = self.sink.set_span_label(span, key, value) {
                self.report(e.into(), "capture_span");
            }
        }
        SpanGuard::open(self.sink.clone(), span)
    }

    /// Close the span, then record whatever the work produced.
    fn finish_span<E>(
        &self,
        name: &str,
        guard: SpanGuard,
        outcome: std::thread::Result<std::result::Result<(), E>>,
    ) where
        E: Into<anyhow::Error>,
    {
        if let Err(e) = guard.close() {
            self.report(e.into(), "capture_span");
        }

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                let kind = short_type_name::<E>();
                let error: anyhow::Error = error.into();
                tracing::warn!(span = %name, kind, error = %error, "Span work failed");
                self.forward_report(&ExceptionReport::from_anyhow(kind, &error));
            }
            Err(payload) => self.report(
                TransactionError::WorkPanicked {
                    span: name.to_string(),
                    message: panic_message(payload.as_ref()),
                },
                "capture_span",
            ),
        }
    }
}

impl std::fmt::Debug for ApmTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApmTransaction")
            .field("options", &self.options)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TransactionFacade for ApmTransaction {
    fn start_transaction(&mut self, name: &str, tracing_data: Option<&str>, transaction_type: &str) {
        if let Err(e) = self.try_start_transaction(name, tracing_data, transaction_type) {
            self.report(e, "start_transaction");
        }
    }

    fn init_current_transaction(&mut self, transaction_type: &str) {
        if let Err(e) = self.try_init_current_transaction(transaction_type) {
            self.report(e, "init_current_transaction");
        }
    }

    fn end_transaction(&mut self) {
        if let Err(e) = self.try_end_transaction() {
            self.report(e, "end_transaction");
        }
        if self.options.clear_on_end {
            self.current = None;
        }
    }

    fn capture_exception(&self, error: &(dyn StdError + 'static)) {
        self.forward_report(&ExceptionReport::from_error(error));
    }

    fn capture_span<F, E>(
        &mut self,
        name: &str,
        labels: Option<&Labels>,
        work: Option<F>,
        span_type: &str,
    ) where
        F: FnOnce() -> std::result::Result<(), E>,
        E: Into<anyhow::Error>,
    {
        self.init_current_transaction(span_type);
        let (name, work) = match validate_span(name, work) {
            Ok(checked) => checked,
            Err(e) => {
                self.report(e, "capture_span");
                return;
            }
        };

        let guard = self.open_span(name, labels, span_type);
        let outcome = tracing::info_span!("apm_span", span_name = %name, span_type = %span_type)
            .in_scope(|| panic::catch_unwind(AssertUnwindSafe(work)));
        self.finish_span(name, guard, outcome);
    }

    async fn capture_span_async<F, Fut, E>(
        &mut self,
        name: &str,
        labels: Option<&Labels>,
        work: Option<F>,
        span_type: &str,
    ) where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<(), E>> + Send,
        E: Into<anyhow::Error> + Send,
    {
        self.init_current_transaction(span_type);
        let (name, work) = match validate_span(name, work) {
            Ok(checked) => checked,
            Err(e) => {
                self.report(e, "capture_span_async");
                return;
            }
        };

        // Dropping this future before completion closes the span through
        // the guard without recording anything.
        let guard = self.open_span(name, labels, span_type);
        let outcome = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .instrument(tracing::info_span!("apm_span", span_name = %name, span_type = %span_type))
            .await;
        self.finish_span(name, guard, outcome);
    }

    fn add_label(&mut self, key: &str, value: Option<&str>, transaction_type: &str) {
        self.init_current_transaction(transaction_type);
        if let Err(e) = self.try_add_label(key, value) {
            self.report(e, "add_label");
        }
    }

    fn add_labels(&mut self, labels: Option<&Labels>, transaction_type: &str) {
        self.init_current_transaction(transaction_type);
        let Some(labels) = labels.filter(|l| !l.is_empty()) else {
            return;
        };
        for (key, value) in labels {
            self.add_label(key, Some(value), transaction_type);
        }
    }

    fn add_message_payload_to_transaction(&mut self, labels: Option<&Labels>, transaction_type: &str) {
        self.init_current_transaction(transaction_type);
        if let Err(e) = self.try_add_message_payload(labels, transaction_type) {
            self.report(e, PAYLOAD_METHOD);
        }
    }

    fn set_transaction_result(&self, result: Option<&str>) {
        let (Some(transaction), Some(result)) = (self.current, result.and_then(non_blank)) else {
            return;
        };
        if let Err(e) = self.sink.set_result(transaction, result) {
            self.report(e.into(), "set_transaction_result");
        }
    }

    fn set_custom_context<T: Serialize + ?Sized>(&self, key: &str, value: Option<&T>) {
        if let Err(e) = self.try_set_custom_context(key, value) {
            self.report(e, "set_custom_context");
        }
    }

    fn outgoing_distributed_tracing_data(&self) -> Option<String> {
        let transaction = self.current?;
        match self.sink.outgoing_trace_parent(transaction) {
            Ok(parent) => Some(parent.to_string()),
            Err(e) => {
                self.report(e.into(), "outgoing_distributed_tracing_data");
                None
            }
        }
    }

    fn has_active_transaction(&self) -> bool {
        self.current.is_some()
    }

    fn clear_current_transaction(&mut self) {
        self.current = None;
    }
}

/// Ends its span when closed or dropped.
struct SpanGuard {
    sink: Arc<dyn BackendSink>,
    span: Option<SpanId>,
}

impl SpanGuard {
    fn open(sink: Arc<dyn BackendSink>, span: SpanId) -> Self {
        Self {
            sink,
            span: Some(span),
        }
    }

    fn detached(sink: Arc<dyn BackendSink>) -> Self {
        Self { sink, span: None }
    }

    fn close(mut self) -> SinkResult<()> {
        match self.span.take() {
            Some(span) => self.sink.end_span(span),
            None => Ok(()),
        }
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            tracing::debug!(span = %span, "Span work cancelled, closing span");
            let _ = self.sink.end_span(span);
        }
    }
}

fn validate_span<F>(name: &str, work: Option<F>) -> Result<(&str, F)> {
    let name = non_blank(name).ok_or(TransactionError::InvalidArgument {
        argument: "Span name",
    })?;
    let work = work.ok_or_else(|| TransactionError::MissingWork {
        span: name.to_string(),
    })?;
    Ok((name, work))
}

/// Trimmed input, or `None` if blank.
fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
