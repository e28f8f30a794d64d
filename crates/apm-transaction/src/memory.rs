//! In-memory reference sink.
//!
//! Records every transaction, span, label, and exception it receives and
//! exposes them as serializable snapshots. Used by tests and the demo
//! server; it does not export anything over the network.
//!
//! Retention is bounded: once more than `max_transactions` are held, the
//! oldest ended transactions are evicted together with their spans. Running
//! transactions are never evicted. [`InMemorySink::drain`] hands ended
//! transactions to a consumer and forgets them.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ApmConfig;
use crate::labels::Labels;
use crate::propagation::TraceParent;
use crate::sink::{
    BackendSink, ExceptionReport, SinkError, SinkResult, SpanId, TransactionId,
};

/// Default span budget per transaction.
pub const DEFAULT_MAX_SPANS: usize = 500;

/// Default number of transactions kept before ended ones are evicted.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 1000;

/// Lifecycle status of a recorded transaction or span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Running,
    Ended,
}

/// Snapshot of a recorded transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedTransaction {
    pub id: TransactionId,
    /// Hex-encoded 128-bit trace id shared by the whole distributed trace.
    pub trace_id: String,
    /// Upstream parent-id when the transaction was started from a token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<u64>,
    pub name: String,
    pub transaction_type: String,
    pub sampled: bool,
    pub status: RecordStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub labels: Labels,
    pub custom: HashMap<String, serde_json::Value>,
    pub exceptions: Vec<ExceptionReport>,
    pub spans: Vec<SpanId>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip)]
    trace_id_raw: u128,
}

impl RecordedTransaction {
    fn new(name: &str, transaction_type: &str, trace_id: u128, parent_id: Option<u64>, sampled: bool) -> Self {
        Self {
            id: TransactionId(random_id()),
            trace_id: format!("{:032x}", trace_id),
            parent_id,
            name: name.to_string(),
            transaction_type: transaction_type.to_string(),
            sampled,
            status: RecordStatus::Running,
            result: None,
            labels: Labels::new(),
            custom: HashMap::new(),
            exceptions: Vec::new(),
            spans: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            trace_id_raw: trace_id,
        }
    }

    /// Mark the transaction as ended.
    fn end(&mut self) {
        let now = Utc::now();
        self.status = RecordStatus::Ended;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }

    pub fn is_ended(&self) -> bool {
        self.status == RecordStatus::Ended
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Snapshot of a recorded span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedSpan {
    pub id: SpanId,
    pub transaction: TransactionId,
    pub name: String,
    pub span_type: String,
    pub status: RecordStatus,
    pub labels: Labels,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl RecordedSpan {
    fn end(&mut self) {
        let now = Utc::now();
        self.status = RecordStatus::Ended;
        self.ended_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
    }
}

#[derive(Debug, Default)]
struct SinkState {
    transactions: HashMap<TransactionId, RecordedTransaction>,
    spans: HashMap<SpanId, RecordedSpan>,
    order: Vec<TransactionId>,
}

impl SinkState {
    fn running_transaction(&mut self, id: TransactionId) -> SinkResult<&mut RecordedTransaction> {
        let tx = self
            .transactions
            .get_mut(&id)
            .ok_or(SinkError::UnknownTransaction(id))?;
        if tx.is_ended() {
            return Err(SinkError::TransactionEnded(id));
        }
        Ok(tx)
    }

    fn insert(&mut self, tx: RecordedTransaction, max_transactions: usize) -> TransactionId {
        let id = tx.id;
        self.order.push(id);
        self.transactions.insert(id, tx);
        self.evict(max_transactions);
        id
    }

    fn remove(&mut self, id: TransactionId) -> Option<RecordedTransaction> {
        let tx = self.transactions.remove(&id)?;
        for span in &tx.spans {
            self.spans.remove(span);
        }
        Some(tx)
    }

    /// Evict the oldest ended transactions until at most `max_transactions`
    /// remain or only running ones are left.
    fn evict(&mut self, max_transactions: usize) {
        let mut excess = self.transactions.len().saturating_sub(max_transactions);
        if excess == 0 {
            return;
        }

        let mut evicted = Vec::new();
        for id in &self.order {
            if excess == 0 {
                break;
            }
            if self.transactions.get(id).is_some_and(RecordedTransaction::is_ended) {
                evicted.push(*id);
                excess -= 1;
            }
        }
        for id in &evicted {
            self.remove(*id);
        }
        let transactions = &self.transactions;
        self.order.retain(|id| transactions.contains_key(id));

        if !evicted.is_empty() {
            tracing::debug!(
                evicted = evicted.len(),
                retained = self.transactions.len(),
                "Evicted ended transactions"
            );
        }
    }
}

/// Thread-safe recording sink.
#[derive(Debug)]
pub struct InMemorySink {
    state: RwLock<SinkState>,
    max_spans: usize,
    max_transactions: usize,
    sample_rate: f64,
}

impl InMemorySink {
    /// Create a sink with the default limits that samples every root transaction
    pub fn new() -> Self {
        Self::with_max_spans(DEFAULT_MAX_SPANS)
    }

    /// Create a sink that rejects spans beyond `max_spans` per transaction
    pub fn with_max_spans(max_spans: usize) -> Self {
        Self {
            state: RwLock::new(SinkState::default()),
            max_spans: max_spans.max(1),
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
            sample_rate: 1.0,
        }
    }

    /// Sink sized and sampled from the config
    pub fn from_config(config: &ApmConfig) -> Self {
        Self::with_max_spans(config.transaction_max_spans)
            .with_max_transactions(config.max_retained_transactions)
            .with_sample_rate(config.transaction_sample_rate)
    }

    /// Keep at most `max_transactions`, evicting the oldest ended ones first
    pub fn with_max_transactions(mut self, max_transactions: usize) -> Self {
        self.max_transactions = max_transactions.max(1);
        self
    }

    /// Fraction of root transactions marked sampled, clamped to `0.0..=1.0`
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = if rate.is_nan() { 1.0 } else { rate.clamp(0.0, 1.0) };
        self
    }

    pub fn max_spans(&self) -> usize {
        self.max_spans
    }

    pub fn max_transactions(&self) -> usize {
        self.max_transactions
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn sample(&self) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        (random_id() as f64 / u64::MAX as f64) < self.sample_rate
    }

    fn read(&self) -> SinkResult<RwLockReadGuard<'_, SinkState>> {
        self.state
            .read()
            .map_err(|_| SinkError::Unavailable("in-memory sink lock poisoned".to_string()))
    }

    fn write(&self) -> SinkResult<RwLockWriteGuard<'_, SinkState>> {
        self.state
            .write()
            .map_err(|_| SinkError::Unavailable("in-memory sink lock poisoned".to_string()))
    }

    /// Snapshot of one transaction
    pub fn transaction(&self, id: TransactionId) -> Option<RecordedTransaction> {
        self.read().ok()?.transactions.get(&id).cloned()
    }

    /// Snapshot of all transactions, in start order
    pub fn transactions(&self) -> Vec<RecordedTransaction> {
        match self.read() {
            Ok(state) => state
                .order
                .iter()
                .filter_map(|id| state.transactions.get(id).cloned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Snapshot of the spans of one transaction, in start order
    pub fn spans(&self, transaction: TransactionId) -> Vec<RecordedSpan> {
        match self.read() {
            Ok(state) => state
                .transactions
                .get(&transaction)
                .map(|tx| {
                    tx.spans
                        .iter()
                        .filter_map(|id| state.spans.get(id).cloned())
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove and return every ended transaction, in start order. Running
    /// transactions stay in place.
    pub fn drain(&self) -> Vec<RecordedTransaction> {
        let Ok(mut state) = self.write() else {
            return Vec::new();
        };
        let ended: Vec<TransactionId> = state
            .order
            .iter()
            .filter(|id| state.transactions.get(*id).is_some_and(RecordedTransaction::is_ended))
            .copied()
            .collect();
        let drained: Vec<RecordedTransaction> =
            ended.into_iter().filter_map(|id| state.remove(id)).collect();
        let SinkState {
            order, transactions, ..
        } = &mut *state;
        order.retain(|id| transactions.contains_key(id));
        drained
    }

    /// Drop everything recorded so far
    pub fn reset(&self) {
        if let Ok(mut state) = self.write() {
            *state = SinkState::default();
        }
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendSink for InMemorySink {
    fn start_transaction(&self, name: &str, transaction_type: &str) -> SinkResult<TransactionId> {
        let tx = RecordedTransaction::new(
            name,
            transaction_type,
            random_trace_id(),
            None,
            self.sample(),
        );
        tracing::debug!(
            transaction = %tx.id,
            name = %name,
            sampled = tx.sampled,
            "Transaction started"
        );
        Ok(self.write()?.insert(tx, self.max_transactions))
    }

    fn start_child_transaction(
        &self,
        name: &str,
        transaction_type: &str,
        parent: &TraceParent,
    ) -> SinkResult<TransactionId> {
        let tx = RecordedTransaction::new(
            name,
            transaction_type,
            parent.trace_id,
            Some(parent.parent_id),
            parent.is_sampled(),
        );
        tracing::debug!(
            transaction = %tx.id,
            name = %name,
            trace_id = %tx.trace_id,
            "Child transaction started"
        );
        Ok(self.write()?.insert(tx, self.max_transactions))
    }

    fn end_transaction(&self, transaction: TransactionId) -> SinkResult<()> {
        let mut state = self.write()?;
        let tx = state
            .transactions
            .get_mut(&transaction)
            .ok_or(SinkError::UnknownTransaction(transaction))?;
        if tx.is_ended() {
            tracing::debug!(transaction = %transaction, "Transaction already ended");
            return Ok(());
        }
        tx.end();
        state.evict(self.max_transactions);
        Ok(())
    }

    fn transaction_name(&self, transaction: TransactionId) -> Option<String> {
        self.read()
            .ok()?
            .transactions
            .get(&transaction)
            .map(|tx| tx.name.clone())
    }

    fn set_label(&self, transaction: TransactionId, key: &str, value: &str) -> SinkResult<()> {
        let mut state = self.write()?;
        state
            .running_transaction(transaction)?
            .labels
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_result(&self, transaction: TransactionId, result: &str) -> SinkResult<()> {
        let mut state = self.write()?;
        state.running_transaction(transaction)?.result = Some(result.to_string());
        Ok(())
    }

    fn set_custom_context(
        &self,
        transaction: TransactionId,
        key: &str,
        value: serde_json::Value,
    ) -> SinkResult<()> {
        let mut state = self.write()?;
        state
            .running_transaction(transaction)?
            .custom
            .insert(key.to_string(), value);
        Ok(())
    }

    fn capture_exception(
        &self,
        transaction: TransactionId,
        report: &ExceptionReport,
    ) -> SinkResult<()> {
        // Errors are accepted on ended transactions too.
        let mut state = self.write()?;
        state
            .transactions
            .get_mut(&transaction)
            .ok_or(SinkError::UnknownTransaction(transaction))?
            .exceptions
            .push(report.clone());
        Ok(())
    }

    fn start_span(
        &self,
        transaction: TransactionId,
        name: &str,
        span_type: &str,
    ) -> SinkResult<SpanId> {
        let max_spans = self.max_spans;
        let mut state = self.write()?;
        let tx = state.running_transaction(transaction)?;
        if tx.spans.len() >= max_spans {
            return Err(SinkError::SpanLimitExceeded {
                transaction,
                limit: max_spans,
            });
        }

        let id = SpanId(random_id());
        tx.spans.push(id);
        state.spans.insert(
            id,
            RecordedSpan {
                id,
                transaction,
                name: name.to_string(),
                span_type: span_type.to_string(),
                status: RecordStatus::Running,
                labels: Labels::new(),
                started_at: Utc::now(),
                ended_at: None,
                duration_ms: None,
            },
        );
        Ok(id)
    }

    fn set_span_label(&self, span: SpanId, key: &str, value: &str) -> SinkResult<()> {
        let mut state = self.write()?;
        let span = state.spans.get_mut(&span).ok_or(SinkError::UnknownSpan(span))?;
        span.labels.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn end_span(&self, span: SpanId) -> SinkResult<()> {
        let mut state = self.write()?;
        let span = state.spans.get_mut(&span).ok_or(SinkError::UnknownSpan(span))?;
        if span.status == RecordStatus::Running {
            span.end();
        }
        Ok(())
    }

    fn outgoing_trace_parent(&self, transaction: TransactionId) -> SinkResult<TraceParent> {
        let state = self.read()?;
        let tx = state
            .transactions
            .get(&transaction)
            .ok_or(SinkError::UnknownTransaction(transaction))?;
        Ok(TraceParent::new(tx.trace_id_raw, tx.id.0, tx.sampled))
    }
}

/// Random non-zero 64-bit id.
fn random_id() -> u64 {
    let id = Uuid::new_v4().as_u128() as u64;
    id.max(1)
}

/// Random non-zero 128-bit trace id.
fn random_trace_id() -> u128 {
    Uuid::new_v4().as_u128().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Severity;

    #[test]
    fn test_transaction_lifecycle() {
        let sink = InMemorySink::new();
        let id = sink.start_transaction("Checkout", "request").unwrap();

        sink.set_label(id, "cart_id", "42").unwrap();
        sink.set_result(id, "success").unwrap();
        sink.end_transaction(id).unwrap();

        let tx = sink.transaction(id).unwrap();
        assert_eq!(tx.name, "Checkout");
        assert_eq!(tx.transaction_type, "request");
        assert_eq!(tx.label("cart_id"), Some("42"));
        assert_eq!(tx.result.as_deref(), Some("success"));
        assert!(tx.is_ended());
        assert!(tx.duration_ms.is_some());
        assert!(tx.parent_id.is_none());
    }

    #[test]
    fn test_writes_after_end_are_rejected_but_exceptions_are_kept() {
        let sink = InMemorySink::new();
        let id = sink.start_transaction("job", "messaging").unwrap();
        sink.end_transaction(id).unwrap();
        // Second end is a no-op
        sink.end_transaction(id).unwrap();

        assert!(matches!(
            sink.set_label(id, "k", "v"),
            Err(SinkError::TransactionEnded(_))
        ));
        let report = ExceptionReport::new("Error", "late failure", Severity::Error);
        sink.capture_exception(id, &report).unwrap();
        assert_eq!(sink.transaction(id).unwrap().exceptions.len(), 1);
    }

    #[test]
    fn test_unknown_ids() {
        let sink = InMemorySink::new();
        assert!(matches!(
            sink.end_transaction(TransactionId(1)),
            Err(SinkError::UnknownTransaction(_))
        ));
        assert!(matches!(
            sink.end_span(SpanId(1)),
            Err(SinkError::UnknownSpan(_))
        ));
        assert!(sink.transaction_name(TransactionId(1)).is_none());
    }

    #[test]
    fn test_child_transaction_continues_trace() {
        let sink = InMemorySink::new();
        let parent: TraceParent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00"
            .parse()
            .unwrap();
        let id = sink
            .start_child_transaction("consume", "messaging", &parent)
            .unwrap();

        let tx = sink.transaction(id).unwrap();
        assert_eq!(tx.trace_id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(tx.parent_id, Some(0x00f067aa0ba902b7));
        assert!(!tx.sampled);

        let outgoing = sink.outgoing_trace_parent(id).unwrap();
        assert_eq!(outgoing.trace_id, parent.trace_id);
        assert_eq!(outgoing.parent_id, id.0);
        assert!(!outgoing.is_sampled());
    }

    #[test]
    fn test_span_limit() {
        let sink = InMemorySink::with_max_spans(1);
        let id = sink.start_transaction("t", "request").unwrap();

        let span = sink.start_span(id, "first", "db").unwrap();
        sink.set_span_label(span, "table", "orders").unwrap();
        sink.end_span(span).unwrap();

        assert!(matches!(
            sink.start_span(id, "second", "db"),
            Err(SinkError::SpanLimitExceeded { limit: 1, .. })
        ));

        let spans = sink.spans(id);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].labels.get("table").map(String::as_str), Some("orders"));
        assert_eq!(spans[0].status, RecordStatus::Ended);
    }

    #[test]
    fn test_transactions_in_start_order_and_reset() {
        let sink = InMemorySink::new();
        let a = sink.start_transaction("a", "request").unwrap();
        let b = sink.start_transaction("b", "request").unwrap();

        let ids: Vec<_> = sink.transactions().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, b]);

        sink.reset();
        assert!(sink.transactions().is_empty());
    }

    #[test]
    fn test_retention_evicts_oldest_ended_transactions() {
        let sink = InMemorySink::new().with_max_transactions(3);
        let mut ids = Vec::new();
        for i in 0..10 {
            let id = sink.start_transaction(&format!("job-{i}"), "messaging").unwrap();
            let span = sink.start_span(id, "step", "db").unwrap();
            sink.end_span(span).unwrap();
            sink.end_transaction(id).unwrap();
            ids.push(id);
        }

        let retained: Vec<_> = sink.transactions().iter().map(|t| t.id).collect();
        assert_eq!(retained, ids[7..].to_vec());
        assert!(sink.transaction(ids[0]).is_none());

        let state = sink.state.read().unwrap();
        assert_eq!(state.spans.len(), 3);
        assert_eq!(state.order.len(), 3);
    }

    #[test]
    fn test_running_transactions_are_never_evicted() {
        let sink = InMemorySink::new().with_max_transactions(2);
        let a = sink.start_transaction("a", "request").unwrap();
        let b = sink.start_transaction("b", "request").unwrap();
        let c = sink.start_transaction("c", "request").unwrap();
        assert_eq!(sink.transactions().len(), 3);

        sink.end_transaction(b).unwrap();
        let ids: Vec<_> = sink.transactions().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, c]);

        // Writes to an evicted transaction fail like any unknown id
        assert!(matches!(
            sink.set_label(b, "k", "v"),
            Err(SinkError::UnknownTransaction(_))
        ));
    }

    #[test]
    fn test_drain_returns_ended_transactions_only() {
        let sink = InMemorySink::new();
        let done = sink.start_transaction("done", "request").unwrap();
        let span = sink.start_span(done, "step", "db").unwrap();
        sink.end_span(span).unwrap();
        sink.end_transaction(done).unwrap();
        let running = sink.start_transaction("running", "request").unwrap();

        let drained = sink.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, done);
        assert_eq!(drained[0].spans, vec![span]);

        let ids: Vec<_> = sink.transactions().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![running]);
        assert!(sink.spans(done).is_empty());
        assert!(sink.drain().is_empty());
    }

    #[test]
    fn test_sample_rate_applies_to_root_transactions() {
        let never = InMemorySink::new().with_sample_rate(0.0);
        let id = never.start_transaction("t", "request").unwrap();
        assert!(!never.transaction(id).unwrap().sampled);
        assert!(!never.outgoing_trace_parent(id).unwrap().is_sampled());

        // Upstream decision wins for child transactions
        let parent: TraceParent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
            .parse()
            .unwrap();
        let child = never
            .start_child_transaction("consume", "messaging", &parent)
            .unwrap();
        assert!(never.transaction(child).unwrap().sampled);

        let always = InMemorySink::new().with_sample_rate(7.5);
        assert_eq!(always.sample_rate(), 1.0);
        let id = always.start_transaction("t", "request").unwrap();
        assert!(always.transaction(id).unwrap().sampled);
    }

    #[test]
    fn test_from_config() {
        let config = ApmConfig::builder()
            .transaction_max_spans(7)
            .max_retained_transactions(20)
            .transaction_sample_rate(0.5)
            .build();
        let sink = InMemorySink::from_config(&config);
        assert_eq!(sink.max_spans(), 7);
        assert_eq!(sink.max_transactions(), 20);
        assert_eq!(sink.sample_rate(), 0.5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let sink = InMemorySink::new();
        let id = sink.start_transaction("Checkout", "request").unwrap();
        let json = serde_json::to_string(&sink.transaction(id).unwrap()).unwrap();
        assert!(json.contains("\"name\":\"Checkout\""));
        assert!(json.contains("\"status\":\"running\""));
    }
}
