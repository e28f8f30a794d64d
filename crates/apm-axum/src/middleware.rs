//! Request instrumentation middleware
//!
//! Every inbound request becomes one transaction named `"{METHOD} {path}"`
//! with type `"request"`. An incoming `traceparent` header links it to the
//! upstream trace. Handlers reach the request's facade through the
//! [`CurrentTransaction`](crate::CurrentTransaction) extractor, and any
//! facade created while the handler runs adopts the same transaction.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use apm_transaction::error::panic_message;
use apm_transaction::sink::short_type_name;
use apm_transaction::{
    ambient, ApmConfig, ApmTransaction, BackendSink, InMemorySink, Labels, TransactionFacade,
    TRACEPARENT_HEADER,
};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
    Router,
};
use futures_util::FutureExt;
use thiserror::Error;
use uuid::Uuid;

/// Transaction type of instrumented requests.
pub const REQUEST_TRANSACTION_TYPE: &str = "request";

/// Header prefix for captured request headers.
pub const HEADER_LABEL_PREFIX: &str = "http.request.header.";

/// Replacement for sensitive header values.
pub const REDACTED: &str = "[REDACTED]";

/// Facade of the request in flight, shared between the middleware and the
/// handler.
pub type SharedTransaction = Arc<tokio::sync::Mutex<ApmTransaction>>;

/// A request handler panicked.
#[derive(Error, Debug)]
#[error("Request handler panicked: {message}")]
pub struct HandlerPanic {
    pub message: String,
}

/// Middleware state shared across requests
#[derive(Clone)]
pub struct ApmState {
    sink: Arc<dyn BackendSink>,
    config: Arc<ApmConfig>,
}

impl ApmState {
    pub fn new(sink: Arc<dyn BackendSink>, config: ApmConfig) -> Self {
        Self {
            sink,
            config: Arc::new(config),
        }
    }

    /// State backed by an [`InMemorySink`] sized and sampled from the config
    pub fn from_config(config: ApmConfig) -> Self {
        let sink = Arc::new(InMemorySink::from_config(&config));
        Self::new(sink, config)
    }

    pub fn sink(&self) -> &Arc<dyn BackendSink> {
        &self.sink
    }

    pub fn config(&self) -> &ApmConfig {
        &self.config
    }

    /// Fresh facade over the shared sink
    pub fn facade(&self) -> ApmTransaction {
        ApmTransaction::from_config(self.sink.clone(), &self.config)
    }
}

/// Record the request as a transaction.
///
/// Ignored paths pass through untouched. A handler panic is recorded, the
/// transaction is ended, and the panic is resumed.
pub async fn transaction_middleware(
    State(state): State<ApmState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    if state.config.is_ignored(&path) {
        tracing::debug!(path = %path, "Path ignored by APM");
        return next.run(request).await;
    }

    let method = request.method().clone();
    let name = format!("{} {}", method, path);
    let tracing_data = header_str(request.headers(), TRACEPARENT_HEADER).map(str::to_string);

    let mut facade = state.facade();
    facade.start_transaction(&name, tracing_data.as_deref(), REQUEST_TRANSACTION_TYPE);
    facade.add_labels(
        Some(&request_labels(&request, &state.config)),
        REQUEST_TRANSACTION_TYPE,
    );

    let Some(transaction) = facade.current_transaction() else {
        tracing::warn!(name = %name, "No transaction for request, continuing uninstrumented");
        return next.run(request).await;
    };

    let shared: SharedTransaction = Arc::new(tokio::sync::Mutex::new(facade));
    request.extensions_mut().insert(shared.clone());

    let start = Instant::now();
    let outcome = AssertUnwindSafe(ambient::scope(transaction, next.run(request)))
        .catch_unwind()
        .await;
    let elapsed = start.elapsed();

    let mut facade = shared.lock().await;
    match outcome {
        Ok(response) => {
            let status = response.status();
            let mut labels = Labels::new();
            labels.insert("http.status_code".to_string(), status.as_u16().to_string());
            labels.insert(
                "http.response_time_ms".to_string(),
                elapsed.as_millis().to_string(),
            );
            facade.add_labels(Some(&labels), REQUEST_TRANSACTION_TYPE);

            let result = if status.as_u16() >= 400 { "error" } else { "success" };
            facade.set_transaction_result(Some(result));
            facade.end_transaction();

            tracing::debug!(
                transaction = %transaction,
                method = %method,
                path = %path,
                status = %status.as_u16(),
                duration_ms = %elapsed.as_millis(),
                "Request transaction recorded"
            );
            response
        }
        Err(payload) => {
            let error = HandlerPanic {
                message: panic_message(payload.as_ref()),
            };
            tracing::error!(
                transaction = %transaction,
                method = %method,
                path = %path,
                error = %error.message,
                "Request handler panicked"
            );

            facade.capture_exception(&error);
            facade.set_transaction_result(Some("error"));
            facade.add_label("error.message", Some(&error.message), REQUEST_TRANSACTION_TYPE);
            facade.add_label(
                "error.type",
                Some(short_type_name::<HandlerPanic>()),
                REQUEST_TRANSACTION_TYPE,
            );
            facade.end_transaction();
            drop(facade);

            std::panic::resume_unwind(payload)
        }
    }
}

/// Labels describing the inbound request
fn request_labels(request: &Request, config: &ApmConfig) -> Labels {
    let uri = request.uri();
    let headers = request.headers();

    let scheme = uri.scheme_str().unwrap_or("http").to_string();
    let host = header_str(headers, header::HOST.as_str())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    let query_string = uri.query().map(|q| format!("?{q}")).unwrap_or_default();

    let remote_address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    let request_id = header_str(headers, "x-request-id")
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut labels = Labels::new();
    labels.insert("http.method".to_string(), request.method().to_string());
    labels.insert(
        "http.url".to_string(),
        format!("{scheme}://{host}{path_and_query}"),
    );
    labels.insert("http.scheme".to_string(), scheme);
    labels.insert("http.host".to_string(), host);
    labels.insert("http.path".to_string(), uri.path().to_string());
    labels.insert("http.query_string".to_string(), query_string);
    labels.insert(
        "user_agent".to_string(),
        header_str(headers, header::USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
    );
    labels.insert("remote_address".to_string(), remote_address);
    labels.insert("request_id".to_string(), request_id);

    if config.capture_headers {
        labels.extend(header_labels(headers, config));
    }
    labels
}

/// One label per header, with sensitive values redacted
fn header_labels(headers: &HeaderMap, config: &ApmConfig) -> Labels {
    headers
        .keys()
        .map(|name| {
            let value = if config.is_sensitive(name.as_str()) {
                REDACTED.to_string()
            } else {
                headers
                    .get_all(name)
                    .iter()
                    .filter_map(|v| v.to_str().ok())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            (format!("{HEADER_LABEL_PREFIX}{}", name.as_str()), value)
        })
        .collect()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Install [`transaction_middleware`] on a router
pub trait ApmRouterExt {
    fn with_apm_transactions(self, state: ApmState) -> Self;
}

impl<S> ApmRouterExt for Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    fn with_apm_transactions(self, state: ApmState) -> Self {
        self.layer(axum::middleware::from_fn_with_state(
            state,
            transaction_middleware,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http;

    fn request(uri: &str) -> Request {
        http::Request::builder()
            .uri(uri)
            .header("host", "shop.local")
            .header("user-agent", "curl/8.0")
            .header("authorization", "Bearer secret")
            .header("x-request-id", "req-1")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_request_labels() {
        let config = ApmConfig::default();
        let labels = request_labels(&request("/orders?page=2"), &config);

        assert_eq!(labels["http.method"], "GET");
        assert_eq!(labels["http.url"], "http://shop.local/orders?page=2");
        assert_eq!(labels["http.host"], "shop.local");
        assert_eq!(labels["http.path"], "/orders");
        assert_eq!(labels["http.query_string"], "?page=2");
        assert_eq!(labels["user_agent"], "curl/8.0");
        assert_eq!(labels["remote_address"], "");
        assert_eq!(labels["request_id"], "req-1");
        assert_eq!(labels["http.request.header.authorization"], REDACTED);
        assert_eq!(labels["http.request.header.user-agent"], "curl/8.0");
    }

    #[test]
    fn test_headers_not_captured_when_disabled() {
        let config = ApmConfig::builder().capture_headers(false).build();
        let labels = request_labels(&request("/orders"), &config);

        assert!(!labels.keys().any(|k| k.starts_with(HEADER_LABEL_PREFIX)));
        assert_eq!(labels["http.query_string"], "");
    }

    #[test]
    fn test_generated_request_id() {
        let request = http::Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let labels = request_labels(&request, &ApmConfig::default());
        assert!(Uuid::parse_str(&labels["request_id"]).is_ok());
    }

    #[test]
    fn test_state_facade_uses_config() {
        let state = ApmState::from_config(ApmConfig::builder().clear_on_end(true).build());
        assert!(state.facade().options().clear_on_end);
    }
}
