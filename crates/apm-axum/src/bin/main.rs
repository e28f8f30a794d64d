//! APM demo server
//!
//! Serves a small checkout API instrumented with the transaction middleware
//! and exposes what the in-memory sink recorded under `/_apm/transactions`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use apm_axum::{ApmRouterExt, ApmState, CurrentTransaction};
use apm_transaction::{ApmConfig, InMemorySink, Labels, ToLabels, TransactionFacade};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apm-demo")]
#[command(about = "Checkout API instrumented with APM transactions")]
#[command(version)]
struct Cli {
    /// Path to a TOML or YAML configuration file
    #[arg(short, long, env = "APM_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind to
    #[arg(short, long, default_value = "127.0.0.1:8080", env = "APM_BIND")]
    bind: SocketAddr,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct CheckoutRequest {
    cart_id: String,
    items: Vec<String>,
    total_cents: u64,
}

#[derive(Clone)]
struct AppState {
    sink: Arc<InMemorySink>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ApmConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ApmConfig::from_env(),
    };
    if config.service_name.trim().is_empty() {
        config.service_name = "apm-demo".to_string();
    }

    let level = if config.enable_logging {
        config.log_level.as_filter()
    } else {
        "off"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    config.validate()?;

    let sink = Arc::new(InMemorySink::from_config(&config));
    let apm = ApmState::new(sink.clone(), config.clone());

    let app = Router::new()
        .route("/checkout", post(checkout))
        .route("/health", get(|| async { "ok" }))
        .route("/_apm/transactions", get(transactions))
        .with_state(AppState { sink })
        .with_apm_transactions(apm);

    tracing::info!(
        service = %config.service_name,
        environment = %config.environment,
        "Starting APM demo on {}",
        cli.bind
    );

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn checkout(
    CurrentTransaction(transaction): CurrentTransaction,
    Json(order): Json<CheckoutRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let mut facade = transaction.lock().await;

    facade.add_message_payload_to_transaction(
        Some(&order.to_labels_for(&["cart_id", "total_cents"])),
        "request",
    );
    facade.set_custom_context("order", Some(&order));

    let mut labels = Labels::new();
    labels.insert("items".to_string(), order.items.len().to_string());
    facade
        .capture_span_async(
            "reserve_inventory",
            Some(&labels),
            Some(|| async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<(), anyhow::Error>(())
            }),
            "db",
        )
        .await;

    if order.items.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "cart is empty" })),
        );
    }

    let trace = facade.outgoing_distributed_tracing_data();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "cart_id": order.cart_id,
            "traceparent": trace,
        })),
    )
}

async fn transactions(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "transactions": state.sink.transactions() }))
}
