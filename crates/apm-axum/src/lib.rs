//! Axum integration for the APM transaction facade.
//!
//! # Usage
//!
//! 1. Build an `ApmState` from a sink and an `ApmConfig`.
//! 2. Install the middleware with `ApmRouterExt::with_apm_transactions`.
//! 3. Use the `CurrentTransaction` extractor in handlers to enrich the
//!    request's transaction.

pub mod extract;
pub mod middleware;

pub use extract::CurrentTransaction;
pub use middleware::{
    transaction_middleware, ApmRouterExt, ApmState, HandlerPanic, SharedTransaction,
    REQUEST_TRANSACTION_TYPE,
};
