//! Axum extractor for the request's transaction facade.
//!
//! Rejects with 500 if [`transaction_middleware`](crate::transaction_middleware)
//! is not installed on the route.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::middleware::SharedTransaction;

/// Handle to the facade of the request in flight.
pub struct CurrentTransaction(pub SharedTransaction);

/// Rejection when the APM middleware did not run for this request.
pub struct CurrentTransactionRejection {
    message: String,
}

impl IntoResponse for CurrentTransactionRejection {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": "TRANSACTION_MIDDLEWARE_MISSING",
                "message": self.message
            })),
        )
            .into_response()
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for CurrentTransaction {
    type Rejection = CurrentTransactionRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SharedTransaction>()
            .cloned()
            .map(Self)
            .ok_or_else(|| CurrentTransactionRejection {
                message: "APM transaction middleware is not installed on this route".to_string(),
            })
    }
}
