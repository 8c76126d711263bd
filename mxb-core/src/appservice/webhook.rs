//! Application-service HTTP surface
//!
//! The homeserver pushes transactions to `PUT /_matrix/app/v1/transactions/{txnId}`
//! and queries user ids in the ghost namespace. Every accepted transaction is
//! answered with `200 {}`; per-event failures stay inside the
//! [`TransactionReport`](super::TransactionReport).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::processor::TransactionProcessor;

/// Shared state of the webhook handlers
#[derive(Clone)]
pub struct AppServiceState {
    processor: Arc<TransactionProcessor>,
    hs_token: Option<Arc<str>>,
}

impl AppServiceState {
    pub fn new(processor: Arc<TransactionProcessor>, hs_token: Option<String>) -> Self {
        Self {
            processor,
            hs_token: hs_token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    pub fn processor(&self) -> &TransactionProcessor {
        &self.processor
    }
}

/// Build the application-service router
pub fn router(state: AppServiceState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/_matrix/app/v1/transactions/:txn_id", put(put_transaction))
        .route("/_matrix/app/v1/transactions", put(missing_transaction_id))
        .route("/_matrix/app/v1/transactions/", put(missing_transaction_id))
        .route("/transactions/:txn_id", put(put_transaction))
        .route("/transactions", put(missing_transaction_id))
        .route("/transactions/", put(missing_transaction_id))
        .route("/_matrix/app/v1/users/:user_id", get(query_user))
        .route("/_matrix/app/v1/rooms/:alias", get(query_room))
        .route("/_matrix/app/v1/ping", post(ping))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct AuthQuery {
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionBody {
    events: Vec<Value>,
}

fn matrix_error(status: StatusCode, errcode: &str, message: &str) -> Response {
    (status, Json(json!({"errcode": errcode, "error": message}))).into_response()
}

fn ok_empty() -> Response {
    (StatusCode::OK, Json(json!({}))).into_response()
}

/// `Err` carries the rejection response
fn authorize(state: &AppServiceState, headers: &HeaderMap, query: &AuthQuery) -> Result<(), Response> {
    let Some(expected) = state.hs_token.as_deref() else {
        return Ok(());
    };

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let presented = bearer.or(query.access_token.as_deref());

    match presented {
        None | Some("") => Err(matrix_error(
            StatusCode::UNAUTHORIZED,
            "M_UNAUTHORIZED",
            "missing homeserver token",
        )),
        Some(token) if token != expected => {
            warn!("Rejected request with an invalid homeserver token");
            Err(matrix_error(
                StatusCode::FORBIDDEN,
                "M_FORBIDDEN",
                "invalid homeserver token",
            ))
        }
        Some(_) => Ok(()),
    }
}

async fn put_transaction(
    State(state): State<AppServiceState>,
    Path(txn_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &auth) {
        return rejection;
    }
    if txn_id.trim().is_empty() {
        return matrix_error(
            StatusCode::BAD_REQUEST,
            "M_MISSING_PARAM",
            "missing transaction id",
        );
    }

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            debug!("Transaction {} body is not JSON: {}", txn_id, e);
            return matrix_error(StatusCode::BAD_REQUEST, "M_NOT_JSON", "body is not valid JSON");
        }
    };
    let transaction: TransactionBody = match serde_json::from_value(value) {
        Ok(transaction) => transaction,
        Err(e) => {
            return matrix_error(
                StatusCode::BAD_REQUEST,
                "M_BAD_JSON",
                &format!("invalid transaction: {}", e),
            );
        }
    };

    let report = state.processor.process(&txn_id, transaction.events).await;
    if !report.duplicate {
        info!(
            "Transaction {} processed: {} events, {} failed",
            txn_id,
            report.outcomes.len(),
            report.failed()
        );
    }
    ok_empty()
}

async fn missing_transaction_id() -> Response {
    matrix_error(
        StatusCode::BAD_REQUEST,
        "M_MISSING_PARAM",
        "missing transaction id",
    )
}

async fn query_user(
    State(state): State<AppServiceState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &auth) {
        return rejection;
    }
    if state.processor.mapper().is_ghost_user(&user_id) {
        ok_empty()
    } else {
        matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "user not managed by the bridge")
    }
}

async fn query_room(
    State(state): State<AppServiceState>,
    Path(_alias): Path<String>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &auth) {
        return rejection;
    }
    matrix_error(StatusCode::NOT_FOUND, "M_NOT_FOUND", "room aliases are not provisioned")
}

async fn ping(
    State(state): State<AppServiceState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> Response {
    if let Err(rejection) = authorize(&state, &headers, &auth) {
        return rejection;
    }
    ok_empty()
}
