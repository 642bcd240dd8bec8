//! The minimal HTTP surface of `serve`.
//!
//! Two endpoints: `/health` for liveness probes, and a long-polling
//! incoming-transaction history backed by the notification bus. The wider
//! wire-gateway REST API lives upstream; this surface exists so operators
//! and integration tests can observe ingestion without touching SQL.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::notifications::NotificationBus;
use crate::store::{PaymentStore, StoreError, CHANNEL_INCOMING};

#[derive(Clone)]
pub struct ApiState {
    pub store: PaymentStore,
    pub bus: NotificationBus,
    /// Cap on client-requested long-poll durations.
    pub max_poll_ms: u64,
}

pub fn routes(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/history/incoming", get(get_incoming_history))
        .with_state(state)
}

#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<ApiState>>) -> Response {
    // A cheap read proves both the pool and the schema are reachable.
    match state.store.incoming_after(i64::MAX - 1).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response(),
        Err(err) => store_error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    /// Return rows with an id strictly greater than this.
    #[serde(default)]
    start: i64,
    /// How long to wait for fresh rows when none are there yet.
    #[serde(default)]
    poll_ms: u64,
}

/// `GET /history/incoming?start=&poll_ms=`: incoming bookings past a row
/// id, waiting up to `poll_ms` for a new one to arrive.
///
/// The bus subscription is registered *before* the initial read; a row
/// that lands between the read and the wait still wakes the poll.
#[instrument(skip_all, fields(start = params.start, poll_ms = params.poll_ms))]
async fn get_incoming_history(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let poll = Duration::from_millis(params.poll_ms.min(state.max_poll_ms));
    let result = state
        .bus
        .listen(CHANNEL_INCOMING, |mut receiver| {
            let store = state.store.clone();
            async move {
                let rows = store.incoming_after(params.start).await?;
                if !rows.is_empty() || poll.is_zero() {
                    return Ok(rows);
                }
                let deadline = tokio::time::sleep(poll);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => return Ok(Vec::new()),
                        notification = receiver.recv() => {
                            if notification.is_err() {
                                // Lagged or closed: fall back to a read.
                                return store.incoming_after(params.start).await;
                            }
                            let rows = store.incoming_after(params.start).await?;
                            if !rows.is_empty() {
                                return Ok(rows);
                            }
                        }
                    }
                }
            }
        })
        .await;
    match result {
        Ok(rows) => (StatusCode::OK, Json(json!({ "incoming": rows }))).into_response(),
        Err(err) => store_error_response(err),
    }
}

fn store_error_response(err: StoreError) -> Response {
    tracing::error!(%err, "request failed against the store");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
        .into_response()
}
