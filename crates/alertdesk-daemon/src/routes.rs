//! Axum router and all HTTP handlers for alertdesk-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;
use uuid::Uuid;

use alertdesk_compiler::CompileRequest;
use alertdesk_orchestrator::EnqueueError;

use crate::{
    api_types::{
        CompileRuleRequest, CompileRuleResponse, ErrorResponse, HealthResponse,
        IngestTransactionRequest, IngestTransactionResponse, ListRulesQuery, ListRulesResponse,
        PatchRuleRequest, RuleHistoryResponse,
    },
    state::{AppState, BusMsg},
};

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stream", get(stream))
        .route("/transactions", post(ingest_transaction))
        .route("/rules/validate", post(validate_rule))
        .route("/rules", post(create_rule))
        .route("/rules", get(list_rules))
        .route("/rules/:id", patch(patch_rule))
        .route("/rules/:id", axum::routing::delete(delete_rule))
        .route("/rules/:id/history", get(rule_history))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service,
            version: st.build.version,
        }),
    )
}

// ---------------------------------------------------------------------------
// POST /transactions
// ---------------------------------------------------------------------------

pub(crate) async fn ingest_transaction(
    State(st): State<Arc<AppState>>,
    Json(body): Json<IngestTransactionRequest>,
) -> Response {
    let txn = body.transaction;

    if let Err(e) = alertdesk_db::insert_transaction(&st.pool, &txn).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response();
    }

    match st.orchestrator.enqueue_transaction(txn.user_id, txn.id) {
        Ok(()) => {
            info!(transaction_id = %txn.id, "transaction ingested");
            (
                StatusCode::ACCEPTED,
                Json(IngestTransactionResponse {
                    transaction_id: txn.id,
                    enqueued: true,
                }),
            )
                .into_response()
        }
        Err(EnqueueError) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ErrorResponse {
                error: "evaluation queue is full, retry shortly".to_string(),
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// POST /rules/validate, POST /rules
// ---------------------------------------------------------------------------

fn compile_result_to_response(result: alertdesk_compiler::CompileResult) -> CompileRuleResponse {
    use alertdesk_compiler::CompileResult;
    match result {
        CompileResult::Valid(rule) => CompileRuleResponse::Valid { rule },
        CompileResult::DuplicateOf { existing_rule_id, similarity } => {
            CompileRuleResponse::Duplicate { existing_rule_id, similarity }
        }
        CompileResult::Invalid { reason, hints } => CompileRuleResponse::Invalid { reason, hints },
        CompileResult::Ambiguous { questions } => CompileRuleResponse::Ambiguous { questions },
    }
}

/// Dry-run compile: runs the full Parse -> Ground -> Synthesize -> Validate
/// -> DedupCheck pipeline but never persists the result, so a client can
/// preview what a rule would look like before committing to it.
pub(crate) async fn validate_rule(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CompileRuleRequest>,
) -> Response {
    let result = match st
        .compiler
        .compile(CompileRequest {
            user_id: body.user_id,
            nl_text: &body.nl_text,
            severity: body.severity,
            editing_rule_id: None,
        })
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: e.to_string() }),
            )
                .into_response()
        }
    };

    (StatusCode::OK, Json(compile_result_to_response(result))).into_response()
}

pub(crate) async fn create_rule(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CompileRuleRequest>,
) -> Response {
    let result = match st
        .compiler
        .compile(CompileRequest {
            user_id: body.user_id,
            nl_text: &body.nl_text,
            severity: body.severity,
            editing_rule_id: None,
        })
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: e.to_string() }),
            )
                .into_response()
        }
    };

    if let alertdesk_compiler::CompileResult::Valid(ref rule) = result {
        if let Err(e) = alertdesk_db::insert_rule(&st.pool, rule).await {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse { error: e.to_string() }),
            )
                .into_response();
        }

        let mut audit = st.audit.lock().await;
        let _ = audit.append(rule.id, "rule", "created", json!({"nl_text": rule.nl_text}));
        drop(audit);

        info!(rule_id = %rule.id, "rule created");
        return (StatusCode::CREATED, Json(compile_result_to_response(result))).into_response();
    }

    (StatusCode::OK, Json(compile_result_to_response(result))).into_response()
}

// ---------------------------------------------------------------------------
// GET /rules?user_id=...
// ---------------------------------------------------------------------------

pub(crate) async fn list_rules(
    State(st): State<Arc<AppState>>,
    Query(q): Query<ListRulesQuery>,
) -> Response {
    match alertdesk_db::get_active_rules(&st.pool, q.user_id).await {
        Ok(rules) => (StatusCode::OK, Json(ListRulesResponse { rules })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// PATCH /rules/:id, DELETE /rules/:id
// ---------------------------------------------------------------------------

pub(crate) async fn patch_rule(
    State(st): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<PatchRuleRequest>,
) -> Response {
    let mut rule = match alertdesk_db::get_rule(&st.pool, id).await {
        Ok(r) => r,
        Err(e) => {
            return (StatusCode::NOT_FOUND, Json(ErrorResponse { error: e.to_string() }))
                .into_response()
        }
    };

    if let Some(is_active) = body.is_active {
        rule.is_active = is_active;
    }
    if let Some(severity) = body.severity {
        rule.severity = severity;
    }

    if let Err(e) = alertdesk_db::update_rule(&st.pool, &rule).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response();
    }

    if !rule.is_active {
        let _ = st.bus.send(BusMsg::RuleDeactivated { rule_id: rule.id });
    }

    let mut audit = st.audit.lock().await;
    let _ = audit.append(rule.id, "rule", "edited", json!({"is_active": rule.is_active}));
    drop(audit);

    (StatusCode::OK, Json(rule)).into_response()
}

pub(crate) async fn delete_rule(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    if let Err(e) = alertdesk_db::delete_rule(&st.pool, id).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e.to_string() }),
        )
            .into_response();
    }

    let mut audit = st.audit.lock().await;
    let _ = audit.append(id, "rule", "deleted", json!({}));
    drop(audit);

    StatusCode::NO_CONTENT.into_response()
}

// ---------------------------------------------------------------------------
// GET /rules/:id/history
// ---------------------------------------------------------------------------

pub(crate) async fn rule_history(State(st): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match alertdesk_db::get_rule(&st.pool, id).await {
        Ok(rule) => (
            StatusCode::OK,
            Json(RuleHistoryResponse {
                rule_id: rule.id,
                trigger_count: rule.trigger_count,
                last_triggered_at: rule.last_triggered_at,
                consecutive_failures: rule.consecutive_failures,
            }),
        )
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(ErrorResponse { error: e.to_string() })).into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::NotificationQueued { .. } => "notification_queued",
                    BusMsg::RuleDeactivated { .. } => "rule_deactivated",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
