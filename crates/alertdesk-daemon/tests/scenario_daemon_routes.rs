//! In-process scenario tests for alertdesk-daemon HTTP endpoints.
//!
//! These tests spin up the Axum router **without** binding a TCP socket,
//! driving it via `tower::ServiceExt::oneshot`, against a real Postgres
//! test database (skipped entirely when one isn't reachable) with a
//! deterministic LLM/embedder stand-in so nothing makes a network call.

use std::collections::BTreeSet;
use std::sync::Arc;

use alertdesk_audit::AuditWriter;
use alertdesk_compiler::llm::{LlmClient, LlmError, LlmService, ParsedIntent};
use alertdesk_compiler::Compiler;
use alertdesk_db::{insert_card, testkit_db_pool, upsert_user};
use alertdesk_dispatch::{ChannelAdapter, DispatchError};
use alertdesk_embed::{EmbeddingProvider, EmbeddingService, ProviderError};
use alertdesk_orchestrator::{DestinationResolver, Orchestrator, OrchestratorConfig};
use alertdesk_schemas::{Channel, CreditCard, Operator, RuleKind, User};
use async_trait::async_trait;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use alertdesk_daemon::{routes, state};

struct CannedLlm;

#[async_trait]
impl LlmClient for CannedLlm {
    fn name(&self) -> &'static str {
        "canned"
    }

    async fn parse_intent(&self, _nl_text: &str) -> Result<ParsedIntent, LlmError> {
        let mut channels = BTreeSet::new();
        channels.insert(Channel::Email);
        Ok(ParsedIntent {
            intent: alertdesk_schemas::RuleIntent {
                kind: RuleKind::Threshold,
                amount: Some(Decimal::new(50000, 2)),
                operator: Some(Operator::Gt),
                baseline: None,
                window_secs: Some(60),
                category: None,
                merchant: None,
                geo_scope: None,
                threshold_pct: None,
                channels,
            },
            confidence: 0.95,
            questions: vec![],
        })
    }
}

struct StubEmbedder;

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn dim(&self) -> usize {
        4
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0, 0.0, 0.0]).collect())
    }
}

struct NoopAdapter;

#[async_trait]
impl ChannelAdapter for NoopAdapter {
    type Request = alertdesk_dispatch::EmailMessage;

    async fn send(&self, _req: &Self::Request) -> Result<(), DispatchError> {
        Ok(())
    }
}

struct NoopWebhookAdapter;

#[async_trait]
impl ChannelAdapter for NoopWebhookAdapter {
    type Request = alertdesk_dispatch::WebhookMessage;

    async fn send(&self, _req: &Self::Request) -> Result<(), DispatchError> {
        Ok(())
    }
}

struct NoDestination;

#[async_trait]
impl DestinationResolver for NoDestination {
    async fn resolve(&self, _user_id: Uuid, _channel: Channel) -> Option<alertdesk_dispatch::Destination> {
        None
    }
}

async fn make_state(pool: PgPool) -> Arc<state::AppState> {
    let embed = EmbeddingService::new(Arc::new(StubEmbedder));
    let llm = LlmService::new(Arc::new(CannedLlm));
    let compiler = Compiler::new(pool.clone(), embed, llm, 0.92, 0.80);

    let audit_path = std::env::temp_dir().join(format!("alertdesk-daemon-test-{}.jsonl", Uuid::new_v4()));
    let audit = Arc::new(tokio::sync::Mutex::new(
        AuditWriter::new(&audit_path, true).expect("audit writer"),
    ));

    let orchestrator = Orchestrator::spawn(
        pool.clone(),
        alertdesk_analyzer::AnalyzerConfig::sane_defaults(),
        alertdesk_evaluator::EvaluatorConfig::sane_defaults(),
        alertdesk_dispatch::DispatchConfig::sane_defaults(),
        Arc::new(NoopAdapter),
        Arc::new(NoopWebhookAdapter),
        Arc::new(NoDestination),
        audit.clone(),
        OrchestratorConfig::sane_defaults(),
    );

    Arc::new(state::AppState::new(pool, compiler, orchestrator, audit))
}

async fn seeded_user(pool: &PgPool) -> (Uuid, Uuid) {
    let user_id = Uuid::new_v4();
    let card_id = Uuid::new_v4();
    upsert_user(
        pool,
        &User {
            id: user_id,
            email: format!("{user_id}@example.com"),
            home_coords: None,
            home_state: Some("CA".into()),
            credit_limit: Decimal::new(1_500_000, 2),
            current_balance: Decimal::ZERO,
            location_consent: true,
            last_known_coords: None,
            timezone: "America/Los_Angeles".into(),
        },
    )
    .await
    .unwrap();
    insert_card(
        pool,
        &CreditCard {
            id: card_id,
            user_id,
            last4: "4242".into(),
            network: "visa".into(),
            issuer: "test-bank".into(),
            active: true,
        },
    )
    .await
    .unwrap();
    (user_id, card_id)
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, serde_json::Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let bytes = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_returns_200_ok_true() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let st = make_state(pool).await;
    let router = routes::build_router(st);

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = call(router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "alertdesk-daemon");
}

#[tokio::test]
async fn validate_rule_returns_valid_without_persisting_it() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let (user_id, _card_id) = seeded_user(&pool).await;
    let st = make_state(pool.clone()).await;
    let router = routes::build_router(st);

    let body = json!({
        "user_id": user_id,
        "nl_text": "alert me if a single purchase is over $500",
        "severity": "MED",
    });
    let req = Request::builder()
        .method("POST")
        .uri("/rules/validate")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, json) = call(router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "valid");

    let rules = alertdesk_db::get_active_rules(&pool, user_id).await.unwrap();
    assert!(rules.is_empty(), "validate must never persist a rule");
}

#[tokio::test]
async fn create_rule_persists_it_and_list_rules_returns_it() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let (user_id, _card_id) = seeded_user(&pool).await;
    let st = make_state(pool.clone()).await;
    let router = routes::build_router(st);

    let body = json!({
        "user_id": user_id,
        "nl_text": "alert me if a single purchase is over $500",
        "severity": "MED",
    });
    let req = Request::builder()
        .method("POST")
        .uri("/rules")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, json) = call(router.clone(), req).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "valid");

    let req = Request::builder()
        .method("GET")
        .uri(format!("/rules?user_id={user_id}"))
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, json) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["rules"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn patch_rule_deactivates_it() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let (user_id, _card_id) = seeded_user(&pool).await;
    let st = make_state(pool.clone()).await;
    let router = routes::build_router(st);

    let body = json!({
        "user_id": user_id,
        "nl_text": "alert me if a single purchase is over $500",
        "severity": "MED",
    });
    let req = Request::builder()
        .method("POST")
        .uri("/rules")
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (_, created) = call(router.clone(), req).await;
    let rule_id = created["rule"]["id"].as_str().unwrap();

    let req = Request::builder()
        .method("PATCH")
        .uri(format!("/rules/{rule_id}"))
        .header("content-type", "application/json")
        .body(axum::body::Body::from(json!({"is_active": false}).to_string()))
        .unwrap();
    let (status, json) = call(router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["is_active"], false);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let st = make_state(pool).await;
    let router = routes::build_router(st);

    let req = Request::builder()
        .method("GET")
        .uri("/does_not_exist")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = call(router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

