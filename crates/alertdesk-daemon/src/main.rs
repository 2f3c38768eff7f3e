//! alertdesk-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, builds the shared
//! state, wires middleware, and starts the HTTP server. All route handlers
//! live in `routes.rs`; all shared state types live in `state.rs`.

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use rust_decimal::Decimal;
use alertdesk_analyzer::AnalyzerConfig;
use alertdesk_compiler::{llm, Compiler};
use alertdesk_config::AppConfig;
use alertdesk_daemon::{routes, state};
use alertdesk_dispatch::{DispatchConfig, EmailAdapter, WebhookAdapter};
use alertdesk_embed::EmbeddingService;
use alertdesk_evaluator::EvaluatorConfig;
use alertdesk_orchestrator::{Orchestrator, OrchestratorConfig};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    let config = load_app_config();
    init_tracing(&config.log.level);

    let pool = alertdesk_db::connect_from_env()
        .await
        .context("connect to database")?;
    alertdesk_db::migrate(&pool).await.context("run migrations")?;

    let embed_provider = alertdesk_embed::provider_from_env().context("build embedding provider")?;
    let embed = EmbeddingService::new(Arc::new(embed_provider));

    let llm_client = llm::client_from_env().context("build llm client")?;
    let llm = llm::LlmService::new(Arc::new(llm_client));

    let compiler = Compiler::new(
        pool.clone(),
        embed,
        llm,
        config.dup_similarity_threshold,
        config.category_similarity_threshold,
    );

    let email_adapter = Arc::new(email_adapter_from_env().context("build email adapter")?);
    let webhook_http = reqwest::Client::builder()
        .timeout(DispatchConfig::sane_defaults().send_timeout)
        .build()
        .context("build webhook http client")?;
    let webhook_adapter = Arc::new(WebhookAdapter::new(webhook_http));

    let webhook_destinations = state::load_webhook_destinations_from_env();
    let resolver = Arc::new(state::StaticDestinationResolver::new(
        pool.clone(),
        webhook_destinations,
    ));

    let analyzer_cfg = AnalyzerConfig {
        impossible_travel_kmh: config.impossible_travel.max_kmh,
        ..AnalyzerConfig::sane_defaults()
    };

    let eval_cfg = EvaluatorConfig {
        sql_timeout: Duration::from_millis(config.eval.timeout_ms),
        fx_rates: load_fx_rates(&config.fx.table_path),
        ..EvaluatorConfig::sane_defaults()
    };

    let dispatch_cfg = DispatchConfig {
        max_retries: config.dispatch.retries,
        backoff_base: Duration::from_millis(config.dispatch.backoff_base_ms),
        ..DispatchConfig::sane_defaults()
    };

    let orchestrator_cfg = OrchestratorConfig {
        evaluate_workers: config.eval.workers,
        dispatch_workers: config.dispatch.workers,
        queue_capacity: config.eval.queue_max,
        ..OrchestratorConfig::sane_defaults()
    };

    let audit_path =
        std::env::var("ALERTDESK_AUDIT_LOG_PATH").unwrap_or_else(|_| "audit/rules.jsonl".to_string());
    let audit = Arc::new(tokio::sync::Mutex::new(
        alertdesk_audit::AuditWriter::new(&audit_path, true).context("open audit log")?,
    ));

    let orchestrator = Orchestrator::spawn(
        pool.clone(),
        analyzer_cfg,
        eval_cfg,
        dispatch_cfg,
        email_adapter,
        webhook_adapter,
        resolver,
        audit.clone(),
        orchestrator_cfg,
    );

    let shared = Arc::new(state::AppState::new(pool, compiler, orchestrator, audit));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(15));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr_from_env(&config).unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8899)));
    info!("alertdesk-daemon listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shared))
        .await
        .context("server crashed")?;

    Ok(())
}

async fn shutdown_signal(state: Arc<state::AppState>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received, draining orchestrator");
    state.orchestrator.shutdown().await;
}

/// Loads the layered YAML config from `ALERTDESK_CONFIG_PATH` (comma
/// separated layers, base first), falling back to built-in defaults when
/// unset or unreadable — a fresh checkout should still start.
fn load_app_config() -> AppConfig {
    let paths_env = std::env::var("ALERTDESK_CONFIG_PATH").unwrap_or_default();
    if paths_env.trim().is_empty() {
        return AppConfig::default();
    }

    let paths: Vec<&str> = paths_env.split(',').map(str::trim).collect();
    match alertdesk_config::load_layered_yaml(&paths).and_then(|loaded| AppConfig::from_loaded(&loaded)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("warning: failed to load config from {:?}, using defaults: {e:#}", paths);
            AppConfig::default()
        }
    }
}

/// Reads a flat `currency: rate` YAML mapping (units of that currency per
/// one USD). Missing or unparseable file yields an empty table, which
/// disables cross-currency rules rather than crashing the daemon.
fn load_fx_rates(path: &str) -> BTreeMap<String, Decimal> {
    let raw = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path, error = %e, "fx rate table not found, cross-currency rules will gate as mismatched");
            return BTreeMap::new();
        }
    };

    match serde_yaml::from_str::<BTreeMap<String, Decimal>>(&raw) {
        Ok(table) => table,
        Err(e) => {
            warn!(path, error = %e, "fx rate table malformed, ignoring");
            BTreeMap::new()
        }
    }
}

fn email_adapter_from_env() -> anyhow::Result<EmailAdapter> {
    let host = std::env::var("ALERTDESK_SMTP_HOST").context("ALERTDESK_SMTP_HOST is not set")?;
    let username = std::env::var("ALERTDESK_SMTP_USERNAME").context("ALERTDESK_SMTP_USERNAME is not set")?;
    let password = std::env::var("ALERTDESK_SMTP_PASSWORD").context("ALERTDESK_SMTP_PASSWORD is not set")?;
    let from = std::env::var("ALERTDESK_SMTP_FROM").context("ALERTDESK_SMTP_FROM is not set")?;

    let credentials = Credentials::new(username, password);
    let mailbox: Mailbox = from.parse().context("parse ALERTDESK_SMTP_FROM as a mailbox")?;
    EmailAdapter::relay(&host, credentials, mailbox)
}

fn init_tracing(default_level: &str) {
    let fallback = if default_level.trim().is_empty() { "info" } else { default_level };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .init();
}

fn bind_addr_from_env(config: &AppConfig) -> Option<SocketAddr> {
    std::env::var("ALERTDESK_DAEMON_ADDR")
        .ok()
        .or_else(|| Some(config.daemon.addr.clone()))
        .and_then(|s| s.parse().ok())
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers(tower_http::cors::Any)
}
