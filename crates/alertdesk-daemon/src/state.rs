//! Shared runtime state for alertdesk-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself, only the handles those handlers need.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alertdesk_compiler::Compiler;
use alertdesk_dispatch::Destination;
use alertdesk_orchestrator::{DestinationResolver, Orchestrator};
use alertdesk_schemas::Channel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

/// Events broadcast over the internal bus and surfaced as SSE events on
/// `GET /stream`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    NotificationQueued { notification_id: Uuid, rule_id: Uuid },
    RuleDeactivated { rule_id: Uuid },
}

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Resolves where a user's notifications should be delivered from a
/// startup-loaded, in-memory configuration table. A real deployment would
/// read this from user-managed settings; this keeps the daemon standalone
/// without adding webhook-destination columns to the schema.
pub struct StaticDestinationResolver {
    pool: PgPool,
    webhook_destinations: BTreeMap<Uuid, (String, String)>,
}

impl StaticDestinationResolver {
    pub fn new(pool: PgPool, webhook_destinations: BTreeMap<Uuid, (String, String)>) -> Self {
        Self { pool, webhook_destinations }
    }
}

#[async_trait]
impl DestinationResolver for StaticDestinationResolver {
    async fn resolve(&self, user_id: Uuid, channel: Channel) -> Option<Destination> {
        match channel {
            Channel::Email => {
                let user = alertdesk_db::get_user(&self.pool, user_id).await.ok()?;
                Some(Destination::Email { to: user.email })
            }
            Channel::Webhook => {
                let (url, hmac_secret) = self.webhook_destinations.get(&user_id)?.clone();
                Some(Destination::Webhook { url, hmac_secret })
            }
            Channel::Sms => None,
        }
    }
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub build: BuildInfo,
    pub bus: broadcast::Sender<BusMsg>,
    pub compiler: Arc<Compiler>,
    pub orchestrator: Arc<Orchestrator>,
    pub audit: Arc<Mutex<alertdesk_audit::AuditWriter>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        compiler: Compiler,
        orchestrator: Orchestrator,
        audit: Arc<Mutex<alertdesk_audit::AuditWriter>>,
    ) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            pool,
            build: BuildInfo {
                service: "alertdesk-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            bus,
            compiler: Arc::new(compiler),
            orchestrator: Arc::new(orchestrator),
            audit,
        }
    }
}

/// Reads `ALERTDESK_WEBHOOK_DESTINATIONS`, a JSON object mapping user id to
/// `{"url": ..., "hmac_secret": ...}`, into the table `StaticDestinationResolver`
/// consults for the webhook channel. Absent or unparseable input yields an
/// empty table — webhook deliveries simply have nowhere to go until a user
/// is added.
pub fn load_webhook_destinations_from_env() -> BTreeMap<Uuid, (String, String)> {
    #[derive(serde::Deserialize)]
    struct Entry {
        url: String,
        hmac_secret: String,
    }

    let raw = match std::env::var("ALERTDESK_WEBHOOK_DESTINATIONS") {
        Ok(v) => v,
        Err(_) => return BTreeMap::new(),
    };

    let parsed: BTreeMap<Uuid, Entry> = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse ALERTDESK_WEBHOOK_DESTINATIONS, ignoring");
            return BTreeMap::new();
        }
    };

    parsed
        .into_iter()
        .map(|(id, e)| (id, (e.url, e.hmac_secret)))
        .collect()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
