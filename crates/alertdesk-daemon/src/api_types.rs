//! Request and response types for all alertdesk-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use alertdesk_schemas::{AlertRule, Severity, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// POST /transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct IngestTransactionRequest {
    pub transaction: Transaction,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestTransactionResponse {
    pub transaction_id: Uuid,
    /// `true` if the transaction was accepted for evaluation, `false` if
    /// the evaluation queue was full (`RateLimited`) — the caller may
    /// retry.
    pub enqueued: bool,
}

// ---------------------------------------------------------------------------
// POST /rules/validate, POST /rules, PATCH /rules/{id}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CompileRuleRequest {
    pub user_id: Uuid,
    pub nl_text: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRulesQuery {
    pub user_id: Uuid,
}

fn default_severity() -> Severity {
    Severity::Med
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompileRuleResponse {
    Valid { rule: AlertRule },
    Duplicate { existing_rule_id: Uuid, similarity: f64 },
    Invalid { reason: String, hints: Vec<String> },
    Ambiguous { questions: Vec<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRulesResponse {
    pub rules: Vec<AlertRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchRuleRequest {
    pub is_active: Option<bool>,
    pub severity: Option<Severity>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleHistoryResponse {
    pub rule_id: Uuid,
    pub trigger_count: i64,
    pub last_triggered_at: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_failures: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
