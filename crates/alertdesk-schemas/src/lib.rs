//! Wire and storage types shared across the workspace: the entities from
//! the data model, plus the small enums that tag their state.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coords {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub home_coords: Option<Coords>,
    pub home_state: Option<String>,
    pub credit_limit: Decimal,
    pub current_balance: Decimal,
    pub location_consent: bool,
    pub last_known_coords: Option<Coords>,
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditCard {
    pub id: Uuid,
    pub user_id: Uuid,
    pub last4: String,
    pub network: String,
    pub issuer: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Pending,
    Approved,
    Declined,
    Settled,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub card_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub merchant_name: String,
    pub merchant_category: String,
    pub occurred_at: DateTime<Utc>,
    pub coords: Option<Coords>,
    pub merchant_state: Option<String>,
    pub status: TransactionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleKind {
    Threshold,
    PctDeltaVsBaseline,
    Location,
    MerchantPattern,
    Frequency,
    RecurringDrift,
    CategoryRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Baseline {
    Avg,
    Median,
    LastN,
    SameMerchantLastN,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Med,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Webhook,
    Sms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub nl_text: String,
    pub name: Option<String>,
    pub kind: RuleKind,
    pub sql_text: String,
    pub sql_params_schema: serde_json::Value,
    /// Concrete scalar values for `sql_text`'s non-window named params
    /// (e.g. `{"amount": "500.00"}`), fixed at compile time. `window_start`/
    /// `window_end` are never stored here — the evaluator rebuilds them
    /// fresh around each transaction.
    pub sql_params_values: serde_json::Value,
    pub trigger_schema: serde_json::Value,
    pub severity: Severity,
    pub channels: BTreeSet<Channel>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: i64,
    pub nl_embedding: Vec<f32>,
    pub validated_sql: bool,
    pub consecutive_failures: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Queued,
    Sent,
    Failed,
    Read,
}

impl NotificationStatus {
    /// Whether `self -> next` is a legal transition per the monotone status DAG.
    pub fn can_transition_to(self, next: NotificationStatus) -> bool {
        use NotificationStatus::*;
        matches!(
            (self, next),
            (Queued, Sent) | (Queued, Failed) | (Sent, Read)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NotificationStatus::Failed | NotificationStatus::Read)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertNotification {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub user_id: Uuid,
    pub transaction_id: Option<Uuid>,
    pub channel: Channel,
    pub title: String,
    pub body: String,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySynonym {
    pub canonical: String,
    pub synonym: String,
    pub embedding: Vec<f32>,
}

/// Structured intent produced by the rule compiler's Parse stage. The LLM
/// fills these slots; nothing downstream trusts it for anything beyond that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleIntent {
    pub kind: RuleKind,
    pub amount: Option<Decimal>,
    pub operator: Option<Operator>,
    pub baseline: Option<Baseline>,
    /// Window length in seconds; kept as a plain integer rather than
    /// `chrono::Duration` so the intent round-trips through JSON untouched.
    pub window_secs: Option<i64>,
    pub category: Option<String>,
    pub merchant: Option<String>,
    pub geo_scope: Option<String>,
    pub threshold_pct: Option<Decimal>,
    pub channels: BTreeSet<Channel>,
}

/// Single-row shape every compiled rule's SQL must return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvalRow {
    pub triggered: bool,
    pub observed: Option<Decimal>,
    pub baseline: Option<Decimal>,
    pub detail: serde_json::Value,
}
