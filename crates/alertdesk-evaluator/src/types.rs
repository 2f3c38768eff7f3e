use std::collections::BTreeMap;
use std::time::Duration;

use alertdesk_schemas::AlertNotification;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Tunables for one evaluation pass, loaded once by the orchestrator and
/// shared across every transaction it processes.
#[derive(Clone, Debug)]
pub struct EvaluatorConfig {
    /// Wall-clock budget for a single rule's SQL, per `T_sql`.
    pub sql_timeout: Duration,
    /// Consecutive SQL failures before a rule is auto-deactivated (`N_consecutive`).
    pub max_consecutive_failures: i32,
    /// Units of `currency` per one USD, loaded once at startup. USD itself
    /// never needs an entry.
    pub fx_rates: BTreeMap<String, Decimal>,
}

impl EvaluatorConfig {
    pub fn sane_defaults() -> Self {
        Self {
            sql_timeout: Duration::from_secs(2),
            max_consecutive_failures: 5,
            fx_rates: BTreeMap::new(),
        }
    }
}

/// A rule that produced no notification this pass, and why. Kept separate
/// from an error return so one bad rule never aborts the rest of the pass.
#[derive(Debug, Clone)]
pub struct SkippedRule {
    pub rule_id: Uuid,
    pub reason: String,
}

/// Everything that happened while evaluating one transaction against a
/// user's active rules.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    /// Notifications newly persisted this pass. Re-running the same
    /// transaction again yields an empty list here, not duplicates.
    pub notifications: Vec<AlertNotification>,
    pub skipped: Vec<SkippedRule>,
    /// Rules auto-deactivated this pass after crossing `max_consecutive_failures`.
    pub deactivated: Vec<Uuid>,
}
