//! Rule evaluation against a single freshly-ingested transaction.
//!
//! [`evaluate`] loads the transaction and its user, pulls the user's active
//! rules in deterministic `(created_at, id)` order (already enforced by
//! `alertdesk_db::get_active_rules`), and runs each rule's compiled SQL
//! through `alertdesk_db::run_rule_sql`. A rule's own grammar-validated SQL
//! is the single source of truth for whether it triggers — this module
//! never re-implements a rule kind's predicate in Rust, it only builds the
//! params SQL needs and decides what happens with the result.

use alertdesk_schemas::{
    AlertNotification, AlertRule, NotificationStatus, RuleKind, Severity, Transaction,
};
use alertdesk_analyzer::{AnalyzerConfig, LocationRisk};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{EvaluationOutcome, EvaluatorConfig, SkippedRule};

/// Evaluation window length per rule kind. Mirrors
/// `alertdesk_compiler::synthesize::default_window_secs` exactly; kept as an
/// independent copy rather than a shared dependency so the evaluator never
/// needs to depend on the compiler crate just for one constant table.
fn default_window_secs(kind: RuleKind) -> i64 {
    match kind {
        RuleKind::Threshold | RuleKind::Location => 60,
        RuleKind::MerchantPattern => 90 * 86_400,
        RuleKind::Frequency => 86_400,
        RuleKind::PctDeltaVsBaseline | RuleKind::CategoryRatio => 30 * 86_400,
        RuleKind::RecurringDrift => 90 * 86_400,
    }
}

/// `window_end` sits one second after the transaction so it always falls
/// inside the window the triggering row is matched against via `:txn_id`.
fn window_for(kind: RuleKind, occurred_at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let window_end = occurred_at + chrono::Duration::seconds(1);
    let window_start = window_end - chrono::Duration::seconds(default_window_secs(kind));
    (window_start, window_end)
}

/// Rule kinds whose SQL compares a historical money sum/average against
/// the live transaction, and therefore need the transaction's currency to
/// be convertible to the book's base currency (USD) before running.
/// `MerchantPattern`/`Frequency` only count rows; `Location` never touches
/// `amount`.
fn requires_currency_conversion(kind: RuleKind) -> bool {
    matches!(
        kind,
        RuleKind::Threshold | RuleKind::PctDeltaVsBaseline | RuleKind::RecurringDrift | RuleKind::CategoryRatio
    )
}

/// `txn_id` is pushed for every rule kind regardless of whether that kind's
/// template references `:txn_id` — `run_rule_sql`'s named-param substitution
/// is a no-op for an unreferenced name, and `grammar::validate` only flags
/// params a template uses but never declares, not the reverse.
fn merge_params(rule: &AlertRule, txn_id: Uuid, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Vec<(&str, Value)> {
    let mut params: Vec<(&str, Value)> = rule
        .sql_params_values
        .as_object()
        .into_iter()
        .flatten()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    params.push(("txn_id", Value::String(txn_id.to_string())));
    params.push(("window_start", Value::String(window_start.to_rfc3339())));
    params.push(("window_end", Value::String(window_end.to_rfc3339())));
    params
}

fn param_str<'a>(rule: &'a AlertRule, key: &str) -> Option<&'a str> {
    rule.sql_params_values.get(key).and_then(Value::as_str)
}

fn param_decimal(rule: &AlertRule, key: &str) -> Option<Decimal> {
    param_str(rule, key).and_then(|s| s.parse().ok())
}

fn severity_label(sev: Severity) -> &'static str {
    match sev {
        Severity::Low => "LOW",
        Severity::Med => "MED",
        Severity::High => "HIGH",
    }
}

fn merge_detail_field(detail: &mut Value, key: &str, value: Value) {
    if !detail.is_object() {
        *detail = json!({});
    }
    if let Value::Object(map) = detail {
        map.insert(key.to_string(), value);
    }
}

/// Notification copy for a triggered rule. One arm per kind, since each
/// kind's `detail` payload shape is different (see `synthesize`'s templates).
fn notification_copy(rule: &AlertRule, txn: &Transaction, severity: Severity, detail: &Value) -> (String, String) {
    let tag = severity_label(severity);
    let (subject, sentence) = match rule.kind {
        RuleKind::Threshold => (
            "Large transaction",
            format!("A ${:.2} transaction at {} exceeded your threshold.", txn.amount, txn.merchant_name),
        ),
        RuleKind::PctDeltaVsBaseline => {
            let category = detail.get("category").and_then(Value::as_str).unwrap_or("this category");
            (
                "Spending spike",
                format!("Your {category} spending is running well above your usual average."),
            )
        }
        RuleKind::Location => {
            let merchant_state = detail.get("merchant_state").and_then(Value::as_str).unwrap_or("an unexpected state");
            (
                "Unusual location",
                format!("A transaction at {} was made from {merchant_state}, away from your home state.", txn.merchant_name),
            )
        }
        RuleKind::MerchantPattern => (
            "Repeat merchant activity",
            format!("Multiple transactions at {} were seen in the configured window.", txn.merchant_name),
        ),
        RuleKind::Frequency => (
            "Transaction frequency alert",
            "Your transaction count in the configured window crossed its limit.".to_string(),
        ),
        RuleKind::RecurringDrift => {
            let merchant = detail.get("merchant").and_then(Value::as_str).unwrap_or(&txn.merchant_name);
            (
                "Recurring payment changed",
                format!("Your recurring payment to {merchant} changed from its usual amount."),
            )
        }
        RuleKind::CategoryRatio => {
            let category = detail.get("category").and_then(Value::as_str).unwrap_or("this category");
            (
                "Category spending ratio",
                format!("{category} now makes up an unusually large share of your spending."),
            )
        }
    };
    (format!("[{tag}] {subject}"), sentence)
}

/// Pull same-category or same-merchant history and hand it to the
/// behavioural analyzer, merging its verdict into the notification detail.
/// Never overrides `triggered`/`observed`/`baseline` — those come from the
/// rule's own validated SQL; this only adds colour for the notification copy.
async fn enrich_with_analyzer(
    pool: &PgPool,
    analyzer_cfg: &AnalyzerConfig,
    rule: &AlertRule,
    txn: &Transaction,
) -> Result<Option<Value>> {
    match rule.kind {
        RuleKind::PctDeltaVsBaseline => {
            let Some(category) = param_str(rule, "category") else { return Ok(None) };
            let since = txn.occurred_at - chrono::Duration::seconds(default_window_secs(rule.kind));
            let history = alertdesk_db::recent_transactions_by_category(pool, txn.user_id, category, since).await?;
            let amounts: Vec<Decimal> = history.iter().map(|t| t.amount).collect();
            let score = alertdesk_analyzer::anomaly_score(txn.amount, &amounts);
            Ok(Some(json!({ "anomaly_score": score.to_string() })))
        }
        RuleKind::RecurringDrift => {
            let Some(merchant) = param_str(rule, "merchant") else { return Ok(None) };
            let since = txn.occurred_at - chrono::Duration::seconds(default_window_secs(rule.kind));
            let history = alertdesk_db::recent_transactions_by_merchant(pool, txn.user_id, merchant, since).await?;
            let pairs: Vec<(DateTime<Utc>, Decimal)> = history.iter().map(|t| (t.occurred_at, t.amount)).collect();
            let threshold_pct = param_decimal(rule, "threshold_pct").unwrap_or(analyzer_cfg.recurring_drift_pct);
            let Some(series) = alertdesk_analyzer::recurring_series(&pairs, threshold_pct) else { return Ok(None) };
            Ok(Some(json!({
                "period_days": series.period_days,
                "expected_amount": series.expected_amount.to_string(),
                "drift_pct": series.drift_pct.to_string(),
                "drifted": series.drifted,
            })))
        }
        _ => Ok(None),
    }
}

/// Builds the system notification an owner gets when their own rule stops
/// protecting them. Uses the rule's own delivery channels — a rule that
/// only ever notified by SMS should still be reachable once it can no
/// longer watch for itself.
fn deactivation_notice(rule: &AlertRule, failures: i32) -> (String, String) {
    (
        "[SYSTEM] Rule disabled".to_string(),
        format!(
            "Your rule \"{}\" failed to evaluate {failures} times in a row and has been turned off. \
             Edit and re-save it to bring it back online.",
            rule.nl_text
        ),
    )
}

/// Evaluate every active rule for `txn.user_id` against `txn`, persisting a
/// notification for each rule that trips and advancing its trigger bookkeeping.
/// Re-running this for the same transaction is safe: `insert_notification`'s
/// `(rule_id, transaction_id, channel)` uniqueness makes every channel insert
/// idempotent, and `trigger_count` only advances when at least one channel's
/// insert is new.
///
/// `audit` receives one event per rule auto-deactivated this pass — every
/// transition that flips a rule's `is_active` flag is audited, not only the
/// ones a user makes through the HTTP API.
pub async fn evaluate(
    pool: &PgPool,
    analyzer_cfg: &AnalyzerConfig,
    cfg: &EvaluatorConfig,
    audit: &tokio::sync::Mutex<alertdesk_audit::AuditWriter>,
    txn_id: Uuid,
) -> Result<EvaluationOutcome> {
    let txn = alertdesk_db::get_transaction(pool, txn_id).await?;
    let user = alertdesk_db::get_user(pool, txn.user_id).await?;
    let rules = alertdesk_db::get_active_rules(pool, txn.user_id).await?;

    let prior = alertdesk_db::most_recent_transaction_before(pool, txn.user_id, txn.occurred_at, txn.id).await?;
    let location_risk = alertdesk_analyzer::location_risk(analyzer_cfg, &user, &txn, prior.as_ref());

    let mut outcome = EvaluationOutcome::default();

    for rule in &rules {
        if requires_currency_conversion(rule.kind)
            && txn.currency != "USD"
            && !cfg.fx_rates.contains_key(&txn.currency)
        {
            outcome.skipped.push(SkippedRule { rule_id: rule.id, reason: "fx_missing".to_string() });
            continue;
        }

        let (window_start, window_end) = window_for(rule.kind, txn.occurred_at);
        let params = merge_params(rule, txn.id, window_start, window_end);

        let row = match alertdesk_db::run_rule_sql(pool, &rule.sql_text, &params, txn.user_id, cfg.sql_timeout).await {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, kind = ?rule.kind, error = %e, "rule sql evaluation failed");
                let failures = alertdesk_db::record_rule_failure(pool, rule.id).await?;
                if failures >= cfg.max_consecutive_failures {
                    alertdesk_db::deactivate_rule(pool, rule.id).await?;
                    outcome.deactivated.push(rule.id);
                    tracing::warn!(rule_id = %rule.id, failures, "rule auto-deactivated after consecutive SQL failures");

                    {
                        let mut writer = audit.lock().await;
                        if let Err(audit_err) = writer.append(
                            rule.id,
                            "rule",
                            "auto_deactivated",
                            json!({"consecutive_failures": failures, "last_error": e.to_string()}),
                        ) {
                            tracing::warn!(rule_id = %rule.id, error = %audit_err, "failed to write auto-deactivation audit event");
                        }
                    }

                    let (title, body) = deactivation_notice(rule, failures);
                    for channel in &rule.channels {
                        let notification = AlertNotification {
                            id: Uuid::new_v4(),
                            rule_id: rule.id,
                            user_id: rule.user_id,
                            transaction_id: None,
                            channel: *channel,
                            title: title.clone(),
                            body: body.clone(),
                            status: NotificationStatus::Queued,
                            created_at: Utc::now(),
                            delivered_at: None,
                            read_at: None,
                            error: None,
                        };
                        if alertdesk_db::insert_notification(pool, &notification).await? {
                            outcome.notifications.push(notification);
                        }
                    }
                }
                outcome.skipped.push(SkippedRule { rule_id: rule.id, reason: format!("sql_error: {e}") });
                continue;
            }
        };

        let mut triggered = row.triggered;
        let mut severity = rule.severity;
        let mut detail = row.detail.clone();

        if rule.kind == RuleKind::Location && location_risk == LocationRisk::ImpossibleTravel {
            triggered = true;
            severity = Severity::High;
            merge_detail_field(&mut detail, "location_risk", Value::String("IMPOSSIBLE_TRAVEL".to_string()));
        }

        if !triggered {
            continue;
        }

        if let Some(enrichment) = enrich_with_analyzer(pool, analyzer_cfg, rule, &txn).await.unwrap_or(None) {
            merge_detail_field(&mut detail, "analyzer", enrichment);
        }

        let (title, body) = notification_copy(rule, &txn, severity, &detail);

        let mut any_new = false;
        for channel in &rule.channels {
            let notification = AlertNotification {
                id: Uuid::new_v4(),
                rule_id: rule.id,
                user_id: txn.user_id,
                transaction_id: Some(txn.id),
                channel: *channel,
                title: title.clone(),
                body: body.clone(),
                status: NotificationStatus::Queued,
                created_at: Utc::now(),
                delivered_at: None,
                read_at: None,
                error: None,
            };
            if alertdesk_db::insert_notification(pool, &notification).await? {
                any_new = true;
                outcome.notifications.push(notification);
            }
        }

        if any_new {
            alertdesk_db::record_rule_trigger(pool, rule.id, txn.occurred_at).await?;
        }
    }

    Ok(outcome)
}

