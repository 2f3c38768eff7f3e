//! Deterministic SQL template emission (Synthesize stage).
//!
//! The LLM never writes SQL. Every rule kind maps to exactly one template
//! here; `RuleIntent` fields only fill the template's slots. The emitted
//! text is then re-checked by [`crate::grammar::validate`] before it is
//! trusted — this module and the grammar validator are independent checks
//! on purpose.

use alertdesk_schemas::{Operator, RuleIntent, RuleKind};
use serde_json::{json, Value};

pub struct RuleTemplate {
    pub sql_text: String,
    pub sql_params_schema: Value,
    pub trigger_schema: Value,
}

fn op_sql(op: Operator) -> &'static str {
    match op {
        Operator::Gt => ">",
        Operator::Lt => "<",
        Operator::Ge => ">=",
        Operator::Le => "<=",
        Operator::Eq => "=",
    }
}

/// Sensible default evaluation window per rule kind when the intent omits one.
pub fn default_window_secs(kind: RuleKind) -> i64 {
    match kind {
        RuleKind::Threshold | RuleKind::Location => 60,
        RuleKind::MerchantPattern => 90 * 86_400,
        RuleKind::Frequency => 86_400,
        RuleKind::PctDeltaVsBaseline | RuleKind::CategoryRatio => 30 * 86_400,
        RuleKind::RecurringDrift => 90 * 86_400,
    }
}

/// Emit the SQL template and schemas for `intent`. Returns `Err(reason)` if
/// a field required by this rule kind's template is missing after grounding.
pub fn synthesize(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    match intent.kind {
        RuleKind::Threshold => synth_threshold(intent),
        RuleKind::PctDeltaVsBaseline => synth_pct_delta(intent),
        RuleKind::Location => synth_location(intent),
        RuleKind::MerchantPattern => synth_merchant_pattern(intent),
        RuleKind::Frequency => synth_frequency(intent),
        RuleKind::RecurringDrift => synth_recurring_drift(intent),
        RuleKind::CategoryRatio => synth_category_ratio(intent),
    }
}

fn synth_threshold(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    intent.amount.ok_or("threshold rule requires an amount")?;
    let op = intent.operator.unwrap_or(Operator::Gt);
    let sql = format!(
        "select (t.amount {op} :amount) as triggered, t.amount as observed, \
         null::numeric as baseline, jsonb_build_object('merchant', t.merchant_name) as detail \
         from transactions t \
         where t.user_id = :user_id and t.id = :txn_id and t.occurred_at >= :window_start \
         and t.occurred_at < :window_end and t.status <> 'REFUNDED'",
        op = op_sql(op)
    );
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: json!({
            "amount": "number", "txn_id": "uuid",
            "window_start": "timestamp", "window_end": "timestamp"
        }),
        trigger_schema: json!({"triggered": "bool", "observed": "number"}),
    })
}

fn synth_pct_delta(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    intent.category.as_ref().ok_or("pct-delta rule requires a category")?;
    intent.threshold_pct.ok_or("pct-delta rule requires a threshold_pct")?;
    let sql = "select (sum(amount) > (select coalesce(avg(amount), 0) from transactions t2 \
         where t2.user_id = :user_id and t2.merchant_category = :category and t2.occurred_at < :window_start) \
         * (1 + :threshold_pct / 100.0)) as triggered, \
         coalesce(sum(amount), 0) as observed, \
         (select coalesce(avg(amount), 0) from transactions t2 \
         where t2.user_id = :user_id and t2.merchant_category = :category and t2.occurred_at < :window_start) as baseline, \
         jsonb_build_object('category', :category::text) as detail \
         from transactions \
         where user_id = :user_id and merchant_category = :category and occurred_at >= :window_start \
         and occurred_at < :window_end and status <> 'REFUNDED'"
        .to_string();
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: json!({
            "category": "text", "threshold_pct": "number",
            "window_start": "timestamp", "window_end": "timestamp"
        }),
        trigger_schema: json!({"triggered": "bool", "observed": "number", "baseline": "number"}),
    })
}

fn synth_location(_intent: &RuleIntent) -> Result<RuleTemplate, String> {
    let sql = "select (t.merchant_state is not null and u.home_state is not null \
         and t.merchant_state <> u.home_state) as triggered, \
         null::numeric as observed, null::numeric as baseline, \
         jsonb_build_object('merchant_state', t.merchant_state, 'home_state', u.home_state) as detail \
         from transactions t join users u on u.id = t.user_id \
         where t.user_id = :user_id and t.id = :txn_id and t.occurred_at >= :window_start \
         and t.occurred_at < :window_end"
        .to_string();
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: json!({"txn_id": "uuid", "window_start": "timestamp", "window_end": "timestamp"}),
        trigger_schema: json!({"triggered": "bool"}),
    })
}

fn synth_merchant_pattern(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    intent.merchant.as_ref().ok_or("merchant-pattern rule requires a merchant")?;
    let sql = "select (count(*) > 0) as triggered, count(*) as observed, null::numeric as baseline, \
         jsonb_build_object('merchant', :merchant::text) as detail \
         from transactions \
         where user_id = :user_id and lower(merchant_name) = lower(:merchant) \
         and occurred_at >= :window_start and occurred_at < :window_end and status <> 'REFUNDED'"
        .to_string();
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: json!({
            "merchant": "text", "window_start": "timestamp", "window_end": "timestamp"
        }),
        trigger_schema: json!({"triggered": "bool", "observed": "number"}),
    })
}

fn synth_frequency(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    intent.amount.ok_or("frequency rule requires a count threshold in amount")?;
    let category_filter = intent
        .category
        .as_ref()
        .map(|_| " and merchant_category = :category".to_string())
        .unwrap_or_default();
    let sql = format!(
        "select (count(*) > :amount) as triggered, count(*) as observed, null::numeric as baseline, \
         jsonb_build_object('count', count(*)) as detail \
         from transactions \
         where user_id = :user_id{category_filter} and occurred_at >= :window_start \
         and occurred_at < :window_end and status <> 'REFUNDED'"
    );
    let mut params_schema = json!({
        "amount": "number", "window_start": "timestamp", "window_end": "timestamp"
    });
    if intent.category.is_some() {
        params_schema["category"] = Value::String("text".to_string());
    }
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: params_schema,
        trigger_schema: json!({"triggered": "bool", "observed": "number"}),
    })
}

fn synth_recurring_drift(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    intent.merchant.as_ref().ok_or("recurring-drift rule requires a merchant")?;
    let sql = "select (abs(t.amount - baseline.avg_amount) > baseline.avg_amount * (:threshold_pct / 100.0)) \
         as triggered, t.amount as observed, baseline.avg_amount as baseline, \
         jsonb_build_object('merchant', :merchant::text) as detail \
         from transactions t, \
         (select coalesce(avg(amount), 0) as avg_amount from transactions t2 \
         where t2.user_id = :user_id and t2.merchant_name = :merchant and t2.occurred_at < :window_start) baseline \
         where t.user_id = :user_id and t.id = :txn_id and t.merchant_name = :merchant \
         and t.occurred_at >= :window_start and t.occurred_at < :window_end"
        .to_string();
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: json!({
            "merchant": "text", "threshold_pct": "number", "txn_id": "uuid",
            "window_start": "timestamp", "window_end": "timestamp"
        }),
        trigger_schema: json!({"triggered": "bool", "observed": "number", "baseline": "number"}),
    })
}

fn synth_category_ratio(intent: &RuleIntent) -> Result<RuleTemplate, String> {
    intent.category.as_ref().ok_or("category-ratio rule requires a category")?;
    intent.threshold_pct.ok_or("category-ratio rule requires a threshold_pct")?;
    let sql = "select ((cat.amt / nullif(tot.amt, 0)) * 100.0 > :threshold_pct) as triggered, \
         cat.amt as observed, tot.amt as baseline, jsonb_build_object('category', :category::text) as detail \
         from (select coalesce(sum(amount), 0) as amt from transactions \
         where user_id = :user_id and merchant_category = :category \
         and occurred_at >= :window_start and occurred_at < :window_end and status <> 'REFUNDED') cat, \
         (select coalesce(sum(amount), 0) as amt from transactions \
         where user_id = :user_id and occurred_at >= :window_start and occurred_at < :window_end \
         and status <> 'REFUNDED') tot"
        .to_string();
    Ok(RuleTemplate {
        sql_text: sql,
        sql_params_schema: json!({
            "category": "text", "threshold_pct": "number",
            "window_start": "timestamp", "window_end": "timestamp"
        }),
        trigger_schema: json!({"triggered": "bool", "observed": "number", "baseline": "number"}),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertdesk_schemas::{Baseline, Channel};
    use std::collections::BTreeSet;

    fn base_intent(kind: RuleKind) -> RuleIntent {
        RuleIntent {
            kind,
            amount: None,
            operator: None,
            baseline: None,
            window_secs: None,
            category: None,
            merchant: None,
            geo_scope: None,
            threshold_pct: None,
            channels: BTreeSet::from([Channel::Email]),
        }
    }

    #[test]
    fn threshold_requires_amount() {
        let intent = base_intent(RuleKind::Threshold);
        assert!(synthesize(&intent).is_err());
    }

    #[test]
    fn threshold_emits_grammar_valid_sql() {
        let mut intent = base_intent(RuleKind::Threshold);
        intent.amount = Some(rust_decimal::Decimal::new(50000, 2));
        intent.operator = Some(Operator::Gt);
        let t = synthesize(&intent).unwrap();
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn pct_delta_requires_category_and_pct() {
        let intent = base_intent(RuleKind::PctDeltaVsBaseline);
        assert!(synthesize(&intent).is_err());
    }

    #[test]
    fn pct_delta_emits_grammar_valid_sql() {
        let mut intent = base_intent(RuleKind::PctDeltaVsBaseline);
        intent.category = Some("dining".to_string());
        intent.threshold_pct = Some(rust_decimal::Decimal::new(40, 0));
        intent.baseline = Some(Baseline::Avg);
        let t = synthesize(&intent).unwrap();
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn location_needs_no_extra_fields() {
        let intent = base_intent(RuleKind::Location);
        let t = synthesize(&intent).unwrap();
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn merchant_pattern_emits_grammar_valid_sql() {
        let mut intent = base_intent(RuleKind::MerchantPattern);
        intent.merchant = Some("Acme Co".to_string());
        let t = synthesize(&intent).unwrap();
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn frequency_without_category_omits_category_param() {
        let mut intent = base_intent(RuleKind::Frequency);
        intent.amount = Some(rust_decimal::Decimal::new(3, 0));
        let t = synthesize(&intent).unwrap();
        assert!(!t.sql_text.contains("merchant_category"));
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn frequency_with_category_includes_category_filter() {
        let mut intent = base_intent(RuleKind::Frequency);
        intent.amount = Some(rust_decimal::Decimal::new(3, 0));
        intent.category = Some("dining".to_string());
        let t = synthesize(&intent).unwrap();
        assert!(t.sql_text.contains("merchant_category = :category"));
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn recurring_drift_emits_grammar_valid_sql() {
        let mut intent = base_intent(RuleKind::RecurringDrift);
        intent.merchant = Some("Netflix".to_string());
        let t = synthesize(&intent).unwrap();
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn category_ratio_emits_grammar_valid_sql() {
        let mut intent = base_intent(RuleKind::CategoryRatio);
        intent.category = Some("dining".to_string());
        intent.threshold_pct = Some(rust_decimal::Decimal::new(30, 0));
        let t = synthesize(&intent).unwrap();
        assert!(crate::grammar::validate(&t.sql_text, &t.sql_params_schema).is_ok());
    }

    #[test]
    fn default_window_secs_covers_every_kind() {
        for kind in [
            RuleKind::Threshold,
            RuleKind::PctDeltaVsBaseline,
            RuleKind::Location,
            RuleKind::MerchantPattern,
            RuleKind::Frequency,
            RuleKind::RecurringDrift,
            RuleKind::CategoryRatio,
        ] {
            assert!(default_window_secs(kind) > 0);
        }
    }
}
