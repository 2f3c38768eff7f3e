//! A THRESHOLD rule fires on the triggering transaction (S1), and
//! re-running evaluation for the same transaction never creates a second
//! notification or a second trigger count (S6).

use std::collections::BTreeSet;

use alertdesk_analyzer::AnalyzerConfig;
use alertdesk_db::{get_rule, insert_card, insert_rule, insert_transaction, testkit_db_pool, upsert_user};
use alertdesk_evaluator::EvaluatorConfig;
use alertdesk_schemas::{
    AlertRule, Channel, CreditCard, RuleKind, Severity, Transaction, TransactionStatus, User,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

fn test_audit() -> tokio::sync::Mutex<alertdesk_audit::AuditWriter> {
    let path = std::env::temp_dir().join(format!("alertdesk-evaluator-test-{}.jsonl", Uuid::new_v4()));
    tokio::sync::Mutex::new(alertdesk_audit::AuditWriter::new(path, true).unwrap())
}

fn seed_user(user_id: Uuid) -> User {
    User {
        id: user_id,
        email: format!("{user_id}@example.com"),
        home_coords: None,
        home_state: Some("CA".into()),
        credit_limit: Decimal::new(1_500_000, 2),
        current_balance: Decimal::ZERO,
        location_consent: true,
        last_known_coords: None,
        timezone: "America/Los_Angeles".into(),
    }
}

fn threshold_rule(rule_id: Uuid, user_id: Uuid) -> AlertRule {
    let mut channels = BTreeSet::new();
    channels.insert(Channel::Email);
    channels.insert(Channel::Sms);
    AlertRule {
        id: rule_id,
        user_id,
        nl_text: "alert me if any single transaction exceeds $500".into(),
        name: None,
        kind: RuleKind::Threshold,
        sql_text: "select (t.amount > :amount) as triggered, t.amount as observed, \
             null::numeric as baseline, jsonb_build_object('merchant', t.merchant_name) as detail \
             from transactions t \
             where t.user_id = :user_id and t.id = :txn_id and t.occurred_at >= :window_start and t.occurred_at < :window_end \
             and t.status <> 'REFUNDED'"
            .into(),
        sql_params_schema: json!({"amount": "number", "txn_id": "uuid", "window_start": "timestamp", "window_end": "timestamp"}),
        sql_params_values: json!({"amount": "500.00"}),
        trigger_schema: json!({"triggered": "bool", "observed": "number"}),
        severity: Severity::Med,
        channels,
        is_active: true,
        created_at: Utc::now(),
        last_triggered_at: None,
        trigger_count: 0,
        nl_embedding: vec![0.1; 8],
        validated_sql: true,
        consecutive_failures: 0,
    }
}

#[tokio::test]
async fn threshold_rule_fires_once_per_transaction_even_when_re_evaluated() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return, // no ALERTDESK_DATABASE_URL in this environment
    };

    let user_id = Uuid::new_v4();
    let card_id = Uuid::new_v4();
    let rule_id = Uuid::new_v4();
    let txn_id = Uuid::new_v4();

    upsert_user(&pool, &seed_user(user_id)).await.unwrap();
    insert_card(
        &pool,
        &CreditCard {
            id: card_id,
            user_id,
            last4: "4242".into(),
            network: "visa".into(),
            issuer: "chase".into(),
            active: true,
        },
    )
    .await
    .unwrap();
    insert_rule(&pool, &threshold_rule(rule_id, user_id)).await.unwrap();
    insert_transaction(
        &pool,
        &Transaction {
            id: txn_id,
            user_id,
            card_id,
            amount: Decimal::new(54700, 2),
            currency: "USD".into(),
            merchant_name: "ACME".into(),
            merchant_category: "retail".into(),
            occurred_at: Utc::now(),
            coords: None,
            merchant_state: Some("CA".into()),
            status: TransactionStatus::Approved,
        },
    )
    .await
    .unwrap();

    let analyzer_cfg = AnalyzerConfig::sane_defaults();
    let eval_cfg = EvaluatorConfig::sane_defaults();
    let audit = test_audit();

    let first = alertdesk_evaluator::evaluate(&pool, &analyzer_cfg, &eval_cfg, &audit, txn_id).await.unwrap();
    assert_eq!(first.notifications.len(), 2, "one notification per channel");
    assert!(first.skipped.is_empty());

    let second = alertdesk_evaluator::evaluate(&pool, &analyzer_cfg, &eval_cfg, &audit, txn_id).await.unwrap();
    assert!(second.notifications.is_empty(), "re-evaluation must not duplicate notifications");

    let third = alertdesk_evaluator::evaluate(&pool, &analyzer_cfg, &eval_cfg, &audit, txn_id).await.unwrap();
    assert!(third.notifications.is_empty());

    let rule = get_rule(&pool, rule_id).await.unwrap();
    assert_eq!(rule.trigger_count, 1, "trigger_count advances exactly once across repeated evaluation");
    assert!(rule.last_triggered_at.is_some());
}

#[tokio::test]
async fn transaction_under_threshold_never_fires() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };

    let user_id = Uuid::new_v4();
    let card_id = Uuid::new_v4();
    let rule_id = Uuid::new_v4();
    let txn_id = Uuid::new_v4();

    upsert_user(&pool, &seed_user(user_id)).await.unwrap();
    insert_card(
        &pool,
        &CreditCard {
            id: card_id,
            user_id,
            last4: "4242".into(),
            network: "visa".into(),
            issuer: "chase".into(),
            active: true,
        },
    )
    .await
    .unwrap();
    insert_rule(&pool, &threshold_rule(rule_id, user_id)).await.unwrap();
    insert_transaction(
        &pool,
        &Transaction {
            id: txn_id,
            user_id,
            card_id,
            amount: Decimal::new(4200, 2),
            currency: "USD".into(),
            merchant_name: "Coffee Shop".into(),
            merchant_category: "dining".into(),
            occurred_at: Utc::now(),
            coords: None,
            merchant_state: Some("CA".into()),
            status: TransactionStatus::Approved,
        },
    )
    .await
    .unwrap();

    let outcome = alertdesk_evaluator::evaluate(
        &pool,
        &AnalyzerConfig::sane_defaults(),
        &EvaluatorConfig::sane_defaults(),
        &test_audit(),
        txn_id,
    )
    .await
    .unwrap();

    assert!(outcome.notifications.is_empty());
}
