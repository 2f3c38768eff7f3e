//! A LOCATION rule's own SQL already flags a home/merchant state mismatch
//! (S3). When the analyzer's impossible-travel check also fires on the same
//! transaction, the evaluator forces the notification to HIGH severity
//! regardless of the rule's configured severity (S5).

use std::collections::BTreeSet;

use alertdesk_analyzer::AnalyzerConfig;
use alertdesk_db::{insert_card, insert_rule, insert_transaction, testkit_db_pool, upsert_user};
use alertdesk_evaluator::EvaluatorConfig;
use alertdesk_schemas::{
    AlertRule, Channel, Coords, CreditCard, RuleKind, Severity, Transaction, TransactionStatus, User,
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

fn location_rule(rule_id: Uuid, user_id: Uuid) -> AlertRule {
    let mut channels = BTreeSet::new();
    channels.insert(Channel::Email);
    AlertRule {
        id: rule_id,
        user_id,
        nl_text: "alert me about transactions outside my home state".into(),
        name: None,
        kind: RuleKind::Location,
        sql_text: "select (t.merchant_state is not null and u.home_state is not null \
             and t.merchant_state <> u.home_state) as triggered, \
             null::numeric as observed, null::numeric as baseline, \
             jsonb_build_object('merchant_state', t.merchant_state, 'home_state', u.home_state) as detail \
             from transactions t join users u on u.id = t.user_id \
             where t.user_id = :user_id and t.id = :txn_id and t.occurred_at >= :window_start and t.occurred_at < :window_end"
            .into(),
        sql_params_schema: json!({"txn_id": "uuid", "window_start": "timestamp", "window_end": "timestamp"}),
        sql_params_values: json!({}),
        trigger_schema: json!({"triggered": "bool"}),
        severity: Severity::Low,
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
async fn impossible_travel_upgrades_a_low_severity_rule_to_high() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return,
    };

    let user_id = Uuid::new_v4();
    let card_id = Uuid::new_v4();
    let rule_id = Uuid::new_v4();
    let prior_id = Uuid::new_v4();
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
    insert_rule(&pool, &location_rule(rule_id, user_id)).await.unwrap();

    let t0 = Utc::now() - chrono::Duration::minutes(30);
    insert_transaction(
        &pool,
        &Transaction {
            id: prior_id,
            user_id,
            card_id,
            amount: Decimal::new(1200, 2),
            currency: "USD".into(),
            merchant_name: "SF Cafe".into(),
            merchant_category: "dining".into(),
            occurred_at: t0,
            coords: Some(Coords { lat: 37.7749, lon: -122.4194 }),
            merchant_state: Some("CA".into()),
            status: TransactionStatus::Approved,
        },
    )
    .await
    .unwrap();

    // One hour later, the same card is used in New York: ~4130km away, an
    // implied speed far beyond any commercial flight.
    insert_transaction(
        &pool,
        &Transaction {
            id: txn_id,
            user_id,
            card_id,
            amount: Decimal::new(8900, 2),
            currency: "USD".into(),
            merchant_name: "NYC Deli".into(),
            merchant_category: "dining".into(),
            occurred_at: t0 + chrono::Duration::hours(1),
            coords: Some(Coords { lat: 40.7128, lon: -74.0060 }),
            merchant_state: Some("NY".into()),
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

    assert_eq!(outcome.notifications.len(), 1);
    let notif = &outcome.notifications[0];
    assert!(notif.title.starts_with("[HIGH]"), "impossible travel must force HIGH severity, got {:?}", notif.title);
}
