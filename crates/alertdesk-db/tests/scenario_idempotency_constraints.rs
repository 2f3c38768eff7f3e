//! Re-running insert_notification for the same (rule, transaction, channel)
//! triple must not create a second row (invariants 3.4 and 3.6).

use std::collections::BTreeSet;

use alertdesk_db::{
    get_active_rules, insert_card, insert_notification, insert_rule, insert_transaction,
    testkit_db_pool, upsert_user,
};
use alertdesk_schemas::{
    AlertNotification, AlertRule, Channel, CreditCard, NotificationStatus, RuleKind, Severity,
    Transaction, TransactionStatus, User,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

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

fn seed_rule(rule_id: Uuid, user_id: Uuid) -> AlertRule {
    let mut channels = BTreeSet::new();
    channels.insert(Channel::Email);
    AlertRule {
        id: rule_id,
        user_id,
        nl_text: "alert me if any single transaction exceeds $500".into(),
        name: None,
        kind: RuleKind::Threshold,
        sql_text: "select true as triggered, 547.00::numeric as observed, null::numeric as baseline, '{}'::jsonb as detail".into(),
        sql_params_schema: json!({}),
        sql_params_values: json!({}),
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
async fn duplicate_insert_is_a_noop() {
    let pool = match testkit_db_pool().await {
        Ok(p) => p,
        Err(_) => return, // no ALERTDESK_DATABASE_URL in this environment
    };

    let user_id = Uuid::new_v4();
    let rule_id = Uuid::new_v4();
    let card_id = Uuid::new_v4();
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
    insert_rule(&pool, &seed_rule(rule_id, user_id)).await.unwrap();

    let active = get_active_rules(&pool, user_id).await.unwrap();
    assert_eq!(active.len(), 1);

    let notif = AlertNotification {
        id: Uuid::new_v4(),
        rule_id,
        user_id,
        transaction_id: Some(txn_id),
        channel: Channel::Email,
        title: "Large transaction".into(),
        body: "A $547.00 transaction exceeded your threshold.".into(),
        status: NotificationStatus::Queued,
        created_at: Utc::now(),
        delivered_at: None,
        read_at: None,
        error: None,
    };
    let replay = AlertNotification {
        id: Uuid::new_v4(),
        ..notif.clone()
    };

    let first_inserted = insert_notification(&pool, &notif).await.unwrap();
    let second_inserted = insert_notification(&pool, &replay).await.unwrap();

    assert!(first_inserted, "first insert for a fresh triple must succeed");
    assert!(
        !second_inserted,
        "re-running evaluation must not create a second notification row"
    );
}
