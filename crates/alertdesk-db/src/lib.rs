// crates/alertdesk-db/src/lib.rs
use std::collections::BTreeSet;
use std::time::Duration;

use alertdesk_schemas::{
    AlertNotification, AlertRule, CategorySynonym, Channel, Coords, CreditCard,
    NotificationStatus, RuleEvalRow, RuleKind, Severity, Transaction, TransactionStatus, User,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

pub const ENV_DB_URL: &str = "ALERTDESK_DATABASE_URL";

/// Connect to Postgres using ALERTDESK_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Test helper: connect using ALERTDESK_DATABASE_URL and ensure migrations applied.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_rules_table: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;
    let ok = one == 1;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema='public' and table_name='alert_rules'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok,
        has_rules_table: exists,
    })
}

// ---------------------------------------------------------------------------
// Users & cards
// ---------------------------------------------------------------------------

pub async fn upsert_user(pool: &PgPool, user: &User) -> Result<()> {
    sqlx::query(
        r#"
        insert into users (
            id, email, home_lat, home_lon, home_state, credit_limit,
            current_balance, location_consent, last_known_lat, last_known_lon, timezone
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        on conflict (id) do update set
            email = excluded.email,
            home_lat = excluded.home_lat,
            home_lon = excluded.home_lon,
            home_state = excluded.home_state,
            credit_limit = excluded.credit_limit,
            current_balance = excluded.current_balance,
            location_consent = excluded.location_consent,
            last_known_lat = excluded.last_known_lat,
            last_known_lon = excluded.last_known_lon,
            timezone = excluded.timezone
        "#,
    )
    .bind(user.id)
    .bind(&user.email)
    .bind(user.home_coords.as_ref().map(|c| c.lat))
    .bind(user.home_coords.as_ref().map(|c| c.lon))
    .bind(&user.home_state)
    .bind(user.credit_limit)
    .bind(user.current_balance)
    .bind(user.location_consent)
    .bind(user.last_known_coords.as_ref().map(|c| c.lat))
    .bind(user.last_known_coords.as_ref().map(|c| c.lon))
    .bind(&user.timezone)
    .execute(pool)
    .await
    .context("upsert_user failed")?;
    Ok(())
}

pub async fn get_user(pool: &PgPool, user_id: Uuid) -> Result<User> {
    let row = sqlx::query(
        r#"
        select id, email, home_lat, home_lon, home_state, credit_limit,
               current_balance, location_consent, last_known_lat, last_known_lon, timezone
        from users where id = $1
        "#,
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .context("get_user failed")?;
    row_to_user(&row)
}

fn row_to_user(row: &sqlx::postgres::PgRow) -> Result<User> {
    let home_lat: Option<f64> = row.try_get("home_lat")?;
    let home_lon: Option<f64> = row.try_get("home_lon")?;
    let last_lat: Option<f64> = row.try_get("last_known_lat")?;
    let last_lon: Option<f64> = row.try_get("last_known_lon")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        home_coords: home_lat.zip(home_lon).map(|(lat, lon)| Coords { lat, lon }),
        home_state: row.try_get("home_state")?,
        credit_limit: row.try_get("credit_limit")?,
        current_balance: row.try_get("current_balance")?,
        location_consent: row.try_get("location_consent")?,
        last_known_coords: last_lat.zip(last_lon).map(|(lat, lon)| Coords { lat, lon }),
        timezone: row.try_get("timezone")?,
    })
}

pub async fn insert_card(pool: &PgPool, card: &CreditCard) -> Result<()> {
    sqlx::query(
        r#"
        insert into credit_cards (id, user_id, last4, network, issuer, active)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (id) do nothing
        "#,
    )
    .bind(card.id)
    .bind(card.user_id)
    .bind(&card.last4)
    .bind(&card.network)
    .bind(&card.issuer)
    .bind(card.active)
    .execute(pool)
    .await
    .context("insert_card failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

pub async fn insert_transaction(pool: &PgPool, txn: &Transaction) -> Result<()> {
    sqlx::query(
        r#"
        insert into transactions (
            id, user_id, card_id, amount, currency, merchant_name, merchant_category,
            occurred_at, lat, lon, merchant_state, status
        ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        on conflict (id) do nothing
        "#,
    )
    .bind(txn.id)
    .bind(txn.user_id)
    .bind(txn.card_id)
    .bind(txn.amount)
    .bind(&txn.currency)
    .bind(&txn.merchant_name)
    .bind(&txn.merchant_category)
    .bind(txn.occurred_at)
    .bind(txn.coords.as_ref().map(|c| c.lat))
    .bind(txn.coords.as_ref().map(|c| c.lon))
    .bind(&txn.merchant_state)
    .bind(status_str(txn.status))
    .execute(pool)
    .await
    .context("insert_transaction failed")?;
    Ok(())
}

pub async fn get_transaction(pool: &PgPool, txn_id: Uuid) -> Result<Transaction> {
    let row = sqlx::query(
        r#"
        select id, user_id, card_id, amount, currency, merchant_name, merchant_category,
               occurred_at, lat, lon, merchant_state, status
        from transactions where id = $1
        "#,
    )
    .bind(txn_id)
    .fetch_one(pool)
    .await
    .context("get_transaction failed")?;
    row_to_transaction(&row)
}

/// Recent transactions for a user in a category, most recent first, used by
/// the behavioural analyzer for baselines and by cheap-rule evaluation.
pub async fn recent_transactions_by_category(
    pool: &PgPool,
    user_id: Uuid,
    category: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query(
        r#"
        select id, user_id, card_id, amount, currency, merchant_name, merchant_category,
               occurred_at, lat, lon, merchant_state, status
        from transactions
        where user_id = $1 and merchant_category = $2 and occurred_at >= $3
        order by occurred_at desc
        "#,
    )
    .bind(user_id)
    .bind(category)
    .bind(since)
    .fetch_all(pool)
    .await
    .context("recent_transactions_by_category failed")?;
    rows.iter().map(row_to_transaction).collect()
}

pub async fn recent_transactions_by_merchant(
    pool: &PgPool,
    user_id: Uuid,
    merchant_name: &str,
    since: DateTime<Utc>,
) -> Result<Vec<Transaction>> {
    let rows = sqlx::query(
        r#"
        select id, user_id, card_id, amount, currency, merchant_name, merchant_category,
               occurred_at, lat, lon, merchant_state, status
        from transactions
        where user_id = $1 and merchant_name = $2 and occurred_at >= $3
        order by occurred_at desc
        "#,
    )
    .bind(user_id)
    .bind(merchant_name)
    .bind(since)
    .fetch_all(pool)
    .await
    .context("recent_transactions_by_merchant failed")?;
    rows.iter().map(row_to_transaction).collect()
}

/// The user's most recent transaction strictly before `before`, excluding
/// `exclude_id` itself — used by the evaluator to anchor impossible-travel
/// checks on the transaction immediately preceding the one being evaluated.
pub async fn most_recent_transaction_before(
    pool: &PgPool,
    user_id: Uuid,
    before: DateTime<Utc>,
    exclude_id: Uuid,
) -> Result<Option<Transaction>> {
    let row = sqlx::query(
        r#"
        select id, user_id, card_id, amount, currency, merchant_name, merchant_category,
               occurred_at, lat, lon, merchant_state, status
        from transactions
        where user_id = $1 and occurred_at < $2 and id <> $3
        order by occurred_at desc
        limit 1
        "#,
    )
    .bind(user_id)
    .bind(before)
    .bind(exclude_id)
    .fetch_optional(pool)
    .await
    .context("most_recent_transaction_before failed")?;
    row.as_ref().map(row_to_transaction).transpose()
}

fn row_to_transaction(row: &sqlx::postgres::PgRow) -> Result<Transaction> {
    let lat: Option<f64> = row.try_get("lat")?;
    let lon: Option<f64> = row.try_get("lon")?;
    Ok(Transaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        card_id: row.try_get("card_id")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        merchant_name: row.try_get("merchant_name")?,
        merchant_category: row.try_get("merchant_category")?,
        occurred_at: row.try_get("occurred_at")?,
        coords: lat.zip(lon).map(|(lat, lon)| Coords { lat, lon }),
        merchant_state: row.try_get("merchant_state")?,
        status: status_from_str(&row.try_get::<String, _>("status")?)?,
    })
}

fn status_str(s: TransactionStatus) -> &'static str {
    match s {
        TransactionStatus::Pending => "PENDING",
        TransactionStatus::Approved => "APPROVED",
        TransactionStatus::Declined => "DECLINED",
        TransactionStatus::Settled => "SETTLED",
        TransactionStatus::Refunded => "REFUNDED",
    }
}

fn status_from_str(s: &str) -> Result<TransactionStatus> {
    Ok(match s {
        "PENDING" => TransactionStatus::Pending,
        "APPROVED" => TransactionStatus::Approved,
        "DECLINED" => TransactionStatus::Declined,
        "SETTLED" => TransactionStatus::Settled,
        "REFUNDED" => TransactionStatus::Refunded,
        other => return Err(anyhow!("invalid transaction status: {other}")),
    })
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

pub async fn insert_rule(pool: &PgPool, rule: &AlertRule) -> Result<()> {
    sqlx::query(
        r#"
        insert into alert_rules (
            id, user_id, nl_text, name, kind, sql_text, sql_params_schema, sql_params_values,
            trigger_schema, severity, channels, is_active, created_at, last_triggered_at,
            trigger_count, nl_embedding, validated_sql, consecutive_failures
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
        "#,
    )
    .bind(rule.id)
    .bind(rule.user_id)
    .bind(&rule.nl_text)
    .bind(&rule.name)
    .bind(kind_str(rule.kind))
    .bind(&rule.sql_text)
    .bind(&rule.sql_params_schema)
    .bind(&rule.sql_params_values)
    .bind(&rule.trigger_schema)
    .bind(severity_str(rule.severity))
    .bind(channels_to_vec(&rule.channels))
    .bind(rule.is_active)
    .bind(rule.created_at)
    .bind(rule.last_triggered_at)
    .bind(rule.trigger_count)
    .bind(&rule.nl_embedding)
    .bind(rule.validated_sql)
    .bind(rule.consecutive_failures)
    .execute(pool)
    .await
    .context("insert_rule failed")?;
    Ok(())
}

/// Replace an existing rule atomically. Used by the compiler's edit path:
/// the previous rule is only overwritten once the new one reaches `Valid`.
pub async fn update_rule(pool: &PgPool, rule: &AlertRule) -> Result<()> {
    sqlx::query(
        r#"
        update alert_rules set
            nl_text = $2, name = $3, kind = $4, sql_text = $5, sql_params_schema = $6,
            sql_params_values = $7, trigger_schema = $8, severity = $9, channels = $10,
            is_active = $11, nl_embedding = $12, validated_sql = $13
        where id = $1
        "#,
    )
    .bind(rule.id)
    .bind(&rule.nl_text)
    .bind(&rule.name)
    .bind(kind_str(rule.kind))
    .bind(&rule.sql_text)
    .bind(&rule.sql_params_schema)
    .bind(&rule.sql_params_values)
    .bind(&rule.trigger_schema)
    .bind(severity_str(rule.severity))
    .bind(channels_to_vec(&rule.channels))
    .bind(rule.is_active)
    .bind(&rule.nl_embedding)
    .bind(rule.validated_sql)
    .execute(pool)
    .await
    .context("update_rule failed")?;
    Ok(())
}

pub async fn get_rule(pool: &PgPool, rule_id: Uuid) -> Result<AlertRule> {
    let row = sqlx::query(RULE_SELECT_COLUMNS)
        .bind(rule_id)
        .fetch_one(pool)
        .await
        .context("get_rule failed")?;
    row_to_rule(&row)
}

/// Active rules for a user in deterministic `(created_at, id)` order, the
/// order the evaluator walks rules in for a single transaction.
pub async fn get_active_rules(pool: &PgPool, user_id: Uuid) -> Result<Vec<AlertRule>> {
    let rows = sqlx::query(
        r#"
        select id, user_id, nl_text, name, kind, sql_text, sql_params_schema, sql_params_values,
               trigger_schema, severity, channels, is_active, created_at, last_triggered_at,
               trigger_count, nl_embedding, validated_sql, consecutive_failures
        from alert_rules
        where user_id = $1 and is_active
        order by created_at asc, id asc
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("get_active_rules failed")?;
    rows.iter().map(row_to_rule).collect()
}

/// Nearest active rule embeddings for the same user, for dedup checking.
pub async fn active_rule_embeddings(pool: &PgPool, user_id: Uuid) -> Result<Vec<(Uuid, Vec<f32>)>> {
    let rows = sqlx::query(
        "select id, nl_embedding from alert_rules where user_id = $1 and is_active",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("active_rule_embeddings failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push((row.try_get("id")?, row.try_get("nl_embedding")?));
    }
    Ok(out)
}

pub async fn record_rule_trigger(pool: &PgPool, rule_id: Uuid, at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        update alert_rules
        set last_triggered_at = $2, trigger_count = trigger_count + 1, consecutive_failures = 0
        where id = $1
        "#,
    )
    .bind(rule_id)
    .bind(at)
    .execute(pool)
    .await
    .context("record_rule_trigger failed")?;
    Ok(())
}

/// Increment a rule's consecutive-SQL-failure counter; returns the new count
/// so the evaluator can decide whether it crossed the auto-deactivation
/// threshold (`N_consecutive`, default 5, per the error-handling policy).
pub async fn record_rule_failure(pool: &PgPool, rule_id: Uuid) -> Result<i32> {
    let (count,): (i32,) = sqlx::query_as(
        r#"
        update alert_rules set consecutive_failures = consecutive_failures + 1
        where id = $1
        returning consecutive_failures
        "#,
    )
    .bind(rule_id)
    .fetch_one(pool)
    .await
    .context("record_rule_failure failed")?;
    Ok(count)
}

pub async fn deactivate_rule(pool: &PgPool, rule_id: Uuid) -> Result<()> {
    sqlx::query("update alert_rules set is_active = false where id = $1")
        .bind(rule_id)
        .execute(pool)
        .await
        .context("deactivate_rule failed")?;
    Ok(())
}

pub async fn delete_rule(pool: &PgPool, rule_id: Uuid) -> Result<()> {
    sqlx::query("delete from alert_rules where id = $1")
        .bind(rule_id)
        .execute(pool)
        .await
        .context("delete_rule failed")?;
    Ok(())
}

const RULE_SELECT_COLUMNS: &str = r#"
    select id, user_id, nl_text, name, kind, sql_text, sql_params_schema, sql_params_values,
           trigger_schema, severity, channels, is_active, created_at, last_triggered_at,
           trigger_count, nl_embedding, validated_sql, consecutive_failures
    from alert_rules where id = $1
"#;

fn row_to_rule(row: &sqlx::postgres::PgRow) -> Result<AlertRule> {
    let channels: Vec<String> = row.try_get("channels")?;
    Ok(AlertRule {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        nl_text: row.try_get("nl_text")?,
        name: row.try_get("name")?,
        kind: kind_from_str(&row.try_get::<String, _>("kind")?)?,
        sql_text: row.try_get("sql_text")?,
        sql_params_schema: row.try_get("sql_params_schema")?,
        sql_params_values: row.try_get("sql_params_values")?,
        trigger_schema: row.try_get("trigger_schema")?,
        severity: severity_from_str(&row.try_get::<String, _>("severity")?)?,
        channels: channels
            .iter()
            .map(|c| channel_from_str(c))
            .collect::<Result<BTreeSet<_>>>()?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        trigger_count: row.try_get("trigger_count")?,
        nl_embedding: row.try_get("nl_embedding")?,
        validated_sql: row.try_get("validated_sql")?,
        consecutive_failures: row.try_get("consecutive_failures")?,
    })
}

fn kind_str(k: RuleKind) -> &'static str {
    match k {
        RuleKind::Threshold => "THRESHOLD",
        RuleKind::PctDeltaVsBaseline => "PCT_DELTA_VS_BASELINE",
        RuleKind::Location => "LOCATION",
        RuleKind::MerchantPattern => "MERCHANT_PATTERN",
        RuleKind::Frequency => "FREQUENCY",
        RuleKind::RecurringDrift => "RECURRING_DRIFT",
        RuleKind::CategoryRatio => "CATEGORY_RATIO",
    }
}

fn kind_from_str(s: &str) -> Result<RuleKind> {
    Ok(match s {
        "THRESHOLD" => RuleKind::Threshold,
        "PCT_DELTA_VS_BASELINE" => RuleKind::PctDeltaVsBaseline,
        "LOCATION" => RuleKind::Location,
        "MERCHANT_PATTERN" => RuleKind::MerchantPattern,
        "FREQUENCY" => RuleKind::Frequency,
        "RECURRING_DRIFT" => RuleKind::RecurringDrift,
        "CATEGORY_RATIO" => RuleKind::CategoryRatio,
        other => return Err(anyhow!("invalid rule kind: {other}")),
    })
}

fn severity_str(s: Severity) -> &'static str {
    match s {
        Severity::Low => "LOW",
        Severity::Med => "MED",
        Severity::High => "HIGH",
    }
}

fn severity_from_str(s: &str) -> Result<Severity> {
    Ok(match s {
        "LOW" => Severity::Low,
        "MED" => Severity::Med,
        "HIGH" => Severity::High,
        other => return Err(anyhow!("invalid severity: {other}")),
    })
}

fn channel_str(c: Channel) -> &'static str {
    match c {
        Channel::Email => "email",
        Channel::Webhook => "webhook",
        Channel::Sms => "sms",
    }
}

fn channel_from_str(s: &str) -> Result<Channel> {
    Ok(match s {
        "email" => Channel::Email,
        "webhook" => Channel::Webhook,
        "sms" => Channel::Sms,
        other => return Err(anyhow!("invalid channel: {other}")),
    })
}

fn channels_to_vec(channels: &BTreeSet<Channel>) -> Vec<String> {
    channels.iter().map(|c| channel_str(*c).to_string()).collect()
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// Insert a notification, relying on the `(rule_id, transaction_id, channel)`
/// unique index for idempotency. Returns `false` without creating a second
/// row if one already exists for this triple (invariant 3.4 / 3.6).
pub async fn insert_notification(pool: &PgPool, n: &AlertNotification) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into alert_notifications (
            id, rule_id, user_id, transaction_id, channel, title, body, status, created_at
        ) values ($1,$2,$3,$4,$5,$6,$7,$8,$9)
        on conflict (rule_id, transaction_id, channel) do nothing
        returning id
        "#,
    )
    .bind(n.id)
    .bind(n.rule_id)
    .bind(n.user_id)
    .bind(n.transaction_id)
    .bind(channel_str(n.channel))
    .bind(&n.title)
    .bind(&n.body)
    .bind(status_str_notif(n.status))
    .bind(n.created_at)
    .fetch_optional(pool)
    .await
    .context("insert_notification failed")?;
    Ok(row.is_some())
}

pub async fn get_notification(pool: &PgPool, id: Uuid) -> Result<AlertNotification> {
    let row = sqlx::query(NOTIF_SELECT_COLUMNS)
        .bind(id)
        .fetch_one(pool)
        .await
        .context("get_notification failed")?;
    row_to_notification(&row)
}

const NOTIF_SELECT_COLUMNS: &str = r#"
    select id, rule_id, user_id, transaction_id, channel, title, body, status,
           created_at, delivered_at, read_at, error
    from alert_notifications where id = $1
"#;

/// Advance a notification's status, enforcing the monotone status DAG
/// (invariant 3.4). Returns an error if the transition is illegal.
pub async fn advance_notification_status(
    pool: &PgPool,
    id: Uuid,
    to: NotificationStatus,
    error: Option<&str>,
) -> Result<()> {
    let current = get_notification(pool, id).await?;
    if !current.status.can_transition_to(to) {
        return Err(anyhow!(
            "illegal notification transition: {:?} -> {:?}",
            current.status,
            to
        ));
    }

    let delivered_at = matches!(to, NotificationStatus::Sent).then(Utc::now);
    let read_at = matches!(to, NotificationStatus::Read).then(Utc::now);

    sqlx::query(
        r#"
        update alert_notifications
        set status = $2,
            delivered_at = coalesce(delivered_at, $3),
            read_at = coalesce(read_at, $4),
            error = coalesce($5, error)
        where id = $1
        "#,
    )
    .bind(id)
    .bind(status_str_notif(to))
    .bind(delivered_at)
    .bind(read_at)
    .bind(error)
    .execute(pool)
    .await
    .context("advance_notification_status failed")?;
    Ok(())
}

fn status_str_notif(s: NotificationStatus) -> &'static str {
    match s {
        NotificationStatus::Queued => "QUEUED",
        NotificationStatus::Sent => "SENT",
        NotificationStatus::Failed => "FAILED",
        NotificationStatus::Read => "READ",
    }
}

fn status_from_str_notif(s: &str) -> Result<NotificationStatus> {
    Ok(match s {
        "QUEUED" => NotificationStatus::Queued,
        "SENT" => NotificationStatus::Sent,
        "FAILED" => NotificationStatus::Failed,
        "READ" => NotificationStatus::Read,
        other => return Err(anyhow!("invalid notification status: {other}")),
    })
}

fn row_to_notification(row: &sqlx::postgres::PgRow) -> Result<AlertNotification> {
    Ok(AlertNotification {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        user_id: row.try_get("user_id")?,
        transaction_id: row.try_get("transaction_id")?,
        channel: channel_from_str(&row.try_get::<String, _>("channel")?)?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        status: status_from_str_notif(&row.try_get::<String, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
        read_at: row.try_get("read_at")?,
        error: row.try_get("error")?,
    })
}

/// Claim a batch of `QUEUED` notifications for exclusive dispatch using
/// `FOR UPDATE SKIP LOCKED`, so concurrent dispatch workers never claim the
/// same row. Gated behind `runtime-claim` so only the orchestrator's
/// dispatch pool can call it.
#[cfg(feature = "runtime-claim")]
pub async fn notification_claim_batch(
    pool: &PgPool,
    batch_size: i64,
    worker_id: &str,
) -> Result<Vec<AlertNotification>> {
    let rows = sqlx::query(
        r#"
        with to_claim as (
            select id
            from alert_notifications
            where status = 'QUEUED' and claimed_at is null
            order by created_at asc
            limit $1
            for update skip locked
        )
        update alert_notifications
        set claimed_at = now(), claimed_by = $2
        where id in (select id from to_claim)
        returning id, rule_id, user_id, transaction_id, channel, title, body, status,
                  created_at, delivered_at, read_at, error
        "#,
    )
    .bind(batch_size)
    .bind(worker_id)
    .fetch_all(pool)
    .await
    .context("notification_claim_batch failed")?;

    rows.iter().map(row_to_notification).collect()
}

// ---------------------------------------------------------------------------
// Category synonyms (C3/C5 category grounding)
// ---------------------------------------------------------------------------

pub async fn list_category_synonyms(pool: &PgPool) -> Result<Vec<CategorySynonym>> {
    let rows = sqlx::query("select canonical, synonym, embedding from category_synonyms")
        .fetch_all(pool)
        .await
        .context("list_category_synonyms failed")?;
    rows.iter()
        .map(|row| {
            Ok(CategorySynonym {
                canonical: row.try_get("canonical")?,
                synonym: row.try_get("synonym")?,
                embedding: row.try_get("embedding")?,
            })
        })
        .collect()
}

pub async fn upsert_category_synonym(pool: &PgPool, s: &CategorySynonym) -> Result<()> {
    sqlx::query(
        r#"
        insert into category_synonyms (canonical, synonym, embedding)
        values ($1, $2, $3)
        on conflict (synonym) do update set canonical = excluded.canonical, embedding = excluded.embedding
        "#,
    )
    .bind(&s.canonical)
    .bind(&s.synonym)
    .bind(&s.embedding)
    .execute(pool)
    .await
    .context("upsert_category_synonym failed")?;
    Ok(())
}

/// Distinct merchant names this user has transacted with, for the
/// compiler's merchant-resolution fallback (case-insensitive containment).
pub async fn distinct_merchant_names(pool: &PgPool, user_id: Uuid) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "select distinct merchant_name from transactions where user_id = $1",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .context("distinct_merchant_names failed")?;
    Ok(rows.into_iter().map(|(m,)| m).collect())
}

// ---------------------------------------------------------------------------
// Rule SQL execution (C3 validate, C4 evaluate)
// ---------------------------------------------------------------------------

/// Execute a compiled rule's SQL in a read-only transaction scoped to
/// `user_id`, with a wall-clock timeout and a row cap of 1. Compiled SQL
/// always returns a single `(triggered, observed, baseline, detail)` row.
pub async fn run_rule_sql(
    pool: &PgPool,
    sql: &str,
    params: &[(&str, Value)],
    user_id: Uuid,
    timeout: Duration,
) -> Result<RuleEvalRow> {
    let mut tx = pool.begin().await.context("run_rule_sql: begin failed")?;
    sqlx::query("set transaction read only")
        .execute(&mut *tx)
        .await
        .context("run_rule_sql: set read only failed")?;
    sqlx::query(&format!(
        "set local statement_timeout = {}",
        timeout.as_millis().max(1)
    ))
    .execute(&mut *tx)
    .await
    .context("run_rule_sql: set statement_timeout failed")?;

    let bound_sql = bind_named_params(sql, params, user_id);

    let row = sqlx::query(&bound_sql)
        .fetch_one(&mut *tx)
        .await
        .context("run_rule_sql: query failed")?;

    let triggered: bool = row.try_get("triggered")?;
    let observed: Option<rust_decimal::Decimal> = row.try_get("observed").ok();
    let baseline: Option<rust_decimal::Decimal> = row.try_get("baseline").ok();
    let detail: Value = row.try_get("detail").unwrap_or(Value::Null);

    tx.rollback().await.context("run_rule_sql: rollback failed")?;

    Ok(RuleEvalRow {
        triggered,
        observed,
        baseline,
        detail,
    })
}

/// Substitute `:name` placeholders with literal SQL values. The grammar
/// validated by the compiler (C3) guarantees every `:param` is a scalar
/// bound via `sql_params_schema`, so textual substitution against
/// already-validated, non-attacker-controlled SQL is safe here; user input
/// never reaches this function directly.
fn bind_named_params(sql: &str, params: &[(&str, Value)], user_id: Uuid) -> String {
    let mut out = sql.replace(":user_id", &format!("'{user_id}'::uuid"));
    for (name, value) in params {
        let literal = json_value_to_sql_literal(value);
        out = out.replace(&format!(":{name}"), &literal);
    }
    out
}

fn json_value_to_sql_literal(v: &Value) -> String {
    match v {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

// ---------------------------------------------------------------------------
// Vector search (C2 backing store)
// ---------------------------------------------------------------------------

/// Nearest-neighbour search over stored embeddings for `table`
/// (`alert_rules` or `category_synonyms`), by cosine distance. Abstracted
/// behind this function so C2/C3/C4 never need to know whether the vectors
/// live in this table or an external vector index.
pub async fn vector_search(
    pool: &PgPool,
    table: &str,
    embedding_column: &str,
    id_column: &str,
    vec: &[f32],
    k: usize,
) -> Result<Vec<(Uuid, f32)>> {
    if table != "alert_rules" && table != "category_synonyms" {
        return Err(anyhow!("vector_search: unknown table {table}"));
    }

    let rows = sqlx::query(&format!(
        "select {id_column} as id, {embedding_column} as embedding from {table}"
    ))
    .fetch_all(pool)
    .await
    .context("vector_search: fetch failed")?;

    let mut scored: Vec<(Uuid, f32)> = Vec::with_capacity(rows.len());
    for row in rows {
        let id: Uuid = row.try_get("id")?;
        let embedding: Vec<f32> = row.try_get("embedding")?;
        let distance = cosine_distance(vec, &embedding);
        scored.push((id, distance));
    }
    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::INFINITY;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - (dot / (norm_a * norm_b))
}
