use std::sync::Arc;

use alertdesk_analyzer::AnalyzerConfig;
use alertdesk_dispatch::{dispatch, ChannelAdapter, DispatchConfig, Destination, EmailMessage, WebhookMessage};
use alertdesk_evaluator::EvaluatorConfig;
use alertdesk_schemas::Channel;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::queue::FairQueue;
use crate::DestinationResolver;

/// Pulls queued transactions and runs them through `evaluate`. Any resulting
/// notification is handed to the dispatch queue, not sent inline — a slow
/// SMTP/webhook send must never block the next transaction's evaluation.
pub async fn evaluate_worker(
    pool: PgPool,
    analyzer_cfg: Arc<AnalyzerConfig>,
    eval_cfg: Arc<EvaluatorConfig>,
    audit: Arc<tokio::sync::Mutex<alertdesk_audit::AuditWriter>>,
    incoming: Arc<FairQueue>,
    outgoing: Arc<FairQueue>,
) {
    while let Some((user_id, txn_id)) = incoming.pop().await {
        match alertdesk_evaluator::evaluate(&pool, &analyzer_cfg, &eval_cfg, &audit, txn_id).await {
            Ok(outcome) => {
                for notification in &outcome.notifications {
                    if outgoing.push(user_id, notification.id).is_err() {
                        tracing::warn!(
                            notification_id = %notification.id,
                            "dispatch queue at capacity, dropping notification for this pass"
                        );
                    }
                }
                for skipped in &outcome.skipped {
                    tracing::debug!(rule_id = %skipped.rule_id, reason = %skipped.reason, "rule skipped");
                }
                for rule_id in &outcome.deactivated {
                    tracing::warn!(rule_id = %rule_id, "rule auto-deactivated by evaluator");
                }
            }
            Err(e) => {
                tracing::error!(transaction_id = %txn_id, error = %e, "transaction evaluation failed");
            }
        }
    }
}

/// Pulls queued notification ids and dispatches each on its own channel,
/// resolving a concrete `Destination` through the caller-supplied resolver.
pub async fn dispatch_worker(
    pool: PgPool,
    dispatch_cfg: Arc<DispatchConfig>,
    email_adapter: Arc<dyn ChannelAdapter<Request = EmailMessage>>,
    webhook_adapter: Arc<dyn ChannelAdapter<Request = WebhookMessage>>,
    resolver: Arc<dyn DestinationResolver>,
    queue: Arc<FairQueue>,
) {
    while let Some((user_id, notification_id)) = queue.pop().await {
        if let Err(e) = dispatch_one(
            &pool,
            &dispatch_cfg,
            &email_adapter,
            &webhook_adapter,
            resolver.as_ref(),
            user_id,
            notification_id,
        )
        .await
        {
            tracing::warn!(notification_id = %notification_id, error = %e, "notification dispatch attempt failed");
        }
    }
}

async fn dispatch_one(
    pool: &PgPool,
    dispatch_cfg: &DispatchConfig,
    email_adapter: &Arc<dyn ChannelAdapter<Request = EmailMessage>>,
    webhook_adapter: &Arc<dyn ChannelAdapter<Request = WebhookMessage>>,
    resolver: &dyn DestinationResolver,
    user_id: Uuid,
    notification_id: Uuid,
) -> anyhow::Result<()> {
    let notification = alertdesk_db::get_notification(pool, notification_id).await?;

    let destination = match resolver.resolve(user_id, notification.channel).await {
        Some(d) => d,
        None => {
            tracing::debug!(notification_id = %notification_id, "no destination configured for this channel, skipping send");
            return Ok(());
        }
    };

    match (notification.channel, destination) {
        (Channel::Email, Destination::Email { to }) => {
            let msg = EmailMessage {
                to,
                subject: notification.title.clone(),
                body: notification.body.clone(),
            };
            dispatch(pool, email_adapter.as_ref(), dispatch_cfg, notification_id, msg).await
        }
        (Channel::Webhook, Destination::Webhook { url, hmac_secret }) => {
            let rule = alertdesk_db::get_rule(pool, notification.rule_id).await?;
            let transaction = match notification.transaction_id {
                Some(txn_id) => Some(alertdesk_db::get_transaction(pool, txn_id).await?),
                None => None,
            };
            let payload = json!({
                "notification_id": notification.id,
                "rule_id": notification.rule_id,
                "user_id": notification.user_id,
                "transaction": transaction,
                "severity": rule.severity,
                "title": notification.title,
                "body": notification.body,
                "issued_at": notification.created_at,
            });
            let msg = WebhookMessage { url, hmac_secret, payload };
            dispatch(pool, webhook_adapter.as_ref(), dispatch_cfg, notification_id, msg).await
        }
        (Channel::Sms, _) => {
            tracing::debug!(notification_id = %notification_id, "sms channel not implemented, skipping");
            Ok(())
        }
        (channel, _) => {
            tracing::warn!(notification_id = %notification_id, ?channel, "destination type does not match channel, skipping");
            Ok(())
        }
    }
}
