//! Shared fixtures for scenario tests across the alert-rule-pipeline
//! crates: default `User`/`CreditCard`/`Transaction` builders, a seeded
//! pool helper, and deterministic `EmbeddingProvider`/`LlmClient` stand-ins
//! so pipeline tests never need a live API key.

use std::collections::BTreeSet;
use std::sync::Arc;

use alertdesk_compiler::llm::{LlmClient, LlmError, ParsedIntent};
use alertdesk_embed::{EmbeddingProvider, ProviderError};
use alertdesk_schemas::{
    Channel, Coords, CreditCard, Operator, RuleIntent, RuleKind, Transaction, TransactionStatus,
    User,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

/// A user with a California home state, no location history yet, and
/// enough credit limit that threshold rules around typical test amounts
/// don't trip an unrelated balance check.
pub fn default_user(user_id: Uuid) -> User {
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

pub fn default_card(card_id: Uuid, user_id: Uuid) -> CreditCard {
    CreditCard {
        id: card_id,
        user_id,
        last4: "4242".into(),
        network: "visa".into(),
        issuer: "test-bank".into(),
        active: true,
    }
}

/// A settled grocery purchase, the most common test default. Override
/// fields on the returned value for scenarios that need something else.
pub fn default_transaction(txn_id: Uuid, user_id: Uuid, card_id: Uuid, amount: Decimal) -> Transaction {
    Transaction {
        id: txn_id,
        user_id,
        card_id,
        amount,
        currency: "USD".into(),
        merchant_name: "Test Grocer".into(),
        merchant_category: "groceries".into(),
        occurred_at: Utc::now(),
        coords: Some(Coords { lat: 34.05, lon: -118.24 }),
        merchant_state: Some("CA".into()),
        status: TransactionStatus::Approved,
    }
}

/// Inserts a [`default_user`] + [`default_card`] pair and returns their ids.
pub async fn seed_user_and_card(pool: &PgPool) -> anyhow::Result<(Uuid, Uuid)> {
    let user_id = Uuid::new_v4();
    let card_id = Uuid::new_v4();
    alertdesk_db::upsert_user(pool, &default_user(user_id)).await?;
    alertdesk_db::insert_card(pool, &default_card(card_id, user_id)).await?;
    Ok((user_id, card_id))
}

/// An [`LlmClient`] that ignores its input and always returns the same
/// threshold-over-$500-to-email intent. Good enough for routing and
/// persistence tests that don't exercise the parse stage itself.
pub struct CannedLlm;

#[async_trait]
impl LlmClient for CannedLlm {
    fn name(&self) -> &'static str {
        "canned"
    }

    async fn parse_intent(&self, _nl_text: &str) -> Result<ParsedIntent, LlmError> {
        let mut channels = BTreeSet::new();
        channels.insert(Channel::Email);
        Ok(ParsedIntent {
            intent: RuleIntent {
                kind: RuleKind::Threshold,
                amount: Some(Decimal::new(50000, 2)),
                operator: Some(Operator::Gt),
                baseline: None,
                window_secs: Some(60),
                category: None,
                merchant: None,
                geo_scope: None,
                threshold_pct: None,
                channels,
            },
            confidence: 0.95,
            questions: vec![],
        })
    }
}

/// An [`LlmClient`] that always fails with the given transport error,
/// for exercising the compiler's `temporarily_unavailable` path.
pub struct FailingLlm(pub String);

#[async_trait]
impl LlmClient for FailingLlm {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn parse_intent(&self, _nl_text: &str) -> Result<ParsedIntent, LlmError> {
        Err(LlmError::Transport(self.0.clone()))
    }
}

/// An [`EmbeddingProvider`] that derives a cheap, deterministic vector
/// from each text's length. Enough to exercise cosine-similarity dedup
/// logic without a live embedder.
pub struct StubEmbedder {
    dim: usize,
}

impl StubEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for StubEmbedder {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; self.dim];
                v[0] = t.len() as f32;
                v
            })
            .collect())
    }
}

/// Convenience wrapper bundling a [`CannedLlm`] and [`StubEmbedder`] as
/// `Arc<dyn ...>` pairs ready to hand to `alertdesk_compiler::Compiler::new`.
pub fn canned_compiler_deps() -> (Arc<dyn EmbeddingProvider>, Arc<dyn LlmClient>) {
    (Arc::new(StubEmbedder::default()), Arc::new(CannedLlm))
}
