//! Rule compiler (natural language -> durable, validated `AlertRule`).
//!
//! `compile` runs the Parse -> Ground -> Synthesize -> Validate -> DedupCheck
//! state machine described in the module docs of each stage file. Every
//! stage either advances or terminates the pipeline with a typed outcome;
//! nothing here retries a failed Parse/Ground/Validate on its own.

pub mod dedup;
pub mod grammar;
pub mod ground;
pub mod llm;
pub mod synthesize;

use std::time::Duration;

use alertdesk_embed::EmbeddingService;
use alertdesk_schemas::{AlertRule, RuleIntent, Severity};
use anyhow::Result;
use chrono::Utc;
use llm::{LlmError, LlmService};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// Hard timeout for the dynamic-validate dry run against live history.
pub const SQL_VALIDATE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum CompileResult {
    Valid(AlertRule),
    DuplicateOf { existing_rule_id: Uuid, similarity: f64 },
    Invalid { reason: String, hints: Vec<String> },
    Ambiguous { questions: Vec<String> },
}

pub struct CompileRequest<'a> {
    pub user_id: Uuid,
    pub nl_text: &'a str,
    pub severity: Severity,
    /// `Some(existing_rule_id)` for an edit; the previous rule is replaced
    /// atomically only if the new one reaches `Valid`.
    pub editing_rule_id: Option<Uuid>,
}

/// Wires the pipeline's external dependencies: the data store, the
/// embedder, the LLM, and the configured similarity thresholds.
pub struct Compiler {
    pool: PgPool,
    embed: EmbeddingService,
    llm: LlmService,
    dup_similarity_threshold: f64,
    category_similarity_threshold: f64,
}

impl Compiler {
    pub fn new(
        pool: PgPool,
        embed: EmbeddingService,
        llm: LlmService,
        dup_similarity_threshold: f64,
        category_similarity_threshold: f64,
    ) -> Self {
        Self {
            pool,
            embed,
            llm,
            dup_similarity_threshold,
            category_similarity_threshold,
        }
    }

    pub async fn compile(&self, req: CompileRequest<'_>) -> Result<CompileResult> {
        let user = alertdesk_db::get_user(&self.pool, req.user_id).await?;

        let parsed = match self.llm.parse_intent(req.nl_text).await {
            Ok(p) => p,
            Err(LlmError::Transport(_)) => {
                return Ok(CompileResult::Invalid {
                    reason: "temporarily_unavailable".to_string(),
                    hints: vec!["the rule-parsing service is temporarily unavailable".to_string()],
                })
            }
            Err(e) => {
                return Ok(CompileResult::Invalid {
                    reason: "unparseable".to_string(),
                    hints: vec![e.to_string()],
                })
            }
        };

        const MIN_CONFIDENCE: f64 = 0.55;
        if parsed.confidence < MIN_CONFIDENCE || !parsed.questions.is_empty() {
            let questions = if parsed.questions.is_empty() {
                vec!["could you be more specific about the amount, category, or merchant?".to_string()]
            } else {
                parsed.questions
            };
            return Ok(CompileResult::Ambiguous { questions });
        }

        let grounded = match ground::ground(
            &self.pool,
            &self.embed,
            self.category_similarity_threshold,
            parsed.intent,
            &user,
        )
        .await
        {
            Ok(intent) => intent,
            Err(e) => {
                return Ok(CompileResult::Invalid {
                    reason: "missing_required_field".to_string(),
                    hints: vec![e.to_string()],
                })
            }
        };

        let template = match synthesize::synthesize(&grounded) {
            Ok(t) => t,
            Err(reason) => {
                return Ok(CompileResult::Invalid {
                    reason: "synthesis_failed".to_string(),
                    hints: vec![reason],
                })
            }
        };

        if let Err(violations) = grammar::validate(&template.sql_text, &template.sql_params_schema) {
            return Ok(CompileResult::Invalid {
                reason: "grammar_violation".to_string(),
                hints: violations.iter().map(|v| v.to_string()).collect(),
            });
        }

        let window_secs = grounded.window_secs.unwrap_or_else(|| synthesize::default_window_secs(grounded.kind));
        let now = Utc::now();
        let window_start = now - chrono::Duration::seconds(window_secs);
        let params = dynamic_validate_params(&grounded, window_start, now);

        if let Err(e) =
            alertdesk_db::run_rule_sql(&self.pool, &template.sql_text, &params, req.user_id, SQL_VALIDATE_TIMEOUT)
                .await
        {
            return Ok(CompileResult::Invalid {
                reason: "dynamic_validation_failed".to_string(),
                hints: vec![e.to_string()],
            });
        }

        let dedup_outcome = dedup::check(
            &self.pool,
            &self.embed,
            self.dup_similarity_threshold,
            req.user_id,
            req.nl_text,
            req.editing_rule_id,
        )
        .await?;

        let nl_embedding = match dedup_outcome {
            dedup::DedupOutcome::Duplicate { existing_rule_id, similarity } => {
                return Ok(CompileResult::DuplicateOf { existing_rule_id, similarity })
            }
            dedup::DedupOutcome::EmbedderUnavailable => {
                return Ok(CompileResult::Invalid {
                    reason: "temporarily_unavailable".to_string(),
                    hints: vec!["the embedding service is temporarily unavailable".to_string()],
                })
            }
            dedup::DedupOutcome::Unique { nl_embedding } => nl_embedding,
        };

        let sql_params_values = fixed_param_values(&grounded);

        let rule = AlertRule {
            id: req.editing_rule_id.unwrap_or_else(Uuid::new_v4),
            user_id: req.user_id,
            nl_text: req.nl_text.to_string(),
            name: None,
            kind: grounded.kind,
            sql_text: template.sql_text,
            sql_params_schema: template.sql_params_schema,
            sql_params_values,
            trigger_schema: template.trigger_schema,
            severity: req.severity,
            channels: grounded.channels,
            is_active: true,
            created_at: now,
            last_triggered_at: None,
            trigger_count: 0,
            nl_embedding,
            validated_sql: true,
            consecutive_failures: 0,
        };

        if let Some(_existing) = req.editing_rule_id {
            alertdesk_db::update_rule(&self.pool, &rule).await?;
        } else {
            alertdesk_db::insert_rule(&self.pool, &rule).await?;
        }

        Ok(CompileResult::Valid(rule))
    }
}

fn dynamic_validate_params(
    intent: &RuleIntent,
    window_start: chrono::DateTime<Utc>,
    window_end: chrono::DateTime<Utc>,
) -> Vec<(&'static str, Value)> {
    let mut params: Vec<(&'static str, Value)> = vec![
        ("window_start", Value::String(window_start.to_rfc3339())),
        ("window_end", Value::String(window_end.to_rfc3339())),
        // No real transaction exists yet at compile time; templates that bind
        // `:txn_id` only use it to pin which row "triggered", which this dry
        // run doesn't need to get right to prove the SQL is well-formed.
        ("txn_id", Value::String(Uuid::nil().to_string())),
    ];
    if let Some(amount) = intent.amount {
        params.push(("amount", Value::String(amount.to_string())));
    }
    if let Some(category) = &intent.category {
        params.push(("category", Value::String(category.clone())));
    }
    if let Some(merchant) = &intent.merchant {
        params.push(("merchant", Value::String(merchant.clone())));
    }
    let threshold_pct = intent.threshold_pct.unwrap_or_else(|| rust_decimal::Decimal::new(20, 0));
    params.push(("threshold_pct", Value::String(threshold_pct.to_string())));
    params
}

/// The subset of a rule's named params whose values are fixed at compile
/// time and persisted on `AlertRule.sql_params_values` for reuse across
/// every future evaluation. `window_start`/`window_end` are deliberately
/// excluded — the evaluator rebuilds those fresh around each transaction.
fn fixed_param_values(intent: &RuleIntent) -> Value {
    let mut obj = serde_json::Map::new();
    if let Some(amount) = intent.amount {
        obj.insert("amount".to_string(), Value::String(amount.to_string()));
    }
    if let Some(category) = &intent.category {
        obj.insert("category".to_string(), Value::String(category.clone()));
    }
    if let Some(merchant) = &intent.merchant {
        obj.insert("merchant".to_string(), Value::String(merchant.clone()));
    }
    let threshold_pct = intent.threshold_pct.unwrap_or_else(|| rust_decimal::Decimal::new(20, 0));
    obj.insert("threshold_pct".to_string(), Value::String(threshold_pct.to_string()));
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertdesk_schemas::RuleKind;
    use rust_decimal::Decimal;

    #[test]
    fn dynamic_validate_params_always_includes_window_and_threshold_pct() {
        let intent = RuleIntent {
            kind: RuleKind::Threshold,
            amount: Some(Decimal::new(50000, 2)),
            operator: None,
            baseline: None,
            window_secs: None,
            category: None,
            merchant: None,
            geo_scope: None,
            threshold_pct: None,
            channels: Default::default(),
        };
        let now = Utc::now();
        let params = dynamic_validate_params(&intent, now - chrono::Duration::seconds(60), now);
        let names: Vec<&str> = params.iter().map(|(k, _)| *k).collect();
        assert!(names.contains(&"window_start"));
        assert!(names.contains(&"window_end"));
        assert!(names.contains(&"amount"));
        assert!(names.contains(&"threshold_pct"));
    }
}
