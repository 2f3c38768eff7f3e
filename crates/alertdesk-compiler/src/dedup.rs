//! DedupCheck stage: find the nearest active rule for this user by
//! `nl_embedding` cosine similarity. Falls back to normalized-text equality
//! if the embedder is unavailable, per the soft-failure policy.

use alertdesk_embed::EmbeddingService;
use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

pub enum DedupOutcome {
    Unique { nl_embedding: Vec<f32> },
    Duplicate { existing_rule_id: Uuid, similarity: f64 },
    /// The embedder is down and no exact textual duplicate was found among
    /// the user's active rules. Never resolves to `Unique` in this case —
    /// persisting an empty `nl_embedding` would permanently break
    /// cosine-similarity dedup for the rule, since `cosine_similarity`
    /// returns 0.0 on a dimension mismatch against every future embedding.
    EmbedderUnavailable,
}

pub async fn check(
    pool: &PgPool,
    embed: &EmbeddingService,
    dup_threshold: f64,
    user_id: Uuid,
    nl_text: &str,
    editing_rule_id: Option<Uuid>,
) -> Result<DedupOutcome> {
    let candidates = alertdesk_db::active_rule_embeddings(pool, user_id).await?;
    let candidates: Vec<(Uuid, Vec<f32>)> = candidates
        .into_iter()
        .filter(|(id, _)| Some(*id) != editing_rule_id)
        .collect();

    match embed.embed(nl_text).await {
        Ok(vec) => {
            if let Some((id, sim)) = alertdesk_embed::nearest_by_cosine(&vec, &candidates) {
                if sim >= dup_threshold {
                    return Ok(DedupOutcome::Duplicate {
                        existing_rule_id: *id,
                        similarity: sim,
                    });
                }
            }
            Ok(DedupOutcome::Unique { nl_embedding: vec })
        }
        Err(e) => {
            let normalized = alertdesk_embed::normalize_text(nl_text);
            for (id, rule) in fetch_active_rules_text(pool, user_id, editing_rule_id).await? {
                if alertdesk_embed::normalize_text(&rule) == normalized {
                    return Ok(DedupOutcome::Duplicate {
                        existing_rule_id: id,
                        similarity: 1.0,
                    });
                }
            }
            tracing::warn!(user_id = %user_id, error = %e, "embedder unavailable during dedup check, no textual duplicate found");
            Ok(DedupOutcome::EmbedderUnavailable)
        }
    }
}

async fn fetch_active_rules_text(
    pool: &PgPool,
    user_id: Uuid,
    editing_rule_id: Option<Uuid>,
) -> Result<Vec<(Uuid, String)>> {
    let rules = alertdesk_db::get_active_rules(pool, user_id).await?;
    Ok(rules
        .into_iter()
        .filter(|r| Some(r.id) != editing_rule_id)
        .map(|r| (r.id, r.nl_text))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_outcome_variants_are_constructible() {
        let unique = DedupOutcome::Unique { nl_embedding: vec![0.1, 0.2] };
        match unique {
            DedupOutcome::Unique { nl_embedding } => assert_eq!(nl_embedding.len(), 2),
            _ => panic!("expected Unique"),
        }

        let unavailable = DedupOutcome::EmbedderUnavailable;
        assert!(matches!(unavailable, DedupOutcome::EmbedderUnavailable));
    }
}
