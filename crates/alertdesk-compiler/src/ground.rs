//! Ground stage: resolve free-form category/merchant strings from Parse
//! against canonical data, and pull user-scoped facts (home state) the
//! synthesized SQL needs. Required-field check happens after grounding so a
//! parse that left `category`/`merchant` in free-form English still has a
//! chance to resolve before being rejected.

use alertdesk_embed::EmbeddingService;
use alertdesk_schemas::{RuleIntent, RuleKind, User};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroundError {
    MissingRequiredField(&'static str),
    UnsupportedBaseline,
}

impl std::fmt::Display for GroundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroundError::MissingRequiredField(field) => {
                write!(f, "required field '{field}' is missing after grounding")
            }
            GroundError::UnsupportedBaseline => {
                write!(f, "only AVG baseline is supported for percent-delta rules")
            }
        }
    }
}

/// Canonicalise `intent.category` and `intent.merchant`, and validate that
/// every field this rule kind's template needs is present. Embedder
/// failures are a soft failure here: grounding falls back to the raw,
/// normalized string rather than aborting the compile.
pub async fn ground(
    pool: &PgPool,
    embed: &EmbeddingService,
    category_threshold: f64,
    mut intent: RuleIntent,
    user: &User,
) -> Result<RuleIntent, GroundError> {
    if let Some(category) = intent.category.take() {
        let canon = canonicalize_category(pool, embed, category_threshold, &category)
            .await
            .unwrap_or_else(|| alertdesk_embed::normalize_text(&category));
        intent.category = Some(canon);
    }

    if let Some(merchant) = intent.merchant.take() {
        let resolved = resolve_merchant(pool, embed, category_threshold, user.id, &merchant)
            .await
            .unwrap_or(merchant);
        intent.merchant = Some(resolved);
    }

    if matches!(intent.kind, RuleKind::PctDeltaVsBaseline) {
        if let Some(baseline) = intent.baseline {
            if baseline != alertdesk_schemas::Baseline::Avg {
                return Err(GroundError::UnsupportedBaseline);
            }
        }
    }

    require_fields(&intent)?;
    Ok(intent)
}

fn require_fields(intent: &RuleIntent) -> Result<(), GroundError> {
    match intent.kind {
        RuleKind::Threshold => {
            if intent.amount.is_none() {
                return Err(GroundError::MissingRequiredField("amount"));
            }
        }
        RuleKind::PctDeltaVsBaseline | RuleKind::CategoryRatio => {
            if intent.category.is_none() {
                return Err(GroundError::MissingRequiredField("category"));
            }
            if intent.threshold_pct.is_none() {
                return Err(GroundError::MissingRequiredField("threshold_pct"));
            }
        }
        RuleKind::MerchantPattern | RuleKind::RecurringDrift => {
            if intent.merchant.is_none() {
                return Err(GroundError::MissingRequiredField("merchant"));
            }
        }
        RuleKind::Frequency => {
            if intent.amount.is_none() {
                return Err(GroundError::MissingRequiredField("amount"));
            }
        }
        RuleKind::Location => {}
    }
    Ok(())
}

/// Map a free-form category string ("food", "restaurants") onto a
/// canonical one via `category_synonyms`, falling back to the nearest
/// embedding match above `category_threshold` (`τ_cat`).
async fn canonicalize_category(
    pool: &PgPool,
    embed: &EmbeddingService,
    category_threshold: f64,
    raw: &str,
) -> Option<String> {
    let normalized = alertdesk_embed::normalize_text(raw);
    let synonyms = alertdesk_db::list_category_synonyms(pool).await.ok()?;

    if let Some(hit) = synonyms.iter().find(|s| alertdesk_embed::normalize_text(&s.synonym) == normalized) {
        return Some(hit.canonical.clone());
    }

    let query_vec = embed.embed(&normalized).await.ok()?;
    let candidates: Vec<(String, Vec<f32>)> = synonyms
        .iter()
        .map(|s| (s.canonical.clone(), s.embedding.clone()))
        .collect();
    let (canonical, similarity) = alertdesk_embed::nearest_by_cosine(&query_vec, &candidates)?;
    if similarity >= category_threshold {
        Some(canonical.clone())
    } else {
        None
    }
}

/// Resolve a free-form merchant name against the user's transaction
/// history: case-insensitive containment first, embedding fallback second.
/// Tie-breaks use the lowest canonical string, per the evaluator's
/// deterministic tie-break policy.
async fn resolve_merchant(
    pool: &PgPool,
    embed: &EmbeddingService,
    category_threshold: f64,
    user_id: Uuid,
    raw: &str,
) -> Option<String> {
    let known = alertdesk_db::distinct_merchant_names(pool, user_id).await.ok()?;
    resolve_merchant_against(&known, embed, category_threshold, raw).await
}

/// Test seam: grounding logic without the DB round trip for merchant lookup.
async fn resolve_merchant_against(
    known: &[String],
    embed: &EmbeddingService,
    category_threshold: f64,
    raw: &str,
) -> Option<String> {
    let normalized = alertdesk_embed::normalize_text(raw);
    let mut containment_hits: Vec<&String> = known
        .iter()
        .filter(|m| alertdesk_embed::normalize_text(m).contains(&normalized))
        .collect();
    containment_hits.sort();
    if let Some(hit) = containment_hits.first() {
        return Some((*hit).clone());
    }

    let query_vec = embed.embed(&normalized).await.ok()?;
    let mut scored: Vec<(String, f64)> = Vec::new();
    for m in known {
        let mv = embed.embed(m).await.ok()?;
        scored.push((m.clone(), alertdesk_embed::cosine_similarity(&query_vec, &mv)));
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    let (best, similarity) = scored.into_iter().next()?;
    if similarity >= category_threshold {
        Some(best)
    } else {
        None
    }
}
