//! Embedding & similarity service.
//!
//! Produces fixed-dimension vectors from free-form text via a pluggable
//! [`EmbeddingProvider`], and owns the deterministic parts of the pipeline
//! that sit on top of it: text normalization and cosine similarity/distance.
//! It does **not** decide what the thresholds mean to callers (that is the
//! compiler's and analyzer's job) — it only computes the numbers.

pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use unicode_normalization::UnicodeNormalization;

pub use provider::{EmbeddingProvider, ProviderError};

/// Default similarity threshold above which two rule texts are considered
/// duplicates of each other.
pub const DEFAULT_DUP_SIMILARITY_THRESHOLD: f64 = 0.92;

/// Default similarity threshold above which a free-form merchant-category
/// string is mapped onto a canonical category.
pub const DEFAULT_CATEGORY_SIMILARITY_THRESHOLD: f64 = 0.80;

/// Outbound deadline for a single embed call, per the pipeline's timeout table.
pub const EMBED_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded retry budget for a transient embed failure: the initial attempt
/// plus this many retries before the caller is told the embedder is down.
const EMBED_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential backoff between embed retries.
const EMBED_BACKOFF_BASE: Duration = Duration::from_millis(200);

/// FNV-1a, used only to derive deterministic backoff jitter, mirroring
/// `alertdesk-dispatch`'s retry policy.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Backoff delay for a given attempt, with jitter derived deterministically
/// from the batch contents so retries are reproducible in tests.
fn backoff_delay(base: Duration, seed: &[u8], attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(16));

    let mut key = seed.to_vec();
    key.extend_from_slice(&attempt.to_le_bytes());
    let jitter_ms = if base_ms == 0 { 0 } else { fnv1a(&key) % base_ms };

    Duration::from_millis(exp_ms.saturating_add(jitter_ms))
}

/// Raised whenever the configured embedder cannot be reached or errors.
///
/// Callers treat this as a soft failure: the compiler falls back to
/// normalized-text equality for dedup, the analyzer falls back to exact
/// category-string matching.
#[derive(Debug)]
pub struct EmbedderUnavailable {
    pub provider: &'static str,
    pub reason: String,
}

impl std::fmt::Display for EmbedderUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "embedder '{}' unavailable: {}",
            self.provider, self.reason
        )
    }
}

impl std::error::Error for EmbedderUnavailable {}

/// Normalize free-form text before it reaches an embedder: lowercase,
/// Unicode NFKC, and whitespace-collapsed.
///
/// This is applied identically to rule text, merchant-category strings, and
/// canonical-category names so that embeddings of semantically equal inputs
/// are comparable regardless of incidental casing or spacing differences.
pub fn normalize_text(input: &str) -> String {
    let nfkc: String = input.nfkc().collect();
    let lower = nfkc.to_lowercase();
    lower.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cosine similarity between two equal-length vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for mismatched lengths or either vector being all-zero,
/// since a zero vector has no defined direction.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance, the canonical dissimilarity metric: `1.0 - similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b)
}

/// Wraps a concrete [`EmbeddingProvider`] with the normalization and
/// deadline behaviour every caller (compiler, analyzer) needs identically.
#[derive(Clone)]
pub struct EmbeddingService {
    provider: Arc<dyn EmbeddingProvider>,
    call_timeout: Duration,
}

impl EmbeddingService {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            call_timeout: EMBED_CALL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn dim(&self) -> usize {
        self.provider.dim()
    }

    /// Embed a single string. Normalizes the input before the call.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderUnavailable> {
        let mut vecs = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        Ok(vecs.pop().unwrap_or_default())
    }

    /// Embed a batch of raw strings: normalizes each, then delegates to the
    /// provider under a bounded deadline. N inputs produce N vectors in the
    /// same order.
    ///
    /// A transport failure or a timed-out call is transient and retried with
    /// exponential backoff and jitter up to `EMBED_MAX_RETRIES`, mirroring
    /// `alertdesk-dispatch`'s retry policy. A non-transient provider error
    /// (bad API response, wrong vector count) surfaces immediately.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedderUnavailable> {
        let normalized: Vec<String> = texts.iter().map(|t| normalize_text(t)).collect();
        let provider_name = self.provider.name();
        let seed: Vec<u8> = normalized.join("\u{1}").into_bytes();

        let mut attempt: u32 = 0;
        loop {
            let call = self.provider.embed_batch(&normalized);
            let (transient, outcome) = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(Ok(vecs)) if vecs.len() == normalized.len() => return Ok(vecs),
                Ok(Ok(vecs)) => (
                    false,
                    EmbedderUnavailable {
                        provider: provider_name,
                        reason: format!(
                            "provider returned {} vectors for {} inputs",
                            vecs.len(),
                            normalized.len()
                        ),
                    },
                ),
                Ok(Err(ProviderError::Transport(reason))) => (
                    true,
                    EmbedderUnavailable { provider: provider_name, reason },
                ),
                Ok(Err(e)) => (
                    false,
                    EmbedderUnavailable { provider: provider_name, reason: e.to_string() },
                ),
                Err(_) => (
                    true,
                    EmbedderUnavailable {
                        provider: provider_name,
                        reason: "embed call timed out".to_string(),
                    },
                ),
            };

            if !transient || attempt >= EMBED_MAX_RETRIES {
                return Err(outcome);
            }
            let delay = backoff_delay(EMBED_BACKOFF_BASE, &seed, attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embed call after transient failure");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Concrete HTTP-backed provider
// ---------------------------------------------------------------------------

/// Embedding provider backed by an OpenAI-compatible `/embeddings` endpoint.
///
/// API key is read by the caller (orchestrator startup) and passed in; do
/// not log it.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingProvider {
    api_key: String,
    model: String,
    dim: usize,
    http: reqwest::Client,
    base_url: String,
}

impl HttpEmbeddingProvider {
    pub fn new(api_key: String, model: String, dim: usize) -> Self {
        Self::new_with_base_url(
            api_key,
            model,
            dim,
            "https://api.openai.com/v1".to_string(),
        )
    }

    pub fn new_with_base_url(
        api_key: String,
        model: String,
        dim: usize,
        base_url: String,
    ) -> Self {
        Self {
            api_key,
            model,
            dim,
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let resp = self
            .http
            .post(self.embeddings_url())
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Api {
                code: Some(status.as_u16() as i64),
                message: body
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown embedder error".to_string()),
            });
        }

        let mut data = body.data.unwrap_or_default();
        data.sort_by_key(|d| d.index);
        if data.len() != texts.len() {
            return Err(ProviderError::Decode(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                data.len()
            )));
        }

        Ok(data
            .into_iter()
            .map(|d| d.embedding.into_iter().map(|x| x as f32).collect())
            .collect())
    }
}

#[derive(serde::Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize, Default)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Option<Vec<EmbeddingDatum>>,
    #[serde(default)]
    error: Option<EmbeddingApiError>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiError {
    message: String,
}

/// Finds the nearest neighbour to `query` among `candidates` by cosine
/// distance. Returns `None` for an empty candidate set.
pub fn nearest_by_cosine<'a, T>(
    query: &[f32],
    candidates: &'a [(T, Vec<f32>)],
) -> Option<(&'a T, f64)> {
    candidates
        .iter()
        .map(|(id, vec)| (id, cosine_similarity(query, vec)))
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}

/// Convenience used by callers that only have an error string, not a
/// `ProviderError`, to raise the same soft-failure signal.
pub fn unavailable(provider: &'static str, reason: impl Into<String>) -> EmbedderUnavailable {
    EmbedderUnavailable {
        provider,
        reason: reason.into(),
    }
}

/// Loads an [`HttpEmbeddingProvider`] from environment variables, validating
/// that the required API key is present before returning.
pub fn provider_from_env() -> Result<HttpEmbeddingProvider> {
    let api_key = std::env::var("ALERTDESK_EMBEDDER_API_KEY")
        .context("ALERTDESK_EMBEDDER_API_KEY is not set")?;
    if api_key.trim().is_empty() {
        return Err(anyhow!("ALERTDESK_EMBEDDER_API_KEY is empty"));
    }
    let model =
        std::env::var("ALERTDESK_EMBEDDER_MODEL").unwrap_or_else(|_| "text-embedding-3-small".to_string());
    let dim: usize = std::env::var("ALERTDESK_EMBEDDER_DIM")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1536);
    Ok(HttpEmbeddingProvider::new(api_key, model, dim))
}
