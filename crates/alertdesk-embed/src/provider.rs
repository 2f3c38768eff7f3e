//! Provider boundary for the embedding backend.
//!
//! This module defines **only** the embedding request/response shapes and
//! the provider trait. No normalization, no threshold logic, no caller-side
//! batching policy belongs here — that lives in `lib.rs`.

use std::fmt;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors an [`EmbeddingProvider`] implementation may return.
///
/// Every variant here is surfaced to callers as [`crate::EmbedderUnavailable`];
/// the pipeline treats embedding failure as a soft failure, never a hard stop.
#[derive(Debug)]
pub enum ProviderError {
    /// Network or transport failure.
    Transport(String),
    /// The upstream API returned an application-level error.
    Api { code: Option<i64>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value (e.g. API key) is missing or invalid.
    Config(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProviderError::Api {
                code: Some(c),
                message,
            } => write!(f, "embedder api error code={c}: {message}"),
            ProviderError::Api {
                code: None,
                message,
            } => write!(f, "embedder api error: {message}"),
            ProviderError::Decode(msg) => write!(f, "decode error: {msg}"),
            ProviderError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Upstream embedding-backend contract.
///
/// Implementations must be `Send + Sync` so a shared `Arc<dyn EmbeddingProvider>`
/// can be handed to every evaluator/compiler worker without cloning API state.
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Human-readable name identifying this provider (e.g. `"openai"`).
    fn name(&self) -> &'static str;

    /// Fixed output vector width for this provider/model pair.
    fn dim(&self) -> usize;

    /// Embed a batch of already-normalized texts, one vector per input in
    /// the same order. Implementations must not reorder or drop inputs.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockProvider {
        dim: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn dim(&self) -> usize {
            self.dim
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![0.0; self.dim]).collect())
        }
    }

    #[tokio::test]
    async fn mock_provider_preserves_input_order_and_count() {
        let provider: Box<dyn EmbeddingProvider> = Box::new(MockProvider { dim: 4 });
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let vecs = provider.embed_batch(&texts).await.unwrap();
        assert_eq!(vecs.len(), 3);
        assert!(vecs.iter().all(|v| v.len() == 4));
    }

    #[test]
    fn provider_error_display_api_with_code() {
        let err = ProviderError::Api {
            code: Some(429),
            message: "rate limited".to_string(),
        };
        assert_eq!(err.to_string(), "embedder api error code=429: rate limited");
    }

    #[test]
    fn provider_is_object_safe_via_box() {
        let _p: Box<dyn EmbeddingProvider> = Box::new(MockProvider { dim: 8 });
    }
}
