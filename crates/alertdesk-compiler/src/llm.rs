//! Parse-stage LLM client boundary.
//!
//! Mirrors the embedder's provider shape: a pluggable async trait plus one
//! concrete HTTP-backed implementation. The LLM is trusted only to fill
//! `RuleIntent` slots — it never emits SQL and its output is re-validated
//! by [`crate::grammar`] regardless of which implementation answered.

use std::time::Duration;

use alertdesk_schemas::RuleIntent;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Outbound deadline for a single LLM parse call.
pub const LLM_CALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Bounded retry budget for a transient parse failure: the initial attempt
/// plus this many retries before the pipeline gives up and reports
/// `temporarily_unavailable`.
const PARSE_MAX_RETRIES: u32 = 3;

/// Base delay of the exponential backoff between parse retries.
const PARSE_BACKOFF_BASE: Duration = Duration::from_millis(200);

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
/// from the input text so retries are reproducible in tests.
fn backoff_delay(base: Duration, seed: &[u8], attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << attempt.min(16));

    let mut key = seed.to_vec();
    key.extend_from_slice(&attempt.to_le_bytes());
    let jitter_ms = if base_ms == 0 { 0 } else { fnv1a(&key) % base_ms };

    Duration::from_millis(exp_ms.saturating_add(jitter_ms))
}

#[derive(Debug)]
pub enum LlmError {
    Transport(String),
    Api { code: Option<i64>, message: String },
    Decode(String),
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::Transport(msg) => write!(f, "llm transport error: {msg}"),
            LlmError::Api {
                code: Some(c),
                message,
            } => write!(f, "llm api error code={c}: {message}"),
            LlmError::Api {
                code: None,
                message,
            } => write!(f, "llm api error: {message}"),
            LlmError::Decode(msg) => write!(f, "llm decode error: {msg}"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Confidence-scored parse result. Low confidence routes the compiler to
/// `Ambiguous` instead of proceeding with a guess.
#[derive(Debug)]
pub struct ParsedIntent {
    pub intent: RuleIntent,
    pub confidence: f64,
    pub questions: Vec<String>,
}

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Parse `nl_text` into a `RuleIntent` under the schema described in
    /// the module docs. Implementations must not emit SQL.
    async fn parse_intent(&self, nl_text: &str) -> Result<ParsedIntent, LlmError>;
}

/// Wraps an [`LlmClient`] with the parse-stage deadline.
pub struct LlmService {
    client: std::sync::Arc<dyn LlmClient>,
    call_timeout: Duration,
}

impl LlmService {
    pub fn new(client: std::sync::Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            call_timeout: LLM_CALL_TIMEOUT,
        }
    }

    /// Transient (transport/timeout) failures are retried with exponential
    /// backoff and jitter up to `PARSE_MAX_RETRIES`; a non-transient
    /// `Api`/`Decode` failure is returned immediately since retrying it
    /// changes nothing.
    pub async fn parse_intent(&self, nl_text: &str) -> Result<ParsedIntent, LlmError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, self.client.parse_intent(nl_text)).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Transport("llm parse call timed out".to_string())),
            };

            match outcome {
                Ok(parsed) => return Ok(parsed),
                Err(LlmError::Transport(reason)) => {
                    if attempt >= PARSE_MAX_RETRIES {
                        return Err(LlmError::Transport(reason));
                    }
                    let delay = backoff_delay(PARSE_BACKOFF_BASE, nl_text.as_bytes(), attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying llm parse after transient failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// LLM client backed by an OpenAI-compatible chat-completions endpoint with
/// a JSON response format, analogous to `HttpEmbeddingProvider`.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
    base_url: String,
}

impl HttpLlmClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self::new_with_base_url(api_key, model, "https://api.openai.com/v1".to_string())
    }

    pub fn new_with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    const SYSTEM_PROMPT: &'static str = "Extract a structured monitoring-rule intent from the user's \
        sentence. Respond with strict JSON matching the RuleIntent schema: kind, amount, operator, \
        baseline, window_secs, category, merchant, geo_scope, threshold_pct, channels, confidence, \
        questions. Never include SQL.";
}

#[async_trait::async_trait]
impl LlmClient for HttpLlmClient {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn parse_intent(&self, nl_text: &str) -> Result<ParsedIntent, LlmError> {
        let resp = self
            .http
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: &self.model,
                response_format: ResponseFormat { kind: "json_object" },
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: Self::SYSTEM_PROMPT,
                    },
                    ChatMessage {
                        role: "user",
                        content: nl_text,
                    },
                ],
            })
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = resp.status();
        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        if !status.is_success() {
            return Err(LlmError::Api {
                code: Some(status.as_u16() as i64),
                message: body
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown llm error".to_string()),
            });
        }

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LlmError::Decode("no choices in llm response".to_string()))?;

        decode_intent_json(&content).map_err(|e| LlmError::Decode(e.to_string()))
    }
}

fn decode_intent_json(content: &str) -> Result<ParsedIntent> {
    let raw: RawIntentJson = serde_json::from_str(content).context("intent json decode failed")?;
    if raw.confidence < 0.0 || raw.confidence > 1.0 {
        return Err(anyhow!("llm returned out-of-range confidence {}", raw.confidence));
    }
    Ok(ParsedIntent {
        intent: raw.intent,
        confidence: raw.confidence,
        questions: raw.questions.unwrap_or_default(),
    })
}

#[derive(Deserialize)]
struct RawIntentJson {
    #[serde(flatten)]
    intent: RuleIntent,
    #[serde(default = "default_confidence")]
    confidence: f64,
    #[serde(default)]
    questions: Option<Vec<String>>,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(serde::Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize, Default)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ChatApiError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatApiError {
    message: String,
}

/// Loads an [`HttpLlmClient`] from environment variables.
pub fn client_from_env() -> Result<HttpLlmClient> {
    let api_key = std::env::var("ALERTDESK_LLM_API_KEY").context("ALERTDESK_LLM_API_KEY is not set")?;
    if api_key.trim().is_empty() {
        return Err(anyhow!("ALERTDESK_LLM_API_KEY is empty"));
    }
    let model = std::env::var("ALERTDESK_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
    Ok(HttpLlmClient::new(api_key, model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertdesk_schemas::{Channel, RuleKind};

    #[test]
    fn decode_intent_json_rejects_out_of_range_confidence() {
        let json = serde_json::json!({
            "kind": "THRESHOLD",
            "amount": "500.00",
            "channels": ["email"],
            "confidence": 1.5
        })
        .to_string();
        assert!(decode_intent_json(&json).is_err());
    }

    #[test]
    fn decode_intent_json_defaults_confidence_when_absent() {
        let json = serde_json::json!({
            "kind": "LOCATION",
            "channels": ["email"]
        })
        .to_string();
        let parsed = decode_intent_json(&json).unwrap();
        assert_eq!(parsed.confidence, 1.0);
        assert_eq!(parsed.intent.kind, RuleKind::Location);
        assert!(parsed.intent.channels.contains(&Channel::Email));
    }

    struct CountingClient {
        fail_times: std::sync::atomic::AtomicU32,
    }

    fn stub_intent() -> ParsedIntent {
        ParsedIntent {
            intent: RuleIntent {
                kind: RuleKind::Location,
                amount: None,
                operator: None,
                baseline: None,
                window_secs: None,
                category: None,
                merchant: None,
                geo_scope: None,
                threshold_pct: None,
                channels: Default::default(),
            },
            confidence: 1.0,
            questions: vec![],
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for CountingClient {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn parse_intent(&self, _nl_text: &str) -> Result<ParsedIntent, LlmError> {
            use std::sync::atomic::Ordering;
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(LlmError::Transport("connection reset".to_string()))
            } else {
                Ok(stub_intent())
            }
        }
    }

    #[tokio::test]
    async fn parse_intent_retries_transient_failures_then_succeeds() {
        let client = std::sync::Arc::new(CountingClient {
            fail_times: std::sync::atomic::AtomicU32::new(2),
        });
        let service = LlmService::new(client);
        let parsed = service.parse_intent("notify me if dining exceeds $50").await.unwrap();
        assert_eq!(parsed.intent.kind, RuleKind::Location);
    }

    struct AlwaysTransientClient;

    #[async_trait::async_trait]
    impl LlmClient for AlwaysTransientClient {
        fn name(&self) -> &'static str {
            "always-transient"
        }

        async fn parse_intent(&self, _nl_text: &str) -> Result<ParsedIntent, LlmError> {
            Err(LlmError::Transport("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn parse_intent_gives_up_after_the_retry_budget_is_exhausted() {
        let service = LlmService::new(std::sync::Arc::new(AlwaysTransientClient));
        let err = service.parse_intent("notify me if dining exceeds $50").await.unwrap_err();
        assert!(matches!(err, LlmError::Transport(_)));
    }

    struct AlwaysApiErrorClient;

    #[async_trait::async_trait]
    impl LlmClient for AlwaysApiErrorClient {
        fn name(&self) -> &'static str {
            "always-api-error"
        }

        async fn parse_intent(&self, _nl_text: &str) -> Result<ParsedIntent, LlmError> {
            Err(LlmError::Api { code: Some(400), message: "bad request".to_string() })
        }
    }

    #[tokio::test]
    async fn parse_intent_does_not_retry_non_transient_failures() {
        let client = std::sync::Arc::new(AlwaysApiErrorClient);
        let service = LlmService::new(client);
        let err = service.parse_intent("notify me if dining exceeds $50").await.unwrap_err();
        assert!(matches!(err, LlmError::Api { .. }));
    }
}
