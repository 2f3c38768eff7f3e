use std::time::Duration;

use serde_json::Value;

/// Where a notification should actually be delivered. Resolved by the
/// caller (the orchestrator knows where per-user destinations/secrets live)
/// and handed in per dispatch call, rather than stored alongside the rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Email { to: String },
    Webhook { url: String, hmac_secret: String },
}

/// Tunables for one dispatcher instance, shared across every notification
/// it sends.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Bounded retries for 5xx/transport failures before giving up (`FAILED`).
    pub max_retries: u32,
    /// Base delay of the exponential backoff between retries.
    pub backoff_base: Duration,
    /// Outbound deadline for a single SMTP or webhook attempt.
    pub send_timeout: Duration,
}

impl DispatchConfig {
    pub fn sane_defaults() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a single send attempt against a channel adapter.
///
/// `Permanent` maps straight to a terminal `FAILED` (4xx-equivalent: the
/// request itself was rejected and retrying it changes nothing). `Transient`
/// is retried under the backoff policy until `max_retries` is exhausted.
#[derive(Debug, Clone)]
pub enum DispatchError {
    Permanent(String),
    Transient(String),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Permanent(msg) => write!(f, "permanent: {msg}"),
            DispatchError::Transient(msg) => write!(f, "transient: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A fully-addressed email send, post-template-rendering.
#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// A webhook POST, already bound to the destination that will receive it.
/// `payload` is the exact JSON body that gets signed and sent.
#[derive(Clone, Debug)]
pub struct WebhookMessage {
    pub url: String,
    pub hmac_secret: String,
    pub payload: Value,
}
