//! Behavioural analyzer.
//!
//! Stateless, deterministic signal computation consumed by the rule
//! evaluator and by the rule compiler's grounding stage: spending
//! baselines, same-category anomaly scores, recurring-payment drift, and
//! location risk. Every function here is pure — no IO, no clock reads
//! beyond the timestamps callers pass in, no store writes. Callers own
//! fetching the transaction history; this crate only does the math.

mod engine;
mod types;

pub use engine::{anomaly_score, baseline, great_circle_km, location_risk, recurring_series};
pub use types::{AnalyzerConfig, LocationRisk, RecurringSeries};
