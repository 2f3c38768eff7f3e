//! Rule evaluator.
//!
//! Given a freshly-ingested transaction, runs a user's active rules through
//! their compiled, grammar-validated SQL and turns any trigger into a
//! persisted notification. This crate owns none of the rule data model
//! (that's `alertdesk-schemas`/`alertdesk-db`) and none of the spending math
//! (`alertdesk-analyzer`) — it is the glue that decides which rule runs
//! against which window, and what happens to the result.

mod engine;
mod types;

pub use engine::evaluate;
pub use types::{EvaluationOutcome, EvaluatorConfig, SkippedRule};
