use rust_decimal::Decimal;

/// Thresholds the analyzer's pure functions are parameterized over. Callers
/// load this once from configuration; nothing in `engine` reads global state.
#[derive(Clone, Debug, PartialEq)]
pub struct AnalyzerConfig {
    /// Great-circle speed (km/h) above which two transactions are flagged
    /// `ImpossibleTravel`.
    pub impossible_travel_kmh: f64,

    /// Distance (km) from `last_known_coords` above which a transaction is
    /// flagged `DistantFromLastKnown`, absent an impossible-travel breach.
    pub distant_km_threshold: f64,

    /// Fractional drift from a recurring series' expected amount that
    /// counts as drifted (0.20 == 20%).
    pub recurring_drift_pct: Decimal,
}

impl AnalyzerConfig {
    pub fn sane_defaults() -> Self {
        Self {
            impossible_travel_kmh: 800.0,
            distant_km_threshold: 150.0,
            recurring_drift_pct: Decimal::new(20, 2),
        }
    }
}

/// Categorical location-risk verdict for a transaction, ordered from least
/// to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocationRisk {
    None,
    OutOfHomeState,
    DistantFromLastKnown,
    ImpossibleTravel,
}

/// Best-fit description of a merchant's recurring payment cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecurringSeries {
    pub period_days: f64,
    pub expected_amount: Decimal,
    pub drift_pct: Decimal,
    pub drifted: bool,
}
