use alertdesk_schemas::{Baseline, Coords, Transaction, User};
use rust_decimal::Decimal;

use crate::{AnalyzerConfig, LocationRisk, RecurringSeries};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Guard: an empty sample has no meaningful baseline.
///
/// `amounts` must be in most-recent-first order — the same order C1's
/// `recent_transactions_by_category`/`recent_transactions_by_merchant`
/// return — since `LastN`/`SameMerchantLastN` read the front of the slice.
pub fn baseline(metric: Baseline, amounts: &[Decimal]) -> Option<Decimal> {
    if amounts.is_empty() {
        return None;
    }
    match metric {
        Baseline::Avg => average(amounts),
        Baseline::Median => Some(median(amounts)),
        Baseline::LastN | Baseline::SameMerchantLastN => amounts.first().copied(),
    }
}

fn average(amounts: &[Decimal]) -> Option<Decimal> {
    let sum: Decimal = amounts.iter().sum();
    sum.checked_div(Decimal::from(amounts.len() as i64))
}

fn median(amounts: &[Decimal]) -> Decimal {
    let mut sorted = amounts.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        sorted[mid - 1]
            .checked_add(sorted[mid])
            .and_then(|sum| sum.checked_div(Decimal::TWO))
            .unwrap_or(sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Ratio of `amount` to the rolling median of `same_category_amounts`.
/// Bounded to `[0, inf)`; an empty or non-positive baseline yields 0 (no
/// signal) rather than dividing by zero or going negative.
pub fn anomaly_score(amount: Decimal, same_category_amounts: &[Decimal]) -> Decimal {
    if same_category_amounts.is_empty() {
        return Decimal::ZERO;
    }
    let med = median(same_category_amounts);
    if med <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    amount
        .checked_div(med)
        .map(|ratio| ratio.max(Decimal::ZERO))
        .unwrap_or(Decimal::ZERO)
}

/// Best-fit period and expected amount for a merchant's payment history.
///
/// `txns_most_recent_first` pairs each occurrence with its amount, newest
/// first. Needs at least two occurrences to infer a period; a single
/// transaction has no cadence to drift from.
pub fn recurring_series(
    txns_most_recent_first: &[(chrono::DateTime<chrono::Utc>, Decimal)],
    drift_pct_threshold: Decimal,
) -> Option<RecurringSeries> {
    if txns_most_recent_first.len() < 2 {
        return None;
    }

    let mut gap_days = Vec::with_capacity(txns_most_recent_first.len() - 1);
    for pair in txns_most_recent_first.windows(2) {
        let (newer, _) = pair[0];
        let (older, _) = pair[1];
        let gap = (newer - older).num_seconds() as f64 / 86_400.0;
        if gap > 0.0 {
            gap_days.push(gap);
        }
    }
    if gap_days.is_empty() {
        return None;
    }
    let period_days = gap_days.iter().sum::<f64>() / gap_days.len() as f64;

    let amounts: Vec<Decimal> = txns_most_recent_first.iter().map(|(_, a)| *a).collect();
    let expected_amount = median(&amounts);
    let latest_amount = txns_most_recent_first[0].1;

    let drift_pct = if expected_amount.is_zero() {
        Decimal::ZERO
    } else {
        latest_amount
            .checked_sub(expected_amount)
            .and_then(|diff| diff.checked_div(expected_amount))
            .map(|r| r.abs())
            .unwrap_or(Decimal::ZERO)
    };

    Some(RecurringSeries {
        period_days,
        expected_amount,
        drift_pct,
        drifted: drift_pct > drift_pct_threshold,
    })
}

/// Great-circle distance between two coordinate pairs, in kilometers
/// (haversine formula).
pub fn great_circle_km(a: Coords, b: Coords) -> f64 {
    let (lat1, lon1) = (a.lat.to_radians(), a.lon.to_radians());
    let (lat2, lon2) = (b.lat.to_radians(), b.lon.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().clamp(-1.0, 1.0).asin()
}

/// `prior` is the user's most recent transaction strictly before `txn`, if
/// any — its coordinates and timestamp anchor the impossible-travel check.
/// Missing consent or missing coordinates fall through to `None` rather
/// than erroring; callers never need to special-case a GPS-less card swipe.
pub fn location_risk(cfg: &AnalyzerConfig, user: &User, txn: &Transaction, prior: Option<&Transaction>) -> LocationRisk {
    if !user.location_consent {
        return LocationRisk::None;
    }

    let out_of_home_state = matches!(
        (&user.home_state, &txn.merchant_state),
        (Some(home), Some(merchant)) if !home.eq_ignore_ascii_case(merchant)
    );

    let Some(txn_coords) = txn.coords else {
        return if out_of_home_state { LocationRisk::OutOfHomeState } else { LocationRisk::None };
    };

    if let Some(prior) = prior {
        if let Some(prior_coords) = prior.coords {
            let elapsed_hours = (txn.occurred_at - prior.occurred_at).num_seconds() as f64 / 3600.0;
            if elapsed_hours > 0.0 {
                let implied_speed_kmh = great_circle_km(prior_coords, txn_coords) / elapsed_hours;
                if implied_speed_kmh > cfg.impossible_travel_kmh {
                    return LocationRisk::ImpossibleTravel;
                }
            }
        }
    }

    if let Some(last_known) = user.last_known_coords {
        if great_circle_km(last_known, txn_coords) > cfg.distant_km_threshold {
            return LocationRisk::DistantFromLastKnown;
        }
    }

    if out_of_home_state { LocationRisk::OutOfHomeState } else { LocationRisk::None }
}
