// 📊 Priority Calculator
//
// Formula: priority = success_score*0.4 + interest_match*0.3 + distance_score*0.3
// where distance_score = max(0, 100 - distance_km/10).
//
// Weights are fixed at compile time. The score is relative to the book's
// reference location (its holder, or its lister while unheld), so it is
// recomputed whenever that location changes.

use crate::geo::{self, GeoPoint};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const SUCCESS_WEIGHT: f64 = 0.4;
pub const INTEREST_WEIGHT: f64 = 0.3;
pub const DISTANCE_WEIGHT: f64 = 0.3;

/// Kilometers of distance that cost one point of distance score
pub const KM_PER_POINT: f64 = 10.0;

/// Snapshot of the requester taken at scoring time
#[derive(Debug, Clone)]
pub struct RequesterSnapshot {
    pub success_score: i64,
    pub location: Option<GeoPoint>,
    pub interests: HashMap<String, f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    pub priority: f64,
    pub interest_match: f64,
    pub distance_km: f64,
}

/// 100 at zero distance, one point lost per 10 km, floored at 0
pub fn distance_score(distance_km: f64) -> f64 {
    (100.0 - distance_km / KM_PER_POINT).max(0.0)
}

/// Score a requester against a book.
pub fn score(
    requester: &RequesterSnapshot,
    book_topics: &[String],
    reference_location: Option<GeoPoint>,
) -> PriorityScore {
    let distance_km = geo::distance_or_far(reference_location, requester.location);
    let interest_match = geo::interest_match(&requester.interests, book_topics);

    let priority = requester.success_score as f64 * SUCCESS_WEIGHT
        + interest_match * INTEREST_WEIGHT
        + distance_score(distance_km) * DISTANCE_WEIGHT;

    PriorityScore {
        priority,
        interest_match,
        distance_km,
    }
}
