// 🌍 Geo/Interest Scorer - pure scoring inputs
//
// Great-circle distance between members and topical affinity between a
// member's weighted interests and a book's topics. No state, no storage.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Mean Earth radius used by the haversine formula
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Distance assumed when either side has no known location.
/// Location-less requesters are ranked low rather than rejected.
pub const FAR_DISTANCE_KM: f64 = 10_000.0;

// ============================================================================
// GEO POINT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        GeoPoint { lat, lng }
    }

    /// Build a point from nullable columns; both halves must be present.
    pub fn from_parts(lat: Option<f64>, lng: Option<f64>) -> Option<Self> {
        match (lat, lng) {
            (Some(lat), Some(lng)) => Some(GeoPoint { lat, lng }),
            _ => None,
        }
    }
}

// ============================================================================
// DISTANCE
// ============================================================================

/// Haversine great-circle distance in kilometers.
pub fn distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Distance with the far sentinel substituted for a missing point.
pub fn distance_or_far(a: Option<GeoPoint>, b: Option<GeoPoint>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => distance(a, b),
        _ => FAR_DISTANCE_KM,
    }
}

// ============================================================================
// INTEREST MATCH
// ============================================================================

/// Normalized affinity in [0, 100] between weighted interests and book topics.
///
/// Sums the member's weight for every topic the book carries, divides by the
/// number of topics and scales to 0-100. A book without topics scores 0.
/// Weights are clamped to [0, 1] and repeated topics count once. Tags on
/// both sides compare case-insensitively, ignoring surrounding whitespace.
pub fn interest_match(interests: &HashMap<String, f64>, topics: &[String]) -> f64 {
    let unique: HashSet<String> = topics.iter().map(|t| normalize_tag(t)).collect();
    if unique.is_empty() {
        return 0.0;
    }

    let weights: HashMap<String, f64> = interests
        .iter()
        .map(|(tag, w)| (normalize_tag(tag), if w.is_nan() { 0.0 } else { w.clamp(0.0, 1.0) }))
        .collect();

    // fold from +0.0: an empty sum() yields -0.0
    let total = unique
        .iter()
        .filter_map(|topic| weights.get(topic))
        .fold(0.0, |acc, w| acc + w);

    (total / unique.len() as f64) * 100.0
}

/// Canonical form of an interest tag or book topic
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}
