// 👤 Member Entity - the reputation-relevant projection of a user
//
// Identity and authentication live elsewhere. This record holds what the
// lending core reads: the success score, a location and weighted interests.
// success_score is a running balance: opening_score plus every ledger delta.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::geo::{normalize_tag, GeoPoint};
use crate::priority::RequesterSnapshot;

/// Balance every new member starts with
pub const INITIAL_SUCCESS_SCORE: i64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    pub username: String,

    /// Denormalized balance; only the ledger writes it after registration
    pub success_score: i64,

    /// Balance at registration, the base the ledger reconciles against
    pub opening_score: i64,

    pub location: Option<GeoPoint>,

    /// Interest tag → weight in [0, 1]
    pub interests: HashMap<String, f64>,

    pub created_at: DateTime<Utc>,
}

impl Member {
    pub fn new(username: String) -> Self {
        Self::with_opening_score(username, INITIAL_SUCCESS_SCORE)
    }

    /// Register a member whose balance was carried over from elsewhere
    pub fn with_opening_score(username: String, opening_score: i64) -> Self {
        Member {
            id: uuid::Uuid::new_v4().to_string(),
            username,
            success_score: opening_score,
            opening_score,
            location: None,
            interests: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn at(mut self, location: GeoPoint) -> Self {
        self.location = Some(location);
        self
    }

    pub fn interested_in(mut self, tag: &str, weight: f64) -> Self {
        self.interests
            .insert(normalize_tag(tag), weight.clamp(0.0, 1.0));
        self
    }

    /// Freeze the inputs the priority calculator needs
    pub fn snapshot(&self) -> RequesterSnapshot {
        RequesterSnapshot {
            success_score: self.success_score,
            location: self.location,
            interests: self.interests.clone(),
        }
    }

    /// Parse "scifi:1.0;history:0.5" into interest weights.
    /// A tag without a weight counts fully.
    pub fn parse_interests(raw: &str) -> Result<HashMap<String, f64>, String> {
        let mut interests = HashMap::new();

        for part in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (tag, weight) = match part.split_once(':') {
                Some((tag, weight)) => {
                    let weight: f64 = weight
                        .trim()
                        .parse()
                        .map_err(|_| format!("invalid weight in '{}'", part))?;
                    (tag, weight)
                }
                None => (part, 1.0),
            };

            if !(0.0..=1.0).contains(&weight) {
                return Err(format!("weight for '{}' must be within [0, 1]", tag.trim()));
            }
            interests.insert(normalize_tag(tag), weight);
        }

        Ok(interests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_member_starts_at_initial_score() {
        let m = Member::new("ada".to_string());
        assert_eq!(m.success_score, INITIAL_SUCCESS_SCORE);
        assert_eq!(m.opening_score, INITIAL_SUCCESS_SCORE);
        assert!(m.location.is_none());
    }

    #[test]
    fn test_builder_clamps_weights() {
        let m = Member::new("ada".to_string())
            .at(GeoPoint::new(1.0, 2.0))
            .interested_in("SciFi", 3.0);

        assert_eq!(m.interests.get("scifi"), Some(&1.0));
        assert_eq!(m.snapshot().location, Some(GeoPoint::new(1.0, 2.0)));
    }

    #[test]
    fn test_parse_interests() {
        let parsed = Member::parse_interests("scifi:1.0; History:0.5 ;poetry").unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["history"], 0.5);
        assert_eq!(parsed["poetry"], 1.0);

        assert!(Member::parse_interests("").unwrap().is_empty());
        assert!(Member::parse_interests("scifi:abc").is_err());
        assert!(Member::parse_interests("scifi:1.5").is_err());
    }
}
