// 🙋 BookRequest Entity - one member asking for one book
//
// Requests are never deleted: approved and rejected rows stay as the audit
// trail of who held a book and who was turned down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::priority::PriorityScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RequestStatus::Pending),
            "approved" => Some(RequestStatus::Approved),
            "rejected" => Some(RequestStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRequest {
    pub id: String,
    pub book_id: String,
    pub user_id: String,
    pub status: RequestStatus,

    // Volatile: recomputed whenever the book's reference location changes
    pub priority_score: f64,
    pub interest_match_score: f64,
    pub distance_km: Option<f64>,

    /// Immutable; breaks priority ties in favour of the earlier request
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
}

impl BookRequest {
    /// New pending request carrying its initial score
    pub fn new(book_id: String, user_id: String, score: PriorityScore) -> Self {
        BookRequest {
            id: uuid::Uuid::new_v4().to_string(),
            book_id,
            user_id,
            status: RequestStatus::Pending,
            priority_score: score.priority,
            interest_match_score: score.interest_match,
            distance_km: Some(score.distance_km),
            requested_at: Utc::now(),
            processed_at: None,
            due_date: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == RequestStatus::Pending
    }
}
