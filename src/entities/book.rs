// 📚 Book Entity - the shared physical resource
//
// A book moves through available → requested → reserved → reading → available.
// Status and holder are a pair: the holder is set exactly while the book is
// reserved or being read. Only the lifecycle and allocation paths write them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::geo::normalize_tag;

// ============================================================================
// BOOK STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    /// On the shelf, nobody has asked for it
    Available,

    /// At least one pending request, no holder yet
    Requested,

    /// Allocated to a member who has not picked it up
    Reserved,

    /// In the hands of its current holder
    Reading,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Available => "available",
            BookStatus::Requested => "requested",
            BookStatus::Reserved => "reserved",
            BookStatus::Reading => "reading",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(BookStatus::Available),
            "requested" => Some(BookStatus::Requested),
            "reserved" => Some(BookStatus::Reserved),
            "reading" => Some(BookStatus::Reading),
            _ => None,
        }
    }

    /// Whether a book in this status must have a holder
    pub fn has_holder(&self) -> bool {
        matches!(self, BookStatus::Reserved | BookStatus::Reading)
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// BOOK ENTITY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Stable identity (UUID)
    pub id: String,

    pub title: String,
    pub author: String,

    /// Topic tags matched against member interests
    pub topics: Vec<String>,

    pub status: BookStatus,

    /// Member currently in possession (reserved or reading)
    pub current_holder: Option<String>,

    /// Member who listed the book; their location stands in while unheld
    pub listed_by: Option<String>,

    pub total_reads: i64,
    pub average_rating: f64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    /// Create a freshly listed, available book
    pub fn new(title: String, author: String, topics: Vec<String>, listed_by: Option<String>) -> Self {
        let now = Utc::now();

        let mut topics: Vec<String> = topics
            .into_iter()
            .map(|t| normalize_tag(&t))
            .filter(|t| !t.is_empty())
            .collect();
        topics.sort();
        topics.dedup();

        Book {
            id: uuid::Uuid::new_v4().to_string(),
            title,
            author,
            topics,
            status: BookStatus::Available,
            current_holder: None,
            listed_by,
            total_reads: 0,
            average_rating: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hash used to skip re-importing the same listing.
    /// Identity is the UUID; this is only for deduplication.
    pub fn compute_listing_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{}|{}|{}",
            self.title.trim().to_lowercase(),
            self.author.trim().to_lowercase(),
            self.listed_by.as_deref().unwrap_or("")
        ));
        format!("{:x}", hasher.finalize())
    }

    /// Holder is present if and only if the status requires one
    pub fn holder_consistent(&self) -> bool {
        self.status.has_holder() == self.current_holder.is_some()
    }

    /// Member whose location scores distance: the holder, else the lister
    pub fn reference_member(&self) -> Option<&str> {
        self.current_holder
            .as_deref()
            .or(self.listed_by.as_deref())
    }
}
