// Book Lending Core - Library
// Lending lifecycle, request-priority matching and the success-score ledger

pub mod error;
pub mod geo;
pub mod priority;
pub mod entities;
pub mod db;
pub mod ledger;
pub mod lifecycle;
pub mod queue;
pub mod allocation;
pub mod notify;
pub mod config;
pub mod engine;
pub mod seed;

// Re-export commonly used types
pub use error::{LendingError, LendingResult};
pub use geo::{distance, distance_or_far, interest_match, GeoPoint, FAR_DISTANCE_KM};
pub use priority::{PriorityScore, RequesterSnapshot};
pub use entities::{Book, BookRequest, BookStatus, Member, RequestStatus, INITIAL_SUCCESS_SCORE};
pub use db::{setup_database, configure_connection, Event, insert_event, get_events_for_entity};
pub use ledger::{
    Eligibility, LedgerBalance, LedgerEntry, LedgerReport, ReferenceType, ScoreEvent,
    MIN_SCORE_TO_REQUEST,
};
pub use lifecycle::{LifecycleEvent, LoanClosed};
pub use queue::{RecomputeFailure, RecomputeSummary};
pub use allocation::{Approval, Rejection};
pub use notify::{LogSink, MemorySink, Notification, NotificationSink};
pub use config::Config;
pub use engine::LendingEngine;
pub use seed::SeedSummary;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
