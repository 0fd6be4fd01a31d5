// 📋 Request Queue - pending borrow requests per book
//
// Creation is transactional (policy gate, duplicate check, scoring and the
// available → requested move commit together). Recomputation is not: each
// request is rescored on its own so one bad row never blocks the rest.

use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db;
use crate::entities::{Book, BookRequest};
use crate::error::{LendingError, LendingResult};
use crate::geo::GeoPoint;
use crate::ledger::Eligibility;
use crate::lifecycle::{self, LifecycleEvent};
use crate::priority::{self, PriorityScore};

// ============================================================================
// RECOMPUTE SUMMARY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecomputeFailure {
    pub request_id: String,
    pub error: String,
}

/// Outcome of a best-effort rescoring pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecomputeSummary {
    pub book_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<RecomputeFailure>,
}

impl RecomputeSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

// ============================================================================
// SCORING INPUTS
// ============================================================================

/// Location distance is measured from: the holder's, else the lister's.
/// A reference member that no longer exists counts as no location.
pub fn reference_location(conn: &Connection, book: &Book) -> LendingResult<Option<GeoPoint>> {
    let Some(member_id) = book.reference_member() else {
        return Ok(None);
    };

    match db::get_member(conn, member_id) {
        Ok(member) => Ok(member.location),
        Err(LendingError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn score_for(
    conn: &Connection,
    user_id: &str,
    book: &Book,
    reference: Option<GeoPoint>,
) -> LendingResult<PriorityScore> {
    let member = db::get_member(conn, user_id)?;
    Ok(priority::score(&member.snapshot(), &book.topics, reference))
}

// ============================================================================
// QUEUE OPERATIONS
// ============================================================================

/// Enter a member into a book's queue.
pub fn create_request(conn: &mut Connection, user_id: &str, book_id: &str) -> LendingResult<BookRequest> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let member = db::get_member(&tx, user_id)?;
    let book = db::get_book(&tx, book_id)?;

    Eligibility::for_score(member.success_score).into_result()?;

    if book.current_holder.as_deref() == Some(user_id) {
        return Err(LendingError::PolicyDenied {
            reason: "You already hold this book".to_string(),
        });
    }

    if db::has_pending_request(&tx, book_id, user_id)? {
        return Err(LendingError::DuplicateRequest {
            book_id: book_id.to_string(),
            user_id: user_id.to_string(),
        });
    }

    let reference = reference_location(&tx, &book)?;
    let score = priority::score(&member.snapshot(), &book.topics, reference);
    let request = BookRequest::new(book_id.to_string(), user_id.to_string(), score);
    db::insert_request(&tx, &request)?;

    lifecycle::transition_book(&tx, &book, LifecycleEvent::RequestCreated, book.current_holder.as_deref(), user_id)?;

    tx.commit()?;

    info!(
        request_id = %request.id,
        book_id,
        user_id,
        priority = request.priority_score,
        "book requested"
    );
    Ok(request)
}

/// Pending requests, highest priority first, earliest first on ties
pub fn pending_for_book(conn: &Connection, book_id: &str) -> LendingResult<Vec<BookRequest>> {
    db::get_book(conn, book_id)?;
    db::pending_requests(conn, book_id)
}

/// Every request a member has made, newest first
pub fn requests_for_user(conn: &Connection, user_id: &str) -> LendingResult<Vec<BookRequest>> {
    db::get_member(conn, user_id)?;
    db::requests_for_user(conn, user_id)
}

/// Rescore every pending request for a book after its holder changed.
///
/// Each request is updated independently (autocommit). Missing members and
/// storage errors are logged, counted and skipped; rows already updated
/// stay updated.
pub fn recompute_priorities(conn: &Connection, book_id: &str) -> LendingResult<RecomputeSummary> {
    let book = db::get_book(conn, book_id)?;
    let reference = reference_location(conn, &book)?;
    let pending = db::pending_requests(conn, book_id)?;

    let mut summary = RecomputeSummary {
        book_id: book_id.to_string(),
        ..Default::default()
    };

    for request in pending {
        match rescore(conn, &request, &book, reference) {
            Ok(()) => summary.succeeded += 1,
            Err(e) if e.is_skippable_in_batch() => {
                warn!(request_id = %request.id, book_id, error = %e, "skipping request during recompute");
                summary.failed += 1;
                summary.failures.push(RecomputeFailure {
                    request_id: request.id.clone(),
                    error: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    info!(
        book_id,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "priorities recomputed"
    );
    Ok(summary)
}

fn rescore(
    conn: &Connection,
    request: &BookRequest,
    book: &Book,
    reference: Option<GeoPoint>,
) -> LendingResult<()> {
    let score = score_for(conn, &request.user_id, book, reference)?;

    // A request processed since the queue was read is left alone
    let updated = conn.execute(
        "UPDATE book_requests
         SET priority_score = ?1, interest_match_score = ?2, distance_km = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![score.priority, score.interest_match, score.distance_km, request.id],
    )?;

    debug!(request_id = %request.id, priority = score.priority, updated, "request rescored");
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
