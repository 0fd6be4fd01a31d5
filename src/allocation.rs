// 🎯 Allocation Selector - who gets the book
//
// Selection is a pure read over the ordered queue. Committing a decision is a
// separate call made by a person or a policy outside this crate.

use chrono::Utc;
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::info;

use crate::db::{self, to_sql_time};
use crate::entities::{Book, BookRequest, BookStatus, RequestStatus};
use crate::error::{LendingError, LendingResult};
use crate::lifecycle::{self, LifecycleEvent};

/// Top of the queue: highest priority, earliest request on ties.
pub fn select_best_match(conn: &Connection, book_id: &str) -> LendingResult<BookRequest> {
    db::get_book(conn, book_id)?;
    db::pending_requests(conn, book_id)?
        .into_iter()
        .next()
        .ok_or_else(|| LendingError::not_found("pending request", book_id))
}

#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub request: BookRequest,
    pub book: Book,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub request: BookRequest,
    pub book: Book,
    /// True when this rejection emptied the queue and released the book
    pub released: bool,
}

fn pending_request(tx: &Transaction<'_>, request_id: &str, event: &str) -> LendingResult<BookRequest> {
    let request = db::get_request(tx, request_id)?;
    if !request.is_pending() {
        return Err(LendingError::InvalidTransition {
            from: format!("request {}", request.status),
            event: event.to_string(),
        });
    }
    Ok(request)
}

fn close_request(
    tx: &Transaction<'_>,
    request_id: &str,
    status: RequestStatus,
    due_days: Option<u32>,
    event: &str,
) -> LendingResult<()> {
    let now = Utc::now();
    let due = due_days
        .map(|days| lifecycle::days_after(now, days, "a loan"))
        .transpose()?;

    let updated = tx.execute(
        "UPDATE book_requests SET status = ?1, processed_at = ?2, due_date = ?3
         WHERE id = ?4 AND status = 'pending'",
        params![status, to_sql_time(&now), due.as_ref().map(to_sql_time), request_id],
    )?;
    if updated == 0 {
        return Err(LendingError::invalid_transition("request already processed", event));
    }
    Ok(())
}

/// Grant the book to a pending request.
///
/// The request must be pending and the book approvable (available or
/// requested). The guarded book update means two racing approvals for the
/// same book cannot both succeed. Other pending requests stay pending.
pub fn commit_approval(conn: &mut Connection, request_id: &str, due_days: u32) -> LendingResult<Approval> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let request = pending_request(&tx, request_id, "approve a request")?;
    let book = db::get_book(&tx, &request.book_id)?;

    lifecycle::transition_book(
        &tx,
        &book,
        LifecycleEvent::AllocationApproved,
        Some(&request.user_id),
        &request.user_id,
    )?;
    close_request(&tx, request_id, RequestStatus::Approved, Some(due_days), "approve a request")?;

    let request = db::get_request(&tx, request_id)?;
    let book = db::get_book(&tx, &request.book_id)?;
    tx.commit()?;

    info!(
        request_id,
        book_id = %book.id,
        holder = %request.user_id,
        due_days,
        "request approved"
    );
    Ok(Approval { request, book })
}

/// Turn a pending request down. The last rejection on a requested book
/// releases it back to available.
pub fn commit_rejection(conn: &mut Connection, request_id: &str) -> LendingResult<Rejection> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let request = pending_request(&tx, request_id, "reject a request")?;
    close_request(&tx, request_id, RequestStatus::Rejected, None, "reject a request")?;

    let book = db::get_book(&tx, &request.book_id)?;
    let released = book.status == BookStatus::Requested && db::count_pending(&tx, &book.id)? == 0;
    if released {
        lifecycle::transition_book(&tx, &book, LifecycleEvent::QueueEmptied, None, &request.user_id)?;
    }

    let request = db::get_request(&tx, request_id)?;
    let book = db::get_book(&tx, &request.book_id)?;
    tx.commit()?;

    info!(request_id, book_id = %book.id, released, "request rejected");
    Ok(Rejection {
        request,
        book,
        released,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Member;
    use crate::queue;
    use std::time::Duration as StdDuration;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::configure_connection(&conn, StdDuration::from_millis(100)).unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    fn add_member(conn: &Connection, name: &str) -> String {
        let member = Member::new(name.to_string());
        db::insert_member(conn, &member).unwrap();
        member.id
    }

    fn add_book(conn: &Connection) -> String {
        let book = Book::new("Solaris".to_string(), "Lem".to_string(), vec!["scifi".to_string()], None);
        db::insert_book(conn, &book).unwrap();
        book.id
    }

    fn set_priority(conn: &Connection, request_id: &str, priority: f64, requested_at: &str) {
        conn.execute(
            "UPDATE book_requests SET priority_score = ?1, requested_at = ?2 WHERE id = ?3",
            params![priority, requested_at, request_id],
        )
        .unwrap();
    }

    #[test]
    fn test_higher_priority_wins() {
        let mut conn = setup();
        let book = add_book(&conn);
        let low_user = add_member(&conn, "low");
        let low = queue::create_request(&mut conn, &low_user, &book).unwrap();
        let high_user = add_member(&conn, "high");
        let high = queue::create_request(&mut conn, &high_user, &book).unwrap();

        set_priority(&conn, &low.id, 80.0, "2024-01-01T10:00:00.000000Z");
        set_priority(&conn, &high.id, 95.0, "2024-01-01T11:00:00.000000Z");

        assert_eq!(select_best_match(&conn, &book).unwrap().id, high.id);
    }

    #[test]
    fn test_oversized_loan_length_is_rejected() {
        let mut conn = setup();
        let book = add_book(&conn);
        let user = add_member(&conn, "ada");
        let request = queue::create_request(&mut conn, &user, &book).unwrap();

        let err = commit_approval(&mut conn, &request.id, u32::MAX).unwrap_err();

        assert!(matches!(err, LendingError::PolicyDenied { .. }));
        assert_eq!(db::get_request(&conn, &request.id).unwrap().status, RequestStatus::Pending);
        let stored = db::get_book(&conn, &book).unwrap();
        assert_eq!(stored.status, BookStatus::Requested);
        assert!(stored.current_holder.is_none());
    }

    #[test]
    fn test_tie_goes_to_earlier_request() {
        let mut conn = setup();
        let book = add_book(&conn);
        let later_user = add_member(&conn, "later");
        let later = queue::create_request(&mut conn, &later_user, &book).unwrap();
        let earlier_user = add_member(&conn, "earlier");
        let earlier = queue::create_request(&mut conn, &earlier_user, &book).unwrap();

        set_priority(&conn, &later.id, 80.0, "2024-01-02T09:00:00.000000Z");
        set_priority(&conn, &earlier.id, 80.0, "2024-01-01T09:00:00.000000Z");

        assert_eq!(select_best_match(&conn, &book).unwrap().id, earlier.id);
    }

    #[test]
    fn test_empty_queue_is_not_found() {
        let conn = setup();
        let book = add_book(&conn);
        assert!(matches!(
            select_best_match(&conn, &book),
            Err(LendingError::NotFound { .. })
        ));
    }

    #[test]
    fn test_approval_reserves_book_and_leaves_others_pending() {
        let mut conn = setup();
        let book = add_book(&conn);
        let winner_user = add_member(&conn, "w");
        let winner = queue::create_request(&mut conn, &winner_user, &book).unwrap();
        let other_user = add_member(&conn, "o");
        let other = queue::create_request(&mut conn, &other_user, &book).unwrap();

        let approval = commit_approval(&mut conn, &winner.id, 14).unwrap();

        assert_eq!(approval.book.status, BookStatus::Reserved);
        assert_eq!(approval.book.current_holder.as_deref(), Some(winner.user_id.as_str()));
        assert_eq!(approval.request.status, RequestStatus::Approved);
        assert!(approval.request.processed_at.is_some());
        let due = approval.request.due_date.unwrap();
        assert!((due - Utc::now()).num_days() >= 13);

        assert_eq!(db::get_request(&conn, &other.id).unwrap().status, RequestStatus::Pending);
    }

    #[test]
    fn test_second_approval_for_held_book_fails() {
        let mut conn = setup();
        let book = add_book(&conn);
        let first_user = add_member(&conn, "a");
        let first = queue::create_request(&mut conn, &first_user, &book).unwrap();
        let second_user = add_member(&conn, "b");
        let second = queue::create_request(&mut conn, &second_user, &book).unwrap();

        commit_approval(&mut conn, &first.id, 14).unwrap();
        let err = commit_approval(&mut conn, &second.id, 14).unwrap_err();

        assert!(matches!(err, LendingError::InvalidTransition { .. }));
        assert_eq!(db::get_request(&conn, &second.id).unwrap().status, RequestStatus::Pending);
    }

    #[test]
    fn test_processed_request_cannot_be_decided_again() {
        let mut conn = setup();
        let book = add_book(&conn);
        let request_user = add_member(&conn, "a");
        let request = queue::create_request(&mut conn, &request_user, &book).unwrap();

        commit_rejection(&mut conn, &request.id).unwrap();

        assert!(matches!(
            commit_approval(&mut conn, &request.id, 14),
            Err(LendingError::InvalidTransition { .. })
        ));
        assert!(matches!(
            commit_rejection(&mut conn, &request.id),
            Err(LendingError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_last_rejection_releases_book() {
        let mut conn = setup();
        let book = add_book(&conn);
        let a_user = add_member(&conn, "a");
        let a = queue::create_request(&mut conn, &a_user, &book).unwrap();
        let b_user = add_member(&conn, "b");
        let b = queue::create_request(&mut conn, &b_user, &book).unwrap();

        let first = commit_rejection(&mut conn, &a.id).unwrap();
        assert!(!first.released);
        assert_eq!(first.book.status, BookStatus::Requested);

        let last = commit_rejection(&mut conn, &b.id).unwrap();
        assert!(last.released);
        assert_eq!(last.book.status, BookStatus::Available);
        assert_eq!(last.request.status, RequestStatus::Rejected);
    }

    #[test]
    fn test_unknown_request_is_not_found() {
        let mut conn = setup();
        assert!(matches!(
            commit_approval(&mut conn, "nope", 14),
            Err(LendingError::NotFound { entity: "request", .. })
        ));
    }
}
