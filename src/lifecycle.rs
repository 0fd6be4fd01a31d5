// 🔄 Book Lifecycle - custody state machine
//
//   available ──request──▶ requested ──approve──▶ reserved ──pickup──▶ reading
//       ▲                                                                │
//       └──────────────── returned on time / late / lost ────────────────┘
//
// Every transition that touches the holder runs in an IMMEDIATE transaction
// with a guarded UPDATE, so two writers can never both move the same book.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::db::{self, to_sql_time, Event};
use crate::entities::{Book, BookStatus};
use crate::error::{LendingError, LendingResult};
use crate::ledger::{self, LedgerEntry, ScoreEvent};

// ============================================================================
// EVENTS & TRANSITIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    RequestCreated,
    /// Last pending request rejected while nobody holds the book
    QueueEmptied,
    AllocationApproved,
    PickupConfirmed,
    ReturnedOnTime,
    ReturnedLate,
    ReportedLost,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestCreated => "request created",
            LifecycleEvent::QueueEmptied => "queue emptied",
            LifecycleEvent::AllocationApproved => "approve a request",
            LifecycleEvent::PickupConfirmed => "confirm pickup",
            LifecycleEvent::ReturnedOnTime => "return on time",
            LifecycleEvent::ReturnedLate => "return late",
            LifecycleEvent::ReportedLost => "report lost",
        }
    }

    /// Ledger entry the holder receives for closing a loan this way
    pub fn score_event(&self) -> Option<ScoreEvent> {
        match self {
            LifecycleEvent::ReturnedOnTime => Some(ScoreEvent::ReturnedOnTime),
            LifecycleEvent::ReturnedLate => Some(ScoreEvent::ReturnedLate),
            LifecycleEvent::ReportedLost => Some(ScoreEvent::LostBook),
            _ => None,
        }
    }

    fn audit_type(&self) -> &'static str {
        match self {
            LifecycleEvent::RequestCreated => "book_requested",
            LifecycleEvent::QueueEmptied => "book_released",
            LifecycleEvent::AllocationApproved => "book_reserved",
            LifecycleEvent::PickupConfirmed => "book_picked_up",
            LifecycleEvent::ReturnedOnTime => "book_returned_on_time",
            LifecycleEvent::ReturnedLate => "book_returned_late",
            LifecycleEvent::ReportedLost => "book_lost",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BookStatus {
    /// Next status for an event, or InvalidTransition.
    pub fn apply(self, event: LifecycleEvent) -> LendingResult<BookStatus> {
        use BookStatus::*;
        use LifecycleEvent::*;

        let next = match (self, event) {
            (Available, RequestCreated) => Requested,
            (status, RequestCreated) => status,
            (Requested, QueueEmptied) => Available,
            (Available | Requested, AllocationApproved) => Reserved,
            (Reserved, PickupConfirmed) => Reading,
            (Reading, ReturnedOnTime | ReturnedLate | ReportedLost) => Available,
            (from, event) => return Err(LendingError::invalid_transition(from, event)),
        };

        Ok(next)
    }
}

// ============================================================================
// STORAGE-BACKED TRANSITIONS
// ============================================================================

/// Result of closing a loan (return or loss)
#[derive(Debug, Clone)]
pub struct LoanClosed {
    pub book: Book,
    pub former_holder: String,
    pub event: LifecycleEvent,
    pub ledger_entry: LedgerEntry,
    /// Members still waiting in the queue, to be told the book is back
    pub waiting_requesters: Vec<String>,
}

/// Write a status change with the status the caller read as a guard.
/// Zero rows updated means someone else moved the book first.
pub(crate) fn transition_book(
    conn: &Connection,
    book: &Book,
    event: LifecycleEvent,
    holder: Option<&str>,
    actor: &str,
) -> LendingResult<BookStatus> {
    let next = book.status.apply(event)?;
    if next == book.status {
        return Ok(next);
    }

    let reads = i64::from(matches!(
        event,
        LifecycleEvent::ReturnedOnTime | LifecycleEvent::ReturnedLate
    ));

    let updated = conn.execute(
        "UPDATE books
         SET status = ?1, current_holder_id = ?2, total_reads = total_reads + ?3, updated_at = ?4
         WHERE id = ?5 AND status = ?6",
        params![next, holder, reads, to_sql_time(&Utc::now()), book.id, book.status],
    )?;
    if updated == 0 {
        return Err(LendingError::invalid_transition(
            format!("{} (changed concurrently)", book.status),
            event,
        ));
    }

    db::insert_event(
        conn,
        &Event::new(
            event.audit_type(),
            "book",
            &book.id,
            serde_json::json!({
                "from": book.status,
                "to": next,
                "holder": holder,
                "previous_holder": book.current_holder,
            }),
            actor,
        ),
    )?;

    Ok(next)
}

/// reserved → reading once the member has the physical book
pub fn confirm_pickup(conn: &mut Connection, book_id: &str) -> LendingResult<Book> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let book = db::get_book(&tx, book_id)?;

    let holder = book
        .current_holder
        .clone()
        .ok_or_else(|| LendingError::invalid_transition(book.status, LifecycleEvent::PickupConfirmed))?;
    transition_book(&tx, &book, LifecycleEvent::PickupConfirmed, Some(&holder), "lifecycle")?;

    let book = db::get_book(&tx, book_id)?;
    tx.commit()?;

    info!(book_id, holder = %holder, "book picked up");
    Ok(book)
}

/// How a loan is being closed
enum Closing {
    Decided(LifecycleEvent),
    /// Punctuality follows the loan's due date, read inside the transaction
    ReturnedAt(DateTime<Utc>),
}

/// Return with the caller deciding punctuality
pub fn record_return(conn: &mut Connection, book_id: &str, on_time: bool) -> LendingResult<LoanClosed> {
    let event = if on_time {
        LifecycleEvent::ReturnedOnTime
    } else {
        LifecycleEvent::ReturnedLate
    };
    close_loan(conn, book_id, Closing::Decided(event))
}

/// Return at a given instant; on time iff not after the loan's due date.
/// A loan without a due date is always on time.
pub fn record_return_at(
    conn: &mut Connection,
    book_id: &str,
    returned_at: DateTime<Utc>,
) -> LendingResult<LoanClosed> {
    close_loan(conn, book_id, Closing::ReturnedAt(returned_at))
}

pub fn is_on_time(due_date: Option<DateTime<Utc>>, returned_at: DateTime<Utc>) -> bool {
    due_date.map_or(true, |due| returned_at <= due)
}

/// `from` plus a whole number of days, refused when the result leaves the
/// representable calendar.
pub(crate) fn days_after(from: DateTime<Utc>, days: u32, what: &str) -> LendingResult<DateTime<Utc>> {
    from.checked_add_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| LendingError::PolicyDenied {
            reason: format!("{} of {} days is out of range", what, days),
        })
}

/// Lost while reading: holder cleared, large penalty
pub fn record_loss(conn: &mut Connection, book_id: &str) -> LendingResult<LoanClosed> {
    close_loan(conn, book_id, Closing::Decided(LifecycleEvent::ReportedLost))
}

fn close_loan(conn: &mut Connection, book_id: &str, closing: Closing) -> LendingResult<LoanClosed> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let book = db::get_book(&tx, book_id)?;

    let event = match closing {
        Closing::Decided(event) => event,
        Closing::ReturnedAt(returned_at) => {
            let due = db::active_loan(&tx, book_id)?.and_then(|loan| loan.due_date);
            if is_on_time(due, returned_at) {
                LifecycleEvent::ReturnedOnTime
            } else {
                LifecycleEvent::ReturnedLate
            }
        }
    };

    let holder = match (&book.current_holder, book.status) {
        (Some(holder), BookStatus::Reading) => holder.clone(),
        (_, status) => return Err(LendingError::invalid_transition(status, event)),
    };

    transition_book(&tx, &book, event, None, "lifecycle")?;

    let score_event = event
        .score_event()
        .ok_or_else(|| LendingError::invalid_transition(book.status, event))?;
    let ledger_entry = ledger::apply_delta_in(
        &tx,
        &holder,
        score_event.delta(),
        score_event.reason(),
        score_event.reference_type(),
        Some(book_id),
    )?;

    let waiting_requesters = db::pending_requests(&tx, book_id)?
        .into_iter()
        .map(|r| r.user_id)
        .collect();

    let book = db::get_book(&tx, book_id)?;
    tx.commit()?;

    info!(
        book_id,
        holder = %holder,
        event = %event,
        change = ledger_entry.change_amount,
        "loan closed"
    );

    Ok(LoanClosed {
        book,
        former_holder: holder,
        event,
        ledger_entry,
        waiting_requesters,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BookRequest, Member, RequestStatus};
    use crate::priority::PriorityScore;

    #[test]
    fn test_happy_path_transitions() {
        let s = BookStatus::Available;
        let s = s.apply(LifecycleEvent::RequestCreated).unwrap();
        assert_eq!(s, BookStatus::Requested);
        let s = s.apply(LifecycleEvent::AllocationApproved).unwrap();
        assert_eq!(s, BookStatus::Reserved);
        let s = s.apply(LifecycleEvent::PickupConfirmed).unwrap();
        assert_eq!(s, BookStatus::Reading);
        let s = s.apply(LifecycleEvent::ReturnedLate).unwrap();
        assert_eq!(s, BookStatus::Available);
    }

    #[test]
    fn test_requests_do_not_disturb_held_books() {
        assert_eq!(
            BookStatus::Reading.apply(LifecycleEvent::RequestCreated).unwrap(),
            BookStatus::Reading
        );
        assert_eq!(
            BookStatus::Reserved.apply(LifecycleEvent::RequestCreated).unwrap(),
            BookStatus::Reserved
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let invalid = [
            (BookStatus::Available, LifecycleEvent::PickupConfirmed),
            (BookStatus::Reserved, LifecycleEvent::AllocationApproved),
            (BookStatus::Reading, LifecycleEvent::AllocationApproved),
            (BookStatus::Reserved, LifecycleEvent::ReturnedOnTime),
            (BookStatus::Available, LifecycleEvent::ReportedLost),
            (BookStatus::Reading, LifecycleEvent::QueueEmptied),
        ];

        for (status, event) in invalid {
            let err = status.apply(event).unwrap_err();
            assert!(
                matches!(err, LendingError::InvalidTransition { .. }),
                "{:?} + {:?}",
                status,
                event
            );
        }
    }

    #[test]
    fn test_is_on_time() {
        let due = Utc::now();
        assert!(is_on_time(Some(due), due));
        assert!(is_on_time(Some(due), due - Duration::hours(1)));
        assert!(!is_on_time(Some(due), due + Duration::seconds(1)));
        assert!(is_on_time(None, due));
    }

    fn setup_reading_book() -> (Connection, String, String) {
        let conn = Connection::open_in_memory().unwrap();
        db::configure_connection(&conn, std::time::Duration::from_millis(100)).unwrap();
        db::setup_database(&conn).unwrap();

        let reader = Member::new("reader".to_string());
        db::insert_member(&conn, &reader).unwrap();

        let mut book = Book::new("Dune".to_string(), "Herbert".to_string(), vec![], None);
        book.status = BookStatus::Reading;
        book.current_holder = Some(reader.id.clone());
        db::insert_book(&conn, &book).unwrap();

        (conn, book.id, reader.id)
    }

    #[test]
    fn test_on_time_return_rewards_holder() {
        let (mut conn, book_id, reader) = setup_reading_book();

        let closed = record_return(&mut conn, &book_id, true).unwrap();

        assert_eq!(closed.book.status, BookStatus::Available);
        assert!(closed.book.current_holder.is_none());
        assert_eq!(closed.book.total_reads, 1);
        assert_eq!(closed.former_holder, reader);
        assert_eq!(closed.ledger_entry.change_amount, 10);
        assert_eq!(db::get_member(&conn, &reader).unwrap().success_score, 110);
    }

    #[test]
    fn test_loss_penalizes_and_keeps_history() {
        let (mut conn, book_id, reader) = setup_reading_book();

        let closed = record_loss(&mut conn, &book_id).unwrap();

        assert_eq!(closed.book.status, BookStatus::Available);
        assert!(closed.book.current_holder.is_none());
        assert_eq!(closed.book.total_reads, 0);
        assert_eq!(closed.ledger_entry.reason, "Lost book");
        assert_eq!(db::get_member(&conn, &reader).unwrap().success_score, 50);

        let events = db::get_events_for_entity(&conn, "book", &book_id).unwrap();
        assert_eq!(events.last().unwrap().event_type, "book_lost");
        assert_eq!(events.last().unwrap().data["previous_holder"], reader.as_str());
    }

    #[test]
    fn test_returning_an_unheld_book_fails_without_side_effects() {
        let (mut conn, book_id, reader) = setup_reading_book();
        record_return(&mut conn, &book_id, true).unwrap();

        let err = record_return(&mut conn, &book_id, true).unwrap_err();
        assert!(matches!(err, LendingError::InvalidTransition { .. }));
        assert_eq!(db::get_member(&conn, &reader).unwrap().success_score, 110);
    }

    fn lend_until(conn: &Connection, book_id: &str, reader: &str, due: DateTime<Utc>) {
        let score = PriorityScore { priority: 0.0, interest_match: 0.0, distance_km: 0.0 };
        let mut loan = BookRequest::new(book_id.to_string(), reader.to_string(), score);
        loan.status = RequestStatus::Approved;
        loan.processed_at = Some(due - Duration::days(14));
        loan.due_date = Some(due);
        db::insert_request(conn, &loan).unwrap();
    }

    #[test]
    fn test_return_at_reads_due_date_of_current_loan() {
        let (mut conn, book_id, reader) = setup_reading_book();
        let due = Utc::now() - Duration::days(2);
        lend_until(&conn, &book_id, &reader, due);

        let closed = record_return_at(&mut conn, &book_id, Utc::now()).unwrap();

        assert_eq!(closed.event, LifecycleEvent::ReturnedLate);
        assert_eq!(closed.ledger_entry.change_amount, -15);
        assert_eq!(closed.book.total_reads, 1);
        assert_eq!(db::get_member(&conn, &reader).unwrap().success_score, 85);
    }

    #[test]
    fn test_return_at_before_due_date_is_on_time() {
        let (mut conn, book_id, reader) = setup_reading_book();
        let due = Utc::now() + Duration::days(5);
        lend_until(&conn, &book_id, &reader, due);

        let closed = record_return_at(&mut conn, &book_id, due).unwrap();

        assert_eq!(closed.event, LifecycleEvent::ReturnedOnTime);
        assert_eq!(closed.ledger_entry.change_amount, 10);
    }

    #[test]
    fn test_days_after_refuses_overflow() {
        let now = Utc::now();
        assert_eq!(days_after(now, 14, "loan length").unwrap(), now + Duration::days(14));

        let err = days_after(now, u32::MAX, "loan length").unwrap_err();
        assert!(matches!(err, LendingError::PolicyDenied { .. }));
    }

    #[test]
    fn test_pickup_requires_reservation() {
        let (mut conn, book_id, _) = setup_reading_book();
        let err = confirm_pickup(&mut conn, &book_id).unwrap_err();
        assert!(matches!(err, LendingError::InvalidTransition { .. }));
    }
}
