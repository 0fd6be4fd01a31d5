// ⚙️ Lending Engine - the operations the surrounding system calls
//
// One engine owns one connection. Each call runs its own transaction(s);
// notifications go out only after the change they describe has committed,
// and a holder change is always followed by a priority recompute.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::Arc;
use tracing::{info, warn};

use crate::allocation::{self, Approval, Rejection};
use crate::config::{Config, LendingConfig};
use crate::db;
use crate::entities::{Book, BookRequest};
use crate::error::LendingResult;
use crate::geo::GeoPoint;
use crate::ledger::{self, Eligibility, LedgerEntry, LedgerReport, ReferenceType, ScoreEvent};
use crate::lifecycle::{self, LoanClosed};
use crate::notify::{Notification, NotificationSink};
use crate::queue::{self, RecomputeSummary};

pub struct LendingEngine {
    conn: Connection,
    sink: Arc<dyn NotificationSink>,
    lending: LendingConfig,
}

impl LendingEngine {
    /// Open (and if needed create) the database named in the config
    pub fn open(config: &Config, sink: Arc<dyn NotificationSink>) -> LendingResult<Self> {
        let conn = Connection::open(&config.storage.path)?;
        db::configure_connection(&conn, config.storage.busy_timeout())?;
        db::setup_database(&conn)?;

        info!(path = %config.storage.path.display(), "lending database opened");
        Ok(Self::with_connection(conn, sink, config.lending.clone()))
    }

    /// Throwaway engine backed by an in-memory database
    pub fn in_memory(sink: Arc<dyn NotificationSink>) -> LendingResult<Self> {
        let conn = Connection::open_in_memory()?;
        db::configure_connection(&conn, Config::default().storage.busy_timeout())?;
        db::setup_database(&conn)?;
        Ok(Self::with_connection(conn, sink, LendingConfig::default()))
    }

    /// Wrap a connection whose schema is already set up
    pub fn with_connection(conn: Connection, sink: Arc<dyn NotificationSink>, lending: LendingConfig) -> Self {
        Self { conn, sink, lending }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ========================================================================
    // QUEUE
    // ========================================================================

    pub fn create_request(&mut self, user_id: &str, book_id: &str) -> LendingResult<BookRequest> {
        queue::create_request(&mut self.conn, user_id, book_id)
    }

    pub fn recompute_priorities(&self, book_id: &str) -> LendingResult<RecomputeSummary> {
        queue::recompute_priorities(&self.conn, book_id)
    }

    pub fn pending_for_book(&self, book_id: &str) -> LendingResult<Vec<BookRequest>> {
        queue::pending_for_book(&self.conn, book_id)
    }

    pub fn requests_for_user(&self, user_id: &str) -> LendingResult<Vec<BookRequest>> {
        queue::requests_for_user(&self.conn, user_id)
    }

    // ========================================================================
    // ALLOCATION
    // ========================================================================

    pub fn select_best_match(&self, book_id: &str) -> LendingResult<BookRequest> {
        allocation::select_best_match(&self.conn, book_id)
    }

    pub fn commit_approval(&mut self, request_id: &str, due_days: u32) -> LendingResult<Approval> {
        let approval = allocation::commit_approval(&mut self.conn, request_id, due_days)?;

        self.after_holder_change(&approval.book.id);
        self.sink.emit(Notification::RequestApproved {
            user_id: approval.request.user_id.clone(),
            book_id: approval.book.id.clone(),
            book_title: approval.book.title.clone(),
            due_date: approval.request.due_date.map(|d| d.to_rfc3339()),
        });
        Ok(approval)
    }

    /// Approve with the configured loan length
    pub fn approve(&mut self, request_id: &str) -> LendingResult<Approval> {
        let days = self.lending.default_due_days;
        self.commit_approval(request_id, days)
    }

    pub fn commit_rejection(&mut self, request_id: &str) -> LendingResult<Rejection> {
        let rejection = allocation::commit_rejection(&mut self.conn, request_id)?;

        self.sink.emit(Notification::RequestRejected {
            user_id: rejection.request.user_id.clone(),
            book_id: rejection.book.id.clone(),
            book_title: rejection.book.title.clone(),
        });
        Ok(rejection)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub fn confirm_pickup(&mut self, book_id: &str) -> LendingResult<Book> {
        lifecycle::confirm_pickup(&mut self.conn, book_id)
    }

    pub fn record_return(&mut self, book_id: &str, on_time: bool) -> LendingResult<LoanClosed> {
        let closed = lifecycle::record_return(&mut self.conn, book_id, on_time)?;
        self.after_loan_closed(&closed);
        Ok(closed)
    }

    /// Return at a given instant; punctuality comes from the loan's due date
    pub fn record_return_at(&mut self, book_id: &str, returned_at: DateTime<Utc>) -> LendingResult<LoanClosed> {
        let closed = lifecycle::record_return_at(&mut self.conn, book_id, returned_at)?;
        self.after_loan_closed(&closed);
        Ok(closed)
    }

    pub fn record_loss(&mut self, book_id: &str) -> LendingResult<LoanClosed> {
        let closed = lifecycle::record_loss(&mut self.conn, book_id)?;
        self.after_loan_closed(&closed);
        Ok(closed)
    }

    fn after_loan_closed(&self, closed: &LoanClosed) {
        self.after_holder_change(&closed.book.id);

        self.sink.emit(Notification::ScoreChanged {
            user_id: closed.former_holder.clone(),
            change: closed.ledger_entry.change_amount,
            reason: closed.ledger_entry.reason.clone(),
        });
        for user_id in &closed.waiting_requesters {
            self.sink.emit(Notification::BookAvailable {
                user_id: user_id.clone(),
                book_id: closed.book.id.clone(),
                book_title: closed.book.title.clone(),
            });
        }
    }

    // The triggering change is already committed, so a failed recompute is
    // logged rather than reported as a failure of that change.
    fn after_holder_change(&self, book_id: &str) {
        match queue::recompute_priorities(&self.conn, book_id) {
            Ok(summary) if !summary.is_clean() => {
                warn!(book_id, failed = summary.failed, "recompute left requests unscored");
            }
            Ok(_) => {}
            Err(e) => warn!(book_id, error = %e, "recompute after holder change failed"),
        }
    }

    // ========================================================================
    // MEMBERS
    // ========================================================================

    /// Move a member and rescore every queue measured from them: books they
    /// hold, and unheld books they listed.
    pub fn relocate_member(
        &self,
        user_id: &str,
        location: Option<GeoPoint>,
    ) -> LendingResult<Vec<RecomputeSummary>> {
        db::set_member_location(&self.conn, user_id, location)?;

        let mut summaries = Vec::new();
        for book_id in db::books_referencing(&self.conn, user_id)? {
            match queue::recompute_priorities(&self.conn, &book_id) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(book_id = %book_id, error = %e, "recompute after relocation failed"),
            }
        }

        info!(user_id, books = summaries.len(), "member relocated");
        Ok(summaries)
    }

    // ========================================================================
    // LEDGER
    // ========================================================================

    pub fn apply_ledger_delta(
        &mut self,
        user_id: &str,
        amount: i64,
        reason: &str,
        reference_type: ReferenceType,
        reference_id: Option<&str>,
    ) -> LendingResult<LedgerEntry> {
        let entry = ledger::apply_delta(&mut self.conn, user_id, amount, reason, reference_type, reference_id)?;
        self.emit_score_change(&entry);
        Ok(entry)
    }

    /// Apply a catalog event (review, idea vote, donation, ...)
    pub fn record_score_event(
        &mut self,
        user_id: &str,
        event: ScoreEvent,
        reference_id: Option<&str>,
    ) -> LendingResult<LedgerEntry> {
        let entry = ledger::record_event(&mut self.conn, user_id, event, reference_id)?;
        self.emit_score_change(&entry);
        Ok(entry)
    }

    fn emit_score_change(&self, entry: &LedgerEntry) {
        self.sink.emit(Notification::ScoreChanged {
            user_id: entry.user_id.clone(),
            change: entry.change_amount,
            reason: entry.reason.clone(),
        });
    }

    pub fn can_request_book(&self, user_id: &str) -> LendingResult<Eligibility> {
        ledger::can_request_book(&self.conn, user_id)
    }

    pub fn history(&self, user_id: &str, limit: usize) -> LendingResult<Vec<LedgerEntry>> {
        ledger::history(&self.conn, user_id, limit)
    }

    pub fn reconcile(&self, user_id: &str) -> LendingResult<LedgerReport> {
        ledger::reconcile(&self.conn, user_id)
    }

    // ========================================================================
    // REMINDERS
    // ========================================================================

    /// Remind holders whose loan falls due within `window_days` of `now`.
    /// Overdue loans are not reminded. Returns how many reminders went out.
    pub fn send_return_reminders(&self, now: DateTime<Utc>, window_days: u32) -> LendingResult<usize> {
        let horizon = lifecycle::days_after(now, window_days, "a reminder window")?;
        let mut sent = 0;

        for loan in db::active_loans(&self.conn)? {
            let Some(due) = loan.due_date else { continue };
            if due < now || due > horizon {
                continue;
            }

            let book = db::get_book(&self.conn, &loan.book_id)?;
            self.sink.emit(Notification::ReturnDue {
                user_id: loan.user_id.clone(),
                book_id: book.id.clone(),
                book_title: book.title.clone(),
                days_left: (due - now).num_days(),
            });
            sent += 1;
        }

        info!(sent, window_days, "return reminders sent");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{BookStatus, Member};
    use crate::notify::MemorySink;

    fn engine() -> (LendingEngine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let engine = LendingEngine::in_memory(sink.clone()).unwrap();
        (engine, sink)
    }

    fn add_member(engine: &LendingEngine, name: &str) -> String {
        let member = Member::new(name.to_string());
        db::insert_member(engine.connection(), &member).unwrap();
        member.id
    }

    fn add_book(engine: &LendingEngine, title: &str) -> String {
        let book = Book::new(title.to_string(), "Anon".to_string(), vec![], None);
        db::insert_book(engine.connection(), &book).unwrap();
        book.id
    }

    #[test]
    fn test_approval_notifies_winner() {
        let (mut engine, sink) = engine();
        let user = add_member(&engine, "ada");
        let book = add_book(&engine, "Dune");

        let request = engine.create_request(&user, &book).unwrap();
        let approval = engine.approve(&request.id).unwrap();

        assert_eq!(approval.book.status, BookStatus::Reserved);
        let sent = sink.sent_to(&user);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), "request_approved");
        assert_eq!(sent[0].message(), "Your request for 'Dune' has been approved!");
    }

    #[test]
    fn test_return_notifies_holder_and_waiting_members() {
        let (mut engine, sink) = engine();
        let reader = add_member(&engine, "reader");
        let waiting = add_member(&engine, "waiting");
        let book = add_book(&engine, "Dune");

        let request = engine.create_request(&reader, &book).unwrap();
        engine.approve(&request.id).unwrap();
        engine.confirm_pickup(&book).unwrap();
        engine.create_request(&waiting, &book).unwrap();
        sink.take();

        engine.record_return(&book, true).unwrap();

        assert_eq!(sink.sent_to(&reader)[0].kind(), "score_changed");
        assert_eq!(sink.sent_to(&waiting)[0].kind(), "book_available");
    }

    #[test]
    fn test_ledger_delta_notifies_member() {
        let (mut engine, sink) = engine();
        let user = add_member(&engine, "ada");

        engine
            .record_score_event(&user, ScoreEvent::BookDonated, Some("book-1"))
            .unwrap();

        assert!(engine.reconcile(&user).unwrap().is_balanced());
        assert_eq!(
            sink.sent()[0].message(),
            "Your success score increased by 20 points: Donated book"
        );
    }

    #[test]
    fn test_relocating_holder_rescores_queue() {
        let (mut engine, _) = engine();
        let holder = add_member(&engine, "holder");
        let waiting = Member::new("waiting".to_string()).at(GeoPoint::new(0.0, 5.0));
        db::insert_member(engine.connection(), &waiting).unwrap();
        let book = add_book(&engine, "Dune");

        let first = engine.create_request(&holder, &book).unwrap();
        engine.approve(&first.id).unwrap();
        let queued = engine.create_request(&waiting.id, &book).unwrap();
        assert_eq!(queued.distance_km, Some(crate::geo::FAR_DISTANCE_KM));

        let summaries = engine
            .relocate_member(&holder, Some(GeoPoint::new(0.0, 5.0)))
            .unwrap();

        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].succeeded, 1);
        let rescored = db::get_request(engine.connection(), &queued.id).unwrap();
        assert_eq!(rescored.distance_km, Some(0.0));
        assert!(rescored.priority_score > queued.priority_score);
    }

    #[test]
    fn test_relocating_unknown_member_is_not_found() {
        let (engine, _) = engine();
        let err = engine.relocate_member("nobody", None).unwrap_err();
        assert!(matches!(err, crate::error::LendingError::NotFound { entity: "user", .. }));
    }

    #[test]
    fn test_reminder_window_past_the_calendar_is_refused() {
        let (engine, sink) = engine();
        let err = engine.send_return_reminders(Utc::now(), u32::MAX).unwrap_err();
        assert!(matches!(err, crate::error::LendingError::PolicyDenied { .. }));
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn test_reminders_cover_only_the_window() {
        let (mut engine, sink) = engine();
        let soon = add_member(&engine, "soon");
        let later = add_member(&engine, "later");
        let soon_book = add_book(&engine, "Soon");
        let later_book = add_book(&engine, "Later");

        let r1 = engine.create_request(&soon, &soon_book).unwrap();
        engine.commit_approval(&r1.id, 1).unwrap();
        let r2 = engine.create_request(&later, &later_book).unwrap();
        engine.commit_approval(&r2.id, 10).unwrap();
        sink.take();

        let sent = engine.send_return_reminders(Utc::now(), 2).unwrap();

        assert_eq!(sent, 1);
        let reminders = sink.take();
        assert_eq!(reminders[0].user_id(), soon);
        assert_eq!(reminders[0].kind(), "return_due");
    }
}
