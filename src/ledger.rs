// ⚖️ Success-Score Ledger - append-only reputation log + running balance
//
// Invariant: users.success_score == users.opening_score + Σ history deltas
//
// The balance is a materialized view with a single writer: apply_delta_in()
// updates it and appends the matching history row inside one transaction.
// Nothing else in the crate assigns success_score.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::db::{self, parse_time, to_sql_time};
use crate::error::{LendingError, LendingResult};

/// Members below this balance may not enter a request queue
pub const MIN_SCORE_TO_REQUEST: i64 = 20;

// ============================================================================
// REFERENCES
// ============================================================================

/// What kind of record triggered a ledger entry. The id itself stays opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    Book,
    Review,
    Idea,
    Donation,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Book => "book",
            ReferenceType::Review => "review",
            ReferenceType::Idea => "idea",
            ReferenceType::Donation => "donation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "book" => Some(ReferenceType::Book),
            "review" => Some(ReferenceType::Review),
            "idea" => Some(ReferenceType::Idea),
            "donation" => Some(ReferenceType::Donation),
            _ => None,
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// DELTA CATALOG
// ============================================================================

/// Fixed reputation events and their deltas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreEvent {
    ReturnedOnTime,
    ReturnedLate,
    PositiveReview,
    NegativeReview,
    IdeaPosted,
    IdeaUpvoted,
    IdeaDownvoted,
    LostBook,
    BookDonated,
    MoneyDonated,
}

impl ScoreEvent {
    pub fn delta(&self) -> i64 {
        match self {
            ScoreEvent::ReturnedOnTime => 10,
            ScoreEvent::ReturnedLate => -15,
            ScoreEvent::PositiveReview => 5,
            ScoreEvent::NegativeReview => -10,
            ScoreEvent::IdeaPosted => 3,
            ScoreEvent::IdeaUpvoted => 1,
            ScoreEvent::IdeaDownvoted => -1,
            ScoreEvent::LostBook => -50,
            ScoreEvent::BookDonated => 20,
            ScoreEvent::MoneyDonated => 10,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ScoreEvent::ReturnedOnTime => "Returned book on time",
            ScoreEvent::ReturnedLate => "Returned book late",
            ScoreEvent::PositiveReview => "Received positive review",
            ScoreEvent::NegativeReview => "Received negative review",
            ScoreEvent::IdeaPosted => "Posted reading idea",
            ScoreEvent::IdeaUpvoted => "Idea received upvote",
            ScoreEvent::IdeaDownvoted => "Idea received downvote",
            ScoreEvent::LostBook => "Lost book",
            ScoreEvent::BookDonated => "Donated book",
            ScoreEvent::MoneyDonated => "Made financial contribution",
        }
    }

    pub fn reference_type(&self) -> ReferenceType {
        match self {
            ScoreEvent::ReturnedOnTime | ScoreEvent::ReturnedLate | ScoreEvent::LostBook => {
                ReferenceType::Book
            }
            ScoreEvent::PositiveReview | ScoreEvent::NegativeReview => ReferenceType::Review,
            ScoreEvent::IdeaPosted | ScoreEvent::IdeaUpvoted | ScoreEvent::IdeaDownvoted => {
                ReferenceType::Idea
            }
            ScoreEvent::BookDonated | ScoreEvent::MoneyDonated => ReferenceType::Donation,
        }
    }
}

// ============================================================================
// LEDGER ENTRY
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub user_id: String,
    pub change_amount: i64,
    pub reason: String,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    fn new(
        user_id: &str,
        change_amount: i64,
        reason: &str,
        reference_type: ReferenceType,
        reference_id: Option<&str>,
    ) -> Self {
        LedgerEntry {
            entry_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            change_amount,
            reason: reason.to_string(),
            reference_type,
            reference_id: reference_id.map(str::to_string),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// WRITE PATH
// ============================================================================

/// Apply a delta in its own transaction.
pub fn apply_delta(
    conn: &mut Connection,
    user_id: &str,
    change_amount: i64,
    reason: &str,
    reference_type: ReferenceType,
    reference_id: Option<&str>,
) -> LendingResult<LedgerEntry> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let entry = apply_delta_in(&tx, user_id, change_amount, reason, reference_type, reference_id)?;
    tx.commit()?;

    info!(
        user_id,
        change = change_amount,
        reason,
        reference_type = %reference_type,
        "success score updated"
    );
    Ok(entry)
}

/// Apply a catalog event in its own transaction.
pub fn record_event(
    conn: &mut Connection,
    user_id: &str,
    event: ScoreEvent,
    reference_id: Option<&str>,
) -> LendingResult<LedgerEntry> {
    apply_delta(
        conn,
        user_id,
        event.delta(),
        event.reason(),
        event.reference_type(),
        reference_id,
    )
}

/// Balance update + history append inside a caller-owned transaction.
/// If either write fails the caller's transaction rolls both back on drop.
pub fn apply_delta_in(
    tx: &Transaction<'_>,
    user_id: &str,
    change_amount: i64,
    reason: &str,
    reference_type: ReferenceType,
    reference_id: Option<&str>,
) -> LendingResult<LedgerEntry> {
    let entry = LedgerEntry::new(user_id, change_amount, reason, reference_type, reference_id);
    let now = to_sql_time(&entry.created_at);

    let updated = tx.execute(
        "UPDATE users SET success_score = success_score + ?1, updated_at = ?2 WHERE id = ?3",
        params![change_amount, now, user_id],
    )?;
    if updated == 0 {
        return Err(LendingError::not_found("user", user_id));
    }

    tx.execute(
        "INSERT INTO success_score_history (
            entry_id, user_id, change_amount, reason, reference_type, reference_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.entry_id,
            entry.user_id,
            entry.change_amount,
            entry.reason,
            entry.reference_type,
            entry.reference_id,
            now,
        ],
    )?;

    debug!(user_id, entry_id = %entry.entry_id, "ledger entry appended");
    Ok(entry)
}

// ============================================================================
// READ PATH
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Eligibility {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl Eligibility {
    pub fn for_score(success_score: i64) -> Self {
        if success_score < MIN_SCORE_TO_REQUEST {
            Eligibility {
                allowed: false,
                reason: Some(format!(
                    "Your success score ({}) is too low. Minimum required: {}",
                    success_score, MIN_SCORE_TO_REQUEST
                )),
            }
        } else {
            Eligibility {
                allowed: true,
                reason: None,
            }
        }
    }

    /// Convert a denial into the error the request path surfaces
    pub fn into_result(self) -> LendingResult<()> {
        match (self.allowed, self.reason) {
            (true, _) => Ok(()),
            (false, reason) => Err(LendingError::PolicyDenied {
                reason: reason.unwrap_or_default(),
            }),
        }
    }
}

pub fn can_request_book(conn: &Connection, user_id: &str) -> LendingResult<Eligibility> {
    let member = db::get_member(conn, user_id)?;
    Ok(Eligibility::for_score(member.success_score))
}

/// Most recent entries first
pub fn history(conn: &Connection, user_id: &str, limit: usize) -> LendingResult<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT entry_id, user_id, change_amount, reason, reference_type, reference_id, created_at
         FROM success_score_history
         WHERE user_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;

    let entries = stmt
        .query_map(params![user_id, limit as i64], |row| {
            let created: String = row.get(6)?;
            Ok(LedgerEntry {
                entry_id: row.get(0)?,
                user_id: row.get(1)?,
                change_amount: row.get(2)?,
                reason: row.get(3)?,
                reference_type: row.get(4)?,
                reference_id: row.get(5)?,
                created_at: parse_time(6, &created)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(entries)
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerBalance {
    /// Stored balance equals opening score plus every delta
    Balanced,

    /// Stored balance disagrees with the history
    Drift {
        expected: i64,
        actual: i64,
        difference: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerReport {
    pub user_id: String,
    pub opening_score: i64,
    pub total_credits: i64,
    pub total_debits: i64,
    pub entry_count: i64,
    pub result: LedgerBalance,
    pub reconciled_at: DateTime<Utc>,
}

impl LedgerReport {
    pub fn is_balanced(&self) -> bool {
        self.result == LedgerBalance::Balanced
    }

    pub fn summary(&self) -> String {
        let status = match &self.result {
            LedgerBalance::Balanced => "balanced".to_string(),
            LedgerBalance::Drift {
                expected,
                actual,
                difference,
            } => format!("DRIFT expected {} actual {} ({:+})", expected, actual, difference),
        };
        format!(
            "Ledger for {}: {} entries, opening {}, +{} / -{}, {}",
            self.user_id,
            self.entry_count,
            self.opening_score,
            self.total_credits,
            self.total_debits,
            status
        )
    }
}

/// Check opening_score + credits - debits against the stored balance
pub fn reconcile(conn: &Connection, user_id: &str) -> LendingResult<LedgerReport> {
    let member = db::get_member(conn, user_id)?;

    let (total_credits, total_debits, entry_count): (i64, i64, i64) = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN change_amount > 0 THEN change_amount ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN change_amount < 0 THEN -change_amount ELSE 0 END), 0),
            COUNT(*)
         FROM success_score_history WHERE user_id = ?1",
        [user_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;

    let expected = member.opening_score + total_credits - total_debits;
    let result = if expected == member.success_score {
        LedgerBalance::Balanced
    } else {
        LedgerBalance::Drift {
            expected,
            actual: member.success_score,
            difference: member.success_score - expected,
        }
    };

    Ok(LedgerReport {
        user_id: user_id.to_string(),
        opening_score: member.opening_score,
        total_credits,
        total_debits,
        entry_count,
        result,
        reconciled_at: Utc::now(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::Member;
    use std::time::Duration;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::configure_connection(&conn, Duration::from_millis(100)).unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    fn add_member(conn: &Connection, name: &str, score: i64) -> String {
        let m = Member::with_opening_score(name.to_string(), score);
        db::insert_member(conn, &m).unwrap();
        m.id
    }

    fn history_count(conn: &Connection, user_id: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM success_score_history WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_catalog_deltas() {
        let expected = [
            (ScoreEvent::ReturnedOnTime, 10),
            (ScoreEvent::ReturnedLate, -15),
            (ScoreEvent::PositiveReview, 5),
            (ScoreEvent::NegativeReview, -10),
            (ScoreEvent::IdeaPosted, 3),
            (ScoreEvent::IdeaUpvoted, 1),
            (ScoreEvent::IdeaDownvoted, -1),
            (ScoreEvent::LostBook, -50),
            (ScoreEvent::BookDonated, 20),
            (ScoreEvent::MoneyDonated, 10),
        ];
        for (event, delta) in expected {
            assert_eq!(event.delta(), delta, "{:?}", event);
        }
        assert_eq!(ScoreEvent::LostBook.reference_type(), ReferenceType::Book);
        assert_eq!(ScoreEvent::MoneyDonated.reference_type(), ReferenceType::Donation);
    }

    #[test]
    fn test_apply_delta_updates_balance_and_history() {
        let mut conn = setup();
        let user = add_member(&conn, "ada", 100);

        let entry = apply_delta(&mut conn, &user, 5, "Received positive review", ReferenceType::Review, Some("r1")).unwrap();
        record_event(&mut conn, &user, ScoreEvent::ReturnedLate, Some("b1")).unwrap();

        assert_eq!(entry.change_amount, 5);
        assert_eq!(db::get_member(&conn, &user).unwrap().success_score, 90);

        let entries = history(&conn, &user, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].change_amount, -15);
        assert_eq!(entries[0].reason, "Returned book late");
        assert_eq!(entries[0].reference_id.as_deref(), Some("b1"));
        assert_eq!(entries[1].reference_type, ReferenceType::Review);

        assert!(reconcile(&conn, &user).unwrap().is_balanced());
    }

    #[test]
    fn test_unknown_user_writes_nothing() {
        let mut conn = setup();

        let err = apply_delta(&mut conn, "ghost", 10, "x", ReferenceType::Book, None).unwrap_err();
        assert!(matches!(err, LendingError::NotFound { .. }));

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM success_score_history", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_failure_between_balance_and_history_applies_neither() {
        let mut conn = setup();
        let user = add_member(&conn, "ada", 100);
        record_event(&mut conn, &user, ScoreEvent::IdeaPosted, Some("i1")).unwrap();

        // Fail every history insert after the balance update has run
        conn.execute_batch(
            "CREATE TRIGGER fail_history BEFORE INSERT ON success_score_history
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
        )
        .unwrap();

        let err = record_event(&mut conn, &user, ScoreEvent::BookDonated, Some("d1")).unwrap_err();
        assert!(matches!(err, LendingError::StorageFailure(_)));

        assert_eq!(db::get_member(&conn, &user).unwrap().success_score, 103);
        assert_eq!(history_count(&conn, &user), 1);
        assert!(reconcile(&conn, &user).unwrap().is_balanced());
    }

    #[test]
    fn test_history_is_immutable() {
        let mut conn = setup();
        let user = add_member(&conn, "ada", 100);
        record_event(&mut conn, &user, ScoreEvent::IdeaUpvoted, Some("i1")).unwrap();

        assert!(conn.execute("UPDATE success_score_history SET change_amount = 1000", []).is_err());
        assert!(conn.execute("DELETE FROM success_score_history", []).is_err());
        assert_eq!(history_count(&conn, &user), 1);
    }

    #[test]
    fn test_reconcile_detects_direct_balance_writes() {
        let mut conn = setup();
        let user = add_member(&conn, "ada", 100);
        record_event(&mut conn, &user, ScoreEvent::PositiveReview, Some("r1")).unwrap();

        conn.execute("UPDATE users SET success_score = 500 WHERE id = ?1", [&user]).unwrap();

        let report = reconcile(&conn, &user).unwrap();
        assert_eq!(
            report.result,
            LedgerBalance::Drift {
                expected: 105,
                actual: 500,
                difference: 395
            }
        );
        assert!(report.summary().contains("DRIFT"));
    }

    #[test]
    fn test_low_score_is_denied_with_threshold() {
        let conn = setup();
        let low = add_member(&conn, "low", 15);
        let ok = add_member(&conn, "ok", 20);

        let denied = can_request_book(&conn, &low).unwrap();
        assert!(!denied.allowed);
        let reason = denied.reason.clone().unwrap();
        assert!(reason.contains("20"), "{}", reason);
        assert!(reason.contains("15"), "{}", reason);
        assert!(matches!(denied.into_result(), Err(LendingError::PolicyDenied { .. })));

        let allowed = can_request_book(&conn, &ok).unwrap();
        assert!(allowed.allowed);
        assert!(allowed.reason.is_none());
    }
}
