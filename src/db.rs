use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::entities::{Book, BookRequest, BookStatus, Member, RequestStatus};
use crate::error::{LendingError, LendingResult};
use crate::geo::{normalize_tag, GeoPoint};
use crate::ledger::ReferenceType;

// ============================================================================
// COLUMN CONVERSIONS
// ============================================================================

/// Timestamps are stored as RFC 3339 text with fixed precision so that
/// lexical order matches chronological order.
pub fn to_sql_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(idx, &v)).transpose()
}

macro_rules! text_enum_sql {
    ($ty:ty, $what:literal) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                <$ty>::parse(s)
                    .ok_or_else(|| FromSqlError::Other(format!("unknown {}: {}", $what, s).into()))
            }
        }
    };
}

text_enum_sql!(BookStatus, "book status");
text_enum_sql!(RequestStatus, "request status");
text_enum_sql!(ReferenceType, "reference type");

// ============================================================================
// SCHEMA
// ============================================================================

/// Connection settings applied to every connection the core opens
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> LendingResult<()> {
    // WAL for crash recovery; in-memory databases report "memory" instead
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(busy_timeout)?;
    debug!(journal_mode = %mode, "connection configured");
    Ok(())
}

pub fn setup_database(conn: &Connection) -> LendingResult<()> {
    conn.execute_batch(
        "
        -- Reputation projection of members
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT UNIQUE NOT NULL,
            success_score INTEGER NOT NULL,
            opening_score INTEGER NOT NULL,
            location_lat REAL,
            location_lng REAL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_interests (
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            interest TEXT NOT NULL,
            weight REAL NOT NULL CHECK (weight >= 0 AND weight <= 1),
            PRIMARY KEY (user_id, interest)
        );

        -- Books: holder is present exactly while reserved or reading
        CREATE TABLE IF NOT EXISTS books (
            id TEXT PRIMARY KEY,
            listing_hash TEXT UNIQUE NOT NULL,
            title TEXT NOT NULL,
            author TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('available', 'requested', 'reserved', 'reading')),
            current_holder_id TEXT REFERENCES users(id),
            listed_by TEXT REFERENCES users(id),
            total_reads INTEGER NOT NULL DEFAULT 0,
            average_rating REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK ((current_holder_id IS NOT NULL) = (status IN ('reserved', 'reading')))
        );

        CREATE TABLE IF NOT EXISTS book_topics (
            book_id TEXT NOT NULL REFERENCES books(id) ON DELETE CASCADE,
            topic TEXT NOT NULL,
            PRIMARY KEY (book_id, topic)
        );

        CREATE TABLE IF NOT EXISTS book_requests (
            id TEXT PRIMARY KEY,
            book_id TEXT NOT NULL REFERENCES books(id),
            user_id TEXT NOT NULL REFERENCES users(id),
            status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'rejected')),
            priority_score REAL NOT NULL DEFAULT 0,
            interest_match_score REAL NOT NULL DEFAULT 0,
            distance_km REAL,
            requested_at TEXT NOT NULL,
            processed_at TEXT,
            due_date TEXT
        );

        -- At most one pending request per (book, user)
        CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_one_pending
            ON book_requests(book_id, user_id) WHERE status = 'pending';

        CREATE INDEX IF NOT EXISTS idx_requests_queue
            ON book_requests(book_id, status, priority_score DESC, requested_at ASC);

        -- Append-only reputation ledger
        CREATE TABLE IF NOT EXISTS success_score_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL REFERENCES users(id),
            change_amount INTEGER NOT NULL,
            reason TEXT NOT NULL,
            reference_type TEXT NOT NULL
                CHECK (reference_type IN ('book', 'review', 'idea', 'donation')),
            reference_id TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_user ON success_score_history(user_id, id);

        CREATE TRIGGER IF NOT EXISTS success_score_history_no_update
            BEFORE UPDATE ON success_score_history
        BEGIN
            SELECT RAISE(ABORT, 'ledger entries are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS success_score_history_no_delete
            BEFORE DELETE ON success_score_history
        BEGIN
            SELECT RAISE(ABORT, 'ledger entries are immutable');
        END;

        -- Audit trail of lifecycle transitions
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id);
        ",
    )?;

    Ok(())
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for the audit trail. Written in the same transaction as the
/// transition it describes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &Event) -> LendingResult<()> {
    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            to_sql_time(&event.timestamp),
            event.event_type,
            event.entity_type,
            event.entity_id,
            event.data.to_string(),
            event.actor,
        ],
    )?;

    Ok(())
}

/// Events for one entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> LendingResult<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp: String = row.get(1)?;
            let data: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_time(1, &timestamp)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// MEMBERS
// ============================================================================

pub fn insert_member(conn: &Connection, member: &Member) -> LendingResult<()> {
    let created = to_sql_time(&member.created_at);
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO users (
            id, username, success_score, opening_score,
            location_lat, location_lng, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            member.id,
            member.username,
            member.opening_score,
            member.opening_score,
            member.location.map(|p| p.lat),
            member.location.map(|p| p.lng),
            created,
        ],
    )?;

    set_member_interests(&tx, &member.id, &member.interests)?;
    tx.commit()?;
    Ok(())
}

pub fn get_member(conn: &Connection, id: &str) -> LendingResult<Member> {
    let member = conn
        .query_row(
            "SELECT id, username, success_score, opening_score,
                    location_lat, location_lng, created_at
             FROM users WHERE id = ?1",
            [id],
            |row| {
                let created: String = row.get(6)?;
                Ok(Member {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    success_score: row.get(2)?,
                    opening_score: row.get(3)?,
                    location: GeoPoint::from_parts(row.get(4)?, row.get(5)?),
                    interests: HashMap::new(),
                    created_at: parse_time(6, &created)?,
                })
            },
        )
        .optional()?;

    let mut member = member.ok_or_else(|| LendingError::not_found("user", id))?;
    member.interests = get_member_interests(conn, id)?;
    Ok(member)
}

pub fn find_member_by_username(conn: &Connection, username: &str) -> LendingResult<Member> {
    let id: Option<String> = conn
        .query_row("SELECT id FROM users WHERE username = ?1", [username], |row| {
            row.get(0)
        })
        .optional()?;

    match id {
        Some(id) => get_member(conn, &id),
        None => Err(LendingError::not_found("user", username)),
    }
}

pub fn get_member_interests(conn: &Connection, user_id: &str) -> LendingResult<HashMap<String, f64>> {
    let mut stmt = conn.prepare("SELECT interest, weight FROM user_interests WHERE user_id = ?1")?;
    let interests = stmt
        .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<HashMap<String, f64>, _>>()?;
    Ok(interests)
}

/// Replace a member's interests. Owned by the profile collaborator.
/// Tags are stored normalized; tags that collide keep the higher weight.
pub fn set_member_interests(
    conn: &Connection,
    user_id: &str,
    interests: &HashMap<String, f64>,
) -> LendingResult<()> {
    conn.execute("DELETE FROM user_interests WHERE user_id = ?1", [user_id])?;

    let mut stmt = conn.prepare(
        "INSERT INTO user_interests (user_id, interest, weight) VALUES (?1, ?2, ?3)
         ON CONFLICT (user_id, interest) DO UPDATE SET weight = MAX(weight, excluded.weight)",
    )?;
    for (interest, weight) in interests {
        stmt.execute(params![user_id, normalize_tag(interest), weight])?;
    }
    Ok(())
}

/// Update a member's location. Owned by the profile collaborator; the
/// caller triggers priority recomputation for books the member holds.
pub fn set_member_location(
    conn: &Connection,
    user_id: &str,
    location: Option<GeoPoint>,
) -> LendingResult<()> {
    let updated = conn.execute(
        "UPDATE users SET location_lat = ?1, location_lng = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            location.map(|p| p.lat),
            location.map(|p| p.lng),
            to_sql_time(&Utc::now()),
            user_id,
        ],
    )?;

    if updated == 0 {
        return Err(LendingError::not_found("user", user_id));
    }
    Ok(())
}

// ============================================================================
// BOOKS
// ============================================================================

/// Insert a listing. Returns false when the same listing already exists.
pub fn insert_book(conn: &Connection, book: &Book) -> LendingResult<bool> {
    let result = conn.execute(
        "INSERT INTO books (
            id, listing_hash, title, author, status, current_holder_id, listed_by,
            total_reads, average_rating, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            book.id,
            book.compute_listing_hash(),
            book.title,
            book.author,
            book.status,
            book.current_holder,
            book.listed_by,
            book.total_reads,
            book.average_rating,
            to_sql_time(&book.created_at),
            to_sql_time(&book.updated_at),
        ],
    );

    match result {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let mut stmt = conn.prepare("INSERT OR IGNORE INTO book_topics (book_id, topic) VALUES (?1, ?2)")?;
    for topic in &book.topics {
        stmt.execute(params![book.id, topic])?;
    }

    Ok(true)
}

pub fn get_book(conn: &Connection, id: &str) -> LendingResult<Book> {
    let book = conn
        .query_row(
            "SELECT id, title, author, status, current_holder_id, listed_by,
                    total_reads, average_rating, created_at, updated_at
             FROM books WHERE id = ?1",
            [id],
            |row| {
                let created: String = row.get(8)?;
                let updated: String = row.get(9)?;
                Ok(Book {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    author: row.get(2)?,
                    topics: Vec::new(),
                    status: row.get(3)?,
                    current_holder: row.get(4)?,
                    listed_by: row.get(5)?,
                    total_reads: row.get(6)?,
                    average_rating: row.get(7)?,
                    created_at: parse_time(8, &created)?,
                    updated_at: parse_time(9, &updated)?,
                })
            },
        )
        .optional()?;

    let mut book = book.ok_or_else(|| LendingError::not_found("book", id))?;
    book.topics = get_book_topics(conn, id)?;
    Ok(book)
}

pub fn get_book_topics(conn: &Connection, book_id: &str) -> LendingResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT topic FROM book_topics WHERE book_id = ?1 ORDER BY topic")?;
    let topics = stmt
        .query_map([book_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(topics)
}

/// Books currently held by a member (reserved or reading)
/// Books whose reference location is this member's: held by them, or
/// listed by them while nobody holds the copy.
pub fn books_referencing(conn: &Connection, user_id: &str) -> LendingResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM books
         WHERE current_holder_id = ?1
            OR (current_holder_id IS NULL AND listed_by = ?1)
         ORDER BY created_at",
    )?;
    let ids = stmt
        .query_map([user_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn count_books(conn: &Connection) -> LendingResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?)
}

// ============================================================================
// REQUESTS
// ============================================================================

const REQUEST_COLUMNS: &str = "r.id, r.book_id, r.user_id, r.status, r.priority_score,
    r.interest_match_score, r.distance_km, r.requested_at, r.processed_at, r.due_date";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<BookRequest> {
    let requested: String = row.get(7)?;
    Ok(BookRequest {
        id: row.get(0)?,
        book_id: row.get(1)?,
        user_id: row.get(2)?,
        status: row.get(3)?,
        priority_score: row.get(4)?,
        interest_match_score: row.get(5)?,
        distance_km: row.get(6)?,
        requested_at: parse_time(7, &requested)?,
        processed_at: parse_optional_time(8, row.get(8)?)?,
        due_date: parse_optional_time(9, row.get(9)?)?,
    })
}

fn query_requests(
    conn: &Connection,
    sql_tail: &str,
    params: impl rusqlite::Params,
) -> LendingResult<Vec<BookRequest>> {
    let sql = format!("SELECT {} FROM book_requests r {}", REQUEST_COLUMNS, sql_tail);
    let mut stmt = conn.prepare(&sql)?;
    let requests = stmt
        .query_map(params, request_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(requests)
}

/// Insert a request; a second pending request for the same pair is rejected.
pub fn insert_request(conn: &Connection, request: &BookRequest) -> LendingResult<()> {
    let result = conn.execute(
        "INSERT INTO book_requests (
            id, book_id, user_id, status, priority_score, interest_match_score,
            distance_km, requested_at, processed_at, due_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            request.id,
            request.book_id,
            request.user_id,
            request.status,
            request.priority_score,
            request.interest_match_score,
            request.distance_km,
            to_sql_time(&request.requested_at),
            request.processed_at.as_ref().map(to_sql_time),
            request.due_date.as_ref().map(to_sql_time),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Err(LendingError::DuplicateRequest {
                book_id: request.book_id.clone(),
                user_id: request.user_id.clone(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

pub fn get_request(conn: &Connection, id: &str) -> LendingResult<BookRequest> {
    query_requests(conn, "WHERE r.id = ?1", [id])?
        .into_iter()
        .next()
        .ok_or_else(|| LendingError::not_found("request", id))
}

pub fn has_pending_request(conn: &Connection, book_id: &str, user_id: &str) -> LendingResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM book_requests
         WHERE book_id = ?1 AND user_id = ?2 AND status = 'pending'",
        params![book_id, user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Pending requests in allocation order
pub fn pending_requests(conn: &Connection, book_id: &str) -> LendingResult<Vec<BookRequest>> {
    query_requests(
        conn,
        "WHERE r.book_id = ?1 AND r.status = 'pending'
         ORDER BY r.priority_score DESC, r.requested_at ASC, r.rowid ASC",
        [book_id],
    )
}

pub fn requests_for_user(conn: &Connection, user_id: &str) -> LendingResult<Vec<BookRequest>> {
    query_requests(
        conn,
        "WHERE r.user_id = ?1 ORDER BY r.requested_at DESC",
        [user_id],
    )
}

pub fn count_pending(conn: &Connection, book_id: &str) -> LendingResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM book_requests WHERE book_id = ?1 AND status = 'pending'",
        [book_id],
        |row| row.get(0),
    )?)
}

/// The approved request under which the current holder has the book
pub fn active_loan(conn: &Connection, book_id: &str) -> LendingResult<Option<BookRequest>> {
    let loans = query_requests(
        conn,
        "JOIN books b ON b.id = r.book_id
         WHERE r.book_id = ?1 AND r.status = 'approved' AND r.user_id = b.current_holder_id
         ORDER BY r.processed_at DESC LIMIT 1",
        [book_id],
    )?;
    Ok(loans.into_iter().next())
}

/// Every loan still out (book reserved or being read), earliest due first
pub fn active_loans(conn: &Connection) -> LendingResult<Vec<BookRequest>> {
    query_requests(
        conn,
        "JOIN books b ON b.id = r.book_id
         WHERE r.status = 'approved' AND r.user_id = b.current_holder_id
           AND b.status IN ('reserved', 'reading')
         ORDER BY r.due_date ASC",
        [],
    )
}
