// 🌱 CSV seeding - bulk load members and books
//
// Members are keyed by username, books by their listing hash; rows already
// present are counted as duplicates and skipped, so re-running a seed file
// is harmless.

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::db;
use crate::entities::{Book, Member};
use crate::error::LendingError;
use crate::geo::GeoPoint;

/// `username,latitude,longitude,interests`
#[derive(Debug, Deserialize)]
pub struct MemberRecord {
    pub username: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// "scifi:1.0;history:0.5"
    #[serde(default)]
    pub interests: String,
}

/// `title,author,topics,listed_by`
#[derive(Debug, Deserialize)]
pub struct BookRecord {
    pub title: String,
    pub author: String,
    /// "scifi;history"
    #[serde(default)]
    pub topics: String,
    /// Username of the listing member
    pub listed_by: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub inserted: usize,
    pub duplicates: usize,
}

pub fn seed_members(conn: &Connection, csv_path: &Path) -> Result<SeedSummary> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open members CSV {}", csv_path.display()))?;
    seed_members_from_reader(conn, file)
}

pub fn seed_members_from_reader<R: Read>(conn: &Connection, reader: R) -> Result<SeedSummary> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut summary = SeedSummary::default();

    for (line, result) in rdr.deserialize().enumerate() {
        let record: MemberRecord = result.context("Failed to deserialize member")?;
        let username = record.username.trim().to_string();

        match db::find_member_by_username(conn, &username) {
            Ok(_) => {
                debug!(username = %username, "member already present");
                summary.duplicates += 1;
                continue;
            }
            Err(LendingError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let mut member = Member::new(username);
        member.location = GeoPoint::from_parts(record.latitude, record.longitude);
        member.interests = Member::parse_interests(&record.interests)
            .map_err(|e| anyhow::anyhow!("row {}: {}", line + 1, e))?;

        db::insert_member(conn, &member)
            .with_context(|| format!("Failed to insert member {}", member.username))?;
        summary.inserted += 1;
    }

    info!(inserted = summary.inserted, duplicates = summary.duplicates, "members seeded");
    Ok(summary)
}

pub fn seed_books(conn: &Connection, csv_path: &Path) -> Result<SeedSummary> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("Failed to open books CSV {}", csv_path.display()))?;
    seed_books_from_reader(conn, file)
}

pub fn seed_books_from_reader<R: Read>(conn: &Connection, reader: R) -> Result<SeedSummary> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut summary = SeedSummary::default();

    for result in rdr.deserialize() {
        let record: BookRecord = result.context("Failed to deserialize book")?;

        let listed_by = match record.listed_by.as_deref().map(str::trim) {
            Some(username) if !username.is_empty() => Some(
                db::find_member_by_username(conn, username)
                    .with_context(|| format!("Unknown lister '{}' for '{}'", username, record.title))?
                    .id,
            ),
            _ => None,
        };

        let topics = record
            .topics
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let book = Book::new(record.title.trim().to_string(), record.author.trim().to_string(), topics, listed_by);
        if db::insert_book(conn, &book)? {
            summary.inserted += 1;
        } else {
            debug!(title = %book.title, "duplicate listing skipped");
            summary.duplicates += 1;
        }
    }

    info!(inserted = summary.inserted, duplicates = summary.duplicates, "books seeded");
    Ok(summary)
}
