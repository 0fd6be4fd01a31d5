//! book-lending: operator CLI for the lending core
//!
//! Every command opens the configured database, performs one engine call and
//! prints the outcome. Notifications are written to the log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use book_lending::{db, seed, Config, GeoPoint, LendingEngine, LendingError, LogSink, ReferenceType};

#[derive(Parser)]
#[command(name = "book-lending")]
#[command(about = "Book lending lifecycle, request matching and success-score ledger")]
#[command(version = book_lending::VERSION)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "book-lending.toml", env = "BOOK_LENDING_CONFIG")]
    config: PathBuf,

    /// Database file (overrides config file)
    #[arg(long, env = "BOOK_LENDING_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database schema
    Init,

    /// Load members from CSV (username,latitude,longitude,interests)
    SeedMembers { csv: PathBuf },

    /// Load books from CSV (title,author,topics,listed_by)
    SeedBooks { csv: PathBuf },

    /// Request a book
    Request {
        /// Member id or username
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        book: String,
    },

    /// Rescore every pending request for a book
    Recompute { book: String },

    /// Show the queue for a book, best match first
    Best { book: String },

    /// Approve a pending request
    Approve {
        request: String,
        /// Loan length in days (defaults to lending.default_due_days)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Reject a pending request
    Reject { request: String },

    /// Confirm the holder has picked the book up
    Pickup { book: String },

    /// Record a return
    Return {
        book: String,
        /// Mark the return as late
        #[arg(long, conflicts_with = "at")]
        late: bool,
        /// Return instant (RFC 3339); punctuality follows the due date
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Report a book as lost by its holder
    Lost { book: String },

    /// Apply a manual success-score delta
    LedgerApply {
        #[arg(short, long)]
        user: String,
        #[arg(short, long, allow_hyphen_values = true)]
        amount: i64,
        #[arg(short, long)]
        reason: String,
        /// book, review, idea or donation
        #[arg(long, value_parser = parse_reference_type)]
        ref_type: ReferenceType,
        #[arg(long)]
        ref_id: Option<String>,
    },

    /// Check whether a member may request books
    CanRequest { user: String },

    /// Show a member's ledger, newest first
    History {
        user: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Check a member's balance against their ledger
    Reconcile { user: String },

    /// Move a member (omit both coordinates to clear) and rescore affected queues
    Relocate {
        user: String,
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
    },

    /// Send reminders for loans falling due soon
    Remind {
        /// Window in days (defaults to lending.reminder_window_days)
        #[arg(long)]
        days: Option<u32>,
    },
}

fn parse_reference_type(value: &str) -> Result<ReferenceType, String> {
    ReferenceType::parse(value).ok_or_else(|| format!("unknown reference type '{}'", value))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_or_default(&cli.config)?;
    if let Some(db) = cli.db {
        config.storage.path = db;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)),
        )
        .init();

    info!(db = %config.storage.path.display(), "book-lending starting");

    let mut engine = LendingEngine::open(&config, Arc::new(LogSink))
        .with_context(|| format!("Failed to open database {}", config.storage.path.display()))?;

    match run(&mut engine, &config, cli.command) {
        Err(e) if is_business_rule(&e) => {
            eprintln!("❌ {}", e);
            std::process::exit(2);
        }
        other => other,
    }
}

fn is_business_rule(e: &anyhow::Error) -> bool {
    e.downcast_ref::<LendingError>()
        .map_or(false, LendingError::is_business_rule)
}

/// Accept either a member id or a username
fn resolve_user(engine: &LendingEngine, user: &str) -> Result<String> {
    match db::get_member(engine.connection(), user) {
        Ok(member) => Ok(member.id),
        Err(LendingError::NotFound { .. }) => Ok(db::find_member_by_username(engine.connection(), user)?.id),
        Err(e) => Err(e.into()),
    }
}

fn run(engine: &mut LendingEngine, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Init => {
            println!("✓ Database ready at {}", config.storage.path.display());
            println!("✓ {} books listed", db::count_books(engine.connection())?);
        }

        Command::SeedMembers { csv } => {
            let summary = seed::seed_members(engine.connection(), &csv)?;
            println!("✓ Inserted {} members", summary.inserted);
            println!("✓ Duplicates skipped: {}", summary.duplicates);
        }

        Command::SeedBooks { csv } => {
            let summary = seed::seed_books(engine.connection(), &csv)?;
            println!("✓ Inserted {} books", summary.inserted);
            println!("✓ Duplicates skipped: {}", summary.duplicates);
        }

        Command::Request { user, book } => {
            let user_id = resolve_user(engine, &user)?;
            let request = engine.create_request(&user_id, &book)?;
            println!("✓ Request {} created", request.id);
            println!("  priority {:.2} (interest {:.1}, distance {:.1} km)",
                request.priority_score,
                request.interest_match_score,
                request.distance_km.unwrap_or_default());
        }

        Command::Recompute { book } => {
            let summary = engine.recompute_priorities(&book)?;
            println!("✓ Rescored {} of {} pending requests", summary.succeeded, summary.total());
            for failure in &summary.failures {
                println!("  ⚠️  {}: {}", failure.request_id, failure.error);
            }
        }

        Command::Best { book } => {
            let best = engine.select_best_match(&book)?;
            println!("🎯 Best match: request {} by {} ({:.2})", best.id, best.user_id, best.priority_score);
            for (rank, request) in engine.pending_for_book(&book)?.iter().enumerate() {
                println!("  {}. {} {:.2} requested {}",
                    rank + 1,
                    request.user_id,
                    request.priority_score,
                    request.requested_at.to_rfc3339());
            }
        }

        Command::Approve { request, days } => {
            let days = days.unwrap_or(config.lending.default_due_days);
            let approval = engine.commit_approval(&request, days)?;
            println!("✓ '{}' reserved for {}", approval.book.title, approval.request.user_id);
            if let Some(due) = approval.request.due_date {
                println!("  due {}", due.to_rfc3339());
            }
        }

        Command::Reject { request } => {
            let rejection = engine.commit_rejection(&request)?;
            println!("✓ Request {} rejected", rejection.request.id);
            if rejection.released {
                println!("  '{}' is available again", rejection.book.title);
            }
        }

        Command::Pickup { book } => {
            let book = engine.confirm_pickup(&book)?;
            println!("✓ '{}' is now being read", book.title);
        }

        Command::Return { book, late, at } => {
            let closed = match at {
                Some(at) => engine.record_return_at(&book, at)?,
                None => engine.record_return(&book, !late)?,
            };
            println!("✓ '{}' returned ({})", closed.book.title, closed.ledger_entry.reason);
            println!("  score change {:+}, {} waiting", closed.ledger_entry.change_amount, closed.waiting_requesters.len());
        }

        Command::Lost { book } => {
            let closed = engine.record_loss(&book)?;
            println!("✓ '{}' reported lost by {}", closed.book.title, closed.former_holder);
            println!("  score change {:+}", closed.ledger_entry.change_amount);
        }

        Command::LedgerApply { user, amount, reason, ref_type, ref_id } => {
            let user_id = resolve_user(engine, &user)?;
            let entry = engine.apply_ledger_delta(&user_id, amount, &reason, ref_type, ref_id.as_deref())?;
            println!("✓ Ledger entry {} ({:+})", entry.entry_id, entry.change_amount);
        }

        Command::CanRequest { user } => {
            let user_id = resolve_user(engine, &user)?;
            let eligibility = engine.can_request_book(&user_id)?;
            match eligibility.reason {
                None => println!("✓ Allowed"),
                Some(reason) => println!("❌ {}", reason),
            }
        }

        Command::History { user, limit } => {
            let user_id = resolve_user(engine, &user)?;
            for entry in engine.history(&user_id, limit)? {
                println!("{}  {:+4}  {} [{}{}]",
                    entry.created_at.to_rfc3339(),
                    entry.change_amount,
                    entry.reason,
                    entry.reference_type,
                    entry.reference_id.map(|id| format!(":{}", id)).unwrap_or_default());
            }
        }

        Command::Reconcile { user } => {
            let user_id = resolve_user(engine, &user)?;
            let report = engine.reconcile(&user_id)?;
            let mark = if report.is_balanced() { "✓" } else { "❌" };
            println!("{} {}", mark, report.summary());
        }

        Command::Relocate { user, lat, lng } => {
            let user_id = resolve_user(engine, &user)?;
            let location = lat.zip(lng).map(|(lat, lng)| GeoPoint::new(lat, lng));
            let summaries = engine.relocate_member(&user_id, location)?;
            println!("✓ Member relocated, {} queues rescored", summaries.len());
            for summary in summaries.iter().filter(|s| !s.is_clean()) {
                println!("  ⚠️  {}: {} requests failed", summary.book_id, summary.failed);
            }
        }

        Command::Remind { days } => {
            let days = days.unwrap_or(config.lending.reminder_window_days);
            let sent = engine.send_return_reminders(Utc::now(), days)?;
            println!("✓ {} reminders sent", sent);
        }
    }

    Ok(())
}
