// 🔔 Notifications - one-way messages to members
//
// The lending core decides WHAT to tell a member; delivery belongs to the
// surrounding system. Sinks are fire-and-forget: emitting never fails and
// is only done after the state change it reports has committed.

use serde::Serialize;
use std::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BookAvailable {
        user_id: String,
        book_id: String,
        book_title: String,
    },
    RequestApproved {
        user_id: String,
        book_id: String,
        book_title: String,
        due_date: Option<String>,
    },
    RequestRejected {
        user_id: String,
        book_id: String,
        book_title: String,
    },
    ReturnDue {
        user_id: String,
        book_id: String,
        book_title: String,
        days_left: i64,
    },
    ScoreChanged {
        user_id: String,
        change: i64,
        reason: String,
    },
}

impl Notification {
    /// Stable kind string, as stored by delivery channels
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::BookAvailable { .. } => "book_available",
            Notification::RequestApproved { .. } => "request_approved",
            Notification::RequestRejected { .. } => "request_rejected",
            Notification::ReturnDue { .. } => "return_due",
            Notification::ScoreChanged { .. } => "score_changed",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Notification::BookAvailable { user_id, .. }
            | Notification::RequestApproved { user_id, .. }
            | Notification::RequestRejected { user_id, .. }
            | Notification::ReturnDue { user_id, .. }
            | Notification::ScoreChanged { user_id, .. } => user_id,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Notification::BookAvailable { .. } => "Book Available",
            Notification::RequestApproved { .. } => "Request Approved",
            Notification::RequestRejected { .. } => "Request Not Approved",
            Notification::ReturnDue { .. } => "Book Return Reminder",
            Notification::ScoreChanged { .. } => "Success Score Updated",
        }
    }

    /// Human-readable body
    pub fn message(&self) -> String {
        match self {
            Notification::BookAvailable { book_title, .. } => {
                format!("The book '{}' is now available for you!", book_title)
            }
            Notification::RequestApproved { book_title, .. } => {
                format!("Your request for '{}' has been approved!", book_title)
            }
            Notification::RequestRejected { book_title, .. } => {
                format!("Your request for '{}' was not approved this time.", book_title)
            }
            Notification::ReturnDue {
                book_title,
                days_left,
                ..
            } => format!("Please return '{}' in {} days.", book_title, days_left),
            Notification::ScoreChanged { change, reason, .. } => {
                let action = if *change < 0 { "decreased" } else { "increased" };
                format!(
                    "Your success score {} by {} points: {}",
                    action,
                    change.abs(),
                    reason
                )
            }
        }
    }
}

/// Receiver of notifications
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Writes every notification as a tracing event
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn emit(&self, notification: Notification) {
        info!(
            kind = notification.kind(),
            user_id = notification.user_id(),
            message = %notification.message(),
            "notification"
        );
    }
}

/// Keeps notifications in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<Notification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn sent_to(&self, user_id: &str) -> Vec<Notification> {
        self.sent()
            .into_iter()
            .filter(|n| n.user_id() == user_id)
            .collect()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl NotificationSink for MemorySink {
    fn emit(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}
