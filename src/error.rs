// Error taxonomy for the lending core
//
// Business-rule failures (DuplicateRequest, PolicyDenied) are kept distinct
// from infrastructure faults (StorageFailure) so the calling layer can show
// them to members as actionable messages.

/// Domain errors raised by the lending core.
#[derive(Debug, thiserror::Error)]
pub enum LendingError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("user {user_id} already has a pending request for book {book_id}")]
    DuplicateRequest { book_id: String, user_id: String },

    #[error("cannot {event} while book is {from}")]
    InvalidTransition { from: String, event: String },

    #[error("storage failure: {0}")]
    StorageFailure(#[from] rusqlite::Error),

    #[error("request not allowed: {reason}")]
    PolicyDenied { reason: String },
}

impl LendingError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        LendingError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_transition(from: impl ToString, event: impl ToString) -> Self {
        LendingError::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
        }
    }

    /// True for failures caused by a business rule rather than by storage.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            LendingError::DuplicateRequest { .. } | LendingError::PolicyDenied { .. }
        )
    }

    /// Errors that a best-effort batch skips instead of aborting.
    pub fn is_skippable_in_batch(&self) -> bool {
        matches!(
            self,
            LendingError::NotFound { .. } | LendingError::StorageFailure(_)
        )
    }
}

pub type LendingResult<T> = Result<T, LendingError>;
