use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state transition for {subject}: {from} -> {to}")]
    InvalidStateTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("Dispatch {id} is not ready for archiving, unfinished documents: {}", .pending.join(", "))]
    NotReady { id: Uuid, pending: Vec<String> },

    #[error("Production order for document {reference} failed: {reason}")]
    ProductionOrderFailed { reference: String, reason: String },

    #[error("Distribution of dispatch {id} failed: {reason}")]
    DistributionFailed { id: Uuid, reason: String },

    /// Timeouts, connection failures, 5xx and 429 responses
    #[error("{service} unavailable: {reason}")]
    ExternalServiceUnavailable { service: String, reason: String },

    #[error("{service} rejected the request with status {status}: {body}")]
    ExternalRejected {
        service: String,
        status: u16,
        body: String,
    },

    #[error("Dispatch not found: {0}")]
    NotFound(Uuid),

    /// Optimistic lock lost
    #[error("Dispatch {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

impl DispatchError {
    pub fn invalid(message: impl Into<String>) -> Self {
        DispatchError::InvalidRequest(message.into())
    }

    pub fn transition(
        subject: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        DispatchError::InvalidStateTransition {
            subject: subject.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    pub fn unavailable(service: impl Into<String>, reason: impl ToString) -> Self {
        DispatchError::ExternalServiceUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Worth retrying the same call later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::ExternalServiceUnavailable { .. }
                | DispatchError::Conflict(_)
                | DispatchError::Database(_)
        )
    }
}

impl From<sea_orm::DbErr> for DispatchError {
    fn from(err: sea_orm::DbErr) -> Self {
        DispatchError::Database(err.to_string())
    }
}
