use shared::{
    domain::MessageId,
    error::{ErrorCode, StoreError},
};
use thiserror::Error;

/// Rejected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message payload is empty")]
    EmptyPayload,
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("no signed-in identity")]
    NoIdentity,
    #[error("cannot start a conversation with yourself")]
    SelfConversation,
    #[error("message {0} was not sent by the current identity")]
    NotMessageOwner(MessageId),
}

/// Aggregate result of a parallel batch where at least one item failed.
/// Items not listed here succeeded and stay in effect.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} of {attempted} operations failed", failures.len())]
pub struct BatchFailure {
    pub attempted: usize,
    pub failures: Vec<(String, SyncError)>,
}

impl BatchFailure {
    pub fn failed_ids(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|(id, _)| id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("remote store failure: {0}")]
    Transient(StoreError),
    #[error("{what} not found")]
    NotFound { what: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Batch(BatchFailure),
    #[error("session is closed")]
    SessionClosed,
}

impl SyncError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err.code {
            ErrorCode::NotFound => Self::NotFound { what: err.message },
            _ => Self::Transient(err),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
