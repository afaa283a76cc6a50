use serde_json::json;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Malformed or out-of-policy input. `field` names the offending input and
/// `rule` names the clause it violated, so callers can tell "bad month" from
/// "too far in the future" without parsing the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: String,
    pub rule: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, rule: &'static str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            rule,
            message: message.into(),
        }
    }

    /// Re-targets the error at an element of a batch, e.g. `records[3].status`.
    pub fn at(mut self, prefix: &str, index: usize) -> Self {
        self.field = format!("{}[{}].{}", prefix, index, self.field);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AuthorizationError {
    pub message: String,
}

/// A storage operation failed. Batches run inside one transaction, so `applied`
/// reports what survived the rollback (normally zero). Failures outside a batch
/// carry `attempted == 0` and report no counts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct PersistenceError {
    pub message: String,
    pub attempted: usize,
    pub applied: usize,
    pub failed_at: Option<usize>,
}

impl PersistenceError {
    pub fn unbatched(e: rusqlite::Error) -> Self {
        Self {
            message: e.to_string(),
            attempted: 0,
            applied: 0,
            failed_at: None,
        }
    }
}

/// A collaborator outside the primary write failed (mail outbox, audit log).
/// Logged and swallowed, never returned to a caller.
#[derive(Debug, Error)]
#[error("{collaborator}: {message}")]
pub struct DependencyError {
    pub collaborator: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Unauthenticated(String),

    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("select a workspace first")]
    NoWorkspace,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        ServiceError::Unauthenticated(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ServiceError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ServiceError::Conflict(msg.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation_error",
            ServiceError::Unauthenticated(_) => "unauthenticated",
            ServiceError::Authorization(_) => "forbidden",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::NoWorkspace => "no_workspace",
            ServiceError::Persistence(_) => "persistence_error",
            ServiceError::Internal(_) => "internal_error",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            ServiceError::Validation(e) => Some(json!({ "field": e.field, "rule": e.rule })),
            ServiceError::Persistence(e) if e.attempted > 0 => Some(json!({
                "attempted": e.attempted,
                "applied": e.applied,
                "failedAt": e.failed_at,
            })),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Persistence(PersistenceError::unbatched(e))
    }
}
