use thiserror::Error;

/// Errors raised by the incident store, the resolution policy and the orchestrator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IncidentError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid review status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Concurrent write rejected by '{constraint}'")]
    Conflict { constraint: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

impl IncidentError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn conflict(constraint: impl Into<String>) -> Self {
        Self::Conflict {
            constraint: constraint.into(),
        }
    }

    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
        }
    }

    /// Only a lost race with another writer of the same site is retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Postgres SQLSTATE for unique_violation.
const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for IncidentError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::not_found("row", "unknown"),
            sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Self::Conflict {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                }
            }
            _ => Self::storage(err.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, IncidentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IncidentError::not_found("incident", "abc");
        assert_eq!(err.to_string(), "incident 'abc' not found");

        let err = IncidentError::invalid("site_id is empty");
        assert_eq!(err.to_string(), "Invalid argument: site_id is empty");
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(IncidentError::Conflict {
            constraint: "site_incidents_one_active_per_site".into()
        }
        .is_retryable());
        assert!(!IncidentError::storage("connection reset").is_retryable());
        assert!(!IncidentError::invalid("bad id").is_retryable());
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: IncidentError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, IncidentError::NotFound { .. }));

        let err: IncidentError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, IncidentError::Storage { .. }));
    }
}
