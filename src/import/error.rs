use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImportError {
    /// The upload could not be decoded as a table or lacks a required column.
    #[error("malformed file: {0}")]
    MalformedFile(String),
    /// Stored data changed between the test run and the confirmation.
    #[error("commit conflict: {0}")]
    CommitConflict(String),
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("unknown import session: {0}")]
    SessionNotFound(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadParams(String),
    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedFile(_) => "malformed_file",
            Self::CommitConflict(_) => "commit_conflict",
            Self::PolicyViolation(_) => "policy_violation",
            Self::SessionNotFound(_) => "session_not_found",
            Self::NotFound(_) => "not_found",
            Self::BadParams(_) => "bad_params",
            Self::Storage(_) => "db_query_failed",
            Self::Encoding(_) => "db_query_failed",
        }
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
