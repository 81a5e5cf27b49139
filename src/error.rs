//! Error types for crowdclaim.
//!
//! [`Error`] is the internal error used between the engine and the store.
//! It never crosses the engine boundary: the assigner, recorder and
//! reclaimer convert it into an [`crate::outcome::Failure`].

use thiserror::Error;

/// SQLSTATE codes Postgres reports for conflicts that succeed on retry.
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    /// A conditional write lost a race (zero rows affected, or the identity
    /// already holds a claim). The whole step is safe to run again.
    #[error("contention: {0}")]
    Contention(String),

    /// The store could not serve the request right now.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// An update that must touch exactly one row did not.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether running the same step again may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Contention(_) | Error::Transient(_) => true,
            Error::Database(e) => is_transient_sqlx(e),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this is a lost conditional write rather than a store fault.
    pub fn is_contention(&self) -> bool {
        matches!(self, Error::Contention(_))
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&code.as_ref())),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_is_transient() {
        let e = Error::Contention("unit full".into());
        assert!(e.is_transient());
        assert!(e.is_contention());
    }

    #[test]
    fn integrity_is_not_transient() {
        assert!(!Error::Integrity("decrement hit zero rows".into()).is_transient());
        assert!(!Error::NotFound("claim".into()).is_transient());
    }

    #[test]
    fn pool_timeout_is_transient() {
        let e = Error::from(sqlx::Error::PoolTimedOut);
        assert!(e.is_transient());
        assert!(!e.is_contention());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        assert!(!Error::from(sqlx::Error::RowNotFound).is_transient());
    }
}
