//! Database error types.

use thiserror::Error;

/// Errors raised by the site database layer.
///
/// Every variant is recoverable from the reactor's point of view: the
/// session is closed and a reconnect is scheduled.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Could not open a session.
    #[error("Failed to connect to database: {reason}")]
    ConnectionFailed { reason: String },

    /// The session went away underneath us.
    #[error("Database connection lost")]
    ConnectionLost,

    /// A statement failed.
    #[error("Database {operation} failed: {reason}")]
    QueryFailed { operation: String, reason: String },

    /// A column or filter name is not a plain SQL identifier.
    #[error("Invalid SQL identifier: {identifier:?}")]
    InvalidIdentifier { identifier: String },

    /// Error reported by sqlx, with context.
    #[cfg(feature = "postgres")]
    #[error("SQL error: {reason}")]
    Sqlx {
        reason: String,
        #[source]
        source: Option<sqlx::Error>,
    },
}

impl DatabaseError {
    /// Check if the session itself is unusable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            DatabaseError::ConnectionFailed { .. } | DatabaseError::ConnectionLost => true,
            #[cfg(feature = "postgres")]
            DatabaseError::Sqlx {
                source: Some(source),
                ..
            } => matches!(
                source,
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }

    /// Check if a statement was rejected.
    pub fn is_query_error(&self) -> bool {
        matches!(
            self,
            DatabaseError::QueryFailed { .. } | DatabaseError::InvalidIdentifier { .. }
        )
    }
}

// Conversion from DatabaseError to the main Error type
impl From<DatabaseError> for crate::Error {
    fn from(err: DatabaseError) -> Self {
        crate::Error::Database(err)
    }
}
