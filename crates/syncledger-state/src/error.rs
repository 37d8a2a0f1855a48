//! State store error types.

/// Errors produced by [`StateApi`](crate::StateApi) and
/// [`AttemptApi`](crate::AttemptApi) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// `SQLite` failure annotated with the operation that hit it.
    #[error("{context}: {source}")]
    SqliteContext {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Stored document could not be encoded or decoded.
    #[error("state document serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Row holds a value this version does not understand.
    #[error("corrupt state row: {0}")]
    Corrupt(String),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Remote API failure reported by a non-SQLite implementation.
    #[error("remote api error: {0}")]
    Remote(String),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state store lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Tag a `SQLite` error with the operation that produced it.
    #[must_use]
    pub fn sqlite_context(context: &'static str, source: rusqlite::Error) -> Self {
        Self::SqliteContext { context, source }
    }

    /// Build a [`StateError::Remote`] from any displayable cause.
    pub fn remote(cause: impl std::fmt::Display) -> Self {
        Self::Remote(cause.to_string())
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;
