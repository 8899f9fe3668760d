use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A SQLite operation on the registry store failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Reading or writing a session JSONL file failed.
    #[error("session file error: {0}")]
    Io(#[from] std::io::Error),

    /// A session JSONL entry could not be decoded.
    #[error("malformed session entry: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The stored conversation holds no user turn to fork at.
    #[error("no forkable user turn in session {uuid}")]
    NothingToFork { uuid: String },
}

pub type Result<T> = std::result::Result<T, SessionError>;
