use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The CLI binary could not be started at all.
    #[error("CLI unavailable: {0}")]
    Unavailable(String),

    /// The CLI exited immediately and the retry also failed.
    #[error("CLI failed to start (exit {code}): {stderr}")]
    SpawnFailed { code: i32, stderr: String },

    /// The CLI finished but produced no parseable output.
    #[error("CLI produced no parseable output")]
    NoOutput,

    #[error("session error: {0}")]
    Session(#[from] switchboard_sessions::SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
