/// Core error type for the bot.
///
/// Adapter crates map their library errors into this type so the state
/// machine can decide consistently what is reported to the user and what
/// aborts an operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    /// A callback or reply referenced a session that no longer exists
    /// (expired, cancelled, or never created).
    #[error("session not found")]
    SessionNotFound,

    /// An event that is illegal in the session's current state.
    #[error("{0}")]
    Validation(String),

    /// File count or cumulative size over the policy threshold.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Transport file fetch or URL download failure.
    #[error("download failed: {0}")]
    Download(String),

    /// External tool exited non-zero or could not be run.
    #[error("processing failed: {0}")]
    Processing(String),

    /// Archive codec failure (unreadable container, bad password, unsafe entry).
    #[error("archive error: {0}")]
    Archive(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Whether the error is consumed by the state machine itself rather
    /// than aborting an operation.
    pub fn is_user_input_error(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::SessionNotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
