use thiserror::Error;

/// Failures surfaced by the daemon core.
///
/// Every variant maps to a stable wire name via [`WatchdError::kind`] so that
/// clients can tell a sync timeout apart from an aborted sync and retry
/// accordingly.
#[derive(Debug, Error)]
pub enum WatchdError {
    #[error(
        "synchronization failed: timed out waiting for cookie file to be observed by watcher within {timeout_ms} milliseconds (elapsed {elapsed_ms}ms)"
    )]
    SyncTimeout { timeout_ms: u64, elapsed_ms: u64 },
    #[error("synchronization aborted: cookie sync for {root} was cancelled before it was observed")]
    SyncAborted { root: String },
    #[error("{0}")]
    InvalidArgument(String),
    #[error("directory {0} is not watched")]
    NotWatched(String),
    #[error("unable to resolve root {path}: {reason}")]
    RootResolve { path: String, reason: String },
    #[error("daemon is shutting down")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WatchdError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncTimeout { .. } => "timeout",
            Self::SyncAborted { .. } => "aborted",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotWatched(_) => "not_watched",
            Self::RootResolve { .. } => "root_resolve",
            Self::Shutdown => "shutdown",
            Self::Io(_) => "io",
        }
    }
}

pub type WatchdResult<T> = Result<T, WatchdError>;
