use thiserror::Error;

/// Errors surfaced by the engine to its callers (HTTP adapter, console socket, saga).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    #[error("session already exists: {0}")]
    SessionExists(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("archive not ready")]
    NotReady,
    #[error("archive i/o failed: {0}")]
    ArchiveIo(String),
    #[error("download failed: {0}")]
    DownloadFailure(String),
    #[error("failed to spawn shell: {0}")]
    SpawnFailure(String),
    #[error("failed to write to session: {0}")]
    SessionIo(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn invalid_path(msg: impl Into<String>) -> Self {
        EngineError::InvalidPath(msg.into())
    }

    /// Stable machine-readable code, shared with the web client.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidPath(_) => "invalid_path",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::AlreadyRunning => "already_running",
            EngineError::NotRunning => "not_running",
            EngineError::SessionExists(_) => "session_exists",
            EngineError::UnknownSession(_) => "unknown_session",
            EngineError::TaskNotFound(_) => "task_not_found",
            EngineError::NotReady => "not_ready",
            EngineError::ArchiveIo(_) => "archive_io",
            EngineError::DownloadFailure(_) => "download_failed",
            EngineError::SpawnFailure(_) => "spawn_failed",
            EngineError::SessionIo(_) => "session_io",
            EngineError::Internal(_) => "internal",
        }
    }

    /// HTTP status the adapter answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::InvalidPath(_) | EngineError::InvalidArgument(_) => 400,
            EngineError::AlreadyRunning
            | EngineError::NotRunning
            | EngineError::SessionExists(_)
            | EngineError::NotReady => 409,
            EngineError::UnknownSession(_) | EngineError::TaskNotFound(_) => 404,
            EngineError::DownloadFailure(_) => 502,
            EngineError::ArchiveIo(_)
            | EngineError::SpawnFailure(_)
            | EngineError::SessionIo(_)
            | EngineError::Internal(_) => 500,
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            EngineError::AlreadyRunning => Some("Stop or kill the server before starting it again."),
            EngineError::NotRunning => Some("Start the server first."),
            EngineError::NotReady => Some("Poll the task status until it reports completed."),
            EngineError::DownloadFailure(_) => {
                Some("Check network connectivity and the requested version, then try again.")
            }
            EngineError::SpawnFailure(_) => {
                Some("Ensure the configured shell exists and the tenant directory is writable.")
            }
            EngineError::SessionIo(_) => Some("The console shell has exited; recreate the session."),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precondition_errors_are_conflicts() {
        assert_eq!(EngineError::AlreadyRunning.http_status(), 409);
        assert_eq!(EngineError::NotRunning.http_status(), 409);
        assert_eq!(EngineError::NotReady.http_status(), 409);
        assert_eq!(EngineError::TaskNotFound("x".into()).http_status(), 404);
        assert_eq!(EngineError::invalid_path("..").http_status(), 400);
    }

    #[test]
    fn internal_errors_keep_their_message() {
        let err = EngineError::from(anyhow::anyhow!("disk on fire"));
        assert_eq!(err.code(), "internal");
        assert_eq!(err.to_string(), "disk on fire");
    }
}
