use bitseek_core::FrameError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("another request is already in flight")]
    Concurrency,
    #[error("no response within {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connectivity(String),
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("server error: {0}")]
    Server(String),
    #[error("request aborted")]
    Aborted,
    #[error("invalid session url: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl SessionError {
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            SessionError::Connectivity(_) | SessionError::ReconnectExhausted { .. }
        )
    }
}
