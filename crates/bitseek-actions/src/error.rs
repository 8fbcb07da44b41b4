use crate::executor::{ExecutorError, ExecutorFailureKind};
use bitseek_session::{Aborted, SessionError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("unusable classification: {0}")]
    ClassificationFormat(String),
    #[error(transparent)]
    Session(SessionError),
    #[error(transparent)]
    Executor(ExecutorError),
    #[error("request aborted")]
    Aborted,
}

impl From<SessionError> for ActionError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Aborted => ActionError::Aborted,
            other => ActionError::Session(other),
        }
    }
}

impl From<ExecutorError> for ActionError {
    fn from(err: ExecutorError) -> Self {
        match err.kind {
            ExecutorFailureKind::Aborted => ActionError::Aborted,
            _ => ActionError::Executor(err),
        }
    }
}

impl From<Aborted> for ActionError {
    fn from(_: Aborted) -> Self {
        ActionError::Aborted
    }
}

impl ActionError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, ActionError::Aborted)
    }

    /// Failures of the session link that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, ActionError::Session(err) if err.is_connectivity())
    }

    /// Text suitable for the end user; raw detail is appended when `debug`.
    pub fn user_message(&self, debug: bool) -> String {
        let base = match self {
            ActionError::ClassificationFormat(_) => {
                "Sorry, I could not work out what you asked for. Please rephrase.".to_string()
            }
            ActionError::Session(err) => session_message(err).to_string(),
            ActionError::Executor(err) => executor_message(err),
            ActionError::Aborted => "Request cancelled.".to_string(),
        };
        if debug && !self.is_aborted() {
            format!("{base}\nDetails: {self}")
        } else {
            base
        }
    }
}

fn session_message(err: &SessionError) -> &'static str {
    match err {
        SessionError::Concurrency => "Another request is still running. Please wait for it to finish.",
        SessionError::Timeout(_) => "The model did not answer in time. Please try again.",
        SessionError::Connectivity(_) => {
            "Could not reach the generation service. Check your network and try again."
        }
        SessionError::ReconnectExhausted { .. } => {
            "The connection to the generation service was lost and could not be restored."
        }
        SessionError::Server(_) => "The generation service reported an error. Please try again later.",
        SessionError::Aborted => "Request cancelled.",
        SessionError::InvalidUrl(_) => "The generation service address is not valid.",
        SessionError::Frame(_) => "The generation service sent a reply that could not be read.",
    }
}

pub(crate) fn executor_message(err: &ExecutorError) -> String {
    match err.kind {
        ExecutorFailureKind::Connectivity => {
            "Could not reach the action service. Check that it is running and try again."
                .to_string()
        }
        ExecutorFailureKind::Timeout => {
            "The action service did not respond in time. Please try again later.".to_string()
        }
        ExecutorFailureKind::Aborted => "Request cancelled.".to_string(),
        _ => "The action could not be completed.".to_string(),
    }
}
