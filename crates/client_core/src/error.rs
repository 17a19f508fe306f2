use shared::{
    domain::{ProcedureId, ValidationError},
    error::ApiError,
};
use thiserror::Error;

/// Failure of a single request/response exchange with the backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
    #[error("server responded with status {status}: {}", .error.message)]
    Status { status: u16, error: ApiError },
    #[error("{}", .message.as_deref().unwrap_or("request rejected by server"))]
    Rejected { message: Option<String> },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("response is missing the procedure payload")]
    MissingProcedure,
    #[error("server sent an invalid procedure: {0}")]
    InvalidPayload(#[source] ValidationError),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
}

impl TransportError {
    /// Message supplied by the backend itself, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            TransportError::Rejected { message } => message.as_deref(),
            TransportError::Status { error, .. } => Some(error.message.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("procedure id is empty")]
    EmptyId,
    #[error("procedure {0} already exists")]
    DuplicateId(ProcedureId),
    #[error("procedure {incoming} reports running while {running} is still running")]
    SecondRunning {
        incoming: ProcedureId,
        running: ProcedureId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("refresh rejected: {running} procedures report running")]
    Refresh { running: usize },
    #[error("store invariant violated: {0}")]
    InvariantViolation(#[from] InvariantViolation),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine task is no longer running")]
    Closed,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The backend answered but the reply could not be applied locally.
    #[error("{0}")]
    Rejected(String),
}
