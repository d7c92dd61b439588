use thiserror::Error;
use tonic::Status;

use crate::state::State;

/// Error kinds surfaced by the coordinator.
///
/// The variants map one-to-one onto the RPC status codes of the external
/// control surface; `Unsupported` is special-cased by the resource-manager
/// liaison (the mutation stands, the RM call is skipped) and `Fatal` marks a
/// broken invariant rather than a recoverable failure.
#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("experiment in incompatible state {state}")]
    Precondition { state: State },

    #[error("{0}")]
    Unsupported(String),

    #[error("{0}")]
    Internal(String),

    #[error("invariant violation: {0}")]
    Fatal(String),
}

impl ExperimentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<ExperimentError> for Status {
    fn from(err: ExperimentError) -> Self {
        match &err {
            ExperimentError::Validation(_) => Status::invalid_argument(err.to_string()),
            ExperimentError::NotFound(_) => Status::not_found(err.to_string()),
            ExperimentError::Precondition { .. } => Status::failed_precondition(err.to_string()),
            ExperimentError::Unsupported(_) => Status::unimplemented(err.to_string()),
            ExperimentError::Internal(_) | ExperimentError::Fatal(_) => {
                Status::internal(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ExperimentError>;
