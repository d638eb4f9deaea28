use thiserror::Error;

use crate::proto::StatusCode;

#[derive(Debug, Error)]
pub enum AcnError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("invalid proof of representation: {0}")]
    InvalidPor(String),

    #[error("agent not ready: {0}")]
    AgentNotReady(String),

    #[error("unknown agent address: {0}")]
    UnknownAgentAddress(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("record store corrupt at byte {offset}: {reason}")]
    CorruptStore { offset: u64, reason: String },

    #[error("remote peer reported {code:?}: {detail}")]
    Remote { code: StatusCode, detail: String },

    #[error("peer already shut down")]
    Shutdown,

    #[error("{0}")]
    Generic(String),
}

impl AcnError {
    /// The status code reported to the remote side for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AcnError::Serialization(_) => StatusCode::ErrorSerialization,
            AcnError::UnexpectedPayload(_) => StatusCode::ErrorUnexpectedPayload,
            AcnError::AgentNotFound(_) | AcnError::UnknownAgentAddress(_) => {
                StatusCode::ErrorUnknownAgentAddress
            }
            AcnError::InvalidPor(_) => StatusCode::ErrorInvalidPor,
            AcnError::AgentNotReady(_) => StatusCode::ErrorAgentNotReady,
            _ => StatusCode::ErrorGeneric,
        }
    }

    /// Map a non-success remote status back to an error.
    pub fn from_status(code: StatusCode, msgs: &[String]) -> Self {
        let detail = msgs.join("; ");
        match code {
            StatusCode::Success => AcnError::Generic("success is not an error".into()),
            StatusCode::ErrorSerialization => AcnError::Serialization(detail),
            StatusCode::ErrorUnexpectedPayload => AcnError::UnexpectedPayload(detail),
            StatusCode::ErrorUnknownAgentAddress => AcnError::UnknownAgentAddress(detail),
            StatusCode::ErrorInvalidPor => AcnError::InvalidPor(detail),
            StatusCode::ErrorAgentNotReady => AcnError::AgentNotReady(detail),
            StatusCode::ErrorGeneric => AcnError::Remote { code, detail },
        }
    }
}
