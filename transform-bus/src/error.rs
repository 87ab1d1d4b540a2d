use thiserror::Error;

use crate::session::SessionState;
use crate::transform::{Codec, ControlMessage, Role};

/// Failure reported by a transform adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("media type rejected: {0}")]
    TypeRejected(String),

    #[error("operation not supported by this transform")]
    Unsupported,

    #[error("transform is not accepting input")]
    NotAccepting,

    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    #[error("platform error: {0}")]
    Platform(String),
}

/// Failure of a session operation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("no {role} transform available for {codec}")]
    NoTransformAvailable { role: Role, codec: Codec },

    #[error("{operation} is not valid while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("empty buffer")]
    EmptyBuffer,

    #[error("frame is {got_width}x{got_height}, session expects {width}x{height}")]
    DimensionMismatch {
        got_width: u32,
        got_height: u32,
        width: u32,
        height: u32,
    },

    #[error("transform is not accepting input, pop outputs and retry")]
    NotAccepting,

    #[error("transform rejected {message:?}: {source}")]
    TransformSignalRejected {
        message: ControlMessage,
        source: TransformError,
    },

    #[error("pixel conversion failed: {0}")]
    ConversionFailed(String),

    #[error("media platform startup failed: {0}")]
    PlatformStartup(#[source] TransformError),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
