use std::any::Any;

use thiserror::Error;

pub type Result<T, E = JsonRpcError> = std::result::Result<T, E>;

/// Errors raised while turning bytes on the wire into frames, or frames into bytes.
///
/// Most of these are specific to one frame and the stream can keep going afterwards; see
/// [`FrameError::is_protocol`].
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame of {length} bytes exceeds the maximum frame size of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error("Stream ended in the middle of a frame; expected {expected} bytes but only {available} arrived")]
    IncompleteFrame { expected: usize, available: usize },

    #[error("Frame payload is not a valid JSON-RPC message: {source}")]
    MalformedPayload { source: serde_json::Error },

    #[error("Error serializing {type_name} to JSON")]
    Serialize {
        source: serde_json::Error,
        type_name: &'static str,
    },

    #[error("I/O error on the underlying stream")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl FrameError {
    /// True if this error concerns the contents of a single frame, and is therefore something that
    /// should be reported to the remote peer as a parse error rather than ending the session.
    pub fn is_protocol(&self) -> bool {
        match self {
            FrameError::FrameTooLarge { .. }
            | FrameError::IncompleteFrame { .. }
            | FrameError::MalformedPayload { .. } => true,
            FrameError::Serialize { .. } | FrameError::Io { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum JsonRpcError {
    #[error(transparent)]
    Frame { source: FrameError },

    #[error("The operation was cancelled")]
    Cancelled,

    #[error("I/O error")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl From<FrameError> for JsonRpcError {
    /// I/O failures are about the stream, not about any particular frame, so they are surfaced as
    /// such rather than as a frame error.
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io { source } => JsonRpcError::Io { source },
            source => JsonRpcError::Frame { source },
        }
    }
}

/// Extract something printable out of the payload of a panic caught with `catch_unwind`.
pub(crate) fn panic_err_to_string(err: Box<dyn Any + Send + 'static>) -> String {
    if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
