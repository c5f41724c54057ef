use std::process::ExitStatus;
use std::time::Duration;

use conduit_jsonrpc::{ErrorDetails, FrameError};
use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Error spawning '{program}' with args [{args}] as child process",
        args = .args.join(" ")
    )]
    SpawnServer {
        source: std::io::Error,
        program: String,
        args: Vec<String>,
    },

    #[error("Error writing to the server")]
    Frame { source: FrameError },

    /// The server answered with a JSON-RPC error
    #[error(transparent)]
    Remote(#[from] ErrorDetails),

    #[error("No response to '{method}' within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("The connection to the server closed before '{method}' was answered")]
    ConnectionClosed { method: String },

    #[error("Error deserializing the result of '{method}'")]
    Deserialize {
        method: String,
        source: serde_json::Error,
    },

    #[error("The server exited with {status} before '{method}' was answered")]
    ServerExited { method: String, status: ExitStatus },

    #[error("Error waiting for the child process to exit")]
    Wait { source: std::io::Error },

    #[error("Error stopping the child process")]
    Kill { source: std::io::Error },
}

impl ClientError {
    /// The JSON-RPC error the server answered with, if that is what this is
    pub fn remote_details(&self) -> Option<&ErrorDetails> {
        match self {
            ClientError::Remote(details) => Some(details),
            _ => None,
        }
    }
}
