//! JSON-RPC 2.0 over a pair of byte streams, with each message carried in a length-prefixed
//! frame.
//!
//! This is the protocol a host application uses to talk to a helper child process over the
//! child's stdin and stdout.  The child runs a [`Server`]: it registers a handler per method name,
//! binds to its stdio, and answers requests one at a time until the host closes the pipe.  The
//! host side lives in the `conduit-client` crate, which is built on the same [`frame`] codec and
//! [`types`].
//!
//! The request/response model borrows heavily from the
//! [`jsonrpsee`](https://github.com/paritytech/jsonrpsee) project, and the handler machinery from
//! `axum`.

mod error;
pub mod frame;
mod handler;
mod router;
mod server;
#[cfg(test)]
pub mod testing;
mod transport;
pub mod types;

pub use error::{FrameError, JsonRpcError, Result};
pub use frame::{FrameCodec, MAX_FRAME_SIZE};
pub use handler::{
    FromRequest, Handler, HandlerError, IntoResponse, InvocationRequest, Json, MethodName, Params, RawParams, State,
};
pub use router::Router;
pub use server::{Connection, EventEmitter, Server, ServerBuilder, ServerConfig};
pub use transport::{FrameReader, FrameWriter};
pub use types::{
    ErrorCode, ErrorDetails, ErrorResponse, Id, JsonValue, Message, Notification, Request, Response, ResponsePayload,
    SuccessResponse, TwoPointZero,
};

/// Re-exported so that users don't need their own dependency on `tokio-util` just to stop a
/// connection.
pub use tokio_util::sync::CancellationToken;
