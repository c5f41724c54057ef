//! The dispatcher: reads requests off one connection, runs their handlers in order, and writes
//! back whatever responses are due.
//!
//! A [`Server`] is just a router plus configuration, and can be bound to any number of
//! connections.  Binding produces a [`Connection`], whose [`Connection::run`] method is the
//! receive/respond loop.
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::error::{FrameError, JsonRpcError, Result};
use crate::frame::{FrameCodec, MAX_FRAME_SIZE};
use crate::handler::{self, InvocationRequest};
use crate::router::Router;
use crate::transport::{FrameReader, FrameWriter};
use crate::types::{self, ErrorCode, ErrorDetails, Id, JsonValue, Notification, Request, Response, ResponsePayload};

/// `data` of the error sent back for requests that aren't valid JSON-RPC 2.0
const INVALID_REQUEST_DETAIL: &str = "jsonrpc must be \"2.0\" and method must be non-empty";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Largest frame accepted from or sent to the peer.  Capped at [`MAX_FRAME_SIZE`].
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

pub struct ServerBuilder<Stage> {
    stage: Stage,
    config: ServerConfig,
}

impl Default for ServerBuilder<Stage1> {
    fn default() -> Self {
        Self {
            stage: Stage1,
            config: ServerConfig::default(),
        }
    }
}

impl<Stage> ServerBuilder<Stage> {
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }
}

impl ServerBuilder<Stage1> {
    pub fn with_state<S: Clone + Send + Sync + 'static>(self, state: S) -> ServerBuilder<Stage2<S>> {
        self.with_router(Router::new_with_state(state))
    }

    pub fn without_state(self) -> ServerBuilder<Stage2<()>> {
        self.with_router(Router::new_stateless())
    }

    pub fn with_router<S: Clone + Send + Sync + 'static>(self, router: Router<S>) -> ServerBuilder<Stage2<S>> {
        ServerBuilder {
            stage: Stage2 { router },
            config: self.config,
        }
    }
}

impl<S: Clone + Send + Sync + 'static> ServerBuilder<Stage2<S>> {
    pub fn with_handler<H, HackT>(self, method: impl Into<String>, handler: H) -> Self
    where
        H: handler::Handler<HackT, S> + 'static,
        HackT: Send + Sync + 'static,
    {
        self.stage.router.register_handler(method, handler);
        self
    }

    pub fn build(self) -> Server<S> {
        Server {
            router: self.stage.router,
            config: self.config,
        }
    }
}

#[doc(hidden)]
pub struct Stage1;

#[doc(hidden)]
pub struct Stage2<S: Clone + Send + Sync + 'static> {
    router: Router<S>,
}

#[derive(Clone)]
pub struct Server<S: Clone + Send + Sync + 'static = ()> {
    router: Router<S>,
    config: ServerConfig,
}

impl Server {
    pub fn builder() -> ServerBuilder<Stage1> {
        ServerBuilder::default()
    }
}

impl<S: Clone + Send + Sync + 'static> Server<S> {
    /// The router shared by every connection this server is bound to.  Handlers registered here
    /// take effect immediately, even on running connections.
    pub fn router(&self) -> &Router<S> {
        &self.router
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Attach the server to a pair of byte streams, such as this process's stdin and stdout.
    ///
    /// Nothing is read or written until [`Connection::run`] is called.
    pub fn bind<R, W>(&self, reader: R, writer: W) -> Connection<S, R>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Send + 'static,
    {
        let max_frame_size = self.config.max_frame_size;
        Connection {
            router: self.router.clone(),
            reader: FrameReader::with_codec(reader, FrameCodec::with_max_frame_size(max_frame_size)),
            writer: FrameWriter::with_codec(writer, FrameCodec::with_max_frame_size(max_frame_size)),
        }
    }

    /// Serve this process's stdin and stdout until the peer closes stdin or `cancellation_token`
    /// is cancelled.
    pub async fn serve_stdio(&self, cancellation_token: CancellationToken) -> Result<()> {
        self.bind(tokio::io::stdin(), tokio::io::stdout())
            .run(cancellation_token)
            .await
    }
}

/// A server bound to one peer.
pub struct Connection<S: Clone + Send + Sync + 'static, R> {
    router: Router<S>,
    reader: FrameReader<R>,
    writer: FrameWriter,
}

impl<S, R> Connection<S, R>
where
    S: Clone + Send + Sync + 'static,
    R: AsyncRead + Unpin + Send,
{
    /// Handle for sending events to the peer, usable from any task and for as long as the
    /// outbound stream stays open.
    pub fn events(&self) -> EventEmitter {
        EventEmitter {
            writer: self.writer.clone(),
        }
    }

    /// Process requests until the peer closes its end of the stream or `cancellation_token` is
    /// cancelled.
    ///
    /// Returns `Ok(())` when the peer closed the stream, [`JsonRpcError::Cancelled`] on
    /// cancellation, and an I/O error if either stream failed.  Frames that can't be decoded are
    /// answered with a parse error and do not end the loop.
    ///
    /// Requests are handled one at a time, in the order they arrive, and each handler runs to
    /// completion before the next frame is read.  Cancellation is only noticed while waiting for a
    /// frame, so a handler that never finishes blocks cancellation too.
    ///
    /// The inbound stream is dropped when this returns.  The outbound stream stays open as long
    /// as any [`EventEmitter`] for this connection exists.
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<()> {
        let Connection {
            router,
            mut reader,
            writer,
        } = self;

        debug!(methods = ?router.methods(), "Connection starting");

        loop {
            let frame = tokio::select! {
                biased;

                _ = cancellation_token.cancelled() => {
                    info!(reason = "cancelled", "Connection stopped");
                    return Err(JsonRpcError::Cancelled);
                }
                frame = reader.read_frame() => frame,
            };

            match frame {
                Ok(Some(request)) => {
                    if let Some(response) = dispatch(&router, request).await {
                        send_response(&writer, response).await?;
                    }
                }
                Ok(None) => {
                    info!(reason = "peer_closed", "Connection stopped");
                    return Ok(());
                }
                Err(e) if e.is_protocol() => {
                    warn!(error = %e, "Failed to decode frame");
                    let response = Response::error(
                        Id::Null,
                        ErrorDetails::parse_error(types::PARSE_ERROR_MSG, json!(e.to_string())),
                    );
                    send_response(&writer, response).await?;
                }
                Err(e) => {
                    return Err(e.into());
                }
            }
        }
    }
}

/// Validate a request and run its handler, returning the response if one is due.
async fn dispatch<S: Clone + Send + Sync + 'static>(router: &Router<S>, request: Request) -> Option<Response> {
    let notification = request.is_notification();
    let span = debug_span!(
        "inbound_request",
        method = %request.method,
        id = %request.id,
        notification
    );

    async move {
        debug!("Request received");

        if !request.is_valid() {
            if notification {
                debug!("Dropping invalid notification");
                return None;
            }

            return Some(Response::error(
                request.id,
                ErrorDetails::invalid_request(types::INVALID_REQUEST_MSG, json!(INVALID_REQUEST_DETAIL)),
            ));
        }

        let id = request.id.clone();
        let payload = router.handle_invocation(InvocationRequest::from(request)).await;

        if notification {
            if let ResponsePayload::Error(types::ErrorResponse { error }) = &payload {
                debug!(code = error.code(), message = %error.message, "Notification failed; nothing sent");
            }
            return None;
        }

        Some(Response {
            jsonrpc: types::TwoPointZero,
            payload,
            id,
        })
    }
    .instrument(span)
    .await
}

/// Write a response.
///
/// A response that can't be framed is replaced by a bare error for the same id: the parse error
/// code if it was already a parse error, an internal error otherwise, and never any `data`.  If
/// even that doesn't fit, nothing is sent.  Only I/O errors are returned.
async fn send_response(writer: &FrameWriter, response: Response) -> Result<()> {
    let e = match writer.write_frame(&response).await {
        Ok(()) => {
            match response.error_details() {
                Some(error) => debug!(id = %response.id, code = error.code(), "Error response sent"),
                None => debug!(id = %response.id, "Response sent"),
            }
            return Ok(());
        }
        Err(e @ FrameError::Io { .. }) => return Err(e.into()),
        Err(e) => e,
    };

    warn!(id = %response.id, error = %e, "Response could not be framed; sending a bare error instead");
    let details = match response.error_details() {
        Some(error) if error.code == ErrorCode::ParseError => {
            ErrorDetails::parse_error(types::PARSE_ERROR_MSG, None)
        }
        _ => ErrorDetails::internal_error(types::INTERNAL_ERROR_MSG, None),
    };
    let code = details.code();
    let fallback = Response::error(response.id, details);

    match writer.write_frame(&fallback).await {
        Ok(()) => {
            debug!(id = %fallback.id, code, "Error response sent");
            Ok(())
        }
        Err(e @ FrameError::Io { .. }) => Err(e.into()),
        Err(e) => {
            warn!(id = %fallback.id, error = %e, "Error response could not be framed either; nothing sent");
            Ok(())
        }
    }
}

/// Sends events (notifications without an id) to the peer of a [`Connection`].
///
/// Events are written through the same lock as responses, so they can be emitted from background
/// tasks at any time without corrupting the stream.
#[derive(Clone, Debug)]
pub struct EventEmitter {
    writer: FrameWriter,
}

impl EventEmitter {
    /// Send an event.  Params that serialize to `null` leave the `params` member out.
    pub async fn emit(&self, method: impl Into<String>, params: impl Serialize) -> Result<()> {
        let params = serde_json::to_value(params).map_err(|source| FrameError::Serialize {
            source,
            type_name: "event params",
        })?;
        // `()` and `None` mean "no params", not `"params": null`
        let params = match params {
            JsonValue::Null => None,
            params => Some(params),
        };
        let notification = Notification::new(method, params);
        debug!(method = %notification.method, "Emitting event");

        self.writer.write_frame(&notification).await?;
        Ok(())
    }
}
