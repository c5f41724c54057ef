//! The host's end of a connection: sends requests to the server, matches responses to them by
//! id, and hands server events to whoever wants them.
use std::collections::HashMap;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use conduit_jsonrpc::{
    FrameCodec, FrameError, FrameReader, FrameWriter, Id, JsonValue, MAX_FRAME_SIZE, Message, Notification, Request,
    Response,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::child_process::{ChildHandle, ChildProcess};
use crate::{ClientError, Result};

/// Default time a call waits for its response
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time [`Client::close`] gives a child process at each step of shutting it down
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a call that lost its connection waits to learn whether the child process died
const EXIT_GRACE_PERIOD: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// How long [`Client::call`] waits for a response before giving up
    pub default_timeout: Duration,

    /// Largest frame accepted in either direction.  Values above [`MAX_FRAME_SIZE`] are clamped.
    pub max_frame_size: usize,

    /// How long [`Client::close`] waits for a child process to exit after closing its input, and
    /// again after SIGTERM, before killing it
    pub shutdown_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Calls that have been sent and are waiting for a response
#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, oneshot::Sender<Response>>,

    /// Set once the server's output has ended; nothing can be answered after that
    closed: bool,
}

type PendingCallsMap = Arc<Mutex<PendingCalls>>;

/// Aborts the receive loop when the client goes away
struct ReceiveTask(JoinHandle<()>);

impl Drop for ReceiveTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// A connection from the host to a server.
///
/// Calls can be made concurrently from any number of tasks through a shared reference; each one
/// gets its own id and waits only for its own response.
pub struct Client {
    config: ClientConfig,
    writer: FrameWriter,
    pending: PendingCallsMap,
    next_id: AtomicU64,
    events: Mutex<Option<mpsc::UnboundedReceiver<Notification>>>,
    child: Option<AsyncMutex<ChildHandle>>,
    pid: Option<u32>,
    _receive_task: ReceiveTask,
}

impl Client {
    /// Connect to a server that reads from `writer` and writes to `reader`.
    pub fn connect<R, W>(reader: R, writer: W, config: ClientConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::connect_with_span(reader, writer, config, tracing::Span::current())
    }

    /// Launch the server described by `command` as a child process and connect to it over its
    /// stdin and stdout.
    ///
    /// The child process is killed if the client is dropped; use [`Self::close`] to let it exit on
    /// its own.
    pub async fn spawn(command: Command, config: ClientConfig) -> Result<Self> {
        let process = ChildProcess::spawn(command).await?;
        let (child, stdin, stdout, span) = process.into_parts();

        let mut client = Self::connect_with_span(stdout, stdin, config, span);
        client.pid = child.id();
        client.child = Some(AsyncMutex::new(child));
        Ok(client)
    }

    fn connect_with_span<R, W>(reader: R, writer: W, config: ClientConfig, span: tracing::Span) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let writer = FrameWriter::with_codec(writer, FrameCodec::with_max_frame_size(config.max_frame_size));
        let reader = FrameReader::with_codec(reader, FrameCodec::<Message>::with_max_frame_size(config.max_frame_size));

        let pending = PendingCallsMap::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let receive_task = tokio::spawn(receive_loop(reader, pending.clone(), events_tx).instrument(span));

        Self {
            config,
            writer,
            pending,
            next_id: AtomicU64::new(1),
            events: Mutex::new(Some(events_rx)),
            child: None,
            pid: None,
            _receive_task: ReceiveTask(receive_task),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// OS process ID of the server, if it was spawned by [`Self::spawn`]
    pub fn child_id(&self) -> Option<u32> {
        self.pid
    }

    /// How the child process exited, or `None` if it is still running or there is no child
    pub async fn exit_status(&self) -> Result<Option<ExitStatus>> {
        match &self.child {
            Some(child) => child.lock().await.try_wait(),
            None => Ok(None),
        }
    }

    /// Invoke `method` on the server and wait up to the configured default timeout for the result.
    ///
    /// Pass `()` for methods that take no params.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(method, params, self.config.default_timeout).await
    }

    /// Invoke `method` on the server and wait up to `timeout` for the result.
    ///
    /// A call that times out is forgotten; if its response shows up later it is discarded.
    pub async fn call_with_timeout<P, R>(&self, method: &str, params: P, timeout: Duration) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let params = to_params(method, params)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Register before sending, or a quick response could arrive before anyone is waiting
        let (response_tx, response_rx) = oneshot::channel();
        let closed = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if !pending.closed {
                pending.calls.insert(id, response_tx);
            }
            pending.closed
        };
        if closed {
            return Err(self.connection_closed(method).await);
        }

        tracing::debug!(id, %method, "Sending request");
        let request = Request::new(id, method, params);
        if let Err(source) = self.writer.write_frame(&request).await {
            self.forget(id);
            return Err(ClientError::Frame { source });
        }

        let response = match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(self.connection_closed(method).await);
            }
            Err(_) => {
                tracing::debug!(id, %method, ?timeout, "Request timed out");
                self.forget(id);
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        let result = response.into_result()?;
        serde_json::from_value(result).map_err(|source| ClientError::Deserialize {
            method: method.to_string(),
            source,
        })
    }

    /// Send a notification, which the server processes without answering.
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let params = to_params(method, params)?;

        tracing::debug!(%method, "Sending notification");
        self.writer
            .write_frame(&Request::notification(method, params))
            .await
            .map_err(|source| ClientError::Frame { source })
    }

    /// Events sent by the server on its own initiative, in the order they arrived.
    ///
    /// Events are buffered from the moment the client connects.  The receiver can only be taken
    /// once; later calls return `None`.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Number of calls that have been sent and are still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).calls.len()
    }

    /// Close the server's input and, if the server is a child process, wait for it to exit.
    ///
    /// A child that is still running after [`ClientConfig::shutdown_timeout`] is sent SIGTERM, and
    /// one that is still running after another timeout is killed.
    pub async fn close(self) -> Result<Option<ExitStatus>> {
        let Client {
            config, writer, child, ..
        } = self;

        if let Err(e) = writer.close().await {
            tracing::debug!(error = %e, "Error closing the server's input; it may have exited already");
        }

        // Shutting down a child's stdin doesn't close the pipe; only dropping it does
        drop(writer);

        match child {
            Some(child) => {
                let status = child.into_inner().shutdown(config.shutdown_timeout).await?;
                if status.success() {
                    tracing::debug!(%status, "Child process exited");
                } else {
                    tracing::warn!(%status, "Child process exited abnormally");
                }
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// The error for a call that can't be answered because the server's output ended.  If the
    /// server is a child process that died, that is what gets reported.
    async fn connection_closed(&self, method: &str) -> ClientError {
        if let Some(child) = &self.child {
            // The child's stdout closes as it exits, so its status is normally moments away
            let mut child = child.lock().await;
            match tokio::time::timeout(EXIT_GRACE_PERIOD, child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    tracing::warn!(%status, %method, "Server exited abnormally");
                    return ClientError::ServerExited {
                        method: method.to_string(),
                        status,
                    };
                }
                _ => {}
            }
        }

        ClientError::ConnectionClosed {
            method: method.to_string(),
        }
    }

    fn forget(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .calls
            .remove(&id);
    }
}

/// `()` and other values that serialize to `null` mean the request carries no params at all
fn to_params<P: Serialize>(method: &str, params: P) -> Result<Option<JsonValue>> {
    match serde_json::to_value(params) {
        Ok(JsonValue::Null) => Ok(None),
        Ok(params) => Ok(Some(params)),
        Err(source) => {
            tracing::error!(%method, error = %source, "Request params could not be serialized");
            Err(ClientError::Frame {
                source: FrameError::Serialize {
                    source,
                    type_name: "request params",
                },
            })
        }
    }
}

/// Read everything the server sends until its output ends, routing responses to the calls
/// waiting for them and events to the events channel.
async fn receive_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R, Message>,
    pending: PendingCallsMap,
    events_tx: mpsc::UnboundedSender<Notification>,
) {
    loop {
        match reader.read_frame().await {
            Ok(Some(Message::Response(response))) => route_response(&pending, response),
            Ok(Some(Message::Notification(event))) => {
                tracing::trace!(method = %event.method, "Received event");

                // Nobody holding the receiver just means nobody cares about events anymore
                let _ = events_tx.send(event);
            }
            Ok(None) => {
                tracing::debug!("Server closed its output");
                break;
            }
            Err(e) if e.is_protocol() => {
                tracing::warn!(error = %e, "Discarding unreadable frame from server");
            }
            Err(e) => {
                tracing::error!(error = %e, "Error reading from server");
                break;
            }
        }
    }

    // Dropping the senders wakes every waiting call with a closed connection
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    pending.closed = true;
    if !pending.calls.is_empty() {
        tracing::debug!(
            num_pending_calls = pending.calls.len(),
            "Failing pending calls because the connection closed"
        );
    }
    pending.calls.clear();
}

fn route_response(pending: &PendingCallsMap, response: Response) {
    let sender = match &response.id {
        Id::Number(number) => number.as_u64().and_then(|id| {
            pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .calls
                .remove(&id)
        }),
        _ => None,
    };

    match sender {
        Some(sender) => {
            // The caller may have given up in the meantime
            let _ = sender.send(response);
        }
        None => match response.error_details() {
            Some(error) => tracing::warn!(id = %response.id, %error, "Server reported an error for no pending call"),
            None => tracing::warn!(id = %response.id, "Response does not match any pending call; dropping it"),
        },
    }
}
