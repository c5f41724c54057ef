//! Integration tests to exercise the JSON-RPC crate using its public interface.

/// Fun hack to avoid duplication: the `testing` module in the `jsonrpc` crate is only enabled in
/// `test` config, and when running integration tests like this one the crate is compiled without
/// `test` enabled.  But we need to use the same test helpers, so just include that module in this
/// test program as well.
#[path = "../src/testing.rs"]
mod test_helpers;
mod test_service;

use std::time::Duration;

use assert_matches::assert_matches;
use conduit_jsonrpc::{
    CancellationToken, ErrorCode, ErrorDetails, FrameReader, FrameWriter, Id, Json, JsonRpcError, JsonValue, Message,
    Notification, Params, Request, Response, ResponsePayload, Server, ServerConfig,
};
use serde_json::json;
use test_helpers::TestPipes;
use test_service::{AddParams, GetValueParams, RecordNotificationParams, SetValueParams};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

/// The host end of a connection to a server running the test service
struct TestHost {
    writer: FrameWriter,
    reader: FrameReader<DuplexStream, Message>,
    next_id: u64,
}

impl TestHost {
    fn new(pipes_host_writer: DuplexStream, pipes_host_reader: DuplexStream) -> Self {
        Self {
            writer: FrameWriter::new(pipes_host_writer),
            reader: FrameReader::new(pipes_host_reader),
            next_id: 1,
        }
    }

    async fn receive(&mut self) -> Message {
        tokio::time::timeout(TIMEOUT, self.reader.read_frame())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
            .expect("server closed its output")
    }

    async fn call(&mut self, method: &str, params: impl serde::Serialize) -> Result<JsonValue, ErrorDetails> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request::new(id, method, to_params(params));
        self.writer.write_frame(&request).await.unwrap();

        match self.receive().await {
            Message::Response(response) => {
                assert_eq!(response.id, Id::from(id));
                response.into_result()
            }
            other => panic!("expected a response to {method}, got {other:?}"),
        }
    }

    async fn notify(&mut self, method: &str, params: impl serde::Serialize) {
        let request = Request::notification(method, to_params(params));
        self.writer.write_frame(&request).await.unwrap();
    }
}

/// `()` means "no params at all" rather than a `null` params member
fn to_params(params: impl serde::Serialize) -> Option<JsonValue> {
    match serde_json::to_value(params).unwrap() {
        JsonValue::Null => None,
        params => Some(params),
    }
}

fn start_test_service() -> (TestHost, CancellationToken, JoinHandle<conduit_jsonrpc::Result<()>>) {
    test_helpers::init_test_logging();

    let TestPipes {
        host_writer,
        host_reader,
        server_reader,
        server_writer,
    } = test_helpers::setup_test_pipes();

    let server = test_service::test_service_server();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(server.bind(server_reader, server_writer).run(cancel.clone()));

    (TestHost::new(host_writer, host_reader), cancel, task)
}

/// Exercise the test service with a variety of operations, as conventional method calls and
/// notifications
#[tokio::test]
async fn client_server_service_test() {
    let (mut host, _cancel, _task) = start_test_service();

    assert_eq!(host.call("system.ping", ()).await, Ok(json!("pong")));

    // Counter operations
    assert_eq!(host.call("get_counter", ()).await, Ok(json!(0)));
    assert_eq!(host.call("increment_counter", ()).await, Ok(json!(1)));
    assert_eq!(host.call("get_counter", ()).await, Ok(json!(1)));

    // Value storage and retrieval
    let set = SetValueParams {
        key: "theme".to_string(),
        value: json!({"dark": true}),
    };
    assert_eq!(host.call("set_value", set).await, Ok(JsonValue::Null));

    let get = GetValueParams {
        key: "theme".to_string(),
    };
    assert_eq!(host.call("get_value", get).await, Ok(json!({"dark": true})));

    let missing = GetValueParams {
        key: "missing".to_string(),
    };
    assert_eq!(host.call("get_value", missing).await, Ok(JsonValue::Null));

    // Notifications are processed but not answered; the next frame is the answer to the next call
    assert_eq!(host.call("get_last_notification", ()).await, Ok(JsonValue::Null));
    host.notify(
        "record_notification",
        RecordNotificationParams {
            message: "hello".to_string(),
        },
    )
    .await;
    assert_eq!(host.call("get_last_notification", ()).await, Ok(json!("hello")));

    assert_eq!(host.call("add", AddParams { a: 40, b: 2 }).await, Ok(json!(42)));
}

#[tokio::test]
async fn method_errors() {
    let (mut host, _cancel, _task) = start_test_service();

    let err = host.call("nonexistent_method", ()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::MethodNotFound);
    assert_eq!(err.data, Some(json!("nonexistent_method")));

    let err = host.call("fail_with_error", ()).await.unwrap_err();
    assert_eq!(err.code(), -32001);
    assert_eq!(err.message, "Test error");

    let err = host.call("fail_with_panic", ()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InternalError);

    let err = host.call("add", json!({"a": 1})).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);

    // None of that killed the session
    assert_eq!(host.call("system.ping", ()).await, Ok(json!("pong")));
}

#[tokio::test]
async fn events_from_background_tasks() {
    test_helpers::init_test_logging();
    let TestPipes {
        host_writer,
        host_reader,
        server_reader,
        server_writer,
    } = test_helpers::setup_test_pipes();

    let server = test_service::test_service_server();
    let connection = server.bind(server_reader, server_writer);

    // A monitor that reports on its own schedule, unrelated to any request
    let events = connection.events();
    let monitor = tokio::spawn(async move {
        for tick in 0..20 {
            events.emit("monitor.tick", json!({"tick": tick})).await.unwrap();
            tokio::task::yield_now().await;
        }
    });

    let cancel = CancellationToken::new();
    let _task = tokio::spawn(connection.run(cancel.clone()));
    let mut host = TestHost::new(host_writer, host_reader);

    for id in 1..=20u64 {
        host.writer
            .write_frame(Request::new(id, "system.ping", None::<JsonValue>))
            .await
            .unwrap();
    }

    let mut ticks = Vec::new();
    let mut response_ids = Vec::new();
    while ticks.len() < 20 || response_ids.len() < 20 {
        match host.receive().await {
            Message::Notification(Notification { method, params, .. }) => {
                assert_eq!(method, "monitor.tick");
                ticks.push(params.unwrap()["tick"].as_u64().unwrap());
            }
            Message::Response(Response { id, payload, .. }) => {
                assert_eq!(payload, ResponsePayload::success(json!("pong")));
                response_ids.push(id);
            }
        }
    }
    monitor.await.unwrap();

    // Both streams arrive complete and each in its own order
    assert_eq!(ticks, (0..20).collect::<Vec<u64>>());
    assert_eq!(response_ids, (1..=20u64).map(Id::from).collect::<Vec<_>>());
}

#[tokio::test]
async fn handlers_registered_while_running() {
    test_helpers::init_test_logging();
    let TestPipes {
        host_writer,
        host_reader,
        server_reader,
        server_writer,
    } = test_helpers::setup_test_pipes();

    let server = Server::builder().without_state().build();
    let _task = tokio::spawn(server.bind(server_reader, server_writer).run(CancellationToken::new()));
    let mut host = TestHost::new(host_writer, host_reader);

    let err = host.call("late", ()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::MethodNotFound);

    server.router().register_handler("late", || async { Json("better late than never") });
    assert_eq!(host.call("late", ()).await, Ok(json!("better late than never")));
}

#[tokio::test]
async fn connections_share_server_state() {
    test_helpers::init_test_logging();
    let server = test_service::test_service_server();

    let mut hosts = Vec::new();
    for _ in 0..2 {
        let pipes = test_helpers::setup_test_pipes();
        tokio::spawn(
            server
                .bind(pipes.server_reader, pipes.server_writer)
                .run(CancellationToken::new()),
        );
        hosts.push(TestHost::new(pipes.host_writer, pipes.host_reader));
    }

    assert_eq!(hosts[0].call("increment_counter", ()).await, Ok(json!(1)));
    assert_eq!(hosts[1].call("increment_counter", ()).await, Ok(json!(2)));
    assert_eq!(hosts[0].call("get_counter", ()).await, Ok(json!(2)));
}

#[tokio::test]
async fn shutdown_paths() {
    // Peer closing its end is a clean shutdown
    let (host, _cancel, task) = start_test_service();
    drop(host);
    assert_matches!(tokio::time::timeout(TIMEOUT, task).await, Ok(Ok(Ok(()))));

    // Cancellation while the server waits for input
    let (_host, cancel, task) = start_test_service();
    cancel.cancel();
    assert_matches!(
        tokio::time::timeout(TIMEOUT, task).await,
        Ok(Ok(Err(JsonRpcError::Cancelled)))
    );
}

#[tokio::test]
async fn configured_frame_limit() {
    test_helpers::init_test_logging();
    let TestPipes {
        host_writer,
        host_reader,
        server_reader,
        server_writer,
    } = test_helpers::setup_test_pipes();

    let server = Server::builder()
        .with_config(ServerConfig { max_frame_size: 128 })
        .without_state()
        .with_handler("repeat", |Params(count): Params<usize>| async move { Json("z".repeat(count)) })
        .build();
    let _task = tokio::spawn(server.bind(server_reader, server_writer).run(CancellationToken::new()));
    let mut host = TestHost::new(host_writer, host_reader);

    assert_eq!(host.call("repeat", 3).await, Ok(json!("zzz")));

    // The request fits, but the response wouldn't fit in a frame
    let err = host.call("repeat", 500).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InternalError);
    assert_eq!(err.data, None);

    // The connection is still in sync
    assert_eq!(host.call("repeat", 1).await, Ok(json!("z")));
}
