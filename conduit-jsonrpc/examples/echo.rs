//! Very simple example in which the JSON-RPC "server" has a method `echo`, which returns in a
//! response any JSON content sent to it by the host.
//!
//! The host side here is written against the raw frame reader and writer, to show what actually
//! crosses the pipe.
use conduit_jsonrpc::{CancellationToken, FrameReader, FrameWriter, Message, RawParams, Request, Server};
use serde_json::json;
use tokio::io::duplex;

#[tokio::main]
async fn main() {
    // Two pipes, the way a child process has a stdin and a stdout
    let (host_writer, server_reader) = duplex(64 * 1024);
    let (server_writer, host_reader) = duplex(64 * 1024);

    let server = Server::builder()
        .without_state()
        .with_handler("echo", |RawParams(params): RawParams| async move { params.unwrap_or_default() })
        .build();

    let connection = server.bind(server_reader, server_writer);
    let cancel = CancellationToken::new();
    let server_task = tokio::spawn(connection.run(cancel.clone()));

    let writer = FrameWriter::new(host_writer);
    let mut reader = FrameReader::<_, Message>::new(host_reader);

    for (id, params) in [json!("Hello, world!"), json!({ "foo": "bar" }), json!([1, 2, 3])]
        .into_iter()
        .enumerate()
    {
        writer
            .write_frame(Request::new(id as u64, "echo", params.clone()))
            .await
            .unwrap();

        match reader.read_frame().await.unwrap() {
            Some(Message::Response(response)) => {
                println!("{id}: {}", serde_json::to_string(&response).unwrap());
                assert_eq!(response.into_result().unwrap(), params);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    // Closing the server's input ends the connection cleanly
    writer.close().await.unwrap();
    server_task.await.unwrap().unwrap();
}
