use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use conduit_jsonrpc::{ErrorDetails, Id, Json, JsonValue, MethodName, Params, RawParams, Router, Server, State};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// A test service built using the JSON-RPC crate. Its internal implementation matches the
/// expected behavior reflected in the `testdata/` folder, and thus it can be used to exercise the
/// JSON RPC implementation end-to-end
#[derive(Debug, Default)]
pub struct TestState {
    counter: i32,
    values: HashMap<String, JsonValue>,
    last_notification: Option<String>,
}

pub type SharedState = Arc<Mutex<TestState>>;

/// Create a router that has the method and notification handlers that make up the "test service".
pub fn test_service_router() -> Router<SharedState> {
    let router = Router::new_with_state(Arc::new(Mutex::new(TestState::default())));

    router.register_handler("system.ping", ping);
    router.register_handler("echo", echo);
    router.register_handler("add", add);
    router.register_handler("whoami", whoami);
    router.register_handler("increment_counter", increment_counter);
    router.register_handler("get_counter", get_counter);
    router.register_handler("get_value", get_value);
    router.register_handler("set_value", set_value);
    router.register_handler("record_notification", record_notification);
    router.register_handler("get_last_notification", get_last_notification);
    router.register_handler("fail_with_error", fail_with_error);
    router.register_handler("fail_with_anyhow", fail_with_anyhow);
    router.register_handler("fail_with_panic", fail_with_panic);

    router
}

pub fn test_service_server() -> Server<SharedState> {
    Server::builder().with_router(test_service_router()).build()
}

async fn ping() -> Json<&'static str> {
    Json("pong")
}

async fn echo(RawParams(params): RawParams) -> JsonValue {
    params.unwrap_or_default()
}

#[derive(Serialize, Deserialize)]
pub struct AddParams {
    pub a: i64,
    pub b: i64,
}

async fn add(Params(AddParams { a, b }): Params<AddParams>) -> Json<i64> {
    Json(a + b)
}

/// Reports how it was invoked
async fn whoami(MethodName(method): MethodName, id: Option<Id>) -> JsonValue {
    serde_json::json!({
        "method": method,
        "id": id,
    })
}

async fn increment_counter(State(state): State<SharedState>) -> Json<i32> {
    let mut state = state.lock().await;
    state.counter += 1;
    Json(state.counter)
}

async fn get_counter(State(state): State<SharedState>) -> Json<i32> {
    let state = state.lock().await;
    Json(state.counter)
}

#[derive(Serialize, Deserialize)]
pub struct SetValueParams {
    pub key: String,
    pub value: JsonValue,
}

async fn set_value(
    State(state): State<SharedState>,
    Params(SetValueParams { key, value }): Params<SetValueParams>,
) {
    let mut state = state.lock().await;
    state.values.insert(key, value);
}

#[derive(Serialize, Deserialize)]
pub struct GetValueParams {
    pub key: String,
}

async fn get_value(
    State(state): State<SharedState>,
    Params(GetValueParams { key }): Params<GetValueParams>,
) -> JsonValue {
    let state = state.lock().await;
    state.values.get(&key).cloned().unwrap_or(JsonValue::Null)
}

#[derive(Serialize, Deserialize)]
pub struct RecordNotificationParams {
    pub message: String,
}

async fn record_notification(
    State(state): State<SharedState>,
    Params(RecordNotificationParams { message }): Params<RecordNotificationParams>,
) {
    let mut state = state.lock().await;
    state.last_notification = Some(message);
}

async fn get_last_notification(State(state): State<SharedState>) -> Json<Option<String>> {
    let state = state.lock().await;
    Json(state.last_notification.clone())
}

/// Always fail with a specific error that the caller can verify
async fn fail_with_error() -> Result<(), ErrorDetails> {
    Err(ErrorDetails::server_error(
        -32001,
        "Test error",
        serde_json::json!({"detail": "as requested"}),
    ))
}

/// Fail with an error that carries no JSON-RPC specifics
async fn fail_with_anyhow() -> anyhow::Result<JsonValue> {
    Err(std::io::Error::other("disk on fire")).context("saving settings")
}

/// Always panic to exercise the panic handler
async fn fail_with_panic() -> Result<(), ErrorDetails> {
    panic!("OMG we're all gonna die!")
}
