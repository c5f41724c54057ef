//! Built-in `system.*` methods every conduit server answers, so a host can check that the child it
//! launched is alive and what build it is talking to.
use conduit_jsonrpc::{Json, Params, Server};
use serde::{Deserialize, Serialize};

/// Git commit the binary was built from, if the build provided one
const COMMIT: &str = match option_env!("CONDUIT_COMMIT") {
    Some(commit) => commit,
    None => "none",
};

const BUILD_DATE: &str = match option_env!("CONDUIT_BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EchoParams {
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub commit: String,
    pub date: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: COMMIT.to_string(),
            date: BUILD_DATE.to_string(),
        }
    }
}

/// A server with the `system.*` methods registered
pub fn server() -> Server {
    Server::builder()
        .without_state()
        .with_handler("system.ping", ping)
        .with_handler("system.echo", echo)
        .with_handler("system.version", version)
        .build()
}

async fn ping() -> Json<&'static str> {
    Json("pong")
}

async fn echo(Params(params): Params<Option<EchoParams>>) -> Json<EchoParams> {
    Json(params.unwrap_or_default())
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo::current())
}
