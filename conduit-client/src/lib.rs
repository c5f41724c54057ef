//! The host side of a conduit connection.
//!
//! A host launches its helper as a child process with [`Client::spawn`], then makes calls on it
//! with [`Client::call`] and listens for the events it sends with [`Client::events`].  The wire
//! format is the one implemented in [`conduit_jsonrpc`].
mod child_process;
mod client;
mod error;
#[cfg(test)]
mod testing;

pub use child_process::ChildProcess;
pub use client::{Client, ClientConfig, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TIMEOUT};
pub use error::{ClientError, Result};
