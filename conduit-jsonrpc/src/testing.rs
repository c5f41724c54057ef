//! Helpers for testing the JSON RPC implementation.
//!
//! This module is only compiled when `test` is enabled, and is also pulled into the integration
//! tests by path, so it must not refer to anything in this crate.
use tokio::io::{DuplexStream, duplex};

/// Size of the in-memory pipes that stand in for a child's stdin and stdout
const PIPE_CAPACITY: usize = 256 * 1024;

/// Initialize tracing with a subscriber and some reasonable defaults suitable for enabling log
/// output in tests.
///
/// This is idempotent; it can be called from multiple tests in multiple threads but will only
/// initialize tracing once.
pub fn init_test_logging() {
    use std::sync::OnceLock;

    const DEFAULT_LOG_FILTER: &str = "trace";
    static INIT_LOGGING: OnceLock<()> = OnceLock::new();

    INIT_LOGGING.get_or_init(|| {
        // Another test binary helper may have beaten us to it; that's fine
        let _ = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
            .with_test_writer()
            .try_init();
    });
}

/// The two ends of a simulated child process's stdio.
pub struct TestPipes {
    /// Host writes requests here (the child's stdin)
    pub host_writer: DuplexStream,
    /// Host reads responses and events here (the child's stdout)
    pub host_reader: DuplexStream,
    /// Server reads requests here
    pub server_reader: DuplexStream,
    /// Server writes responses and events here
    pub server_writer: DuplexStream,
}

/// Create a pair of in-memory pipes connecting a host to a server.
pub fn setup_test_pipes() -> TestPipes {
    let (host_writer, server_reader) = duplex(PIPE_CAPACITY);
    let (server_writer, host_reader) = duplex(PIPE_CAPACITY);

    TestPipes {
        host_writer,
        host_reader,
        server_reader,
        server_writer,
    }
}
