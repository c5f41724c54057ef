//! A conduit server meant to be launched by a host as a child process.
//!
//! Requests arrive on stdin and responses leave on stdout, so all logging goes to stderr.  The
//! log filter comes from `RUST_LOG` and defaults to `info`.
use anyhow::Context;
use conduit_jsonrpc::{CancellationToken, JsonRpcError};
use tracing::info;

mod system;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Error starting the tokio runtime")?;

    let result = runtime.block_on(serve());

    // Reading stdin blocks a runtime thread that can't be interrupted, and waiting for it would
    // keep a cancelled server alive until the host happens to write something
    runtime.shutdown_background();

    result
}

async fn serve() -> anyhow::Result<()> {
    let cancellation_token = CancellationToken::new();

    // Installed before serving, so a signal that arrives early isn't fatal
    let shutdown = shutdown_signal().context("Error installing signal handlers")?;
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            shutdown.await;
            info!("Shutdown signal received");
            cancellation_token.cancel();
        }
    });

    let server = system::server();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        methods = ?server.router().methods(),
        "Serving JSON-RPC on stdin and stdout"
    );

    match server.serve_stdio(cancellation_token).await {
        Ok(()) => {
            info!("Host closed stdin; exiting");
            Ok(())
        }
        Err(JsonRpcError::Cancelled) => {
            info!("Cancelled; exiting");
            Ok(())
        }
        Err(e) => Err(e).context("Error serving stdin and stdout"),
    }
}

/// A future that resolves when the process is asked to stop: SIGINT or SIGTERM.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
}
