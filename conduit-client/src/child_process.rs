use std::fmt;
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tracing::Instrument;

use crate::{ClientError, Result};

/// A server launched as a child process of the host, with its stdio piped.
///
/// The child's stdin and stdout carry the protocol.  Whatever it writes to stderr is logged here
/// line by line.  When this struct is dropped, the child process is killed.
pub struct ChildProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    span: tracing::Span,
}

impl ChildProcess {
    /// Launch the server as a child process described by the given [`Command`].
    ///
    /// This will launch the child process and then immediately return.
    pub async fn spawn(command: Command) -> Result<Self> {
        // Internally we use tokio to manage the process
        let mut command: tokio::process::Command = command.into();

        command
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped());

        let program = command.as_std().get_program().to_string_lossy().to_string();
        let args = command
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().to_string())
            .collect::<Vec<_>>();

        tracing::debug!(%program,
            args = %args.join(" "),
            "Spawning server as child process"
        );

        let spawn_error = |source| ClientError::SpawnServer {
            source,
            program: program.clone(),
            args: args.clone(),
        };

        let mut child = command.spawn().map_err(spawn_error)?;

        let pid = child.id();
        tracing::debug!(pid, "Child process spawned");

        let missing_pipe = |name: &str| spawn_error(std::io::Error::other(format!("child has no {name} pipe")));
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        // The server's diagnostics go to stderr; they are only useful if someone sees them
        tokio::spawn(
            async move {
                let mut lines = BufReader::new(stderr).lines();

                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => tracing::info!("{}", line),
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "Error reading child process stderr");
                            break;
                        }
                    }
                }
            }
            .instrument(tracing::info_span!("child_process_stderr", pid)),
        );

        Ok(Self {
            child,
            stdin,
            stdout,
            span: tracing::info_span!("child_process", pid),
        })
    }

    /// OS process ID of the child, if it hasn't been reaped yet
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) fn into_parts(self) -> (ChildHandle, ChildStdin, ChildStdout, tracing::Span) {
        (ChildHandle { child: self.child }, self.stdin, self.stdout, self.span)
    }
}

impl fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

/// What's left of a [`ChildProcess`] once its pipes have been handed to a connection.
pub(crate) struct ChildHandle {
    child: Child,
}

impl ChildHandle {
    pub(crate) fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub(crate) async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|source| ClientError::Wait { source })
    }

    /// The exit status if the child has already exited, without waiting
    pub(crate) fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        self.child.try_wait().map_err(|source| ClientError::Wait { source })
    }

    /// Give the child `timeout` to exit on its own, then the same again after SIGTERM, then kill
    /// it.
    ///
    /// The child's input should already be closed, since that is how it is asked to exit.
    pub(crate) async fn shutdown(&mut self, timeout: Duration) -> Result<ExitStatus> {
        if let Ok(status) = tokio::time::timeout(timeout, self.wait()).await {
            return status;
        }

        tracing::warn!(pid = self.id(), ?timeout, "Child process still running after its input closed; terminating it");
        match self.terminate() {
            Ok(()) => {
                if let Ok(status) = tokio::time::timeout(timeout, self.wait()).await {
                    return status;
                }
                tracing::warn!(pid = self.id(), ?timeout, "Child process ignored SIGTERM; killing it");
            }
            Err(e) => tracing::warn!(pid = self.id(), error = %e, "Error sending SIGTERM; killing the child process"),
        }

        self.child.start_kill().map_err(|source| ClientError::Kill { source })?;
        self.wait().await
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        match self.child.id() {
            Some(pid) => signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
            // Already reaped
            None => Ok(()),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

/// Tests for this rely on UNIX-specific commands, so on Windows we'll just have to assume this
/// works for now.
#[cfg(all(unix, test))]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn pipes_are_connected() {
        testing::init_test_logging();

        let mut command = Command::new("sh");
        command.arg("-c").arg("echo \"Starting process\" >&2; cat");
        let process = ChildProcess::spawn(command).await.unwrap();
        let (mut child, mut stdin, mut stdout, _span) = process.into_parts();

        stdin.write_all(b"round trip").await.unwrap();
        drop(stdin);

        let mut output = String::new();
        stdout.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "round trip");

        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn spawn_failure_names_the_program() {
        testing::init_test_logging();

        let mut command = Command::new("/definitely/not/a/real/program");
        command.arg("--flag");

        let result = ChildProcess::spawn(command).await;
        assert_matches!(
            result,
            Err(ClientError::SpawnServer { program, args, .. })
                if program == "/definitely/not/a/real/program" && args == vec!["--flag".to_string()]
        );
    }

    #[tokio::test]
    async fn process_is_killed_on_drop() {
        use nix::sys::signal;
        use nix::unistd::Pid;

        testing::init_test_logging();

        let process = ChildProcess::spawn(Command::new("cat")).await.unwrap();
        let pid = process.id().expect("Child should have a valid PID");

        // Send None as the signal to check if process exists without actually sending a signal
        let is_process_running = |pid: u32| -> bool { signal::kill(Pid::from_raw(pid as i32), None).is_ok() };

        assert!(is_process_running(pid), "Process should be running");

        drop(process);

        for _ in 0..1000 {
            if !is_process_running(pid) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(!is_process_running(pid), "Process should be terminated after drop");
    }
}
