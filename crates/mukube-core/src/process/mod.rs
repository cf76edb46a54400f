//! Process management module.
//!
//! Spawns the external daemon binaries, streams their output to a caller
//! supplied handler and reports their exit. Children are detached into their
//! own process group so that a signal delivered to the supervisor's process
//! group does not cascade into them; instead, every child installs a one-shot
//! interrupt listener that kills it when the host receives SIGINT or SIGTERM
//! before the child has exited.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use nix::unistd::{setpgid, Pid};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Handler invoked with each chunk of child stdout/stderr.
pub type OutputHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handler invoked exactly once when the child exits.
///
/// `success` is `true` iff the OS reported a zero exit status. The raw status
/// is passed along when the child could be reaped.
pub type ExitHandler = Arc<dyn Fn(bool, Option<ExitStatus>) + Send + Sync>;

/// Size of the read buffer used by the pipe reader tasks.
const READ_BUF_SIZE: usize = 256;

/// Error types for process operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Failed to spawn the child process.
    #[error("failed to spawn {binary}: {source}")]
    SpawnFailed {
        /// Binary that could not be spawned.
        binary: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The child was spawned but its pipes could not be taken.
    #[error("failed to capture output of {0}")]
    PipeUnavailable(PathBuf),
}

/// Handle to a spawned child process.
///
/// Dropping the handle does not affect the child; call [`ChildProcess::stop`]
/// to terminate it. The exit handler passed to [`spawn`] fires regardless of
/// how the child ends.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    /// OS process ID of the child.
    pid: u32,
    /// Cancelled to request termination. Safe to cancel more than once and
    /// after the child has already exited.
    stop: CancellationToken,
}

impl ChildProcess {
    /// OS process ID of the child.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Request termination of the child.
    ///
    /// Idempotent: calling this on an already-exited child is a no-op.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Spawn `command` with `args`, placing the child in a fresh process group.
///
/// Two background tasks read stdout and stderr in chunks of at most 256
/// bytes and pass every non-empty chunk to `output`. A third task waits for
/// the child and invokes `exit` with the outcome; it also listens for
/// SIGINT/SIGTERM and kills the child if the host is interrupted first. The
/// listener is dropped as soon as the child exits.
///
/// # Errors
///
/// Returns [`ProcessError::SpawnFailed`] if the binary cannot be executed and
/// [`ProcessError::PipeUnavailable`] if its output pipes cannot be captured.
pub fn spawn(
    command: &Path,
    args: &[String],
    output: OutputHandler,
    exit: ExitHandler,
) -> Result<ChildProcess, ProcessError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    // Detach into a fresh process group so signals aimed at the supervisor's
    // group do not reach the child directly.
    unsafe {
        cmd.pre_exec(|| {
            setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|source| ProcessError::SpawnFailed {
        binary: command.to_path_buf(),
        source,
    })?;

    let pid = child
        .id()
        .ok_or_else(|| ProcessError::PipeUnavailable(command.to_path_buf()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::PipeUnavailable(command.to_path_buf()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcessError::PipeUnavailable(command.to_path_buf()))?;

    tokio::spawn(read_pipe(stdout, output.clone()));
    tokio::spawn(read_pipe(stderr, output));

    let stop = CancellationToken::new();
    let waiter_stop = stop.clone();
    tokio::spawn(async move {
        let status = wait_for_exit(&mut child, &waiter_stop).await;
        match status {
            Ok(status) => exit(status.success(), Some(status)),
            Err(_) => exit(false, None),
        }
    });

    Ok(ChildProcess { pid, stop })
}

/// Wait for the child to exit, killing it first if either the stop token is
/// cancelled or the host receives an interrupt.
async fn wait_for_exit(
    child: &mut tokio::process::Child,
    stop: &CancellationToken,
) -> std::io::Result<ExitStatus> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        status = child.wait() => status,
        _ = stop.cancelled() => kill_and_reap(child).await,
        _ = sigint.recv() => kill_and_reap(child).await,
        _ = sigterm.recv() => kill_and_reap(child).await,
    }
}

async fn kill_and_reap(child: &mut tokio::process::Child) -> std::io::Result<ExitStatus> {
    // start_kill only fails if the child is already gone; wait() reaps either
    // way.
    let _ = child.start_kill();
    child.wait().await
}

/// Pump one pipe into the output handler until EOF.
async fn read_pipe<R>(mut pipe: R, output: OutputHandler)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => output(&buf[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn collecting_output() -> (OutputHandler, Arc<Mutex<Vec<u8>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&collected);
        let handler: OutputHandler = Arc::new(move |chunk: &[u8]| {
            sink.lock().unwrap().extend_from_slice(chunk);
        });
        (handler, collected)
    }

    fn exit_channel() -> (ExitHandler, tokio::sync::mpsc::UnboundedReceiver<bool>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let handler: ExitHandler = Arc::new(move |success, _status| {
            let _ = tx.send(success);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_spawn_reports_output_and_clean_exit() {
        let (output, collected) = collecting_output();
        let (exit, mut exit_rx) = exit_channel();

        let child = spawn(
            Path::new("sh"),
            &["-c".to_string(), "echo hello".to_string()],
            output,
            exit,
        )
        .unwrap();
        assert!(child.pid() > 0);

        let success = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(success);

        // Readers race the exit notification; give them a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let collected = collected.lock().unwrap().clone();
        assert_eq!(String::from_utf8_lossy(&collected), "hello\n");
    }

    #[tokio::test]
    async fn test_spawn_reports_failing_exit() {
        let (output, _) = collecting_output();
        let (exit, mut exit_rx) = exit_channel();

        spawn(
            Path::new("sh"),
            &["-c".to_string(), "exit 3".to_string()],
            output,
            exit,
        )
        .unwrap();

        let success = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!success);
    }

    #[tokio::test]
    async fn test_stop_kills_child_and_is_idempotent() {
        let (output, _) = collecting_output();
        let (exit, mut exit_rx) = exit_channel();

        let child = spawn(Path::new("sleep"), &["30".to_string()], output, exit).unwrap();
        child.stop();

        let success = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!success);

        // Stopping an already-exited child is a no-op.
        child.stop();
    }

    #[tokio::test]
    async fn test_spawn_invalid_binary() {
        let (output, _) = collecting_output();
        let (exit, _exit_rx) = exit_channel();

        let result = spawn(
            Path::new("nonexistent_binary_54321"),
            &[],
            output,
            exit,
        );
        assert!(matches!(result, Err(ProcessError::SpawnFailed { .. })));
    }
}
