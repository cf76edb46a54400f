//! Supervision module.
//!
//! One supervisor owns one external daemon: it spawns the child, probes its
//! health endpoint, and on unexpected exit either restarts it (while the
//! retry budget lasts) or hands the exit to the caller's terminal exit
//! handler.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{error, warn};

use crate::health::{self, BodyValidator, HealthMessage, ProbeTls};
use crate::process::{self, ChildProcess, ExitHandler, OutputHandler, ProcessError};

/// Pause between periodic health probes.
const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Specification of one supervised daemon.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    /// Human-readable daemon name, also the log application name.
    pub name: String,
    /// Binary to execute.
    pub command: PathBuf,
    /// Arguments, exactly as handed to the binary.
    pub args: Vec<String>,
    /// Health endpoint probed after start and during steady state.
    pub health_url: String,
    /// How to decode the health response body.
    pub validator: BodyValidator,
    /// TLS material for the probe; `None` probes over plaintext.
    pub tls: Option<ProbeTls>,
    /// Restart budget: number of starts before an exit becomes terminal.
    pub retries: u32,
}

impl ServiceSpec {
    /// Create a new builder for `ServiceSpec`.
    #[must_use]
    pub fn builder() -> ServiceSpecBuilder {
        ServiceSpecBuilder::default()
    }
}

/// Builder for [`ServiceSpec`].
#[derive(Debug, Default)]
pub struct ServiceSpecBuilder {
    name: Option<String>,
    command: Option<PathBuf>,
    args: Vec<String>,
    health_url: Option<String>,
    validator: Option<BodyValidator>,
    tls: Option<ProbeTls>,
    retries: Option<u32>,
}

impl ServiceSpecBuilder {
    /// Set the daemon name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the binary to execute.
    #[must_use]
    pub fn command(mut self, command: impl Into<PathBuf>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Set the argument list.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the health endpoint.
    #[must_use]
    pub fn health_url(mut self, url: impl Into<String>) -> Self {
        self.health_url = Some(url.into());
        self
    }

    /// Set the health body validator.
    #[must_use]
    pub const fn validator(mut self, validator: BodyValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Set the probe TLS material.
    #[must_use]
    pub fn tls(mut self, tls: ProbeTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the restart budget.
    #[must_use]
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Build the `ServiceSpec`.
    ///
    /// # Panics
    ///
    /// Panics if `name`, `command` or `health_url` is not set.
    #[must_use]
    pub fn build(self) -> ServiceSpec {
        ServiceSpec {
            name: self.name.expect("name is required"),
            command: self.command.expect("command is required"),
            args: self.args,
            health_url: self.health_url.expect("health_url is required"),
            validator: self.validator.unwrap_or(BodyValidator::PlainOk),
            tls: self.tls,
            retries: self.retries.unwrap_or(1),
        }
    }
}

/// Supervisor of one external daemon.
///
/// Cheap to clone; all clones share the same supervised child.
#[derive(Debug, Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    spec: ServiceSpec,
    output: OutputHandler,
    /// Terminal exit handler, invoked once the retry budget is exhausted.
    exit: ExitHandler,
    /// The currently running child, if any.
    child: Mutex<Option<ChildProcess>>,
    /// Remaining starts before an exit becomes terminal.
    retries_left: AtomicU32,
    /// Single-shot guard: is a probe loop currently running?
    probe_running: AtomicBool,
    /// Signalled by `stop` to unblock the probe loop between probes.
    probe_quit: Notify,
}

impl std::fmt::Debug for SupervisorInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorInner")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Create a supervisor for `spec`.
    ///
    /// `output` receives every chunk of child output; `exit` fires exactly
    /// once when the child exits with no retry budget left.
    #[must_use]
    pub fn new(spec: ServiceSpec, output: OutputHandler, exit: ExitHandler) -> Self {
        let retries = spec.retries;
        Self {
            inner: Arc::new(SupervisorInner {
                spec,
                output,
                exit,
                child: Mutex::new(None),
                retries_left: AtomicU32::new(retries),
                probe_running: AtomicBool::new(false),
                probe_quit: Notify::new(),
            }),
        }
    }

    /// The daemon's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// Start the child.
    ///
    /// # Errors
    ///
    /// Returns an error if the binary cannot be spawned.
    pub fn start(&self) -> Result<(), ProcessError> {
        SupervisorInner::start(&self.inner)
    }

    /// Stop the child and unblock a running probe loop.
    ///
    /// Idempotent, including on a child that already exited.
    pub fn stop(&self) {
        if let Some(child) = self
            .inner
            .child
            .lock()
            .expect("supervisor child lock poisoned")
            .as_ref()
        {
            child.stop();
        }
        if self.inner.probe_running.load(Ordering::SeqCst) {
            self.inner.probe_quit.notify_one();
        }
    }

    /// Enable health checks, writing each verdict to `messages`.
    ///
    /// With `forever` unset a single probe runs; otherwise probes repeat
    /// every ten seconds until [`Supervisor::stop`]. Guarded by an atomic
    /// flag: enabling while a probe loop is already running is a no-op, so
    /// at most one probe task exists per supervisor.
    pub fn enable_health_checks(&self, messages: mpsc::Sender<HealthMessage>, forever: bool) {
        if self
            .inner
            .probe_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let verdict = health::probe(
                    &inner.spec.health_url,
                    inner.spec.tls.as_ref(),
                    inner.spec.validator,
                )
                .await;
                if messages.send(verdict).await.is_err() {
                    break;
                }
                if !forever {
                    break;
                }
                tokio::select! {
                    _ = inner.probe_quit.notified() => break,
                    () = tokio::time::sleep(PROBE_INTERVAL) => {}
                }
            }
            inner.probe_running.store(false, Ordering::SeqCst);
        });
    }
}

impl SupervisorInner {
    /// Spawn the child, wiring its exit back into the retry logic.
    fn start(inner: &Arc<Self>) -> Result<(), ProcessError> {
        let weak = Arc::downgrade(inner);
        let exit: ExitHandler = Arc::new(move |success, status| {
            if let Some(inner) = weak.upgrade() {
                Self::handle_exit(&inner, success, status);
            }
        });

        let child = process::spawn(
            &inner.spec.command,
            &inner.spec.args,
            inner.output.clone(),
            exit,
        )?;
        *inner.child.lock().expect("supervisor child lock poisoned") = Some(child);
        Ok(())
    }

    /// Called on every child exit: restart in place while the budget lasts,
    /// otherwise invoke the terminal exit handler.
    fn handle_exit(inner: &Arc<Self>, success: bool, status: Option<ExitStatus>) {
        let remaining = inner.retries_left.fetch_sub(1, Ordering::SeqCst);
        if remaining > 1 {
            warn!(app = %inner.spec.name, success, "service exited, restarting");
            if let Err(err) = Self::start(inner) {
                error!(app = %inner.spec.name, error = %err, "restart failed");
                (inner.exit)(success, status);
            }
        } else {
            (inner.exit)(success, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn null_output() -> OutputHandler {
        Arc::new(|_chunk: &[u8]| {})
    }

    fn exit_channel() -> (ExitHandler, mpsc::UnboundedReceiver<bool>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: ExitHandler = Arc::new(move |success, _status| {
            let _ = tx.send(success);
        });
        (handler, rx)
    }

    /// Serve `ok` to any number of health probes.
    async fn health_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
                        )
                        .await;
                });
            }
        });
        format!("http://{addr}/healthz")
    }

    fn sleeping_spec(health_url: String) -> ServiceSpec {
        ServiceSpec::builder()
            .name("test-service")
            .command("sleep")
            .args(["30"])
            .health_url(health_url)
            .build()
    }

    #[test]
    fn test_spec_builder_defaults() {
        let spec = ServiceSpec::builder()
            .name("etcd")
            .command("/usr/bin/etcd")
            .health_url("https://localhost:7000/health")
            .validator(BodyValidator::EtcdJson)
            .build();

        assert_eq!(spec.name, "etcd");
        assert_eq!(spec.retries, 1);
        assert!(spec.tls.is_none());
        assert_eq!(spec.validator, BodyValidator::EtcdJson);
    }

    #[tokio::test]
    async fn test_terminal_exit_fires_once_budget_spent() {
        let (exit, mut exit_rx) = exit_channel();
        let spec = ServiceSpec::builder()
            .name("short")
            .command("sh")
            .args(["-c", "exit 0"])
            .health_url("http://localhost:1/healthz")
            .build();
        let supervisor = Supervisor::new(spec, null_output(), exit);

        supervisor.start().unwrap();
        let success = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(success);
    }

    #[tokio::test]
    async fn test_restart_budget_restarts_in_place() {
        let (exit, mut exit_rx) = exit_channel();
        let spec = ServiceSpec::builder()
            .name("flappy")
            .command("sh")
            .args(["-c", "exit 1"])
            .health_url("http://localhost:1/healthz")
            .retries(2)
            .build();
        let supervisor = Supervisor::new(spec, null_output(), exit);

        supervisor.start().unwrap();
        // First exit consumes the budget and restarts; only the second exit
        // reaches the terminal handler.
        let success = tokio::time::timeout(Duration::from_secs(5), exit_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!success);
        assert!(exit_rx.try_recv().is_err(), "exit handler fired twice");
    }

    #[tokio::test]
    async fn test_single_probe_delivers_one_message() {
        let url = health_server().await;
        let (exit, _exit_rx) = exit_channel();
        let supervisor = Supervisor::new(sleeping_spec(url), null_output(), exit);

        let (tx, mut rx) = mpsc::channel(2);
        supervisor.enable_health_checks(tx, false);

        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.healthy);
    }

    #[tokio::test]
    async fn test_enable_health_checks_is_single_shot() {
        let url = health_server().await;
        let (exit, _exit_rx) = exit_channel();
        let supervisor = Supervisor::new(sleeping_spec(url), null_output(), exit);

        let (tx, mut rx) = mpsc::channel(4);
        supervisor.enable_health_checks(tx.clone(), true);
        supervisor.enable_health_checks(tx.clone(), true);
        supervisor.enable_health_checks(tx, true);

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.healthy);

        // A second loop would deliver a second verdict immediately; the
        // periodic one only fires after ten seconds.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "more than one probe task is running");

        supervisor.stop();
    }
}
