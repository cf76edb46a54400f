//! Bring-up orchestration.
//!
//! Starts the six daemons in their fixed dependency order, gating each
//! transition on a bounded-retry health handshake:
//!
//! ```text
//! etcd -> kube-apiserver -> (kubeconfig) -> controller-manager
//!      -> kube-scheduler -> kubelet -> kube-proxy
//! ```
//!
//! The apiserver requires etcd; everything after it registers with the
//! apiserver; the kubeconfig is synthesised once the apiserver is reachable
//! because the file pins the bind address. A child exit before bring-up
//! completes terminates the process immediately - retrying that early would
//! only mask deterministic misconfiguration.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mukube_core::credentials::ClusterCredentials;
use mukube_core::env::ExecutionEnvironment;
use mukube_core::health::HealthMessage;
use mukube_core::logparse::{LogDialect, LogPipeline};
use mukube_core::network::NetworkPlan;
use mukube_core::process::ExitHandler;
use mukube_core::supervisor::{ServiceSpec, Supervisor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::kubeclient::KubeClient;
use crate::services::{self, ServiceContext};

/// Probes allowed before a daemon is declared dead on arrival.
const STARTUP_PROBES: u32 = 8;

/// Pause before each startup probe.
const STARTUP_PROBE_SPACING: Duration = Duration::from_secs(1);

/// How long the node gets to self-register and become Ready.
const NODE_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Notification that a supervised daemon exited after bring-up.
#[derive(Debug, Clone, Copy)]
pub struct ExitEvent {
    /// Whether the OS reported a clean exit.
    pub success: bool,
}

/// Bring-up state shared with every daemon's exit handler.
///
/// An exit before `done` is a bring-up fault and kills the process on the
/// spot - unless the orchestrator set `aborting` because it is already
/// tearing the started daemons down itself.
#[derive(Debug, Default)]
struct StartupFlags {
    done: AtomicBool,
    aborting: AtomicBool,
}

/// One running daemon plus the channels the monitor multiplexes.
pub struct RunningService {
    /// Daemon name.
    pub name: &'static str,
    /// The daemon's supervisor.
    pub supervisor: Supervisor,
    /// Sender for the permanent probe loop.
    pub health_tx: mpsc::Sender<HealthMessage>,
    /// Exit notifications.
    pub exit_rx: mpsc::Receiver<ExitEvent>,
    /// Health verdicts.
    pub health_rx: mpsc::Receiver<HealthMessage>,
}

/// The fully started control plane.
pub struct Cluster {
    /// All services in start order.
    pub services: Vec<RunningService>,
}

/// Paths to the six daemon binaries.
#[derive(Debug, Clone)]
pub struct DaemonBinaries {
    /// etcd.
    pub etcd: PathBuf,
    /// kube-apiserver.
    pub kube_apiserver: PathBuf,
    /// kube-controller-manager.
    pub kube_controller_manager: PathBuf,
    /// kube-scheduler.
    pub kube_scheduler: PathBuf,
    /// kubelet.
    pub kubelet: PathBuf,
    /// kube-proxy.
    pub kube_proxy: PathBuf,
}

/// Start the whole control plane.
///
/// On success every daemon is healthy, the node is Ready and permanent
/// health probes are armed. On failure every service started so far has
/// been stopped again, in reverse start order.
///
/// # Errors
///
/// Fails when any daemon cannot be started or never becomes healthy, when
/// the kubeconfig cannot be written, or when the node misses its readiness
/// deadline.
pub async fn bring_up(
    env: &ExecutionEnvironment,
    creds: &ClusterCredentials,
    plan: &NetworkPlan,
    binaries: &DaemonBinaries,
) -> Result<(Cluster, KubeClient)> {
    let flags = Arc::new(StartupFlags::default());
    let mut services = Vec::new();

    match run_bring_up(env, creds, plan, binaries, &flags, &mut services).await {
        Ok(client) => Ok((Cluster { services }, client)),
        Err(err) => {
            flags.aborting.store(true, Ordering::SeqCst);
            for service in services.iter().rev() {
                debug!(app = service.name, "Stopping service after failed bring-up");
                service.supervisor.stop();
            }
            Err(err)
        }
    }
}

async fn run_bring_up(
    env: &ExecutionEnvironment,
    creds: &ClusterCredentials,
    plan: &NetworkPlan,
    binaries: &DaemonBinaries,
    flags: &Arc<StartupFlags>,
    services: &mut Vec<RunningService>,
) -> Result<KubeClient> {
    let ctx = ServiceContext { env, creds, plan };

    let etcd = services::etcd::spec(&ctx, &binaries.etcd);
    services.push(start_service("etcd", etcd, LogDialect::Etcd, flags).await?);

    let apiserver = services::apiserver::spec(&ctx, &binaries.kube_apiserver);
    services.push(start_service("kube-api", apiserver, LogDialect::Klog, flags).await?);

    // The kubeconfig pins the bind address, so it is synthesised only once
    // the apiserver is reachable there.
    debug!("Generating kubeconfig...");
    services::kubeconfig::ensure(&ctx, env.listen_address)?;

    let controller_manager =
        services::controller_manager::spec(&ctx, &binaries.kube_controller_manager);
    services.push(
        start_service(
            "kube-controller-manager",
            controller_manager,
            LogDialect::Klog,
            flags,
        )
        .await?,
    );

    let scheduler = services::scheduler::spec(&ctx, &binaries.kube_scheduler)?;
    services.push(start_service("kube-scheduler", scheduler, LogDialect::Klog, flags).await?);

    let kubelet = services::kubelet::spec(&ctx, &binaries.kubelet)?;
    services.push(start_service("kubelet", kubelet, LogDialect::Klog, flags).await?);

    let proxy = services::proxy::spec(&ctx, &binaries.kube_proxy)?;
    services.push(start_service("kube-proxy", proxy, LogDialect::Klog, flags).await?);

    let client = KubeClient::new(&creds.kubeconfig)
        .await
        .context("couldn't connect to the fresh apiserver")?;

    info!("Waiting for node to become ready...");
    let ready_deadline = CancellationToken::new();
    let timer = ready_deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(NODE_READY_TIMEOUT).await;
        timer.cancel();
    });
    client
        .wait_for_node(&ready_deadline)
        .await
        .context("node didn't become ready in time")?;

    // Bring-up is done: from here on, exits go to the monitor instead of
    // aborting the process.
    flags.done.store(true, Ordering::SeqCst);

    for service in services.iter() {
        service
            .supervisor
            .enable_health_checks(service.health_tx.clone(), true);
    }

    info!("Cluster is up");
    Ok(client)
}

/// Start one daemon and block until its first healthy verdict.
///
/// Wires the daemon's output into the named log parser, creates the exit
/// and health channels (capacity 2 each), starts the supervisor and polls
/// its health endpoint up to eight times with one-second spacing. Aborts
/// with the last diagnostic when the daemon stays unhealthy.
async fn start_service(
    name: &'static str,
    spec: ServiceSpec,
    dialect: LogDialect,
    flags: &Arc<StartupFlags>,
) -> Result<RunningService> {
    info!(app = name, "Starting {name}...");

    let pipeline = LogPipeline::new(name, dialect);
    let output = pipeline.output_handler();

    let (exit_tx, exit_rx) = mpsc::channel(2);
    let (health_tx, health_rx) = mpsc::channel(2);

    let startup = Arc::clone(flags);
    let exit: ExitHandler = Arc::new(move |success, _status| {
        if !startup.done.load(Ordering::SeqCst) {
            if startup.aborting.load(Ordering::SeqCst) {
                return;
            }
            // Deterministic misconfiguration; a retry would only mask it.
            error!(app = name, success, "Service stopped during bring-up!");
            std::process::exit(-1);
        }
        error!(app = name, success, "Service stopped!");
        let _ = exit_tx.try_send(ExitEvent { success });
    });

    let supervisor = Supervisor::new(spec, output, exit);
    supervisor
        .start()
        .with_context(|| format!("couldn't start {name}"))?;

    let mut service = RunningService {
        name,
        supervisor,
        health_tx,
        exit_rx,
        health_rx,
    };

    let mut verdict = HealthMessage {
        healthy: false,
        error: None,
    };
    for _ in 0..STARTUP_PROBES {
        tokio::time::sleep(STARTUP_PROBE_SPACING).await;
        service
            .supervisor
            .enable_health_checks(service.health_tx.clone(), false);
        let Some(message) = service.health_rx.recv().await else {
            break;
        };
        verdict = message;
        debug!(app = name, health = verdict.healthy, "Healthcheck");
        if verdict.healthy {
            break;
        }
    }

    if !verdict.healthy {
        flags.aborting.store(true, Ordering::SeqCst);
        service.supervisor.stop();
        bail!(
            "{name} didn't become healthy in time: {}",
            verdict.error.unwrap_or_else(|| "no verdict".to_string())
        );
    }

    Ok(service)
}

/// Locate all six daemon binaries.
///
/// # Errors
///
/// Fails when any binary cannot be found.
pub fn find_binaries(app_dir: &Path, extra_dir: Option<&Path>) -> Result<DaemonBinaries> {
    Ok(DaemonBinaries {
        etcd: crate::fs::find_binary("etcd", app_dir, extra_dir)?,
        kube_apiserver: crate::fs::find_binary("kube-apiserver", app_dir, extra_dir)?,
        kube_controller_manager: crate::fs::find_binary(
            "kube-controller-manager",
            app_dir,
            extra_dir,
        )?,
        kube_scheduler: crate::fs::find_binary("kube-scheduler", app_dir, extra_dir)?,
        kubelet: crate::fs::find_binary("kubelet", app_dir, extra_dir)?,
        kube_proxy: crate::fs::find_binary("kube-proxy", app_dir, extra_dir)?,
    })
}
