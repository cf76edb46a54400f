//! Steady-state monitoring.
//!
//! One select loop multiplexes, for every supervised daemon, its exit and
//! health channels, plus the termination signal. Any exit is fatal for the
//! whole cluster; unhealthy probes are warnings only, since the next probe
//! may recover; a termination signal drains the node and stops the daemons
//! in reverse start order.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kubeclient::KubeClient;
use crate::orchestrator::Cluster;

/// How long the node drain may take before shutdown proceeds without it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(120);

/// How monitoring ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// Graceful shutdown after a termination signal.
    Drained,
    /// A daemon exited; the cluster cannot continue.
    Failed,
}

/// Monitor the running cluster until a daemon dies or a signal arrives.
pub async fn run(cluster: Cluster, kube: &KubeClient) -> MonitorOutcome {
    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let mut supervisors = Vec::new();
    let mut exits = StreamMap::new();
    let mut healths = StreamMap::new();
    for service in cluster.services {
        supervisors.push((service.name, service.supervisor));
        exits.insert(service.name, ReceiverStream::new(service.exit_rx));
        healths.insert(service.name, ReceiverStream::new(service.health_rx));
    }

    let outcome = loop {
        // Biased: a termination signal also takes the children down via
        // their interrupt listeners, and those exits must not be mistaken
        // for crashes.
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                drain(kube).await;
                break MonitorOutcome::Drained;
            }
            Some((name, event)) = exits.next() => {
                error!(app = name, success = event.success, "Service exited, aborting!");
                break MonitorOutcome::Failed;
            }
            Some((name, message)) = healths.next() => {
                if message.healthy {
                    debug!(app = name, "healthy");
                } else {
                    warn!(app = name, error = ?message.error, "unhealthy!");
                }
            }
        }
    };

    for (name, supervisor) in supervisors.iter().rev() {
        debug!(app = name, "Stopping service");
        supervisor.stop();
    }

    outcome
}

/// Translate SIGINT/SIGTERM into a cancellation.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let (Ok(mut sigint), Ok(mut sigterm)) = (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) else {
            error!("Couldn't register signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        shutdown.cancel();
    });
}

/// Best-effort node drain with a deadline. The control plane may already be
/// dying when this runs, so failures only warn.
async fn drain(kube: &KubeClient) {
    info!("Draining node...");
    let deadline = CancellationToken::new();
    let timer = deadline.clone();
    tokio::spawn(async move {
        tokio::time::sleep(DRAIN_TIMEOUT).await;
        timer.cancel();
    });

    if let Err(err) = kube.drain_node(&deadline).await {
        warn!(error = %err, "Node drain failed");
    }
}
