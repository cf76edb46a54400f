//! Kube client adapter.
//!
//! Thin operations against the freshly started apiserver: wait for the node
//! to self-register and become Ready, drain it on shutdown, and look up
//! service endpoints and secrets for the operator. All polling loops honour
//! an external cancellation token between intervals.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long an evicted pod gets to terminate gracefully.
const EVICTION_GRACE_SECONDS: u32 = 10;

/// Pause between node readiness polls.
const NODE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Pause between checks for evicted pods having gone away.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Error types for cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum KubeClientError {
    /// The kubeconfig could not be read or interpreted.
    #[error("couldn't read kubeconfig: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// An API request failed.
    #[error(transparent)]
    Api(#[from] kube::Error),

    /// The cluster has more than one node, which a single-node supervisor
    /// cannot be responsible for.
    #[error("too many nodes registered: {0}")]
    TooManyNodes(usize),

    /// No node was registered when one was required.
    #[error("no node found")]
    NoNode,

    /// The operation's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

/// A service's first TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Cluster IP of the service.
    pub cluster_ip: String,
    /// First TCP port of the service.
    pub port: i32,
}

/// Client for operations on the running cluster.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    /// Connect using the kubeconfig at `path`.
    ///
    /// # Errors
    ///
    /// Fails when the kubeconfig cannot be read or the client cannot be
    /// constructed from it.
    pub async fn new(path: &Path) -> Result<Self, KubeClientError> {
        let kubeconfig = Kubeconfig::read_from(path)?;
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;
        Ok(Self { client })
    }

    /// Fetch the single node, if one has registered yet.
    ///
    /// # Errors
    ///
    /// Fails when the node list cannot be fetched or holds more than one
    /// node.
    async fn find_node(&self) -> Result<Option<Node>, KubeClientError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        match list.items.len() {
            0 => {
                debug!("No node registered yet");
                Ok(None)
            }
            1 => Ok(list.items.into_iter().next()),
            n => Err(KubeClientError::TooManyNodes(n)),
        }
    }

    /// Block until the single node reports Ready.
    ///
    /// A node that registered unschedulable is cordoned back on,
    /// best-effort. The token is consulted between polls.
    ///
    /// # Errors
    ///
    /// Fails when the token fires or the node list cannot be read.
    pub async fn wait_for_node(&self, cancel: &CancellationToken) -> Result<(), KubeClientError> {
        loop {
            if let Some(node) = self.find_node().await? {
                let ready = node
                    .status
                    .as_ref()
                    .and_then(|status| status.conditions.as_ref())
                    .is_some_and(|conditions| {
                        conditions
                            .iter()
                            .any(|c| c.type_ == "Ready" && c.status == "True")
                    });

                if ready {
                    let unschedulable = node
                        .spec
                        .as_ref()
                        .and_then(|spec| spec.unschedulable)
                        .unwrap_or(false);
                    info!(can_schedule = !unschedulable, "Node now ready!");

                    if unschedulable {
                        if let Err(err) = self.set_unschedulable(&node.name_any(), false).await {
                            warn!(error = %err, "Couldn't uncordon node!");
                        }
                    }
                    return Ok(());
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(KubeClientError::Cancelled),
                () = tokio::time::sleep(NODE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Drain the node: cordon it, evict every pod, wait until they are gone.
    ///
    /// Eviction failures are logged and skipped; a pod whose state can no
    /// longer be checked is assumed gone, since the control plane may
    /// already be on its way down. The token is consulted between polls.
    ///
    /// # Errors
    ///
    /// Fails when no node exists, the cordon patch fails, the pod list
    /// cannot be read or the token fires.
    pub async fn drain_node(&self, cancel: &CancellationToken) -> Result<(), KubeClientError> {
        let node = self.find_node().await?.ok_or(KubeClientError::NoNode)?;
        self.set_unschedulable(&node.name_any(), true).await?;

        let all_pods: Api<Pod> = Api::all(self.client.clone());
        let pods = all_pods.list(&ListParams::default()).await?;

        let evict_params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: Some(EVICTION_GRACE_SECONDS),
                ..DeleteParams::default()
            }),
            ..EvictParams::default()
        };

        let mut pending: Vec<(String, String)> = Vec::new();
        for pod in pods {
            let Some(namespace) = pod.namespace() else {
                continue;
            };
            let name = pod.name_any();
            info!(namespace = %namespace, pod = %name, "Evicting pod...");

            let namespaced: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
            match namespaced.evict(&name, &evict_params).await {
                Ok(_) => pending.push((namespace, name)),
                Err(err) => warn!(namespace = %namespace, pod = %name, error = %err, "Couldn't evict pod!"),
            }
        }

        info!("Waiting for evicted pods to stop...");
        loop {
            let mut still_running = Vec::new();
            for (namespace, name) in pending {
                let namespaced: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
                match namespaced.get_opt(&name).await {
                    Ok(Some(_)) => {
                        info!(namespace = %namespace, pod = %name, "Pod is still running");
                        still_running.push((namespace, name));
                    }
                    Ok(None) => debug!(namespace = %namespace, pod = %name, "Pod is gone"),
                    Err(err) => {
                        warn!(
                            namespace = %namespace,
                            pod = %name,
                            error = %err,
                            "Couldn't check pod state, assuming it's dead"
                        );
                    }
                }
            }
            pending = still_running;

            if pending.is_empty() {
                info!("All pods gone!");
                return Ok(());
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(KubeClientError::Cancelled),
                () = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
            }
        }
    }

    /// Set or clear the node's `unschedulable` field.
    async fn set_unschedulable(&self, name: &str, value: bool) -> Result<(), KubeClientError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": value } });
        nodes
            .patch(name, &PatchParams::default(), &Patch::Strategic(patch))
            .await?;
        Ok(())
    }

    /// Look up the first TCP port and cluster IP of a service.
    ///
    /// # Errors
    ///
    /// Fails when the service cannot be fetched.
    pub async fn find_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceEndpoint>, KubeClientError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let Some(service) = services.get_opt(name).await? else {
            return Ok(None);
        };

        let Some(spec) = service.spec else {
            return Ok(None);
        };
        let Some(cluster_ip) = spec.cluster_ip else {
            return Ok(None);
        };
        let port = spec
            .ports
            .unwrap_or_default()
            .iter()
            .find(|port| port.protocol.as_deref().unwrap_or("TCP") == "TCP")
            .map(|port| port.port);

        Ok(port.map(|port| ServiceEndpoint { cluster_ip, port }))
    }

    /// Look up the token of the first secret whose name starts with
    /// `prefix`.
    ///
    /// # Errors
    ///
    /// Fails when the secret list cannot be fetched.
    pub async fn find_secret(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Option<String>, KubeClientError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let list = secrets.list(&ListParams::default()).await?;

        for secret in list {
            if !secret.name_any().starts_with(prefix) {
                continue;
            }
            let data: BTreeMap<_, _> = secret.data.unwrap_or_default();
            if let Some(token) = data.get("token") {
                return Ok(Some(String::from_utf8_lossy(&token.0).into_owned()));
            }
        }
        Ok(None)
    }
}
