//! mukubed - boots and supervises a single-node Kubernetes control plane.
//!
//! Given the six control-plane binaries (etcd, kube-apiserver,
//! kube-controller-manager, kube-scheduler, kubelet, kube-proxy) in a
//! `third_party` directory, this daemon generates the PKI they need, wires
//! them together, starts them in dependency order and supervises them until
//! a termination signal drains the node and tears everything down again.
//!
//! All state lives under one root directory (default `~/.mukube`); removing
//! it resets the cluster completely.

mod fs;
mod kubeclient;
mod monitor;
mod orchestrator;
mod services;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use mukube_core::credentials::ClusterCredentials;
use mukube_core::env::ExecutionEnvironment;
use mukube_core::network::{self, NetworkPlan};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::kubeclient::KubeClient;
use crate::monitor::MonitorOutcome;

/// Base port the whole port table is derived from.
const BASE_PORT: u16 = 7000;

/// mukube - single-node Kubernetes for developer workstations
#[derive(Parser, Debug)]
#[command(name = "mukubed")]
#[command(version, about, long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(long)]
    verbose: bool,

    /// Mukube root directory
    #[arg(long, default_value = "~/.mukube")]
    root: String,

    /// Additional directory to search for executables
    #[arg(long, default_value = "")]
    extra_bin_dir: String,

    /// Pod IP range to use
    #[arg(long, default_value = "10.233.42.1/24")]
    pod_range: String,

    /// Service IP range to use
    #[arg(long, default_value = "10.233.43.1/24")]
    service_range: String,

    /// Sudo tool to use
    #[arg(long, default_value = "/usr/bin/pkexec")]
    sudo: String,

    /// Report the dashboard endpoint after bring-up
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    kube_dash: bool,

    /// Report the cluster DNS endpoint after bring-up
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    dns: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await {
        Ok(MonitorOutcome::Drained) => {}
        Ok(MonitorOutcome::Failed) => std::process::exit(-1),
        Err(err) => {
            error!(error = %format!("{err:#}"), "Fatal error");
            std::process::exit(-1);
        }
    }
}

async fn run(args: Args) -> Result<MonitorOutcome> {
    let root = expand_home(&args.root)
        .with_context(|| format!("couldn't expand root directory {}", args.root))?;
    let extra_bin_dir = if args.extra_bin_dir.is_empty() {
        None
    } else {
        Some(expand_home(&args.extra_bin_dir).with_context(|| {
            format!("couldn't expand extra binary directory {}", args.extra_bin_dir)
        })?)
    };

    let sudo = PathBuf::from(&args.sudo);
    let sudo_info = std::fs::metadata(&sudo)
        .with_context(|| format!("sudo method {} is not usable", sudo.display()))?;
    if !sudo_info.is_file() {
        bail!("sudo method {} is not a regular file", sudo.display());
    }

    let plan = NetworkPlan::calculate(&args.pod_range, &args.service_range)?;
    let bind_address = network::find_bind_address()?;
    info!(host_ip = %bind_address, "Bind address selected");

    let env = ExecutionEnvironment::new(
        root.clone(),
        sudo,
        bind_address,
        plan.service_ip,
        plan.dns_ip,
        BASE_PORT,
    );

    std::fs::create_dir_all(&root)
        .with_context(|| format!("couldn't create root directory {}", root.display()))?;
    for subdirectory in ["etcddata", "kube", "kubesched"] {
        fs::ensure_dir(&root, subdirectory, 0o770)?;
    }

    let creds = ClusterCredentials::ensure(
        &root,
        &[bind_address.to_string(), plan.service_ip.to_string()],
    )?;

    let app_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    let binaries = orchestrator::find_binaries(&app_dir, extra_bin_dir.as_deref())?;

    let (cluster, kube) = orchestrator::bring_up(&env, &creds, &plan, &binaries).await?;

    report_addon_endpoints(&kube, args.kube_dash, args.dns).await;

    Ok(monitor::run(cluster, &kube).await)
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(input: &str) -> Result<PathBuf> {
    if let Some(rest) = input.strip_prefix('~') {
        let home = home::home_dir().context("couldn't determine home directory")?;
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    Ok(PathBuf::from(input))
}

/// Log where the optional cluster add-ons can be reached, if they exist.
async fn report_addon_endpoints(kube: &KubeClient, dashboard: bool, dns: bool) {
    if dashboard {
        match kube.find_service("kube-system", "kubernetes-dashboard").await {
            Ok(Some(endpoint)) => {
                info!(
                    url = %format!("https://{}:{}", endpoint.cluster_ip, endpoint.port),
                    "Dashboard is reachable inside the cluster"
                );
                match kube
                    .find_secret("kube-system", "kubernetes-dashboard-token")
                    .await
                {
                    Ok(Some(token)) => info!(token = %token, "Dashboard login token"),
                    Ok(None) => debug!("Dashboard token secret not found"),
                    Err(err) => warn!(error = %err, "Couldn't look up dashboard token"),
                }
            }
            Ok(None) => debug!("Dashboard service not deployed"),
            Err(err) => warn!(error = %err, "Couldn't look up dashboard service"),
        }
    }

    if dns {
        match kube.find_service("kube-system", "kube-dns").await {
            Ok(Some(endpoint)) => {
                info!(address = %endpoint.cluster_ip, port = endpoint.port, "Cluster DNS is up");
            }
            Ok(None) => debug!("Cluster DNS service not deployed"),
            Err(err) => warn!(error = %err, "Couldn't look up cluster DNS service"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let args = Args::parse_from(["mukubed"]);

        assert!(!args.verbose);
        assert_eq!(args.root, "~/.mukube");
        assert_eq!(args.pod_range, "10.233.42.1/24");
        assert_eq!(args.service_range, "10.233.43.1/24");
        assert_eq!(args.sudo, "/usr/bin/pkexec");
        assert!(args.kube_dash);
        assert!(args.dns);
    }

    #[test]
    fn test_boolean_flags_take_values() {
        let args = Args::parse_from(["mukubed", "--kube-dash", "false", "--dns", "false"]);
        assert!(!args.kube_dash);
        assert!(!args.dns);
    }

    #[test]
    fn test_expand_home() {
        let home = home::home_dir().unwrap();
        assert_eq!(expand_home("~/.mukube").unwrap(), home.join(".mukube"));
        assert_eq!(
            expand_home("/var/lib/mukube").unwrap(),
            PathBuf::from("/var/lib/mukube")
        );
    }
}
