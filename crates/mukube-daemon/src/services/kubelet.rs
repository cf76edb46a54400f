//! kubelet service definition.
//!
//! The kubelet needs root for its container runtime plumbing, so its argv is
//! wrapped with the configured privilege-elevation binary. Most settings
//! live in a rendered config file; the rest stay flags because the config
//! format does not carry them.

use std::path::Path;

use anyhow::Result;
use mukube_core::health::BodyValidator;
use mukube_core::supervisor::ServiceSpec;
use serde::Serialize;

use super::{path_str, render_config, ServiceContext};
use crate::fs::ensure_dir;

const CONFIG_TEMPLATE: &str = "\
kind: KubeletConfiguration
apiVersion: kubelet.config.k8s.io/v1beta1
evictionHard:
    memory.available:  \"2Gi\"
authentication:
  anonymous:
    enabled: false
  x509:
    clientCAFile: {{ca_file}}
staticPodPath: {{static_pod_path}}
healthzBindAddress: 127.0.0.1
healthzPort: {{health_port}}
kubeletCgroups: \"/systemd/system.slice\"
tlsCertFile: {{cert_file}}
tlsPrivateKeyFile: {{key_file}}
";

#[derive(Serialize)]
struct ConfigData {
    ca_file: String,
    static_pod_path: String,
    health_port: u16,
    cert_file: String,
    key_file: String,
}

/// Build the kubelet service spec, creating its state directories and
/// rendering its config file.
///
/// # Errors
///
/// Fails when a state directory cannot be created or the config file cannot
/// be rendered.
pub fn spec(ctx: &ServiceContext<'_>, binary: &Path) -> Result<ServiceSpec> {
    let kube_dir = ctx.env.workdir.join("kube");
    ensure_dir(&kube_dir, "kubelet", 0o770)?;
    ensure_dir(&kube_dir, "staticpods", 0o770)?;

    let config = kube_dir.join("kubelet.cfg");
    render_config(
        CONFIG_TEMPLATE,
        &ConfigData {
            ca_file: path_str(&ctx.creds.kube_ca.cert_path),
            static_pod_path: path_str(&kube_dir.join("staticpods")),
            health_port: ctx.env.ports.kubelet_health,
            cert_file: path_str(&ctx.creds.kube_server.cert_path),
            key_file: path_str(&ctx.creds.kube_server.key_path),
        },
        &config,
    )?;

    let root_dir = kube_dir.join("kubelet");
    Ok(ServiceSpec::builder()
        .name("kubelet")
        .command(&ctx.env.sudo_method)
        .args([
            path_str(binary),
            "--config".to_string(),
            path_str(&config),
            "--node-ip".to_string(),
            ctx.env.listen_address.to_string(),
            "--kubeconfig".to_string(),
            path_str(&ctx.creds.kubeconfig),
            "--cni-bin-dir".to_string(),
            path_str(&root_dir.join("cni")),
            "--root-dir".to_string(),
            path_str(&root_dir),
            "--seccomp-profile-root".to_string(),
            path_str(&root_dir.join("seccomp")),
            "--bootstrap-checkpoint-path".to_string(),
            path_str(&root_dir.join("checkpoint")),
            "--network-plugin".to_string(),
            "kubenet".to_string(),
            "--runtime-cgroups".to_string(),
            "/systemd/system.slice".to_string(),
        ])
        .health_url(format!(
            "http://localhost:{}/healthz",
            ctx.env.ports.kubelet_health
        ))
        .validator(BodyValidator::PlainOk)
        .build())
}
