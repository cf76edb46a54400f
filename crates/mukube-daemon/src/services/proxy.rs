//! kube-proxy service definition.
//!
//! kube-proxy rewrites iptables and therefore runs through the configured
//! privilege-elevation binary, like the kubelet. Its config file carries the
//! cluster CIDR so traffic to pods and services is recognised as in-cluster.

use std::path::Path;

use anyhow::Result;
use mukube_core::health::BodyValidator;
use mukube_core::supervisor::ServiceSpec;
use serde::Serialize;

use super::{path_str, render_config, ServiceContext};

const CONFIG_TEMPLATE: &str = "\
apiVersion: kubeproxy.config.k8s.io/v1alpha1
bindAddress: 0.0.0.0
clientConnection:
  acceptContentTypes: \"\"
  burst: 10
  contentType: application/vnd.kubernetes.protobuf
  kubeconfig: \"{{kubeconfig}}\"
  qps: 5
configSyncPeriod: 15m0s
clusterCIDR: \"{{cluster_cidr}}\"
conntrack:
  max: 0
  maxPerCore: 32768
  min: 131072
  tcpCloseWaitTimeout: 1h0m0s
  tcpEstablishedTimeout: 24h0m0s
enableProfiling: false
healthzBindAddress: 127.0.0.1:{{health_port}}
hostnameOverride: \"\"
iptables:
  masqueradeAll: false
  masqueradeBit: 14
  minSyncPeriod: 0s
  syncPeriod: 30s
ipvs:
  excludeCIDRs: null
  minSyncPeriod: 0s
  scheduler: \"\"
  syncPeriod: 30s
kind: KubeProxyConfiguration
metricsBindAddress: 127.0.0.1:{{metrics_port}}
nodePortAddresses: null
oomScoreAdj: -999
portRange: \"\"
resourceContainer: /kube-proxy
udpIdleTimeout: 250ms
";

#[derive(Serialize)]
struct ConfigData {
    kubeconfig: String,
    cluster_cidr: String,
    health_port: u16,
    metrics_port: u16,
}

/// Build the kube-proxy service spec, rendering its config file.
///
/// # Errors
///
/// Fails when the config file cannot be rendered.
pub fn spec(ctx: &ServiceContext<'_>, binary: &Path) -> Result<ServiceSpec> {
    let config = ctx.env.workdir.join("kube").join("kube-proxy.cfg");
    render_config(
        CONFIG_TEMPLATE,
        &ConfigData {
            kubeconfig: path_str(&ctx.creds.kubeconfig),
            cluster_cidr: ctx.plan.cluster_net.to_string(),
            health_port: ctx.env.ports.kube_proxy_health,
            metrics_port: ctx.env.ports.kube_proxy_metrics,
        },
        &config,
    )?;

    Ok(ServiceSpec::builder()
        .name("kube-proxy")
        .command(&ctx.env.sudo_method)
        .args([
            path_str(binary),
            "--config".to_string(),
            path_str(&config),
        ])
        .health_url(format!(
            "http://localhost:{}/healthz",
            ctx.env.ports.kube_proxy_health
        ))
        .validator(BodyValidator::KubeProxyJson)
        .build())
}
