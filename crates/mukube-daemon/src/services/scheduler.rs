//! kube-scheduler service definition.
//!
//! The scheduler takes a config file instead of flags; it is rendered into
//! the `kubesched` state directory on every run.

use std::path::Path;

use anyhow::Result;
use mukube_core::health::BodyValidator;
use mukube_core::supervisor::ServiceSpec;
use serde::Serialize;

use super::{path_str, render_config, ServiceContext};

const CONFIG_TEMPLATE: &str = "\
algorithmSource:
  provider: DefaultProvider
apiVersion: componentconfig/v1alpha1
clientConnection:
  acceptContentTypes: \"\"
  burst: 100
  contentType: application/vnd.kubernetes.protobuf
  kubeconfig: \"{{kubeconfig}}\"
  qps: 50
disablePreemption: false
enableContentionProfiling: false
enableProfiling: false
failureDomains: kubernetes.io/hostname,failure-domain.beta.kubernetes.io/zone,failure-domain.beta.kubernetes.io/region
hardPodAffinitySymmetricWeight: 1
healthzBindAddress: 127.0.0.1:{{health_port}}
kind: KubeSchedulerConfiguration
leaderElection:
  leaderElect: true
  leaseDuration: 15s
  lockObjectName: kube-scheduler
  lockObjectNamespace: kube-system
  renewDeadline: 10s
  resourceLock: endpoints
  retryPeriod: 2s
metricsBindAddress: 127.0.0.1:{{metrics_port}}
schedulerName: default-scheduler
";

#[derive(Serialize)]
struct ConfigData {
    kubeconfig: String,
    health_port: u16,
    metrics_port: u16,
}

/// Build the kube-scheduler service spec, rendering its config file.
///
/// # Errors
///
/// Fails when the config file cannot be rendered.
pub fn spec(ctx: &ServiceContext<'_>, binary: &Path) -> Result<ServiceSpec> {
    let config = ctx.env.workdir.join("kubesched").join("kube-scheduler.cfg");
    render_config(
        CONFIG_TEMPLATE,
        &ConfigData {
            kubeconfig: path_str(&ctx.creds.kubeconfig),
            health_port: ctx.env.ports.kube_scheduler_health,
            metrics_port: ctx.env.ports.kube_scheduler_metrics,
        },
        &config,
    )?;

    Ok(ServiceSpec::builder()
        .name("kube-scheduler")
        .command(binary)
        .args(["--config".to_string(), path_str(&config)])
        .health_url(format!(
            "http://localhost:{}/healthz",
            ctx.env.ports.kube_scheduler_health
        ))
        .validator(BodyValidator::PlainOk)
        .build())
}

#[cfg(test)]
mod tests {
    use crate::services::test_support::test_context;

    use super::*;

    #[test]
    fn test_config_rendered_and_argv_minimal() {
        let fixture = test_context();
        let spec = spec(&fixture.context(), Path::new("/opt/bin/kube-scheduler")).unwrap();

        assert_eq!(spec.name, "kube-scheduler");
        assert_eq!(spec.health_url, "http://localhost:7008/healthz");
        assert!(spec.tls.is_none(), "scheduler health endpoint is plaintext");

        let config_path = fixture.env.workdir.join("kubesched/kube-scheduler.cfg");
        assert_eq!(
            spec.args,
            vec!["--config".to_string(), path_str(&config_path)]
        );

        let config = std::fs::read_to_string(config_path).unwrap();
        assert!(config.contains("healthzBindAddress: 127.0.0.1:7008"));
        assert!(config.contains("metricsBindAddress: 127.0.0.1:7009"));
        assert!(config.contains(&format!(
            "kubeconfig: \"{}\"",
            fixture.creds.kubeconfig.display()
        )));
    }
}
