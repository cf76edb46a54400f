//! kube-controller-manager service definition.
//!
//! The controller-manager gets the cluster CA so it can sign certificates
//! for newly enrolled nodes, and the service-account key so the tokens it
//! mints verify against the apiserver's copy.

use std::path::Path;

use mukube_core::health::{BodyValidator, ProbeTls};
use mukube_core::supervisor::ServiceSpec;

use super::{path_str, ServiceContext};

/// Build the kube-controller-manager service spec.
#[must_use]
pub fn spec(ctx: &ServiceContext<'_>, binary: &Path) -> ServiceSpec {
    let listen = ctx.env.listen_address.to_string();
    let port = ctx.env.ports.kube_controller_manager;

    ServiceSpec::builder()
        .name("kube-controller-manager")
        .command(binary)
        .args([
            "--allocate-node-cidrs".to_string(),
            "--cluster-cidr".to_string(),
            ctx.plan.pod_net.to_string(),
            "--bind-address".to_string(),
            listen.clone(),
            "--cluster-name".to_string(),
            "mukube".to_string(),
            "--cluster-signing-cert-file".to_string(),
            path_str(&ctx.creds.kube_cluster_ca.cert_path),
            "--cluster-signing-key-file".to_string(),
            path_str(&ctx.creds.kube_cluster_ca.key_path),
            "--enable-hostpath-provisioner".to_string(),
            "--secure-port".to_string(),
            port.to_string(),
            "--kubeconfig".to_string(),
            path_str(&ctx.creds.kubeconfig),
            "--tls-cert-file".to_string(),
            path_str(&ctx.creds.kube_server.cert_path),
            "--tls-private-key-file".to_string(),
            path_str(&ctx.creds.kube_server.key_path),
            "--service-account-private-key-file".to_string(),
            path_str(&ctx.creds.kube_service_signing_cert.key_path),
        ])
        .health_url(format!("https://{listen}:{port}/healthz"))
        .validator(BodyValidator::PlainOk)
        .tls(ProbeTls::from_certs(
            &ctx.creds.kube_ca,
            &ctx.creds.kube_client,
        ))
        .build()
}

#[cfg(test)]
mod tests {
    use crate::services::test_support::test_context;

    use super::*;

    #[test]
    fn test_argv_shape() {
        let fixture = test_context();
        let spec = spec(
            &fixture.context(),
            Path::new("/opt/bin/kube-controller-manager"),
        );

        assert_eq!(spec.name, "kube-controller-manager");
        assert_eq!(spec.health_url, "https://192.168.1.10:7004/healthz");

        let args = spec.args.join(" ");
        assert!(args.starts_with("--allocate-node-cidrs --cluster-cidr 10.233.42.0/24"));
        assert!(args.contains("--cluster-name mukube"));
        assert!(args.contains("--secure-port 7004"));
        assert!(args.contains("--enable-hostpath-provisioner"));
    }
}
