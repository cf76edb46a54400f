//! kube-apiserver service definition.

use std::path::Path;

use mukube_core::health::{BodyValidator, ProbeTls};
use mukube_core::supervisor::ServiceSpec;

use super::{path_str, ServiceContext};

/// Build the kube-apiserver service spec.
#[must_use]
pub fn spec(ctx: &ServiceContext<'_>, binary: &Path) -> ServiceSpec {
    let ports = &ctx.env.ports;
    let listen = ctx.env.listen_address.to_string();
    let (lower_svc_port, upper_svc_port) =
        node_port_range(&[ports.etcd_client, ports.kube_api, ports.kube_node_api]);

    ServiceSpec::builder()
        .name("kube-api")
        .command(binary)
        .args([
            "--bind-address".to_string(),
            listen.clone(),
            "--secure-port".to_string(),
            ports.kube_api.to_string(),
            "--kubernetes-service-node-port".to_string(),
            ports.kube_node_api.to_string(),
            "--service-node-port-range".to_string(),
            format!("{lower_svc_port}-{upper_svc_port}"),
            "--service-cluster-ip-range".to_string(),
            ctx.plan.service_net.to_string(),
            "--allow-privileged".to_string(),
            "--anonymous-auth".to_string(),
            "false".to_string(),
            "--authorization-mode".to_string(),
            "RBAC".to_string(),
            "--client-ca-file".to_string(),
            path_str(&ctx.creds.kube_ca.cert_path),
            "--etcd-cafile".to_string(),
            path_str(&ctx.creds.etcd_ca.cert_path),
            "--etcd-certfile".to_string(),
            path_str(&ctx.creds.etcd_client.cert_path),
            "--etcd-keyfile".to_string(),
            path_str(&ctx.creds.etcd_client.key_path),
            "--etcd-servers".to_string(),
            format!("https://127.0.0.1:{}", ports.etcd_client),
            "--kubelet-certificate-authority".to_string(),
            path_str(&ctx.creds.kube_ca.cert_path),
            "--kubelet-client-certificate".to_string(),
            path_str(&ctx.creds.kube_client.cert_path),
            "--kubelet-client-key".to_string(),
            path_str(&ctx.creds.kube_client.key_path),
            "--tls-cert-file".to_string(),
            path_str(&ctx.creds.kube_server.cert_path),
            "--tls-private-key-file".to_string(),
            path_str(&ctx.creds.kube_server.key_path),
            "--service-account-key-file".to_string(),
            path_str(&ctx.creds.kube_service_signing_cert.cert_path),
            "--service-account-key-file".to_string(),
            path_str(&ctx.creds.kube_service_signing_cert.key_path),
            // Deprecated, but until it is removed it defaults to 8080.
            "--insecure-port".to_string(),
            "0".to_string(),
        ])
        .health_url(format!("https://{listen}:{}/healthz", ports.kube_api))
        .validator(BodyValidator::PlainOk)
        .tls(ProbeTls::from_certs(
            &ctx.creds.kube_ca,
            &ctx.creds.kube_client,
        ))
        .build()
}

/// Pick a node-port range that does not collide with the assigned ports.
fn node_port_range(assigned: &[u16]) -> (u32, u32) {
    let mut lower: u32 = 7000;
    let mut upper: u32 = 9000;
    for port in assigned {
        let port = u32::from(*port);
        if port > upper {
            upper = port + 100;
        }
        if port < lower {
            lower = port.saturating_sub(100);
        }
    }
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use crate::services::test_support::test_context;

    use super::*;

    #[test]
    fn test_argv_shape() {
        let fixture = test_context();
        let spec = spec(&fixture.context(), Path::new("/opt/bin/kube-apiserver"));

        assert_eq!(spec.name, "kube-api");
        assert_eq!(spec.health_url, "https://192.168.1.10:7002/healthz");
        assert_eq!(spec.validator, BodyValidator::PlainOk);

        let args = spec.args.join(" ");
        assert!(args.contains("--bind-address 192.168.1.10"));
        assert!(args.contains("--secure-port 7002"));
        assert!(args.contains("--kubernetes-service-node-port 7003"));
        assert!(args.contains("--service-cluster-ip-range 10.233.43.0/24"));
        assert!(args.contains("--etcd-servers https://127.0.0.1:7000"));
        assert!(args.contains("--authorization-mode RBAC"));
        assert!(args.contains("--anonymous-auth false"));
        assert!(args.ends_with("--insecure-port 0"));
    }

    #[test]
    fn test_node_port_range_tracks_assigned_ports() {
        assert_eq!(node_port_range(&[7000, 7002, 7003]), (7000, 9000));
        assert_eq!(node_port_range(&[10000, 10002, 10003]), (7000, 10100));
        assert_eq!(node_port_range(&[5000, 5002, 5003]), (4900, 9000));
    }
}
