//! etcd service definition.
//!
//! etcd listens on localhost only; all TLS material comes from the etcd PKI
//! and client certificates are required on both the client and peer ports.

use std::path::Path;

use mukube_core::health::{BodyValidator, ProbeTls};
use mukube_core::supervisor::ServiceSpec;

use super::{path_str, ServiceContext};

/// Build the etcd service spec.
#[must_use]
pub fn spec(ctx: &ServiceContext<'_>, binary: &Path) -> ServiceSpec {
    let client_port = ctx.env.ports.etcd_client;
    let peer_port = ctx.env.ports.etcd_peer;
    let data_dir = ctx.env.workdir.join("etcddata");

    ServiceSpec::builder()
        .name("etcd")
        .command(binary)
        .args([
            "--data-dir".to_string(),
            path_str(&data_dir),
            "--listen-peer-urls".to_string(),
            format!("https://localhost:{peer_port}"),
            "--initial-advertise-peer-urls".to_string(),
            format!("https://localhost:{peer_port}"),
            "--initial-cluster".to_string(),
            format!("default=https://localhost:{peer_port}"),
            "--listen-client-urls".to_string(),
            format!("https://localhost:{client_port}"),
            "--advertise-client-urls".to_string(),
            format!("https://localhost:{client_port}"),
            "--trusted-ca-file".to_string(),
            path_str(&ctx.creds.etcd_ca.cert_path),
            "--cert-file".to_string(),
            path_str(&ctx.creds.etcd_server.cert_path),
            "--key-file".to_string(),
            path_str(&ctx.creds.etcd_server.key_path),
            "--peer-trusted-ca-file".to_string(),
            path_str(&ctx.creds.etcd_ca.cert_path),
            "--peer-cert-file".to_string(),
            path_str(&ctx.creds.etcd_server.cert_path),
            "--peer-key-file".to_string(),
            path_str(&ctx.creds.etcd_server.key_path),
            "--client-cert-auth".to_string(),
            "--peer-client-cert-auth".to_string(),
        ])
        .health_url(format!("https://localhost:{client_port}/health"))
        .validator(BodyValidator::EtcdJson)
        .tls(ProbeTls::from_certs(
            &ctx.creds.etcd_ca,
            &ctx.creds.etcd_client,
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
        let spec = spec(&fixture.context(), Path::new("/opt/bin/etcd"));

        assert_eq!(spec.name, "etcd");
        assert_eq!(spec.command, Path::new("/opt/bin/etcd"));
        assert_eq!(spec.health_url, "https://localhost:7000/health");
        assert_eq!(spec.validator, BodyValidator::EtcdJson);
        assert!(spec.tls.is_some());

        let args = spec.args.join(" ");
        assert!(args.contains("--listen-client-urls https://localhost:7000"));
        assert!(args.contains("--listen-peer-urls https://localhost:7001"));
        assert!(args.contains("--initial-cluster default=https://localhost:7001"));
        assert!(args.ends_with("--client-cert-auth --peer-client-cert-auth"));
    }
}
