//! Kubeconfig emitter.
//!
//! Renders the kubeconfig every downstream component (and the operator's
//! kubectl) uses to talk to the apiserver. An existing file is never
//! rewritten so hand-edits survive restarts.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use tracing::debug;

use super::{render_config, ServiceContext};

const KUBECONFIG_TEMPLATE: &str = "\
apiVersion: v1
kind: Config
clusters:
- name: mukube
  cluster:
    server: https://{{address}}:{{api_port}}
    certificate-authority-data: {{ca}}
users:
- name: admin
  user:
    client-certificate-data: {{client_cert}}
    client-key-data: {{client_key}}
contexts:
- context:
    cluster: mukube
    user: admin
  name: default-ctx
current-context: default-ctx
";

#[derive(Serialize)]
struct KubeconfigData {
    address: String,
    api_port: u16,
    ca: String,
    client_cert: String,
    client_key: String,
}

/// Ensure the kubeconfig exists, rendering it on first bring-up only.
///
/// # Errors
///
/// Fails when the certificate material cannot be read or the file cannot be
/// written.
pub fn ensure(ctx: &ServiceContext<'_>, host: Ipv4Addr) -> Result<PathBuf> {
    let path = ctx.creds.kubeconfig.clone();
    if path.exists() {
        debug!(path = %path.display(), "Kubeconfig already exists, keeping it");
        return Ok(path);
    }

    let data = KubeconfigData {
        address: host.to_string(),
        api_port: ctx.env.ports.kube_api,
        ca: base64_encoded_pem(&ctx.creds.kube_ca.cert_path)?,
        client_cert: base64_encoded_pem(&ctx.creds.kube_client.cert_path)?,
        client_key: base64_encoded_pem(&ctx.creds.kube_client.key_path)?,
    };
    render_config(KUBECONFIG_TEMPLATE, &data, &path)?;
    Ok(path)
}

/// Read `path` and return its contents base64-encoded.
fn base64_encoded_pem(path: &Path) -> Result<String> {
    let contents = std::fs::read(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    Ok(STANDARD.encode(contents))
}

#[cfg(test)]
mod tests {
    use crate::services::test_support::test_context;

    use super::*;

    fn write_fake_pems(fixture: &crate::services::test_support::TestFixture) {
        for cert in [&fixture.creds.kube_ca, &fixture.creds.kube_client] {
            std::fs::write(&cert.cert_path, b"CERT").unwrap();
            std::fs::write(&cert.key_path, b"KEY").unwrap();
        }
    }

    #[test]
    fn test_renders_address_and_base64_material() {
        let fixture = test_context();
        write_fake_pems(&fixture);

        let path = ensure(&fixture.context(), "192.168.1.10".parse().unwrap()).unwrap();
        let rendered = std::fs::read_to_string(path).unwrap();

        assert!(rendered.contains("server: https://192.168.1.10:7002"));
        assert!(rendered.contains(&format!(
            "certificate-authority-data: {}",
            STANDARD.encode(b"CERT")
        )));
        assert!(rendered.contains(&format!(
            "client-key-data: {}",
            STANDARD.encode(b"KEY")
        )));
    }

    #[test]
    fn test_existing_file_is_never_rewritten() {
        let fixture = test_context();
        write_fake_pems(&fixture);

        std::fs::write(&fixture.creds.kubeconfig, b"operator edited this").unwrap();
        let path = ensure(&fixture.context(), "192.168.1.10".parse().unwrap()).unwrap();

        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents, "operator edited this");
    }
}
