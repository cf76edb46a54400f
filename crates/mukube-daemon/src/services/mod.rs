//! Per-daemon service definitions.
//!
//! One module per supervised daemon. Each builds the daemon's
//! [`ServiceSpec`] - the argv handed to the binary is the only contract
//! mukube has with it - and renders whatever config file the daemon expects
//! in place of command-line flags.

pub mod apiserver;
pub mod controller_manager;
pub mod etcd;
pub mod kubeconfig;
pub mod kubelet;
pub mod proxy;
pub mod scheduler;

use std::path::Path;

use anyhow::{Context, Result};
use handlebars::Handlebars;
use mukube_core::credentials::ClusterCredentials;
use mukube_core::env::ExecutionEnvironment;
use mukube_core::network::NetworkPlan;
use serde::Serialize;

/// Everything a service module needs to assemble its spec.
#[derive(Debug, Clone, Copy)]
pub struct ServiceContext<'a> {
    /// Shared execution environment.
    pub env: &'a ExecutionEnvironment,
    /// The credential bundle.
    pub creds: &'a ClusterCredentials,
    /// The computed network plan.
    pub plan: &'a NetworkPlan,
}

/// Render a config template to `path`.
///
/// Escaping is disabled: these are YAML files, not HTML, and the values
/// include paths and base64 data.
pub(crate) fn render_config(
    template: &str,
    data: &impl Serialize,
    path: &Path,
) -> Result<()> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    let rendered = handlebars
        .render_template(template, data)
        .context("template render failed")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("couldn't write {}", path.display()))?;
    Ok(())
}

/// Lossy path-to-argv conversion; state roots are expected to be UTF-8.
pub(crate) fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::PathBuf;

    use mukube_core::pki::Certificate;

    use super::*;

    /// A throwaway state root with plausible credential paths and the
    /// default network plan.
    pub(crate) struct TestFixture {
        /// Keeps the state root alive for the duration of the test.
        #[allow(dead_code)]
        pub dir: tempfile::TempDir,
        pub env: ExecutionEnvironment,
        pub creds: ClusterCredentials,
        pub plan: NetworkPlan,
    }

    impl TestFixture {
        pub(crate) fn context(&self) -> ServiceContext<'_> {
            ServiceContext {
                env: &self.env,
                creds: &self.creds,
                plan: &self.plan,
            }
        }
    }

    fn cert(root: &Path, sub: &str, name: &str) -> Certificate {
        Certificate::from_files(
            root.join(sub).join(format!("{name}.pem")),
            root.join(sub).join(format!("{name}.key")),
        )
    }

    pub(crate) fn test_context() -> TestFixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        for sub in ["etcdtls", "kubetls", "kubectls", "kubestls", "kube", "kubesched"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }

        let creds = ClusterCredentials {
            etcd_ca: cert(&root, "etcdtls", "ca"),
            etcd_server: cert(&root, "etcdtls", "server"),
            etcd_client: cert(&root, "etcdtls", "client"),
            kube_ca: cert(&root, "kubetls", "ca"),
            kube_server: cert(&root, "kubetls", "server"),
            kube_client: cert(&root, "kubetls", "client"),
            kube_cluster_ca: cert(&root, "kubectls", "ca"),
            kube_service_signing_cert: cert(&root, "kubestls", "cert"),
            kubeconfig: root.join("kube/kubeconfig"),
        };

        let env = ExecutionEnvironment::new(
            root,
            PathBuf::from("/usr/bin/pkexec"),
            "192.168.1.10".parse().unwrap(),
            "10.233.43.1".parse().unwrap(),
            "10.233.43.2".parse().unwrap(),
            7000,
        );

        let plan = NetworkPlan::calculate("10.233.42.1/24", "10.233.43.1/24").unwrap();

        TestFixture {
            dir,
            env,
            creds,
            plan,
        }
    }
}
