//! Credential management module.
//!
//! Aggregates every certificate artifact the daemons need into one bundle.
//! Four independent CAs exist: etcd and the apiserver authenticate
//! independently, the cluster CA is what controller-manager hands to newly
//! enrolled nodes, and the signing certificate issues service-account
//! tokens. The bundle is materialised lazily: a second run with the same
//! state root reloads everything from disk without regenerating.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::pki::{CertManager, Certificate, PkiError};

/// Mode for the per-PKI state directories.
const PKI_DIR_MODE: u32 = 0o750;

/// Error types for credential assembly.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    /// A PKI operation failed.
    #[error("{context} pki creation failed: {source}")]
    Pki {
        /// Which bundle part was being created.
        context: &'static str,
        /// Underlying PKI error.
        source: PkiError,
    },

    /// A state directory could not be created.
    #[error("credential directory creation failed: {0}")]
    Io(#[from] std::io::Error),

    /// The local hostname could not be read for the server SAN list.
    #[error("couldn't read hostname: {0}")]
    Hostname(#[from] nix::Error),
}

/// All credentials needed by the control-plane daemons.
#[derive(Debug)]
pub struct ClusterCredentials {
    /// CA certificate for etcd.
    pub etcd_ca: Certificate,
    /// Server certificate for etcd.
    pub etcd_server: Certificate,
    /// Client certificate for etcd.
    pub etcd_client: Certificate,
    /// CA certificate for the Kubernetes control plane.
    pub kube_ca: Certificate,
    /// Server certificate for the Kubernetes control plane.
    pub kube_server: Certificate,
    /// Client certificate for the Kubernetes control plane
    /// (`O=system:masters`).
    pub kube_client: Certificate,
    /// In-cluster CA handed to newly enrolled nodes.
    pub kube_cluster_ca: Certificate,
    /// Signing certificate for service-account tokens.
    pub kube_service_signing_cert: Certificate,
    /// Path to the kubeconfig rendered once the apiserver is up.
    pub kubeconfig: PathBuf,
}

impl ClusterCredentials {
    /// Create all credentials under `base_dir`, or reload them if a previous
    /// run already materialised them.
    ///
    /// `extra_addresses` are added to the server certificates' SAN lists on
    /// top of `127.0.0.1`, `localhost` and the local hostname.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created, the hostname
    /// cannot be read, or certificate generation fails.
    pub fn ensure(base_dir: &Path, extra_addresses: &[String]) -> Result<Self, CredentialsError> {
        Self::ensure_with(base_dir, extra_addresses, false)
    }

    /// Like [`ClusterCredentials::ensure`] but with throwaway key sizes.
    ///
    /// # Errors
    ///
    /// Same as [`ClusterCredentials::ensure`].
    pub fn ensure_insecure(
        base_dir: &Path,
        extra_addresses: &[String],
    ) -> Result<Self, CredentialsError> {
        Self::ensure_with(base_dir, extra_addresses, true)
    }

    fn ensure_with(
        base_dir: &Path,
        extra_addresses: &[String],
        insecure: bool,
    ) -> Result<Self, CredentialsError> {
        let hostname = nix::unistd::gethostname()?.to_string_lossy().into_owned();
        let mut sans: Vec<String> = extra_addresses.to_vec();
        sans.push("127.0.0.1".to_string());
        sans.push("localhost".to_string());
        sans.push(hostname);

        let etcd_dir = base_dir.join("etcdtls");
        ensure_pki_dir(&etcd_dir)?;
        let (etcd_ca, etcd_server, etcd_client) =
            ensure_full_pki(&etcd_dir, "Mukube ETCD", false, true, &sans, insecure).map_err(
                |source| CredentialsError::Pki {
                    context: "etcd",
                    source,
                },
            )?;

        let kube_dir = base_dir.join("kubetls");
        ensure_pki_dir(&kube_dir)?;
        let (kube_ca, kube_server, kube_client) =
            ensure_full_pki(&kube_dir, "Mukube Kubernetes", true, false, &sans, insecure).map_err(
                |source| CredentialsError::Pki {
                    context: "kube",
                    source,
                },
            )?;

        let cluster_dir = base_dir.join("kubectls");
        ensure_pki_dir(&cluster_dir)?;
        let kube_cluster_ca = ensure_ca(&cluster_dir, "Mukube Cluster", insecure).map_err(
            |source| CredentialsError::Pki {
                context: "kube cluster",
                source,
            },
        )?;

        let signing_dir = base_dir.join("kubestls");
        ensure_pki_dir(&signing_dir)?;
        let kube_service_signing_cert =
            ensure_signing_cert(&signing_dir, "Mukube Cluster SVC", insecure).map_err(
                |source| CredentialsError::Pki {
                    context: "kube service signing cert",
                    source,
                },
            )?;

        Ok(Self {
            etcd_ca,
            etcd_server,
            etcd_client,
            kube_ca,
            kube_server,
            kube_client,
            kube_cluster_ca,
            kube_service_signing_cert,
            kubeconfig: base_dir.join("kube").join("kubeconfig"),
        })
    }
}

fn ensure_pki_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::DirBuilder::new().mode(PKI_DIR_MODE).create(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(err) => Err(err),
    }
}

/// Ensure a full PKI for `name` in `root`:
///
/// - a CA named `<name> CA` in `ca.pem`/`ca.key`
/// - a server certificate named `<name> Server` in `server.pem`/`server.key`
///   with the provided SANs
/// - a client certificate named `<name> Client` in `client.pem`/`client.key`,
///   carrying `O=system:masters` when `is_kube` is set
///
/// The server certificate doubles as a client certificate when `is_etcd` is
/// set, because etcd presents it for peer connections too.
fn ensure_full_pki(
    root: &Path,
    name: &str,
    is_kube: bool,
    is_etcd: bool,
    sans: &[String],
    insecure: bool,
) -> Result<(Certificate, Certificate, Certificate), PkiError> {
    if root.join("ca.pem").exists() {
        debug!(root = %root.display(), "Reusing existing PKI");
        return Ok((
            Certificate::from_files(root.join("ca.pem"), root.join("ca.key")),
            Certificate::from_files(root.join("server.pem"), root.join("server.key")),
            Certificate::from_files(root.join("client.pem"), root.join("client.key")),
        ));
    }

    let mut manager = CertManager::new(root);
    if insecure {
        manager.insecure_keys();
    }

    let ca = manager.new_self_signed_ca("ca", &format!("{name} CA"), 1)?;

    let server = manager.new_leaf(
        "server",
        &format!("{name} Server"),
        None,
        2,
        true,
        is_etcd,
        sans,
        &ca,
    )?;

    let organization = is_kube.then_some("system:masters");
    let client = manager.new_leaf(
        "client",
        &format!("{name} Client"),
        organization,
        3,
        false,
        true,
        &[],
        &ca,
    )?;

    Ok((ca, server, client))
}

/// Ensure a lone CA for `name` exists in `root` (`ca.pem`/`ca.key`).
fn ensure_ca(root: &Path, name: &str, insecure: bool) -> Result<Certificate, PkiError> {
    if root.join("ca.pem").exists() {
        return Ok(Certificate::from_files(
            root.join("ca.pem"),
            root.join("ca.key"),
        ));
    }

    let mut manager = CertManager::new(root);
    if insecure {
        manager.insecure_keys();
    }
    manager.new_self_signed_ca("ca", &format!("{name} CA"), 1)
}

/// Ensure a self-signed signing certificate for `name` exists in `root`
/// (`cert.pem`/`cert.key`).
fn ensure_signing_cert(root: &Path, name: &str, insecure: bool) -> Result<Certificate, PkiError> {
    if root.join("cert.pem").exists() {
        return Ok(Certificate::from_files(
            root.join("cert.pem"),
            root.join("cert.key"),
        ));
    }

    let mut manager = CertManager::new(root);
    if insecure {
        manager.insecure_keys();
    }
    manager.new_self_signed_leaf("cert", &format!("{name} Signing Cert"), 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all_certs(base: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files = Vec::new();
        for sub in ["etcdtls", "kubetls", "kubectls", "kubestls"] {
            let dir = base.join(sub);
            let mut entries: Vec<_> = std::fs::read_dir(&dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            entries.sort();
            for path in entries {
                let contents = std::fs::read(&path).unwrap();
                files.push((path, contents));
            }
        }
        files
    }

    #[test]
    fn test_bundle_is_fully_populated() {
        let dir = tempfile::tempdir().unwrap();
        let creds = ClusterCredentials::ensure_insecure(dir.path(), &[]).unwrap();

        for cert in [
            &creds.etcd_ca,
            &creds.etcd_server,
            &creds.etcd_client,
            &creds.kube_ca,
            &creds.kube_server,
            &creds.kube_client,
            &creds.kube_cluster_ca,
            &creds.kube_service_signing_cert,
        ] {
            assert!(cert.cert_path.exists(), "missing {:?}", cert.cert_path);
            assert!(cert.key_path.exists(), "missing {:?}", cert.key_path);
        }
        assert_eq!(creds.kubeconfig, dir.path().join("kube/kubeconfig"));
    }

    #[test]
    fn test_second_run_reloads_identical_files() {
        let dir = tempfile::tempdir().unwrap();

        ClusterCredentials::ensure_insecure(dir.path(), &[]).unwrap();
        let first = read_all_certs(dir.path());

        ClusterCredentials::ensure_insecure(dir.path(), &[]).unwrap();
        let second = read_all_certs(dir.path());

        assert_eq!(first, second, "reload must not regenerate anything");
    }

    #[test]
    fn test_expected_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let creds = ClusterCredentials::ensure_insecure(dir.path(), &[]).unwrap();

        assert_eq!(creds.etcd_ca.cert_path, dir.path().join("etcdtls/ca.pem"));
        assert_eq!(
            creds.kube_server.key_path,
            dir.path().join("kubetls/server.key")
        );
        assert_eq!(
            creds.kube_cluster_ca.cert_path,
            dir.path().join("kubectls/ca.pem")
        );
        assert_eq!(
            creds.kube_service_signing_cert.cert_path,
            dir.path().join("kubestls/cert.pem")
        );
    }
}
