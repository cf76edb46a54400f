//! PKI management module.
//!
//! Manages an on-disk X.509 PKI with RSA keys: self-signed CAs, CA-signed
//! server/client leaves and a self-signed signing certificate used for
//! service-account tokens. Certificates are written once and never mutated;
//! removing the state directory is the only way to destroy them.

use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, PKCS_RSA_SHA256,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use time::{Duration, OffsetDateTime};

/// Key size used for all generated certificates.
const DEFAULT_KEY_BITS: usize = 2048;

/// Reduced key size for throwaway PKIs. The signature backend rejects RSA
/// moduli below 1017 bits, so this is as small as keys can get.
const REDUCED_KEY_BITS: usize = 1024;

/// File mode for certificate files.
const CERT_MODE: u32 = 0o644;

/// File mode for key files.
const KEY_MODE: u32 = 0o640;

/// Error types for PKI operations.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// RSA key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rsa::Error),

    /// Key could not be encoded as PKCS#8 PEM.
    #[error("key encoding failed: {0}")]
    KeyEncoding(#[from] rsa::pkcs8::Error),

    /// Certificate construction or signing failed.
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Certificate or key file could not be written.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A certificate loaded from disk was asked to sign a new leaf.
    #[error("certificate '{0}' was loaded from disk and cannot sign new certificates")]
    NotASigner(PathBuf),
}

/// In-memory signing material kept only for certificates generated in this
/// process. Certificates reloaded from disk carry none and cannot sign.
struct SignerMaterial {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl std::fmt::Debug for SignerMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerMaterial").finish_non_exhaustive()
    }
}

/// An on-disk PEM certificate/key pair.
#[derive(Debug)]
pub struct Certificate {
    /// Full path to the PEM-encoded certificate.
    pub cert_path: PathBuf,
    /// Full path to the PEM-encoded private key.
    pub key_path: PathBuf,
    /// Signing material, present only for freshly generated certificates.
    signer: Option<SignerMaterial>,
}

impl Certificate {
    /// Reference an existing certificate/key pair on disk.
    ///
    /// The result can be handed to daemons and used for TLS probes but cannot
    /// sign new leaves.
    #[must_use]
    pub const fn from_files(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            cert_path,
            key_path,
            signer: None,
        }
    }
}

/// Manages an X.509 PKI with RSA certificates stored in one directory.
#[derive(Debug)]
pub struct CertManager {
    /// Where certificates are stored.
    workdir: PathBuf,
    /// Size of generated keys in bits.
    key_bits: usize,
    /// Certificate validity.
    validity: Duration,
}

impl CertManager {
    /// Create a manager that stores certificates in `workdir`.
    #[must_use]
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            key_bits: DEFAULT_KEY_BITS,
            validity: Duration::days(365),
        }
    }

    /// Shrink generated keys to the backend minimum.
    ///
    /// The resulting certificates are cryptographically worthless; this
    /// exists so throwaway PKIs can be generated quickly.
    pub fn insecure_keys(&mut self) {
        self.key_bits = REDUCED_KEY_BITS;
    }

    /// Create a new self-signed CA certificate.
    ///
    /// The CA carries `keyCertSign` only and is stored in `workdir/name.pem`
    /// and `workdir/name.key`.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation, signing or writing fails.
    pub fn new_self_signed_ca(
        &self,
        name: &str,
        common_name: &str,
        serial: u64,
    ) -> Result<Certificate, PkiError> {
        let (key, key_pem) = self.generate_key()?;
        let mut params = self.base_params(common_name, None, serial);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];

        let cert = params.self_signed(&key)?;
        self.write_cert(name, cert, key, &key_pem)
    }

    /// Create a new self-signed certificate usable for signing payloads.
    ///
    /// Same shape as a CA but with `digitalSignature` and `keyEncipherment`
    /// added; used for service-account token signing and never for TLS.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation, signing or writing fails.
    pub fn new_self_signed_leaf(
        &self,
        name: &str,
        common_name: &str,
        serial: u64,
    ) -> Result<Certificate, PkiError> {
        let (key, key_pem) = self.generate_key()?;
        let mut params = self.base_params(common_name, None, serial);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let cert = params.self_signed(&key)?;
        self.write_cert(name, cert, key, &key_pem)
    }

    /// Create a new leaf certificate signed by `signer`.
    ///
    /// Key usages and EKUs are added according to `is_server`/`is_client`.
    /// SANs that lex as dotted-quad addresses become IP SANs, everything else
    /// becomes a DNS SAN.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::NotASigner`] if `signer` was reloaded from disk,
    /// or an error if key generation, signing or writing fails.
    #[allow(clippy::too_many_arguments)]
    pub fn new_leaf(
        &self,
        name: &str,
        common_name: &str,
        organization: Option<&str>,
        serial: u64,
        is_server: bool,
        is_client: bool,
        sans: &[String],
        signer: &Certificate,
    ) -> Result<Certificate, PkiError> {
        let material = signer
            .signer
            .as_ref()
            .ok_or_else(|| PkiError::NotASigner(signer.cert_path.clone()))?;

        let (key, key_pem) = self.generate_key()?;
        let mut params = self.base_params(common_name, organization, serial);
        params.is_ca = IsCa::ExplicitNoCa;

        if is_server {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages.push(ExtendedKeyUsagePurpose::ServerAuth);
            for san in sans {
                params.subject_alt_names.push(parse_san(san)?);
            }
        }
        if is_client {
            params.key_usages = vec![
                KeyUsagePurpose::DigitalSignature,
                KeyUsagePurpose::KeyEncipherment,
            ];
            params.extended_key_usages.push(ExtendedKeyUsagePurpose::ClientAuth);
        }

        let cert = params.signed_by(&key, &material.cert, &material.key)?;
        self.write_cert(name, cert, key, &key_pem)
    }

    /// Generate an RSA key and wrap it for certificate signing.
    fn generate_key(&self) -> Result<(KeyPair, String), PkiError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), self.key_bits)?;
        let pem = key.to_pkcs8_pem(LineEnding::LF)?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&pem, &PKCS_RSA_SHA256)?;
        Ok((key_pair, pem.to_string()))
    }

    /// Shared template fields for every certificate.
    fn base_params(
        &self,
        common_name: &str,
        organization: Option<&str>,
        serial: u64,
    ) -> CertificateParams {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        if let Some(org) = organization {
            dn.push(DnType::OrganizationName, org);
        }

        let not_before = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(serial.into());
        params.not_before = not_before;
        params.not_after = not_before + self.validity;
        params
    }

    /// Write the certificate to `workdir/name.pem` (0644) and its key to
    /// `workdir/name.key` (0640).
    fn write_cert(
        &self,
        name: &str,
        cert: rcgen::Certificate,
        key: KeyPair,
        key_pem: &str,
    ) -> Result<Certificate, PkiError> {
        let cert_path = self.workdir.join(format!("{name}.pem"));
        let key_path = self.workdir.join(format!("{name}.key"));

        write_with_mode(&cert_path, cert.pem().as_bytes(), CERT_MODE)?;
        write_with_mode(&key_path, key_pem.as_bytes(), KEY_MODE)?;

        Ok(Certificate {
            cert_path,
            key_path,
            signer: Some(SignerMaterial { cert, key }),
        })
    }
}

fn write_with_mode(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Parse one SAN entry: dotted-quad addresses become IP SANs, everything
/// else a DNS SAN.
fn parse_san(san: &str) -> Result<SanType, rcgen::Error> {
    if let Ok(ip) = san.parse::<Ipv4Addr>() {
        return Ok(SanType::IpAddress(ip.into()));
    }
    Ok(SanType::DnsName(san.to_string().try_into()?))
}
