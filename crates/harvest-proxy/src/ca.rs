//! Root CA used to sign the per-host certificates of the intercepting proxy.

use std::fs;
use std::path::{Path, PathBuf};

use hudsucker::certificate_authority::RcgenAuthority;
use hudsucker::rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};
use hudsucker::rustls::crypto::aws_lc_rs::default_provider;

use crate::error::{ProxyError, Result};

const CA_CERT_FILENAME: &str = "harvest-ca.crt";
const CA_KEY_FILENAME: &str = "harvest-ca.key";
const CA_COMMON_NAME: &str = "Harvest Capture CA";

/// Number of generated leaf certificates kept in memory.
const CERT_CACHE_SIZE: u64 = 1000;

/// Loads or creates the capture CA in a directory.
#[derive(Debug, Clone)]
pub struct CaManager {
    ca_dir: PathBuf,
}

impl CaManager {
    /// Creates a CA manager for the given directory.
    pub fn new(ca_dir: impl AsRef<Path>) -> Self {
        Self {
            ca_dir: ca_dir.as_ref().to_path_buf(),
        }
    }

    /// Uses the platform data directory.
    pub fn with_default_dir() -> Result<Self> {
        let project_dirs = directories::ProjectDirs::from("com", "harvest", "harvest")
            .ok_or_else(|| ProxyError::Ca("Could not determine data directory".into()))?;
        Ok(Self::new(project_dirs.data_dir().join("ca")))
    }

    /// Path of the PEM certificate clients must trust.
    pub fn cert_path(&self) -> PathBuf {
        self.ca_dir.join(CA_CERT_FILENAME)
    }

    /// Path of the PEM private key.
    pub fn key_path(&self) -> PathBuf {
        self.ca_dir.join(CA_KEY_FILENAME)
    }

    /// Checks if the CA certificate exists.
    pub fn ca_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Generates the CA on first use and returns the signing authority.
    pub fn ensure_ca(&self) -> Result<RcgenAuthority> {
        if !self.ca_exists() {
            self.generate_ca()?;
        }
        self.load_authority()
    }

    /// Writes a fresh self-signed CA certificate and key.
    pub fn generate_ca(&self) -> Result<()> {
        fs::create_dir_all(&self.ca_dir)?;

        let key_pair = KeyPair::generate().map_err(|e| ProxyError::Ca(e.to_string()))?;
        let mut params = CertificateParams::new(vec![CA_COMMON_NAME.to_string()])
            .map_err(|e| ProxyError::Ca(e.to_string()))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::Ca(e.to_string()))?;

        fs::write(self.cert_path(), cert.pem())?;
        fs::write(self.key_path(), key_pair.serialize_pem())?;

        tracing::info!("Generated capture CA at {:?}", self.cert_path());
        Ok(())
    }

    /// Loads the stored CA as a hudsucker authority.
    pub fn load_authority(&self) -> Result<RcgenAuthority> {
        let cert_pem = fs::read_to_string(self.cert_path())?;
        let key_pem = fs::read_to_string(self.key_path())?;

        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| ProxyError::Ca(e.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| ProxyError::Ca(e.to_string()))?;

        Ok(RcgenAuthority::new(issuer, CERT_CACHE_SIZE, default_provider()))
    }
}
