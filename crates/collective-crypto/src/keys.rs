//! Ed25519 device key pair -- generation, loading, signing.

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as _};
use std::io::Write;
use std::path::Path;

use crate::{CryptoError, PublicKey, Signature};

/// A device or server key pair. The PKCS#8 document is kept so the pair can
/// be written back out (key file, identity snapshot).
pub struct KeyPair {
    keypair: Ed25519KeyPair,
    pkcs8_doc: Vec<u8>,
}

impl KeyPair {
    /// Generate a new random keypair.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| CryptoError::IdentityError(e.to_string()))?;
        Self::from_pkcs8(pkcs8.as_ref().to_vec())
    }

    /// Load keypair from PKCS#8 DER file.
    pub fn from_file(path: &Path) -> Result<Self, CryptoError> {
        let pkcs8_bytes = std::fs::read(path)?;
        Self::from_pkcs8(pkcs8_bytes)
    }

    /// Load or create keypair at path.
    pub fn load_or_create(path: &Path) -> Result<Self, CryptoError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            let keypair = Self::generate()?;
            write_private(path, &keypair.pkcs8_doc)?;
            Ok(keypair)
        }
    }

    pub fn from_pkcs8(pkcs8_bytes: Vec<u8>) -> Result<Self, CryptoError> {
        let keypair = Ed25519KeyPair::from_pkcs8(&pkcs8_bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(Self {
            keypair,
            pkcs8_doc: pkcs8_bytes,
        })
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.keypair.public_key().as_ref().to_vec())
    }

    /// Sign data.
    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(self.keypair.sign(data).as_ref().to_vec())
    }

    /// PKCS#8 DER bytes.
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8_doc
    }
}

/// Write secret material to `path`, readable by the owner only. Missing
/// parent directories are created.
pub fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;

    // An existing file keeps its old mode on open.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}
