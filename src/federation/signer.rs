//! Signing key for outbound requests
//!
//! Deliveries only ever see the `SigningOracle` trait, so the private key can
//! live in a file, a KMS, or a test fixture.

use async_trait::async_trait;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;

use crate::error::{AppError, FederationError};

#[async_trait]
pub trait SigningOracle: Send + Sync {
    /// RSASSA-PKCS1-v1.5 / SHA-256 signature over `message`
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, FederationError>;

    /// SubjectPublicKeyInfo PEM published in the actor document
    fn public_key_pem(&self) -> Result<String, FederationError>;
}

/// Parse a remote public key, accepting SPKI and PKCS#1 PEM
pub fn decode_public_key_pem(pem: &str) -> Result<RsaPublicKey, FederationError> {
    RsaPublicKey::from_public_key_pem(pem.trim())
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem.trim()))
        .map_err(|e| FederationError::KeyFetchFailure(format!("invalid public key: {}", e)))
}

/// In-process RSA key
#[derive(Clone)]
pub struct RsaKeySigner {
    private_key: RsaPrivateKey,
}

impl RsaKeySigner {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, FederationError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| FederationError::Signing(format!("invalid private key: {}", e)))?;
        Ok(Self::new(private_key))
    }

    pub fn generate(bits: usize) -> Result<Self, FederationError> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| FederationError::Signing(format!("key generation failed: {}", e)))?;
        Ok(Self::new(private_key))
    }

    /// Load the actor key from `path`, generating and writing a 4096-bit key
    /// if the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, AppError> {
        if path.exists() {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            let signer = Self::from_pkcs8_pem(&pem)?;
            tracing::info!(path = %path.display(), "Loaded actor signing key");
            return Ok(signer);
        }

        tracing::info!(path = %path.display(), "Generating actor signing key...");
        let signer = Self::generate(4096)?;
        let pem = signer
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(e.into()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| AppError::Internal(e.into()))?;
            }
        }
        std::fs::write(path, pem.as_bytes()).map_err(|e| AppError::Internal(e.into()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| AppError::Internal(e.into()))?;
        }

        tracing::info!(path = %path.display(), "Actor signing key created");
        Ok(signer)
    }
}

#[async_trait]
impl SigningOracle for RsaKeySigner {
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, FederationError> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key
            .try_sign(message)
            .map_err(|e| FederationError::Signing(e.to_string()))?;
        Ok(signature.to_vec())
    }

    fn public_key_pem(&self) -> Result<String, FederationError> {
        RsaPublicKey::from(&self.private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| FederationError::Signing(format!("failed to encode public key: {}", e)))
    }
}
