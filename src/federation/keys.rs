//! Site signing key
//!
//! One RSA key for every blog, generated on first start and kept in the
//! `persistent_cache` table under `activitypub_key`.

use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::data::Database;
use crate::error::AppError;

const KEY_CACHE_KEY: &str = "activitypub_key";

/// Loaded key pair; read-only after construction.
pub struct KeyStore {
    signing_key: SigningKey<Sha256>,
    public_key_pem: String,
}

impl KeyStore {
    /// Load the stored key, or generate and store one with `bits` bits.
    ///
    /// When two processes race on first start, the row that landed first
    /// wins and both end up using it.
    pub async fn load_or_generate(db: &Database, bits: usize) -> Result<Self, AppError> {
        if let Some(pem) = db.cache_get(KEY_CACHE_KEY).await? {
            tracing::debug!("Loaded ActivityPub key from database");
            return Self::from_pem_bytes(&pem);
        }

        tracing::info!(bits, "Generating ActivityPub key...");
        let private_key = tokio::task::spawn_blocking(move || {
            let mut rng = rand::thread_rng();
            RsaPrivateKey::new(&mut rng, bits)
        })
        .await
        .map_err(|e| AppError::Internal(e.into()))?
        .map_err(|e| AppError::Encryption(format!("Failed to generate key: {}", e)))?;

        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Encryption(format!("Failed to encode key: {}", e)))?;

        if db.cache_set_if_absent(KEY_CACHE_KEY, pem.as_bytes()).await? {
            tracing::info!("ActivityPub key generated and stored");
            return Self::from_private_key(private_key);
        }

        let stored = db
            .cache_get(KEY_CACHE_KEY)
            .await?
            .ok_or_else(|| AppError::Encryption("ActivityPub key vanished".to_string()))?;
        Self::from_pem_bytes(&stored)
    }

    fn from_pem_bytes(pem: &[u8]) -> Result<Self, AppError> {
        let pem = std::str::from_utf8(pem)
            .map_err(|_| AppError::Encryption("Stored key is not UTF-8".to_string()))?;
        Self::from_pem(pem)
    }

    /// Build from a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Encryption(format!("Invalid private key: {}", e)))?;
        Self::from_private_key(private_key)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Result<Self, AppError> {
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Encryption(format!("Failed to encode public key: {}", e)))?;

        Ok(Self {
            signing_key: SigningKey::<Sha256>::new(private_key),
            public_key_pem,
        })
    }

    /// SPKI PEM of the public half, embedded in every Person document.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn signing_key(&self) -> &SigningKey<Sha256> {
        &self.signing_key
    }
}
