//! Narrow key-management seam for per-bucket server-side encryption.
//!
//! The KMS proper is an external collaborator; the gateway only needs to
//! mint and destroy per-bucket master keys and to obtain cipher/decipher
//! bundles for individual objects.  Object data is encrypted with a
//! random per-object data key under AES-256-CTR; the data key travels in
//! the retrieval record, wrapped under the bucket's master key.
//!
//! CTR keystreams are position-addressable, so a ranged GET deciphers
//! correctly by seeking the keystream to the range's first byte.

use aes::Aes256;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::Ctr128BE;
use std::collections::HashMap;
use tokio::sync::RwLock;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Cipher scheme tag stored in retrieval records.
pub const CRYPTO_SCHEME_AES_CTR: u8 = 1;

/// A keystream positioned over one object's data.
pub struct DataCipher {
    inner: Aes256Ctr,
}

impl DataCipher {
    fn new(data_key: &[u8; 32], offset: u64) -> Self {
        let iv = [0u8; 16];
        let mut inner = Aes256Ctr::new(data_key.into(), &iv.into());
        inner.seek(offset);
        Self { inner }
    }

    /// Apply the keystream in place (encrypt and decrypt are the same
    /// operation under CTR).
    pub fn apply(&mut self, data: Bytes) -> Bytes {
        let mut buf = data.to_vec();
        self.inner.apply_keystream(&mut buf);
        Bytes::from(buf)
    }
}

/// Everything a PUT needs to encrypt one object.
pub struct CipherBundle {
    /// Base64 of the data key wrapped under the bucket master key.
    pub ciphered_data_key: String,
    pub crypto_scheme: u8,
    pub master_key_id: String,
    pub cipher: DataCipher,
}

/// Async key-management contract.
#[async_trait]
pub trait KeyManager: Send + Sync + 'static {
    /// Mint a master key for a bucket, returning its id.
    async fn create_bucket_key(&self) -> anyhow::Result<String>;

    /// Destroy a bucket's master key.  Not-found is not an error.
    async fn destroy_bucket_key(&self, master_key_id: &str) -> anyhow::Result<()>;

    /// Mint a fresh data key under `master_key_id` and return a cipher
    /// bundle positioned at offset zero.
    async fn create_cipher_bundle(&self, master_key_id: &str) -> anyhow::Result<CipherBundle>;

    /// Unwrap `ciphered_data_key` and return a keystream seeked to
    /// `offset` (the first byte of the requested range).
    async fn create_decipher_bundle(
        &self,
        master_key_id: &str,
        ciphered_data_key: &str,
        offset: u64,
    ) -> anyhow::Result<DataCipher>;
}

/// In-process [`KeyManager`] holding master keys in a map.
#[derive(Default)]
pub struct MemoryKeyManager {
    keys: RwLock<HashMap<String, [u8; 32]>>,
}

impl MemoryKeyManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn master_key(&self, master_key_id: &str) -> anyhow::Result<[u8; 32]> {
        self.keys
            .read()
            .await
            .get(master_key_id)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("unknown master key: {master_key_id}"))
    }

    /// Wrap or unwrap a data key under the master key.  CTR is an
    /// involution, so the same operation serves both directions.
    fn wrap(master_key: &[u8; 32], data_key: &[u8; 32]) -> [u8; 32] {
        let mut out = *data_key;
        let iv = [0u8; 16];
        let mut cipher = Aes256Ctr::new(master_key.into(), &iv.into());
        cipher.apply_keystream(&mut out);
        out
    }
}

#[async_trait]
impl KeyManager for MemoryKeyManager {
    async fn create_bucket_key(&self) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let key: [u8; 32] = rand::random();
        self.keys.write().await.insert(id.clone(), key);
        Ok(id)
    }

    async fn destroy_bucket_key(&self, master_key_id: &str) -> anyhow::Result<()> {
        self.keys.write().await.remove(master_key_id);
        Ok(())
    }

    async fn create_cipher_bundle(&self, master_key_id: &str) -> anyhow::Result<CipherBundle> {
        let master_key = self.master_key(master_key_id).await?;
        let data_key: [u8; 32] = rand::random();
        let wrapped = Self::wrap(&master_key, &data_key);
        Ok(CipherBundle {
            ciphered_data_key: BASE64_STANDARD.encode(wrapped),
            crypto_scheme: CRYPTO_SCHEME_AES_CTR,
            master_key_id: master_key_id.to_string(),
            cipher: DataCipher::new(&data_key, 0),
        })
    }

    async fn create_decipher_bundle(
        &self,
        master_key_id: &str,
        ciphered_data_key: &str,
        offset: u64,
    ) -> anyhow::Result<DataCipher> {
        let master_key = self.master_key(master_key_id).await?;
        let wrapped_vec = BASE64_STANDARD
            .decode(ciphered_data_key)
            .map_err(|e| anyhow::anyhow!("invalid ciphered data key: {e}"))?;
        let wrapped: [u8; 32] = wrapped_vec
            .try_into()
            .map_err(|_| anyhow::anyhow!("ciphered data key must be 32 bytes"))?;
        let data_key = Self::wrap(&master_key, &wrapped);
        Ok(DataCipher::new(&data_key, offset))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let kms = MemoryKeyManager::new();
        let key_id = kms.create_bucket_key().await.unwrap();

        let plaintext = Bytes::from("the quick brown fox jumps over the lazy dog");
        let mut bundle = kms.create_cipher_bundle(&key_id).await.unwrap();
        let ciphertext = bundle.cipher.apply(plaintext.clone());
        assert_ne!(ciphertext, plaintext);

        let mut decipher = kms
            .create_decipher_bundle(&key_id, &bundle.ciphered_data_key, 0)
            .await
            .unwrap();
        assert_eq!(decipher.apply(ciphertext), plaintext);
    }

    #[tokio::test]
    async fn test_ranged_decipher_aligns_keystream() {
        let kms = MemoryKeyManager::new();
        let key_id = kms.create_bucket_key().await.unwrap();

        let plaintext = Bytes::from(vec![7u8; 100]);
        let mut bundle = kms.create_cipher_bundle(&key_id).await.unwrap();
        let ciphertext = bundle.cipher.apply(plaintext.clone());

        // Decipher only bytes [37, 100) by seeking to the range start.
        let mut decipher = kms
            .create_decipher_bundle(&key_id, &bundle.ciphered_data_key, 37)
            .await
            .unwrap();
        let tail = decipher.apply(ciphertext.slice(37..));
        assert_eq!(tail, plaintext.slice(37..));
    }

    #[tokio::test]
    async fn test_destroyed_key_is_unusable() {
        let kms = MemoryKeyManager::new();
        let key_id = kms.create_bucket_key().await.unwrap();
        kms.destroy_bucket_key(&key_id).await.unwrap();
        assert!(kms.create_cipher_bundle(&key_id).await.is_err());
        // Destroying again is not an error.
        kms.destroy_bucket_key(&key_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_data_keys_per_object() {
        let kms = MemoryKeyManager::new();
        let key_id = kms.create_bucket_key().await.unwrap();
        let a = kms.create_cipher_bundle(&key_id).await.unwrap();
        let b = kms.create_cipher_bundle(&key_id).await.unwrap();
        assert_ne!(a.ciphered_data_key, b.ciphered_data_key);
    }
}
