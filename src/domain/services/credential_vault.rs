//! Credential vault
//!
//! Exchange API credentials are stored as AES-256-GCM ciphertexts. Each
//! ciphertext is bound to its `(exchange, account_id, user_id)` context twice:
//! the data key is derived from the master key with HKDF-SHA256 using the
//! context as info, and the context is passed as associated data. Decrypting
//! under any other context fails.
//!
//! Encoding: `base64(version || nonce || ciphertext+tag)`.
//!
//! Decrypted values are kept in a small LRU cache with a TTL so a burst of
//! dispatches for one account does not pay for key derivation every time.
//! Cached plaintexts are zeroized on eviction and never persisted.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use lru::LruCache;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::domain::entities::account::{CredentialContext, ExchangeAccount};
use crate::domain::errors::DispatchError;
use crate::domain::repositories::exchange_client::ApiCredentials;

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HKDF_SALT: &[u8] = b"signal-dispatch/credential-vault/v1";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VaultError {
    #[error("Master key must be 32 bytes, got {0}")]
    InvalidMasterKey(usize),

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Unsupported ciphertext version: {0}")]
    UnsupportedVersion(u8),

    /// Wrong key, wrong context or tampered data. Deliberately uninformative.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,
}

impl From<VaultError> for DispatchError {
    fn from(err: VaultError) -> Self {
        DispatchError::AuthenticationFailure(format!("credential vault: {}", err))
    }
}

struct CachedSecret {
    plaintext: Zeroizing<String>,
    expires_at: Instant,
}

pub struct CredentialVault {
    master_key: Zeroizing<[u8; KEY_LEN]>,
    cache: Mutex<LruCache<[u8; 32], CachedSecret>>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("master_key", &"[REDACTED]")
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl CredentialVault {
    pub fn new(
        master_key: &[u8],
        cache_ttl: Duration,
        cache_capacity: usize,
    ) -> Result<Self, VaultError> {
        if master_key.len() != KEY_LEN {
            return Err(VaultError::InvalidMasterKey(master_key.len()));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(master_key);

        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            master_key: key,
            cache: Mutex::new(LruCache::new(capacity)),
            cache_ttl,
        })
    }

    fn cipher_for(&self, context: &CredentialContext) -> Result<Aes256Gcm, VaultError> {
        let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), self.master_key.as_ref());
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(&context.to_bytes(), okm.as_mut())
            .map_err(|_| VaultError::EncryptionFailed)?;
        Aes256Gcm::new_from_slice(okm.as_ref()).map_err(|_| VaultError::EncryptionFailed)
    }

    pub fn encrypt(&self, plaintext: &str, context: &CredentialContext) -> Result<String, VaultError> {
        let cipher = self.cipher_for(context)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let aad = context.to_bytes();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|_| VaultError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(1 + NONCE_LEN + sealed.len());
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    pub fn decrypt(
        &self,
        ciphertext: &str,
        context: &CredentialContext,
    ) -> Result<Zeroizing<String>, VaultError> {
        let cache_key = Self::cache_key(ciphertext, context);
        if let Some(hit) = self.cached(&cache_key) {
            return Ok(hit);
        }

        let plaintext = self.decrypt_uncached(ciphertext, context)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                cache_key,
                CachedSecret {
                    plaintext: plaintext.clone(),
                    expires_at: Instant::now() + self.cache_ttl,
                },
            );
        }
        Ok(plaintext)
    }

    fn decrypt_uncached(
        &self,
        ciphertext: &str,
        context: &CredentialContext,
    ) -> Result<Zeroizing<String>, VaultError> {
        let raw = Zeroizing::new(
            BASE64
                .decode(ciphertext.trim())
                .map_err(|e| VaultError::Malformed(e.to_string()))?,
        );
        if raw.len() < 1 + NONCE_LEN + 16 {
            return Err(VaultError::Malformed(format!("too short ({} bytes)", raw.len())));
        }
        if raw[0] != FORMAT_VERSION {
            return Err(VaultError::UnsupportedVersion(raw[0]));
        }

        let (nonce, sealed) = raw[1..].split_at(NONCE_LEN);
        let cipher = self.cipher_for(context)?;
        let aad = context.to_bytes();
        let plain = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(nonce),
                    Payload {
                        msg: sealed,
                        aad: &aad,
                    },
                )
                .map_err(|_| {
                    warn!(
                        exchange = %context.exchange,
                        account_id = context.account_id,
                        "Credential decryption failed"
                    );
                    VaultError::DecryptionFailed
                })?,
        );

        let text = std::str::from_utf8(&plain).map_err(|_| VaultError::DecryptionFailed)?;
        Ok(Zeroizing::new(text.to_string()))
    }

    /// Decrypt every credential field of an account
    pub fn decrypt_credentials(&self, account: &ExchangeAccount) -> Result<ApiCredentials, VaultError> {
        let context = account.credential_context();
        let api_key = self.decrypt(&account.api_key_encrypted, &context)?;
        let api_secret = self.decrypt(&account.api_secret_encrypted, &context)?;
        let passphrase = account
            .passphrase_encrypted
            .as_deref()
            .map(|p| self.decrypt(p, &context))
            .transpose()?;

        Ok(ApiCredentials {
            api_key: api_key.to_string(),
            api_secret,
            passphrase,
        })
    }

    pub fn clear_cache(&self) -> usize {
        match self.cache.lock() {
            Ok(mut cache) => {
                let n = cache.len();
                cache.clear();
                debug!("Cleared {} cached credential(s)", n);
                n
            }
            Err(_) => 0,
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn cached(&self, key: &[u8; 32]) -> Option<Zeroizing<String>> {
        let mut cache = self.cache.lock().ok()?;
        let expired = match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.plaintext.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        None
    }

    fn cache_key(ciphertext: &str, context: &CredentialContext) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(ciphertext.as_bytes());
        hasher.update([0u8]);
        hasher.update(context.to_bytes());
        hasher.finalize().into()
    }
}
