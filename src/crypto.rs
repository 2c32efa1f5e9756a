//! Symmetric encryption used by the health prober's crypto self-test.
//!
//! Ciphertexts are laid out as `nonce (12 bytes) || sealed payload`. The
//! context string is bound as associated data, so a ciphertext only opens
//! under the context it was sealed with.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::MIN_MASTER_KEY_LEN;
use crate::error::{MonitorError, Result};

const NONCE_LEN: usize = 12;

/// Authenticated encryption bound to a caller-supplied context.
pub trait Cipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], context: &str) -> Result<Vec<u8>>;
    fn decrypt(&self, ciphertext: &[u8], context: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM keyed from the SHA-256 digest of a master key.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(master_key: &str) -> Result<Self> {
        if master_key.len() < MIN_MASTER_KEY_LEN {
            return Err(MonitorError::Crypto(format!(
                "master key must be at least {MIN_MASTER_KEY_LEN} characters"
            )));
        }

        let key = Sha256::digest(master_key.as_bytes());
        Ok(Self {
            cipher: Aes256Gcm::new(&key),
        })
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], context: &str) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| MonitorError::Crypto("encryption failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], context: &str) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(MonitorError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| MonitorError::Crypto("decryption failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::new(&"m".repeat(MIN_MASTER_KEY_LEN)).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"health_check_test", "health_check").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"health_check_test");

        let opened = cipher.decrypt(&sealed, "health_check").unwrap();
        assert_eq!(opened, b"health_check_test");
    }

    #[test]
    fn test_wrong_context_rejected() {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"secret", "a").unwrap();
        assert!(cipher.decrypt(&sealed, "b").is_err());
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = cipher();
        let a = cipher.encrypt(b"same", "ctx").unwrap();
        let b = cipher.encrypt(b"same", "ctx").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_short_key_and_truncated_input() {
        assert!(AesGcmCipher::new("short").is_err());
        assert!(cipher().decrypt(&[0u8; 4], "ctx").is_err());
    }
}
