//! Encryption of long-lived credentials at rest.
//!
//! Installation access tokens are stored encrypted; the database never holds
//! plaintext. Each call to [`Vault::encrypt`] derives a fresh key from the
//! master secret via PBKDF2-HMAC-SHA256 with a random per-blob salt, then
//! seals the plaintext with AES-256-GCM under a random nonce.
//!
//! Blob layout, stored as one opaque value:
//!
//! ```text
//! salt (16) ‖ nonce (12) ‖ tag (16) ‖ ciphertext
//! ```
//!
//! Decryption fails with [`VaultError::Authentication`] when the tag does not
//! verify. That error must never be swallowed: it means the stored blob is
//! corrupt or was tampered with.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// PBKDF2 iteration count. Key derivation is deliberately slow; tokens are
/// encrypted once per mint and decrypted once per use, so the cost is paid
/// rarely.
const PBKDF2_ROUNDS: u32 = 150_000;

#[derive(Debug, Error)]
pub enum VaultError {
    /// The blob is shorter than `salt + nonce + tag` and cannot contain a
    /// valid ciphertext.
    #[error("encrypted blob is truncated: {actual} bytes, need at least {min}", min = SALT_LEN + NONCE_LEN + TAG_LEN)]
    Truncated { actual: usize },

    /// The authentication tag did not verify: the blob is corrupt or was
    /// tampered with.
    #[error("credential blob failed authentication: corrupt or tampered data")]
    Authentication,

    /// AES-GCM refused the encryption input (practically unreachable for
    /// in-memory plaintexts).
    #[error("encryption failed")]
    Encryption,
}

/// Symmetric vault for credentials at rest.
///
/// Cheap to clone; holds only the master secret. Key material is derived per
/// operation, so no plaintext key outlives a single call.
#[derive(Clone)]
pub struct Vault {
    master_secret: Vec<u8>,
}

impl Vault {
    pub fn new(master_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            master_secret: master_secret.into(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.master_secret, salt, PBKDF2_ROUNDS, &mut key);
        key
    }

    /// Encrypts `plaintext` into an opaque blob.
    ///
    /// A fresh salt and nonce are drawn per call, so encrypting the same
    /// plaintext twice yields unrelated blobs.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).expect("derived key is always 32 bytes");
        let nonce = Nonce::from_slice(&nonce_bytes);

        // The aead crate appends the tag to the ciphertext; split it back out
        // so the stored layout is salt ‖ nonce ‖ tag ‖ ciphertext.
        let sealed = cipher
            .encrypt(nonce, Payload::from(plaintext))
            .map_err(|_| VaultError::Encryption)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);
        Ok(blob)
    }

    /// Decrypts a blob produced by [`Vault::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, VaultError> {
        if blob.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(VaultError::Truncated { actual: blob.len() });
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce_bytes, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let key = self.derive_key(salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).expect("derived key is always 32 bytes");
        let nonce = Nonce::from_slice(nonce_bytes);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        cipher
            .decrypt(nonce, Payload::from(sealed.as_slice()))
            .map_err(|_| VaultError::Authentication)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the master secret.
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn vault() -> Vault {
        Vault::new(b"test-master-secret".to_vec())
    }

    #[test]
    fn test_round_trip() {
        let v = vault();
        let blob = v.encrypt(b"ghs_installation_token_123").unwrap();
        assert_eq!(v.decrypt(&blob).unwrap(), b"ghs_installation_token_123");
    }

    #[test]
    fn test_round_trip_empty_plaintext() {
        let v = vault();
        let blob = v.encrypt(b"").unwrap();
        assert_eq!(v.decrypt(&blob).unwrap(), b"");
    }

    #[test]
    fn test_round_trip_delimiter_bytes() {
        // Plaintext that looks like internal structure (salt/nonce-sized runs
        // of zeros, 0xff, and separator-ish bytes) must survive unchanged.
        let v = vault();
        let plaintext: Vec<u8> = [vec![0u8; 16], vec![0xff; 12], b"||::\n\0".to_vec()].concat();
        let blob = v.encrypt(&plaintext).unwrap();
        assert_eq!(v.decrypt(&blob).unwrap(), plaintext);
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_encryption() {
        let v = vault();
        let a = v.encrypt(b"same plaintext").unwrap();
        let b = v.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..SALT_LEN], &b[..SALT_LEN]);
    }

    #[test]
    fn test_tampering_any_byte_fails() {
        let v = vault();
        let blob = v.encrypt(b"secret token").unwrap();

        for i in 0..blob.len() {
            let mut tampered = blob.clone();
            tampered[i] ^= 0x01;
            assert!(
                v.decrypt(&tampered).is_err(),
                "tampering byte {i} must not decrypt"
            );
        }
    }

    #[test]
    fn test_wrong_master_secret_fails() {
        let blob = vault().encrypt(b"secret token").unwrap();
        let other = Vault::new(b"different-master-secret".to_vec());
        assert!(matches!(
            other.decrypt(&blob),
            Err(VaultError::Authentication)
        ));
    }

    #[test]
    fn test_truncated_blob_is_distinct_error() {
        let v = vault();
        let blob = v.encrypt(b"secret token").unwrap();
        assert!(matches!(
            v.decrypt(&blob[..SALT_LEN + NONCE_LEN]),
            Err(VaultError::Truncated { .. })
        ));
        assert!(matches!(v.decrypt(b""), Err(VaultError::Truncated { .. })));
    }

    proptest! {
        // PBKDF2 at full cost makes per-case encryption slow; keep the case
        // count modest.
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn prop_round_trip_arbitrary_bytes(
            plaintext in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let v = vault();
            let blob = v.encrypt(&plaintext).unwrap();
            prop_assert_eq!(v.decrypt(&blob).unwrap(), plaintext);
        }
    }
}
