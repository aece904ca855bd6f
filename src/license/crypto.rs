//! At-rest encryption for the license record (§4.9): AES-256-GCM keyed by a PBKDF2-HMAC-SHA256
//! derivation over a process-local secret (`LICENSE_SALT` env var if set, else
//! [`DEFAULT_SECRET`]) and a random per-blob salt. The key only ever exists in memory, for the
//! duration of one encrypt/decrypt call, and is wiped on drop.
//!
//! The secret is deliberately device-independent: the record's own [`super::DeviceFingerprint`]
//! is what binds a license to a machine (checked by the manager after decryption succeeds), not
//! the at-rest key. Keying the blob to the current device would make `license.bin` undecryptable
//! from any other device, which would make reactivation-by-similarity unreachable.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::LicenseError;

const PBKDF2_ROUNDS: u32 = 210_000;
const KEY_LEN: usize = 32;

/// Used when `LICENSE_SALT` is unset. Not a secret in the cryptographic sense (it ships in the
/// binary); `LICENSE_SALT` is what an operator sets to keep `license.bin` unreadable by a stock
/// build of this binary.
pub const DEFAULT_SECRET: &[u8] = b"isx-pulse-license-v1-default-secret";

#[derive(ZeroizeOnDrop)]
struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    fn derive(secret: &[u8], salt: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(secret, salt, PBKDF2_ROUNDS, &mut key);
        Self(key)
    }
}

/// Ciphertext + the nonce and salt needed to decrypt it, all safe to persist on disk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EncryptedBlob {
    pub salt: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

pub fn encrypt(plaintext: &[u8], secret: &[u8]) -> Result<EncryptedBlob, LicenseError> {
    let mut salt = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
    let mut derived = DerivedKey::derive(secret, &salt);

    let key = Key::<Aes256Gcm>::from_slice(&derived.0);
    let cipher = Aes256Gcm::new(key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| LicenseError::Crypto("encryption failed".to_string()))?;

    derived.0.zeroize();

    Ok(EncryptedBlob {
        salt: salt.to_vec(),
        nonce: nonce.to_vec(),
        ciphertext,
    })
}

pub fn decrypt(blob: &EncryptedBlob, secret: &[u8]) -> Result<Vec<u8>, LicenseError> {
    let mut derived = DerivedKey::derive(secret, &blob.salt);
    let key = Key::<Aes256Gcm>::from_slice(&derived.0);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&blob.nonce);

    let plaintext = cipher
        .decrypt(nonce, blob.ciphertext.as_ref())
        .map_err(|_| LicenseError::Crypto("license record is corrupt or was written with a different LICENSE_SALT".to_string()))?;

    derived.0.zeroize();
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_with_the_same_secret() {
        let blob = encrypt(b"secret payload", DEFAULT_SECRET).unwrap();
        let decrypted = decrypt(&blob, DEFAULT_SECRET).unwrap();
        assert_eq!(decrypted, b"secret payload");
    }

    #[test]
    fn fails_to_decrypt_with_a_different_secret() {
        let blob = encrypt(b"secret payload", DEFAULT_SECRET).unwrap();
        assert!(decrypt(&blob, b"some-other-secret").is_err());
    }
}
