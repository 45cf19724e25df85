//! Symmetric encryption of facilitator signing keys.
//!
//! Each facilitator key is stored twice: once under the owner's password and
//! once under the system master secret. Both copies use [`AesGcmCipher`]:
//! PBKDF2-HMAC-SHA256 stretches the secret into an AES-256 key, and the
//! envelope is `base64(version ‖ salt ‖ iv ‖ ciphertext+tag)`.

use std::sync::Arc;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;
use rand::rng;
use sha2::Sha256;

const VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + SALT_LEN + IV_LEN;

/// PBKDF2 rounds used when none are configured.
pub const DEFAULT_KDF_ITERATIONS: u32 = 210_000;

/// Errors from the key cipher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// The envelope is not valid base64 or is too short.
    #[error("malformed ciphertext envelope")]
    Malformed,
    /// The envelope was written by an unknown format version.
    #[error("unsupported ciphertext version {0}")]
    UnsupportedVersion(u8),
    /// Authentication failed: wrong secret or tampered data.
    #[error("decryption failed")]
    DecryptionFailed,
    /// The cipher refused the input.
    #[error("encryption failed")]
    EncryptionFailed,
    /// The blocking worker running the cipher panicked or was cancelled.
    #[error("cipher worker did not complete")]
    WorkerLost,
}

/// Encrypts and decrypts secrets under a caller-supplied passphrase.
pub trait KeyCipher: Send + Sync {
    /// Encrypts `plaintext` under `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the cipher refuses the input.
    fn encrypt(&self, plaintext: &[u8], secret: &str) -> Result<String, CryptoError>;

    /// Decrypts an envelope produced by [`encrypt`](Self::encrypt).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] if the envelope is malformed or the secret is wrong.
    fn decrypt(&self, ciphertext: &str, secret: &str) -> Result<Vec<u8>, CryptoError>;
}

/// PBKDF2-HMAC-SHA256 + AES-256-GCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AesGcmCipher {
    iterations: u32,
}

impl Default for AesGcmCipher {
    fn default() -> Self {
        Self::new(DEFAULT_KDF_ITERATIONS)
    }
}

impl AesGcmCipher {
    /// Creates a cipher deriving keys with `iterations` PBKDF2 rounds.
    #[must_use]
    pub const fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    fn derive(&self, secret: &str, salt: &[u8]) -> Aes256Gcm {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, self.iterations, &mut key);
        Aes256Gcm::new(&key.into())
    }
}

/// Runs [`KeyCipher::encrypt`] on the blocking thread pool. Key stretching is
/// CPU-bound and must not stall async workers.
///
/// # Errors
///
/// Returns the cipher's error, or [`CryptoError::WorkerLost`].
pub async fn encrypt_off_runtime(
    cipher: Arc<dyn KeyCipher>,
    plaintext: Vec<u8>,
    secret: String,
) -> Result<String, CryptoError> {
    tokio::task::spawn_blocking(move || cipher.encrypt(&plaintext, &secret))
        .await
        .map_err(|_| CryptoError::WorkerLost)?
}

/// Runs [`KeyCipher::decrypt`] on the blocking thread pool.
///
/// # Errors
///
/// Returns the cipher's error, or [`CryptoError::WorkerLost`].
pub async fn decrypt_off_runtime(
    cipher: Arc<dyn KeyCipher>,
    ciphertext: String,
    secret: String,
) -> Result<Vec<u8>, CryptoError> {
    tokio::task::spawn_blocking(move || cipher.decrypt(&ciphertext, &secret))
        .await
        .map_err(|_| CryptoError::WorkerLost)?
}

impl KeyCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], secret: &str) -> Result<String, CryptoError> {
        let salt: [u8; SALT_LEN] = rng().random();
        let iv: [u8; IV_LEN] = rng().random();
        let sealed = self
            .derive(secret, &salt)
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let mut envelope = Vec::with_capacity(HEADER_LEN + sealed.len());
        envelope.push(VERSION);
        envelope.extend_from_slice(&salt);
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&sealed);
        Ok(STANDARD.encode(envelope))
    }

    fn decrypt(&self, ciphertext: &str, secret: &str) -> Result<Vec<u8>, CryptoError> {
        let envelope = STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| CryptoError::Malformed)?;
        if envelope.len() < HEADER_LEN + TAG_LEN {
            return Err(CryptoError::Malformed);
        }
        if envelope[0] != VERSION {
            return Err(CryptoError::UnsupportedVersion(envelope[0]));
        }
        let (salt, rest) = envelope[1..].split_at(SALT_LEN);
        let (iv, sealed) = rest.split_at(IV_LEN);
        self.derive(secret, salt)
            .decrypt(Nonce::from_slice(iv), sealed)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    /// Encrypts only once the test lets it through.
    struct GatedCipher(Mutex<mpsc::Receiver<()>>);

    impl KeyCipher for GatedCipher {
        fn encrypt(&self, plaintext: &[u8], _secret: &str) -> Result<String, CryptoError> {
            self.0
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(2))
                .map_err(|_| CryptoError::EncryptionFailed)?;
            Ok(STANDARD.encode(plaintext))
        }

        fn decrypt(&self, _ciphertext: &str, _secret: &str) -> Result<Vec<u8>, CryptoError> {
            Err(CryptoError::DecryptionFailed)
        }
    }

    fn cipher() -> AesGcmCipher {
        AesGcmCipher::new(1_000)
    }

    #[test]
    fn test_round_trip_and_fresh_salt() {
        let cipher = cipher();
        let a = cipher.encrypt(b"0xdeadbeef", "master").unwrap();
        let b = cipher.encrypt(b"0xdeadbeef", "master").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a, "master").unwrap(), b"0xdeadbeef");
        assert_eq!(cipher.decrypt(&b, "master").unwrap(), b"0xdeadbeef");
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let cipher = cipher();
        let sealed = cipher.encrypt(b"key", "master").unwrap();
        assert_eq!(
            cipher.decrypt(&sealed, "not-master"),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_rejects_malformed_envelopes() {
        let cipher = cipher();
        assert_eq!(cipher.decrypt("!!!", "s"), Err(CryptoError::Malformed));
        assert_eq!(
            cipher.decrypt(&STANDARD.encode([VERSION; 10]), "s"),
            Err(CryptoError::Malformed)
        );
        let mut envelope = STANDARD.decode(cipher.encrypt(b"k", "s").unwrap()).unwrap();
        envelope[0] = 9;
        assert_eq!(
            cipher.decrypt(&STANDARD.encode(&envelope), "s"),
            Err(CryptoError::UnsupportedVersion(9))
        );
    }

    #[tokio::test]
    async fn test_off_runtime_helpers_round_trip() {
        let cipher: Arc<dyn KeyCipher> = Arc::new(cipher());
        let sealed = encrypt_off_runtime(Arc::clone(&cipher), b"0xabc".to_vec(), "m".into())
            .await
            .unwrap();
        let opened = decrypt_off_runtime(Arc::clone(&cipher), sealed.clone(), "m".into())
            .await
            .unwrap();
        assert_eq!(opened, b"0xabc");
        assert_eq!(
            decrypt_off_runtime(cipher, sealed, "other".into()).await,
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_encryption_leaves_the_async_worker_free() {
        let (go, gate) = mpsc::channel();
        let cipher: Arc<dyn KeyCipher> = Arc::new(GatedCipher(Mutex::new(gate)));
        let pending = tokio::spawn(encrypt_off_runtime(cipher, b"key".to_vec(), "m".into()));
        tokio::task::yield_now().await;
        // A cipher running on this thread would have timed out by now.
        go.send(()).unwrap();
        assert_eq!(pending.await.unwrap(), Ok(STANDARD.encode(b"key")));
    }
}
