use crate::db::connectors::{BackendKind, ConnectionConfig};
use crate::report::Connection;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// Errors from secret encryption and decryption.
///
/// Messages never include key material, ciphertext or plaintext.
#[derive(Debug, Clone, PartialEq)]
pub enum CredentialError {
    MissingKey(String),
    MalformedCiphertext,
    DecryptionFailed,
    EncryptionFailed,
    UnsupportedBackend(String),
}

impl std::fmt::Display for CredentialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialError::MissingKey(var) => {
                write!(f, "Encryption key not configured (set {})", var)
            }
            CredentialError::MalformedCiphertext => write!(f, "Stored secret is malformed"),
            CredentialError::DecryptionFailed => {
                write!(f, "Stored secret could not be decrypted with the configured key")
            }
            CredentialError::EncryptionFailed => write!(f, "Secret could not be encrypted"),
            CredentialError::UnsupportedBackend(kind) => {
                write!(f, "Unsupported database type: {}", kind)
            }
        }
    }
}

impl std::error::Error for CredentialError {}

/// Keyed cipher used to open connection secrets at call time.
///
/// Injected into the engine so tests can supply their own key, and so the
/// plaintext exists only for the lifetime of one connection attempt.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError>;

    fn decrypt(&self, ciphertext: &str) -> Result<String, CredentialError>;
}

/// AES-256-GCM cipher keyed by the SHA-256 digest of a passphrase.
///
/// Token format: unpadded base64 of `nonce || ciphertext || tag`.
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    pub fn new(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();
        let key = Key::<Aes256Gcm>::from_slice(digest.as_slice());
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Build a cipher from the passphrase stored in the environment variable `var`.
    pub fn from_env(var: &str) -> Result<Self, CredentialError> {
        match std::env::var(var) {
            Ok(passphrase) if !passphrase.is_empty() => Ok(Self::new(&passphrase)),
            _ => Err(CredentialError::MissingKey(var.to_string())),
        }
    }
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CredentialError::EncryptionFailed)?;

        let mut token = Vec::with_capacity(NONCE_LEN + sealed.len());
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&sealed);
        Ok(STANDARD_NO_PAD.encode(token))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CredentialError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }

        let token = STANDARD_NO_PAD
            .decode(ciphertext.trim())
            .map_err(|_| CredentialError::MalformedCiphertext)?;
        if token.len() <= NONCE_LEN {
            return Err(CredentialError::MalformedCiphertext);
        }

        let (nonce, sealed) = token.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CredentialError::DecryptionFailed)?;
        String::from_utf8(plaintext).map_err(|_| CredentialError::DecryptionFailed)
    }
}

/// Build a ConnectionConfig from a stored connection and a cipher.
/// The secret is decrypted here and lives only in the returned config.
pub fn build_connection_config(
    connection: &Connection,
    cipher: &dyn SecretCipher,
    connection_timeout_secs: u64,
) -> Result<ConnectionConfig, CredentialError> {
    let kind: BackendKind = connection
        .kind
        .parse()
        .map_err(|_| CredentialError::UnsupportedBackend(connection.kind.clone()))?;

    let password = cipher.decrypt(&connection.encrypted_secret)?;

    Ok(ConnectionConfig {
        kind,
        host: connection.host.clone(),
        port: connection.port.unwrap_or_else(|| kind.default_port()),
        database: connection.database.clone(),
        username: connection.username.clone(),
        password,
        connection_timeout_secs,
    })
}
