//! Cryptographic operations for viewer hand-off links
//!
//! This module covers both sides of the link scheme: deriving the metadata
//! encryption key, nonce and auth token from a short master secret, sealing
//! and opening the event metadata with AES-256-GCM, and signing a Matrix
//! encrypted file reference with its own file key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the master secret carried in the link fragment
pub const SECRET_LEN: usize = 16;
/// Length of the derived AES-256-GCM key
pub const ENCRYPTION_KEY_LEN: usize = 32;
/// Length of the derived GCM nonce
pub const IV_LEN: usize = 12;
/// Length of the derived viewer auth token
pub const AUTH_TOKEN_LEN: usize = 32;
/// Length of the GCM tag appended to every ciphertext
pub const TAG_LEN: usize = 16;
/// Length of a Matrix attachment key (AES-256-CTR)
pub const FILE_KEY_LEN: usize = 32;

/// HKDF info label for the metadata encryption key
pub const ENCRYPTION_LABEL: &[u8] = b"encryption";
/// HKDF info label for the metadata nonce
pub const IV_LABEL: &[u8] = b"initialization";
/// HKDF info label for the viewer auth token
pub const AUTH_LABEL: &[u8] = b"authentication";

const EMPTY_SALT: &[u8] = &[];

type HmacSha256 = Hmac<Sha256>;

/// Errors produced by key derivation, sealing and signing
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// The operating system random source failed
    #[error("secure random source unavailable: {0}")]
    Random(String),

    /// HKDF refused the requested output length
    #[error("key derivation failed for {label}")]
    KeyDerivation {
        /// Label of the value being derived
        label: &'static str,
    },

    /// AEAD encryption failed
    #[error("metadata encryption failed")]
    EncryptFailed,

    /// AEAD decryption or tag verification failed
    #[error("metadata decryption failed")]
    DecryptFailed,

    /// A field was not valid unpadded base64
    #[error("invalid base64 in {field}")]
    InvalidBase64 {
        /// Name of the offending field
        field: &'static str,
    },

    /// A decoded field had the wrong length
    #[error("invalid {field} length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// Name of the offending field
        field: &'static str,
        /// Required length in bytes
        expected: usize,
        /// Actual length in bytes
        got: usize,
    },

    /// A file reference signature did not verify
    #[error("file reference signature mismatch")]
    SignatureMismatch,
}

impl CryptoError {
    /// Short stable name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Random(_) => "random",
            Self::KeyDerivation { .. } => "key_derivation",
            Self::EncryptFailed => "encrypt",
            Self::DecryptFailed => "decrypt",
            Self::InvalidBase64 { .. } => "invalid_base64",
            Self::InvalidLength { .. } => "invalid_length",
            Self::SignatureMismatch => "signature_mismatch",
        }
    }
}

/// The 16-byte master secret a self-encrypted link is built from
///
/// The secret only ever leaves the process inside the URL fragment of the
/// reply; it is wiped from memory when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; SECRET_LEN]);

impl MasterSecret {
    /// Draw a fresh secret from the operating system CSPRNG
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SECRET_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::Random(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a secret from a link fragment
    ///
    /// Accepts the base64url form the bot emits as well as standard base64,
    /// with or without padding, and an optional leading `#`.
    pub fn from_fragment(fragment: &str) -> Result<Self, CryptoError> {
        let raw = decode_unpadded(fragment.trim_start_matches('#'), "fragment")?;
        let bytes: [u8; SECRET_LEN] =
            raw.as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    field: "fragment",
                    expected: SECRET_LEN,
                    got: raw.len(),
                })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Encode the secret for use as a URL fragment (base64url, unpadded)
    pub fn to_fragment(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }
}

impl std::fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterSecret(***)")
    }
}

/// Key material derived from a [`MasterSecret`]
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub encryption_key: [u8; ENCRYPTION_KEY_LEN],
    pub iv: [u8; IV_LEN],
    pub auth_token: [u8; AUTH_TOKEN_LEN],
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("encryption_key", &"***")
            .field("iv", &"***")
            .field("auth_token", &"***")
            .finish()
    }
}

/// Derive the metadata key, nonce and auth token from a master secret
///
/// All three values come from HKDF-SHA512 over the secret with an empty salt,
/// separated only by their info labels:
///
/// ```text
/// encryption_key = HKDF-SHA512(secret, salt = "", info = "encryption",     L = 32)
/// iv             = HKDF-SHA512(secret, salt = "", info = "initialization", L = 12)
/// auth_token     = HKDF-SHA512(secret, salt = "", info = "authentication", L = 32)
/// ```
///
/// The viewer frontend performs the same derivation from the link fragment,
/// so hash, labels and lengths are fixed.
pub fn derive_keys(secret: &MasterSecret) -> Result<DerivedKeys, CryptoError> {
    let hk = Hkdf::<Sha512>::new(Some(EMPTY_SALT), secret.as_bytes());

    let mut keys = DerivedKeys {
        encryption_key: [0u8; ENCRYPTION_KEY_LEN],
        iv: [0u8; IV_LEN],
        auth_token: [0u8; AUTH_TOKEN_LEN],
    };
    hk.expand(ENCRYPTION_LABEL, &mut keys.encryption_key)
        .map_err(|_| CryptoError::KeyDerivation {
            label: "encryption",
        })?;
    hk.expand(IV_LABEL, &mut keys.iv)
        .map_err(|_| CryptoError::KeyDerivation {
            label: "initialization",
        })?;
    hk.expand(AUTH_LABEL, &mut keys.auth_token)
        .map_err(|_| CryptoError::KeyDerivation {
            label: "authentication",
        })?;
    Ok(keys)
}

/// Encrypt `plaintext` with AES-256-GCM; the 16-byte tag is appended
pub fn seal(keys: &DerivedKeys, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&keys.encryption_key)
        .map_err(|_| CryptoError::EncryptFailed)?;
    cipher
        .encrypt(Nonce::from_slice(&keys.iv), plaintext)
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Decrypt and verify a ciphertext produced by [`seal`]
pub fn open(keys: &DerivedKeys, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptFailed);
    }
    let cipher = Aes256Gcm::new_from_slice(&keys.encryption_key)
        .map_err(|_| CryptoError::DecryptFailed)?;
    cipher
        .decrypt(Nonce::from_slice(&keys.iv), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

/// Ciphertext and auth token for one self-encrypted upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMetadata {
    /// AES-256-GCM ciphertext with the tag appended
    pub ciphertext: Vec<u8>,
    /// Token the viewer uses to gate access to the ciphertext
    pub auth_token: [u8; AUTH_TOKEN_LEN],
}

/// Seal event metadata under a master secret
pub fn seal_metadata(secret: &MasterSecret, payload: &[u8]) -> Result<SealedMetadata, CryptoError> {
    let keys = derive_keys(secret)?;
    let ciphertext = seal(&keys, payload)?;
    Ok(SealedMetadata {
        ciphertext,
        auth_token: keys.auth_token,
    })
}

/// Viewer-side inverse of [`seal_metadata`]
pub fn open_metadata(secret: &MasterSecret, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let keys = derive_keys(secret)?;
    open(&keys, ciphertext)
}

/// HMAC-SHA256 over `url || sha256 || iv`, keyed with the raw file key
///
/// The three inputs are the exact strings carried in the Matrix encrypted
/// file object, concatenated without separators.
pub fn sign_file_reference(
    file_key: &[u8],
    url: &str,
    sha256: &str,
    iv: &str,
) -> Result<[u8; 32], CryptoError> {
    let mac = file_reference_mac(file_key, url, sha256, iv)?;
    Ok(mac.finalize().into_bytes().into())
}

/// Check a base64 signature produced by [`sign_file_reference`] in constant time
pub fn verify_file_reference(
    file_key: &[u8],
    url: &str,
    sha256: &str,
    iv: &str,
    signature: &str,
) -> Result<(), CryptoError> {
    let expected = decode_unpadded(signature, "signature")?;
    file_reference_mac(file_key, url, sha256, iv)?
        .verify_slice(&expected)
        .map_err(|_| CryptoError::SignatureMismatch)
}

fn file_reference_mac(
    file_key: &[u8],
    url: &str,
    sha256: &str,
    iv: &str,
) -> Result<HmacSha256, CryptoError> {
    if file_key.len() != FILE_KEY_LEN {
        return Err(CryptoError::InvalidLength {
            field: "file key",
            expected: FILE_KEY_LEN,
            got: file_key.len(),
        });
    }
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(file_key).expect("HMAC accepts keys of any length");
    mac.update(url.as_bytes());
    mac.update(sha256.as_bytes());
    mac.update(iv.as_bytes());
    Ok(mac)
}

/// SHA-256 of the raw file key, unpadded standard base64
pub fn key_digest(file_key: &[u8]) -> String {
    STANDARD_NO_PAD.encode(Sha256::digest(file_key))
}

/// Encode bytes as unpadded standard base64, the viewer's wire encoding
pub fn encode_unpadded(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Decode unpadded base64 in either the standard or the URL-safe alphabet
///
/// Trailing padding is tolerated. `field` names the input in errors.
pub fn decode_unpadded(input: &str, field: &'static str) -> Result<Vec<u8>, CryptoError> {
    let trimmed = input.trim().trim_end_matches('=');
    let decoded = if trimmed.contains(['-', '_']) {
        URL_SAFE_NO_PAD.decode(trimmed)
    } else {
        STANDARD_NO_PAD.decode(trimmed)
    };
    decoded.map_err(|_| CryptoError::InvalidBase64 { field })
}
