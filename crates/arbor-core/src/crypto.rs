//! Cryptographic primitives for arbor.
//!
//! Provides three things:
//!   1. SHA-256 hashing for every Merkle hash and every Datum check
//!   2. ECDSA over P-256 for optional, advisory message signatures
//!   3. Key persistence: one private scalar per node, hex on disk
//!
//! Public keys travel as 64 raw bytes (X ‖ Y, no SEC1 tag) and signatures
//! as 64 raw bytes (r ‖ s). Both encodings are part of the wire format.

use std::fs;
use std::path::{Path, PathBuf};

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// A 32-byte SHA-256 digest. Every node in the file tree is named by one.
pub type Hash = [u8; 32];

/// Hash a byte slice, returning a 32-byte SHA-256 digest.
pub fn hash(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Incremental SHA-256 hasher for preimages assembled from several parts
/// (tag byte, child names, child hashes).
///
/// # Example
/// ```
/// use arbor_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, arbor_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Hash {
        self.0.finalize().into()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Length of a raw public key on the wire (X ‖ Y).
pub const PUBLIC_KEY_LEN: usize = 64;

/// Length of a raw signature on the wire (r ‖ s).
pub const SIGNATURE_LEN: usize = 64;

/// A peer's P-256 public key, as learned from PublicKey / PublicKeyReply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Parse the 64-byte raw wire form. Fails if the bytes are not a point
    /// on the curve.
    pub fn from_raw(raw: &[u8]) -> Result<Self, CryptoError> {
        if raw.len() != PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidPublicKey);
        }
        let mut sec1 = [0u8; PUBLIC_KEY_LEN + 1];
        sec1[0] = 0x04;
        sec1[1..].copy_from_slice(raw);
        VerifyingKey::from_sec1_bytes(&sec1)
            .map(Self)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    /// The 64-byte raw wire form.
    pub fn to_raw(&self) -> [u8; PUBLIC_KEY_LEN] {
        let point = self.0.to_encoded_point(false);
        let mut raw = [0u8; PUBLIC_KEY_LEN];
        // Uncompressed SEC1: 0x04 ‖ X ‖ Y
        raw.copy_from_slice(&point.as_bytes()[1..]);
        raw
    }

    /// Verify `signature` over `data` (SHA-256 then ECDSA).
    pub fn verify(&self, data: &[u8], signature: &[u8; SIGNATURE_LEN]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.0.verify(data, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

/// A node's long-term P-256 signing key pair.
///
/// The private scalar never leaves this struct except through
/// `private_bytes`, which hands back a zeroizing copy for persistence.
pub struct Keypair {
    signing: SigningKey,
    /// Public half, sent in PublicKey / PublicKeyReply bodies.
    pub public: PublicKey,
}

impl Keypair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let signing = SigningKey::random(&mut OsRng);
        let public = PublicKey(VerifyingKey::from(&signing));
        Self { signing, public }
    }

    /// Reconstruct a key pair from a stored private scalar.
    pub fn from_private(private_bytes: &[u8]) -> Result<Self, CryptoError> {
        let signing =
            SigningKey::from_slice(private_bytes).map_err(|_| CryptoError::InvalidPrivateKey)?;
        let public = PublicKey(VerifyingKey::from(&signing));
        Ok(Self { signing, public })
    }

    /// Serialize the private scalar for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Sign `data`, returning the 64-byte raw (r ‖ s) form.
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        let sig: Signature = self.signing.sign(data);
        let mut raw = [0u8; SIGNATURE_LEN];
        raw.copy_from_slice(&sig.to_bytes());
        raw
    }
}

// ── Persistence ───────────────────────────────────────────────────────────────

/// Load the key pair stored at `path`, or generate and store a new one.
///
/// The file holds the hex-encoded private scalar and nothing else.
pub fn load_or_create_keypair(path: &Path) -> Result<Keypair, CryptoError> {
    if path.exists() {
        let text = Zeroizing::new(
            fs::read_to_string(path).map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?,
        );
        let raw = Zeroizing::new(
            hex::decode(text.trim()).map_err(|_| CryptoError::KeyFileFormat(path.to_path_buf()))?,
        );
        let keypair =
            Keypair::from_private(&raw).map_err(|_| CryptoError::KeyFileFormat(path.to_path_buf()))?;
        tracing::debug!(path = %path.display(), "loaded key pair");
        return Ok(keypair);
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CryptoError::KeyFile(parent.to_path_buf(), e))?;
    }
    let text = Zeroizing::new(hex::encode(*keypair.private_bytes()));
    fs::write(path, text.as_bytes()).map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))?;
    restrict_permissions(path)?;
    tracing::info!(path = %path.display(), "generated new key pair");
    Ok(keypair)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), CryptoError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| CryptoError::KeyFile(path.to_path_buf(), e))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), CryptoError> {
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("public key is not a valid P-256 point")]
    InvalidPublicKey,

    #[error("private key is not a valid P-256 scalar")]
    InvalidPrivateKey,

    #[error("key file {0}: {1}")]
    KeyFile(PathBuf, std::io::Error),

    #[error("key file {0} is corrupt")]
    KeyFileFormat(PathBuf),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
