//! Cryptographic primitives consumed by the handshake and the transport.
//!
//! Everything above this module works on byte strings and opaque key
//! handles. Adding a cipher suite means adding a [`HandshakeCipher`]
//! variant and a `SecretKey` arm here; the state machine and the
//! connection contexts do not change.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use p256::EncodedPoint;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the per-message handshake nonce.
pub const NONCE_LEN: usize = 32;

/// Length of every symmetric key this crate derives.
pub const KEY_LEN: usize = 32;

/// Length of a SHA-512 commitment.
pub const COMMITMENT_LEN: usize = 64;

/// ChaCha20-Poly1305 nonce length.
pub const AEAD_NONCE_LEN: usize = 12;

/// ChaCha20-Poly1305 authentication tag length.
pub const AEAD_TAG_LEN: usize = 16;

/// Errors raised by the primitive layer.
#[derive(Debug, Error)]
pub enum PrimitiveError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key agreement produced a non-contributory secret")]
    NonContributory,

    #[error("invalid key derivation output length: {0}")]
    InvalidOutputLength(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed")]
    Decryption,
}

/// Handshake cipher suites.
///
/// The numeric identifiers are what travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeCipher {
    /// ECDH over NIST P-256, SHA-512 commitments.
    P256Sha512,
    /// X25519, SHA-512 commitments.
    Curve25519Sha512,
}

impl HandshakeCipher {
    /// Wire identifier.
    pub const fn id(self) -> u32 {
        match self {
            Self::P256Sha512 => 100,
            Self::Curve25519Sha512 => 200,
        }
    }

    /// Look up a suite by wire identifier.
    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            100 => Some(Self::P256Sha512),
            200 => Some(Self::Curve25519Sha512),
            _ => None,
        }
    }

    /// Length of an encoded public key for this suite.
    pub const fn public_key_len(self) -> usize {
        match self {
            // SEC1 uncompressed point
            Self::P256Sha512 => 65,
            Self::Curve25519Sha512 => 32,
        }
    }
}

impl std::fmt::Display for HandshakeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P256Sha512 => write!(f, "P256_SHA512"),
            Self::Curve25519Sha512 => write!(f, "CURVE25519_SHA512"),
        }
    }
}

/// Raw Diffie-Hellman output. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_LEN]);

impl SharedSecret {
    /// Get the raw bytes (be careful with this!)
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

enum SecretKey {
    Curve25519(x25519_dalek::StaticSecret),
    P256(p256::ecdh::EphemeralSecret),
}

/// Ephemeral key pair, generated fresh for every handshake attempt.
pub struct EphemeralKeyPair {
    cipher: HandshakeCipher,
    secret: SecretKey,
    public_key: Vec<u8>,
}

impl EphemeralKeyPair {
    /// Generate a new key pair for `cipher` from the OS CSPRNG.
    pub fn generate(cipher: HandshakeCipher) -> Self {
        match cipher {
            HandshakeCipher::Curve25519Sha512 => {
                let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
                let public = x25519_dalek::PublicKey::from(&secret);
                Self {
                    cipher,
                    public_key: public.as_bytes().to_vec(),
                    secret: SecretKey::Curve25519(secret),
                }
            }
            HandshakeCipher::P256Sha512 => {
                let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
                let public = EncodedPoint::from(secret.public_key());
                Self {
                    cipher,
                    public_key: public.as_bytes().to_vec(),
                    secret: SecretKey::P256(secret),
                }
            }
        }
    }

    /// Suite this key pair belongs to.
    pub fn cipher(&self) -> HandshakeCipher {
        self.cipher
    }

    /// Encoded public key to share with the peer.
    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Compute the shared secret with a peer's encoded public key.
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<SharedSecret, PrimitiveError> {
        match &self.secret {
            SecretKey::Curve25519(secret) => {
                let bytes: [u8; 32] = peer_public.try_into().map_err(|_| {
                    PrimitiveError::InvalidPublicKey(format!(
                        "expected 32 bytes, got {}",
                        peer_public.len()
                    ))
                })?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(bytes));
                if !shared.was_contributory() {
                    return Err(PrimitiveError::NonContributory);
                }
                Ok(SharedSecret(shared.to_bytes()))
            }
            SecretKey::P256(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_public).map_err(|_| {
                    PrimitiveError::InvalidPublicKey("not a valid P-256 point".into())
                })?;
                let shared = secret.diffie_hellman(&peer);
                let mut raw = [0u8; KEY_LEN];
                raw.copy_from_slice(shared.raw_secret_bytes().as_slice());
                Ok(SharedSecret(raw))
            }
        }
    }
}

/// Commitment to a public key: `SHA-512(be32(cipher_id) || public_key)`.
pub fn commitment(cipher: HandshakeCipher, public_key: &[u8]) -> [u8; COMMITMENT_LEN] {
    let mut hasher = Sha512::new();
    hasher.update(cipher.id().to_be_bytes());
    hasher.update(public_key);
    hasher.finalize().into()
}

/// SHA-256 digest.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// HKDF-SHA256 extract-and-expand into `out`.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    out: &mut [u8],
) -> Result<(), PrimitiveError> {
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, out)
        .map_err(|_| PrimitiveError::InvalidOutputLength(out.len()))
}

/// HKDF-SHA256 producing one 32-byte key.
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; KEY_LEN], PrimitiveError> {
    let mut key = [0u8; KEY_LEN];
    hkdf_sha256(ikm, salt, info, &mut key)?;
    Ok(key)
}

/// Fresh 32-byte handshake nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt with ChaCha20-Poly1305 under a random nonce.
///
/// Returns `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    let mut nonce_bytes = [0u8; AEAD_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let cipher = ChaCha20Poly1305::new(key.into());
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| PrimitiveError::Encryption)?;

    let mut out = Vec::with_capacity(AEAD_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open an envelope produced by [`seal`].
pub fn open(key: &[u8; KEY_LEN], envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, PrimitiveError> {
    if envelope.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
        return Err(PrimitiveError::Decryption);
    }
    let (nonce_bytes, ciphertext) = envelope.split_at(AEAD_NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = ChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| PrimitiveError::Decryption)
}
