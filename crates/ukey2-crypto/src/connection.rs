//! Replay-protected message transport produced by a finished handshake.
//!
//! A [`ConnectionContext`] is either the legacy variant (one key for both
//! directions, arbitrary starting sequence numbers) or the current
//! variant (independent encode/decode keys, counters starting at 0/1).
//! Both share one encode/decode surface.
//!
//! # Wire Format
//!
//! ```text
//! [12 bytes: nonce] [ChaCha20-Poly1305 ciphertext] [16 bytes: auth tag]
//! plaintext = { payload_type: u32, sequence_number: i32, payload: bytes }
//! ```
//!
//! The sequence number lives inside the authenticated plaintext, so a
//! message cannot be re-labelled. Decoding accepts exactly the next
//! expected sequence number: replays, gaps and reordering all fail.
//!
//! # Saved sessions
//!
//! ```text
//! legacy:  [0] [key: 32] [encode_seq: 4] [decode_seq: 4]                   = 41 bytes
//! current: [1] [encode_key: 32] [decode_key: 32] [encode_seq: 4] [decode_seq: 4] = 73 bytes
//! ```
//!
//! Counters are big-endian `i32`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::fsm::Role;
use crate::primitives::{
    self, PrimitiveError, AEAD_NONCE_LEN, AEAD_TAG_LEN, KEY_LEN,
};
use crate::wire;

/// Associated data bound into every transport envelope.
const TRANSPORT_AAD: &[u8] = b"UKEY2 D2D v1";

/// Input to the salt used for connection keys and session fingerprints.
const D2D_SALT_INPUT: &[u8] = b"D2D";

/// Transport frames are bounded by the caller's payload, not by us.
const FRAME_LIMIT: u64 = u64::MAX;

/// Errors raised while encoding, decoding, saving or restoring.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("message authentication failed")]
    Authentication,

    #[error("sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: i32, actual: i32 },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unsupported session version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid saved session length for {version:?}: expected {expected}, got {actual}")]
    InvalidSessionLength {
        version: ProtocolVersion,
        expected: usize,
        actual: usize,
    },

    #[error("sequence counter exhausted")]
    SequenceExhausted,

    #[error("encryption failed")]
    Encryption,

    #[error("crypto error: {0}")]
    Crypto(#[from] PrimitiveError),
}

/// Connection protocol version, also the saved-session tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    Legacy,
    Current,
}

impl ProtocolVersion {
    /// Saved-session tag byte.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Legacy => 0,
            Self::Current => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Legacy),
            1 => Some(Self::Current),
            _ => None,
        }
    }

    /// Exact length of a saved session of this version.
    pub const fn saved_session_len(self) -> usize {
        match self {
            Self::Legacy => 1 + KEY_LEN + 8,
            Self::Current => 1 + 2 * KEY_LEN + 8,
        }
    }
}

/// What a transport frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    Application,
    /// Payload embedded in a legacy responder hello.
    LegacyHandshake,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct TransportFrame {
    pub payload_type: PayloadType,
    pub sequence_number: i32,
    pub payload: Vec<u8>,
}

/// Per-direction sequence state.
///
/// `encode_seq` is the last sequence number sent; `decode_seq` is the
/// number the next incoming message must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceCounters {
    pub encode_seq: i32,
    pub decode_seq: i32,
}

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct SessionKey([u8; KEY_LEN]);

/// Single shared key, independent counters.
#[derive(Clone)]
pub struct LegacyContext {
    key: SessionKey,
    seq: SequenceCounters,
}

/// Independent encode and decode keys.
#[derive(Clone)]
pub struct CurrentContext {
    encode_key: SessionKey,
    decode_key: SessionKey,
    seq: SequenceCounters,
}

/// Secure channel state for one session.
#[derive(Clone)]
pub enum ConnectionContext {
    Legacy(LegacyContext),
    Current(CurrentContext),
}

impl ConnectionContext {
    /// Legacy context continuing an existing stream.
    pub fn legacy(key: [u8; KEY_LEN], encode_seq: i32, decode_seq: i32) -> Self {
        Self::Legacy(LegacyContext {
            key: SessionKey(key),
            seq: SequenceCounters {
                encode_seq,
                decode_seq,
            },
        })
    }

    /// Fresh current context: nothing sent yet, expecting the peer's first message.
    pub fn current(encode_key: [u8; KEY_LEN], decode_key: [u8; KEY_LEN]) -> Self {
        Self::Current(CurrentContext {
            encode_key: SessionKey(encode_key),
            decode_key: SessionKey(decode_key),
            seq: SequenceCounters {
                encode_seq: 0,
                decode_seq: 1,
            },
        })
    }

    /// Derive a current context from the handshake's next-protocol secret.
    ///
    /// The initiator encodes with the "client" key, the responder with the
    /// "server" key.
    pub(crate) fn from_next_protocol_secret(
        secret: &[u8; KEY_LEN],
        role: Role,
    ) -> Result<Self, ConnectionError> {
        let salt = d2d_salt();
        let client_key = primitives::derive_key(secret, &salt, b"client")?;
        let server_key = primitives::derive_key(secret, &salt, b"server")?;

        Ok(match role {
            Role::Initiator => Self::current(client_key, server_key),
            Role::Responder => Self::current(server_key, client_key),
        })
    }

    pub fn version(&self) -> ProtocolVersion {
        match self {
            Self::Legacy(_) => ProtocolVersion::Legacy,
            Self::Current(_) => ProtocolVersion::Current,
        }
    }

    pub fn sequence_counters(&self) -> SequenceCounters {
        match self {
            Self::Legacy(c) => c.seq,
            Self::Current(c) => c.seq,
        }
    }

    fn parts(&mut self) -> (&[u8; KEY_LEN], &[u8; KEY_LEN], &mut SequenceCounters) {
        match self {
            Self::Legacy(c) => (&c.key.0, &c.key.0, &mut c.seq),
            Self::Current(c) => (&c.encode_key.0, &c.decode_key.0, &mut c.seq),
        }
    }

    /// Encrypt and authenticate `payload` for the peer.
    ///
    /// Each call consumes a sequence number, so the returned message is
    /// only valid once every earlier message has been delivered.
    /// `i32::MAX` is never sent: the peer could not advance past it.
    pub fn encode_message_to_peer(&mut self, payload: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let (key, _, seq) = self.parts();
        let next = seq
            .encode_seq
            .checked_add(1)
            .filter(|next| *next < i32::MAX)
            .ok_or(ConnectionError::SequenceExhausted)?;

        let message = seal_frame(key, PayloadType::Application, next, payload)?;
        seq.encode_seq = next;
        Ok(message)
    }

    /// Authenticate and decrypt a message from the peer.
    ///
    /// Fails with [`ConnectionError::SequenceMismatch`] unless the message
    /// carries exactly the next expected sequence number.
    pub fn decode_message_from_peer(&mut self, message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let (_, key, seq) = self.parts();
        let frame = open_frame(key, message)?;

        if frame.payload_type != PayloadType::Application {
            warn!(payload_type = ?frame.payload_type, "rejected unexpected payload type");
            return Err(ConnectionError::Malformed(format!(
                "unexpected payload type {:?}",
                frame.payload_type
            )));
        }

        if frame.sequence_number != seq.decode_seq {
            warn!(
                expected = seq.decode_seq,
                actual = frame.sequence_number,
                "rejected out-of-sequence message"
            );
            return Err(ConnectionError::SequenceMismatch {
                expected: seq.decode_seq,
                actual: frame.sequence_number,
            });
        }

        seq.decode_seq = seq
            .decode_seq
            .checked_add(1)
            .ok_or(ConnectionError::SequenceExhausted)?;
        Ok(frame.payload)
    }

    /// Session fingerprint, identical on both peers and independent of
    /// sequence state.
    pub fn session_unique(&self) -> [u8; 32] {
        let mut input = d2d_salt().to_vec();
        match self {
            Self::Legacy(c) => input.extend_from_slice(&c.key.0),
            Self::Current(c) => {
                // Both peers hold the same two keys in swapped roles.
                let (first, second) = if c.encode_key.0 <= c.decode_key.0 {
                    (&c.encode_key.0, &c.decode_key.0)
                } else {
                    (&c.decode_key.0, &c.encode_key.0)
                };
                input.extend_from_slice(first);
                input.extend_from_slice(second);
            }
        }
        let unique = primitives::sha256(&input);
        input.zeroize();
        unique
    }

    /// Serialize keys and counters. The result is secret.
    pub fn save_session(&self) -> Vec<u8> {
        let version = self.version();
        let mut out = Vec::with_capacity(version.saved_session_len());
        out.push(version.tag());
        match self {
            Self::Legacy(c) => out.extend_from_slice(&c.key.0),
            Self::Current(c) => {
                out.extend_from_slice(&c.encode_key.0);
                out.extend_from_slice(&c.decode_key.0);
            }
        }
        let seq = self.sequence_counters();
        out.extend_from_slice(&seq.encode_seq.to_be_bytes());
        out.extend_from_slice(&seq.decode_seq.to_be_bytes());
        debug!(version = ?version, "saved session");
        out
    }

    /// Rebuild a context from [`ConnectionContext::save_session`] output.
    pub fn restore_session(bytes: &[u8]) -> Result<Self, ConnectionError> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| ConnectionError::Malformed("empty saved session".into()))?;
        let version = ProtocolVersion::from_tag(tag).ok_or(ConnectionError::UnsupportedVersion(tag))?;

        let expected = version.saved_session_len();
        if bytes.len() != expected {
            return Err(ConnectionError::InvalidSessionLength {
                version,
                expected,
                actual: bytes.len(),
            });
        }

        let context = match version {
            ProtocolVersion::Legacy => Self::Legacy(LegacyContext {
                key: SessionKey(read_key(body, 0)),
                seq: SequenceCounters {
                    encode_seq: read_i32(body, KEY_LEN),
                    decode_seq: read_i32(body, KEY_LEN + 4),
                },
            }),
            ProtocolVersion::Current => Self::Current(CurrentContext {
                encode_key: SessionKey(read_key(body, 0)),
                decode_key: SessionKey(read_key(body, KEY_LEN)),
                seq: SequenceCounters {
                    encode_seq: read_i32(body, 2 * KEY_LEN),
                    decode_seq: read_i32(body, 2 * KEY_LEN + 4),
                },
            }),
        };
        debug!(version = ?version, "restored session");
        Ok(context)
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let unique = self.session_unique();
        f.debug_struct("ConnectionContext")
            .field("version", &self.version())
            .field("sequence", &self.sequence_counters())
            .field("session", &hex::encode(&unique[..8]))
            .finish()
    }
}

/// `SHA-256("D2D")`.
fn d2d_salt() -> [u8; 32] {
    primitives::sha256(D2D_SALT_INPUT)
}

fn read_key(bytes: &[u8], at: usize) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes[at..at + KEY_LEN]);
    key
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    i32::from_be_bytes(buf)
}

/// Seal one frame under `key`.
pub(crate) fn seal_frame(
    key: &[u8; KEY_LEN],
    payload_type: PayloadType,
    sequence_number: i32,
    payload: &[u8],
) -> Result<Vec<u8>, ConnectionError> {
    let frame = TransportFrame {
        payload_type,
        sequence_number,
        payload: payload.to_vec(),
    };
    let mut plaintext =
        wire::encode(&frame, FRAME_LIMIT).map_err(|e| ConnectionError::Malformed(e.to_string()))?;
    let sealed =
        primitives::seal(key, &plaintext, TRANSPORT_AAD).map_err(|_| ConnectionError::Encryption);
    plaintext.zeroize();
    sealed
}

/// Open one frame sealed under `key`.
pub(crate) fn open_frame(
    key: &[u8; KEY_LEN],
    message: &[u8],
) -> Result<TransportFrame, ConnectionError> {
    if message.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
        return Err(ConnectionError::Malformed(format!(
            "message too short: {} bytes",
            message.len()
        )));
    }

    let plaintext = primitives::open(key, message, TRANSPORT_AAD).map_err(|_| {
        warn!("transport message failed authentication");
        ConnectionError::Authentication
    })?;

    wire::decode(&plaintext, FRAME_LIMIT).map_err(|e| ConnectionError::Malformed(e.to_string()))
}
