//! Handshake message schemas and their binary encoding.
//!
//! # Wire Format
//!
//! Every versioned handshake message travels inside a [`Ukey2Message`]
//! envelope whose `message_data` holds one of the inner messages below.
//! Both layers are bincode with fixed-width little-endian integers and
//! length-prefixed byte strings; trailing bytes are rejected.
//!
//! ```text
//! Ukey2Message   { message_type: u32, message_data: bytes }
//! ClientInit     { version, random[32], cipher_commitments, next_protocol?, legacy_public_key? }
//! ServerInit     { version, random[32], handshake_cipher, public_key, payload? }
//! ClientFinished { public_key }
//! Alert          { kind, error_message }
//! ```
//!
//! The legacy protocol has no envelope and no version field:
//!
//! ```text
//! LegacyHello          { public_key }
//! LegacyResponderHello { public_key, sealed }
//! ```
//!
//! A legacy message starts with the 8-byte length of an encoded public
//! key, which never decodes as a valid `message_type`, so the two
//! families cannot be confused.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The only protocol version this crate speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Lowest version accepted from a peer.
pub const MIN_SUPPORTED_VERSION: u32 = 1;

/// Highest version accepted from a peer.
pub const MAX_SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit)
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode `value`, failing if the result would exceed `limit` bytes.
pub fn encode<T: Serialize>(value: &T, limit: u64) -> Result<Vec<u8>, WireError> {
    options(limit)
        .serialize(value)
        .map_err(|e| WireError::Encode(e.to_string()))
}

/// Decode a `T` that must span all of `bytes`, at most `limit` bytes long.
pub fn decode<T: DeserializeOwned>(bytes: &[u8], limit: u64) -> Result<T, WireError> {
    // bincode's limit does not cover byte strings borrowed from a slice.
    if bytes.len() as u64 > limit {
        return Err(WireError::Decode(format!(
            "message of {} bytes exceeds limit of {limit}",
            bytes.len()
        )));
    }
    options(limit)
        .deserialize(bytes)
        .map_err(|e| WireError::Decode(e.to_string()))
}

/// Handshake message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Alert,
    ClientInit,
    ServerInit,
    ClientFinished,
}

/// Outer handshake envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ukey2Message {
    pub message_type: MessageType,
    pub message_data: Vec<u8>,
}

impl Ukey2Message {
    /// Encode `inner` and wrap it in an envelope of `message_type`.
    pub fn wrap<T: Serialize>(
        message_type: MessageType,
        inner: &T,
        limit: u64,
    ) -> Result<Vec<u8>, WireError> {
        let message_data = encode(inner, limit)?;
        encode(
            &Ukey2Message {
                message_type,
                message_data,
            },
            limit,
        )
    }
}

/// Commitment to the initiator's public key for one cipher suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherCommitment {
    /// Suite wire identifier; unknown values survive decoding.
    pub handshake_cipher: u32,
    pub commitment: Vec<u8>,
}

/// Message 1: initiator -> responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInit {
    pub version: u32,
    pub random: Vec<u8>,
    pub cipher_commitments: Vec<CipherCommitment>,
    pub next_protocol: Option<String>,
    /// X25519 key offered to legacy responders. Never the committed key.
    pub legacy_public_key: Option<Vec<u8>>,
}

/// Message 2: responder -> initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInit {
    pub version: u32,
    pub random: Vec<u8>,
    pub handshake_cipher: u32,
    pub public_key: Vec<u8>,
    /// Application payload sent ahead of the handshake result.
    pub payload: Option<Vec<u8>>,
}

/// Message 3: initiator -> responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFinished {
    pub public_key: Vec<u8>,
}

/// Reasons a handshake message is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    /// Envelope could not be decoded.
    BadMessage,
    /// Envelope decoded but carries the wrong message type.
    BadMessageType,
    /// A message arrived that the current state does not expect.
    IncorrectMessage,
    /// Inner message could not be decoded or is inconsistent.
    BadMessageData,
    BadVersion,
    BadRandom,
    BadHandshakeCipher,
    BadNextProtocol,
    BadPublicKey,
    InternalError,
}

/// Alert sent to the peer before abandoning a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub error_message: String,
}

/// Legacy message 1: initiator -> responder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyHello {
    pub public_key: Vec<u8>,
}

/// Legacy message 2: responder -> initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyResponderHello {
    pub public_key: Vec<u8>,
    /// Transport envelope sealed under the raw DH output.
    pub sealed: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 64 * 1024;

    #[test]
    fn test_envelope_wraps_inner_message() {
        let finished = ClientFinished {
            public_key: vec![7u8; 32],
        };
        let bytes = Ukey2Message::wrap(MessageType::ClientFinished, &finished, LIMIT).unwrap();

        let envelope: Ukey2Message = decode(&bytes, LIMIT).unwrap();
        assert_eq!(envelope.message_type, MessageType::ClientFinished);
        let inner: ClientFinished = decode(&envelope.message_data, LIMIT).unwrap();
        assert_eq!(inner, finished);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&ClientFinished { public_key: vec![1] }, LIMIT).unwrap();
        bytes.push(0);
        assert!(decode::<ClientFinished>(&bytes, LIMIT).is_err());
    }

    #[test]
    fn test_size_limit_enforced() {
        let big = ClientFinished {
            public_key: vec![0u8; 1024],
        };
        assert!(encode(&big, 512).is_err());
        let bytes = encode(&big, LIMIT).unwrap();
        assert!(decode::<ClientFinished>(&bytes, 512).is_err());
    }

    #[test]
    fn test_legacy_messages_are_not_envelopes() {
        let hello = encode(
            &LegacyHello {
                public_key: vec![5u8; 32],
            },
            LIMIT,
        )
        .unwrap();
        assert!(decode::<Ukey2Message>(&hello, LIMIT).is_err());

        let reply = encode(
            &LegacyResponderHello {
                public_key: vec![5u8; 32],
                sealed: vec![6u8; 48],
            },
            LIMIT,
        )
        .unwrap();
        assert!(decode::<Ukey2Message>(&reply, LIMIT).is_err());
    }

    #[test]
    fn test_envelopes_are_not_legacy_messages() {
        let bytes = Ukey2Message::wrap(
            MessageType::ClientFinished,
            &ClientFinished {
                public_key: vec![7u8; 32],
            },
            LIMIT,
        )
        .unwrap();
        assert!(decode::<LegacyHello>(&bytes, LIMIT).is_err());
        assert!(decode::<LegacyResponderHello>(&bytes, LIMIT).is_err());
    }
}
