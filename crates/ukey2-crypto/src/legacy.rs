//! Legacy two-message exchange, kept for peers that predate UKEY2.
//!
//! ```text
//! Initiator                                   Responder
//!     |  LegacyHello { pk_i }                     |
//!     |------------------------------------------>|
//!     |  LegacyResponderHello { pk_r, sealed }    |  sealed under DH(pk_i, pk_r), seq 1
//!     |<------------------------------------------|
//! ```
//!
//! There is no commitment and no verification string. Both directions
//! share the raw X25519 output as key. The sealed frame carries the
//! responder's payload as an encoded `Option<bytes>`.

use tracing::{debug, warn};

use crate::config::DEFAULT_MAX_MESSAGE_SIZE;
use crate::connection::{open_frame, seal_frame, ConnectionContext, ConnectionError, PayloadType};
use crate::handshake::HandshakeError;
use crate::primitives::{EphemeralKeyPair, HandshakeCipher};
use crate::wire::{self, AlertKind, ClientInit, LegacyHello, LegacyResponderHello, MessageType, Ukey2Message};

/// Sequence number of the sealed responder hello.
const RESPONDER_HELLO_SEQ: i32 = 1;

fn legacy_error(kind: AlertKind, reason: impl Into<String>) -> HandshakeError {
    let reason = reason.into();
    warn!(kind = ?kind, %reason, "legacy handshake failed");
    HandshakeError::Alert {
        kind,
        reason,
        alert_message: None,
    }
}

fn shared_key(key: &EphemeralKeyPair, peer_public: &[u8]) -> Result<[u8; 32], HandshakeError> {
    key.diffie_hellman(peer_public)
        .map(|shared| *shared.as_bytes())
        .map_err(|e| legacy_error(AlertKind::BadPublicKey, e.to_string()))
}

/// Initiator side of the legacy exchange.
pub struct LegacyInitiator {
    key: EphemeralKeyPair,
    max_message_size: u64,
}

impl LegacyInitiator {
    pub fn new() -> Self {
        Self {
            key: EphemeralKeyPair::generate(HandshakeCipher::Curve25519Sha512),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub(crate) fn with_max_message_size(mut self, limit: u64) -> Self {
        self.max_message_size = limit;
        self
    }

    pub fn public_key(&self) -> &[u8] {
        self.key.public_key()
    }

    pub fn hello_message(&self) -> Result<Vec<u8>, HandshakeError> {
        let hello = LegacyHello {
            public_key: self.public_key().to_vec(),
        };
        wire::encode(&hello, self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::InternalError, e.to_string()))
    }

    /// Complete the exchange from the responder's reply.
    ///
    /// Returns the connection and the responder's payload, if it sent one.
    pub fn finish(
        self,
        reply: &[u8],
    ) -> Result<(ConnectionContext, Option<Vec<u8>>), HandshakeError> {
        let reply: LegacyResponderHello = wire::decode(reply, self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::BadMessage, e.to_string()))?;

        let key = shared_key(&self.key, &reply.public_key)?;
        let frame = open_frame(&key, &reply.sealed)?;
        if frame.payload_type != PayloadType::LegacyHandshake {
            return Err(legacy_error(
                AlertKind::BadMessageData,
                format!("unexpected payload type {:?}", frame.payload_type),
            ));
        }

        let decode_seq = frame
            .sequence_number
            .checked_add(1)
            .ok_or(ConnectionError::SequenceExhausted)?;
        debug!(seq = frame.sequence_number, "legacy handshake complete (initiator)");

        let payload: Option<Vec<u8>> = wire::decode(&frame.payload, self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::BadMessageData, e.to_string()))?;
        Ok((ConnectionContext::legacy(key, 0, decode_seq), payload))
    }
}

impl Default for LegacyInitiator {
    fn default() -> Self {
        Self::new()
    }
}

/// Responder side of the legacy exchange.
#[derive(Debug, Clone)]
pub struct LegacyResponder {
    max_message_size: u64,
}

impl LegacyResponder {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub(crate) fn with_max_message_size(limit: u64) -> Self {
        Self {
            max_message_size: limit,
        }
    }

    /// Answer the initiator's first message.
    ///
    /// Accepts a [`LegacyHello`], or a versioned ClientInit carrying a
    /// legacy key offer. `payload` travels sealed in the reply.
    pub fn respond(
        &self,
        first_message: &[u8],
        payload: Option<&[u8]>,
    ) -> Result<(Vec<u8>, ConnectionContext), HandshakeError> {
        let peer_public = self.peer_public_key(first_message)?;

        let key_pair = EphemeralKeyPair::generate(HandshakeCipher::Curve25519Sha512);
        let key = shared_key(&key_pair, &peer_public)?;
        let payload = wire::encode(&payload.map(<[u8]>::to_vec), self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::InternalError, e.to_string()))?;
        let sealed = seal_frame(&key, PayloadType::LegacyHandshake, RESPONDER_HELLO_SEQ, &payload)?;

        let reply = LegacyResponderHello {
            public_key: key_pair.public_key().to_vec(),
            sealed,
        };
        let reply = wire::encode(&reply, self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::InternalError, e.to_string()))?;
        debug!("legacy handshake complete (responder)");

        let context = ConnectionContext::legacy(key, RESPONDER_HELLO_SEQ, RESPONDER_HELLO_SEQ);
        Ok((reply, context))
    }

    fn peer_public_key(&self, first_message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if let Ok(hello) = wire::decode::<LegacyHello>(first_message, self.max_message_size) {
            return Ok(hello.public_key);
        }

        let envelope: Ukey2Message = wire::decode(first_message, self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::BadMessage, e.to_string()))?;
        if envelope.message_type != MessageType::ClientInit {
            return Err(legacy_error(
                AlertKind::BadMessageType,
                format!("expected ClientInit, got {:?}", envelope.message_type),
            ));
        }
        let client_init: ClientInit = wire::decode(&envelope.message_data, self.max_message_size)
            .map_err(|e| legacy_error(AlertKind::BadMessageData, e.to_string()))?;
        client_init
            .legacy_public_key
            .ok_or_else(|| legacy_error(AlertKind::BadVersion, "peer offers no legacy key"))
    }
}

impl Default for LegacyResponder {
    fn default() -> Self {
        Self::new()
    }
}
