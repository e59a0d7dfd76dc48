//! UKEY2 handshake.
//!
//! # Handshake Flow
//!
//! ```text
//! Initiator                                   Responder
//!     |                                           |
//!     |  ClientInit { random, commitments }       |  H(cipher || pk_i) only
//!     |------------------------------------------>|
//!     |                                           |
//!     |  ServerInit { random, cipher, pk_r }      |  may carry a payload
//!     |<------------------------------------------|
//!     |                                           |
//!     |  ClientFinished { pk_i }                  |  checked against commitment
//!     |------------------------------------------>|
//!     |                                           |
//!     [  compare verification strings out of band ]
//!     [  into_connection_context()                ]
//! ```
//!
//! The initiator commits to its ephemeral key before seeing the
//! responder's, so neither side can pick a key that steers the shared
//! secret. Both secrets below are bound to the DH output and all three
//! encoded messages:
//!
//! - verification material: `HKDF-SHA256(SHA-256(dh), "UKEY2 v1 auth", M1 || M2 || M3)`
//! - next-protocol secret:  `HKDF-SHA256(SHA-256(dh), "UKEY2 v1 next", M1 || M2 || M3)`

use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use ukey2_common::constant_time_eq;

use crate::config::HandshakeConfig;
use crate::connection::{ConnectionContext, ConnectionError};
use crate::fsm::{transition, HandshakeEvent, HandshakeState, Role, Stage};
use crate::primitives::{
    self, EphemeralKeyPair, HandshakeCipher, PrimitiveError, SharedSecret, COMMITMENT_LEN,
    KEY_LEN, NONCE_LEN,
};
use crate::wire::{
    self, Alert, AlertKind, CipherCommitment, ClientFinished, ClientInit, MessageType, ServerInit,
    Ukey2Message, MAX_SUPPORTED_VERSION, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
};

const AUTH_SALT: &[u8] = b"UKEY2 v1 auth";
const NEXT_SALT: &[u8] = b"UKEY2 v1 next";

/// Longest verification string a handshake can produce.
pub const MAX_VERIFICATION_STRING_LEN: usize = 32;

/// Handshake errors.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: HandshakeState,
    },

    #[error("verification string length {0} outside 1..=32")]
    InvalidVerificationLength(usize),

    /// The peer's message was rejected. `alert_message` is an encoded
    /// alert the caller may forward to the peer.
    #[error("handshake rejected ({kind:?}): {reason}")]
    Alert {
        kind: AlertKind,
        reason: String,
        alert_message: Option<Vec<u8>>,
    },

    /// Carries a `BadPublicKey` alert for the peer.
    #[error("revealed public key does not match its commitment")]
    CommitmentMismatch { alert_message: Option<Vec<u8>> },

    #[error("peer aborted the handshake ({kind:?}): {reason}")]
    PeerAlert { kind: AlertKind, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] PrimitiveError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
}

impl HandshakeError {
    /// True when the failure points at an active attacker rather than a
    /// misbehaving or outdated peer.
    pub fn is_tampering(&self) -> bool {
        match self {
            Self::CommitmentMismatch { .. } => true,
            Self::Alert { kind, .. } => *kind == AlertKind::BadPublicKey,
            Self::Connection(ConnectionError::Authentication) => true,
            _ => false,
        }
    }

    /// True when the failure is benign version or suite skew.
    pub fn is_version_skew(&self) -> bool {
        match self {
            Self::Alert { kind, .. } | Self::PeerAlert { kind, .. } => matches!(
                kind,
                AlertKind::BadVersion | AlertKind::BadNextProtocol | AlertKind::BadHandshakeCipher
            ),
            _ => false,
        }
    }

    /// Encoded alert to forward to the peer, if any.
    pub fn alert_message(&self) -> Option<&[u8]> {
        match self {
            Self::Alert { alert_message, .. } | Self::CommitmentMismatch { alert_message } => {
                alert_message.as_deref()
            }
            _ => None,
        }
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct DerivedSecrets {
    auth: [u8; MAX_VERIFICATION_STRING_LEN],
    next: [u8; KEY_LEN],
}

impl DerivedSecrets {
    fn derive(shared: &SharedSecret, transcript: &[u8]) -> Result<Self, PrimitiveError> {
        let mut ikm = primitives::sha256(shared.as_bytes());
        let mut auth = [0u8; MAX_VERIFICATION_STRING_LEN];
        primitives::hkdf_sha256(&ikm, AUTH_SALT, transcript, &mut auth)?;
        let next = primitives::derive_key(&ikm, NEXT_SALT, transcript)?;
        ikm.zeroize();
        Ok(Self { auth, next })
    }
}

/// One UKEY2 handshake attempt for one role.
///
/// Not safe to drive from several tasks at once; it is meant to be owned
/// by a single pairing attempt. Dropping it at any point abandons the
/// attempt and wipes its secrets.
pub struct HandshakeContext {
    role: Role,
    stage: Stage,
    config: HandshakeConfig,

    /// Initiator key pairs, one per offered suite, until one is chosen.
    offered_keys: Vec<EphemeralKeyPair>,
    local_key: Option<EphemeralKeyPair>,
    cipher: Option<HandshakeCipher>,
    /// Responder copy of the commitment for the chosen suite.
    peer_commitment: Option<Vec<u8>>,
    legacy_offer: Option<Vec<u8>>,

    client_init: Option<Vec<u8>>,
    server_init: Option<Vec<u8>>,
    shared: Option<SharedSecret>,
    secrets: Option<DerivedSecrets>,
}

impl HandshakeContext {
    /// Initiator offering a single suite.
    pub fn for_initiator(cipher: HandshakeCipher) -> Self {
        Self::build(Role::Initiator, HandshakeConfig::with_cipher(cipher))
    }

    /// Responder accepting a single suite.
    pub fn for_responder(cipher: HandshakeCipher) -> Self {
        Self::build(Role::Responder, HandshakeConfig::with_cipher(cipher))
    }

    /// Context for `role` with explicit configuration.
    pub fn with_config(role: Role, config: HandshakeConfig) -> Result<Self, HandshakeError> {
        config.validate().map_err(HandshakeError::Config)?;
        Ok(Self::build(role, config))
    }

    fn build(role: Role, config: HandshakeConfig) -> Self {
        Self {
            role,
            stage: Stage::initial(role),
            config,
            offered_keys: Vec::new(),
            local_key: None,
            cipher: None,
            peer_commitment: None,
            legacy_offer: None,
            client_init: None,
            server_init: None,
            shared: None,
            secrets: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.stage.public_state()
    }

    /// Suite in use, once the responder has chosen one.
    pub fn cipher(&self) -> Option<HandshakeCipher> {
        self.cipher
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn max_message_size(&self) -> u64 {
        self.config.max_message_size
    }

    /// Attach a legacy X25519 key to the ClientInit this context will send.
    pub(crate) fn set_legacy_offer(&mut self, public_key: Vec<u8>) {
        self.legacy_offer = Some(public_key);
    }

    fn invalid_state(&self, operation: &'static str) -> HandshakeError {
        HandshakeError::InvalidState {
            operation,
            state: self.handshake_state(),
        }
    }

    fn advance(&mut self, event: HandshakeEvent) -> Result<(), HandshakeError> {
        let next = transition(self.stage, event).map_err(|e| HandshakeError::InvalidState {
            operation: "advance the handshake",
            state: e.stage.public_state(),
        })?;
        debug!(role = ?self.role, from = ?self.stage, to = ?next, "handshake transition");
        self.stage = next;
        Ok(())
    }

    /// Move to `Error`, drop key material, and build the alert to report.
    fn fail(&mut self, kind: AlertKind, reason: impl Into<String>) -> HandshakeError {
        let reason = reason.into();
        warn!(role = ?self.role, kind = ?kind, %reason, "handshake failed");
        self.poison();

        let alert_message = self.encode_alert(kind, &reason);
        HandshakeError::Alert {
            kind,
            reason,
            alert_message,
        }
    }

    fn encode_alert(&self, kind: AlertKind, reason: &str) -> Option<Vec<u8>> {
        let alert = Alert {
            kind,
            error_message: reason.to_string(),
        };
        Ukey2Message::wrap(MessageType::Alert, &alert, self.config.max_message_size).ok()
    }

    fn poison(&mut self) {
        self.stage = Stage::Error;
        self.offered_keys.clear();
        self.local_key = None;
        self.shared = None;
        self.secrets = None;
    }

    /// Produce the next outbound handshake message.
    ///
    /// `payload` is only accepted by a responder producing ServerInit; the
    /// initiator receives it from [`HandshakeContext::parse_handshake_message`].
    pub fn next_handshake_message(
        &mut self,
        payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, HandshakeError> {
        match self.stage {
            Stage::ClientStart => {
                if payload.is_some() {
                    return Err(self.invalid_state("attach a payload to ClientInit"));
                }
                self.make_client_init()
            }
            Stage::ServerAfterClientInit => self.make_server_init(payload),
            Stage::ClientAfterServerInit => {
                if payload.is_some() {
                    return Err(self.invalid_state("attach a payload to ClientFinished"));
                }
                self.make_client_finished()
            }
            _ => Err(self.invalid_state("produce a handshake message")),
        }
    }

    fn make_client_init(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let keys: Vec<EphemeralKeyPair> = self
            .config
            .ciphers
            .iter()
            .map(|cipher| EphemeralKeyPair::generate(*cipher))
            .collect();

        let client_init = ClientInit {
            version: PROTOCOL_VERSION,
            random: primitives::random_nonce().to_vec(),
            cipher_commitments: keys
                .iter()
                .map(|key| CipherCommitment {
                    handshake_cipher: key.cipher().id(),
                    commitment: primitives::commitment(key.cipher(), key.public_key()).to_vec(),
                })
                .collect(),
            next_protocol: Some(self.config.next_protocol.clone()),
            legacy_public_key: self.legacy_offer.clone(),
        };

        let message = self.wrap(MessageType::ClientInit, &client_init)?;
        self.advance(HandshakeEvent::SendClientInit)?;
        self.offered_keys = keys;
        self.client_init = Some(message.clone());
        Ok(message)
    }

    fn make_server_init(&mut self, payload: Option<&[u8]>) -> Result<Vec<u8>, HandshakeError> {
        let cipher = self
            .cipher
            .ok_or_else(|| self.invalid_state("produce ServerInit without a chosen cipher"))?;
        let key = EphemeralKeyPair::generate(cipher);

        let server_init = ServerInit {
            version: PROTOCOL_VERSION,
            random: primitives::random_nonce().to_vec(),
            handshake_cipher: cipher.id(),
            public_key: key.public_key().to_vec(),
            payload: payload.map(<[u8]>::to_vec),
        };

        let message = self.wrap(MessageType::ServerInit, &server_init)?;
        self.advance(HandshakeEvent::SendServerInit)?;
        self.local_key = Some(key);
        self.server_init = Some(message.clone());
        Ok(message)
    }

    fn make_client_finished(&mut self) -> Result<Vec<u8>, HandshakeError> {
        let public_key = self
            .local_key
            .as_ref()
            .map(|key| key.public_key().to_vec())
            .ok_or_else(|| self.invalid_state("produce ClientFinished without a key"))?;

        let message = self.wrap(MessageType::ClientFinished, &ClientFinished { public_key })?;
        self.derive_secrets(&message)?;
        self.advance(HandshakeEvent::SendClientFinished)?;
        Ok(message)
    }

    fn wrap<T: serde::Serialize>(
        &mut self,
        message_type: MessageType,
        inner: &T,
    ) -> Result<Vec<u8>, HandshakeError> {
        Ukey2Message::wrap(message_type, inner, self.config.max_message_size)
            .map_err(|e| self.fail(AlertKind::InternalError, e.to_string()))
    }

    fn derive_secrets(&mut self, client_finished: &[u8]) -> Result<(), HandshakeError> {
        let (Some(m1), Some(m2), Some(shared)) = (
            self.client_init.as_ref(),
            self.server_init.as_ref(),
            self.shared.as_ref(),
        ) else {
            return Err(self.fail(AlertKind::InternalError, "transcript incomplete"));
        };

        let mut transcript = Vec::with_capacity(m1.len() + m2.len() + client_finished.len());
        transcript.extend_from_slice(m1);
        transcript.extend_from_slice(m2);
        transcript.extend_from_slice(client_finished);

        match DerivedSecrets::derive(shared, &transcript) {
            Ok(secrets) => {
                self.secrets = Some(secrets);
                self.shared = None;
                Ok(())
            }
            Err(e) => Err(self.fail(AlertKind::InternalError, e.to_string())),
        }
    }

    /// Consume a handshake message from the peer.
    ///
    /// Returns the payload the responder attached to ServerInit, if any.
    /// Any rejection moves the handshake to `Error`.
    pub fn parse_handshake_message(
        &mut self,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, HandshakeError> {
        if self.stage.is_terminal() {
            return Err(self.invalid_state("parse a handshake message"));
        }
        if !self.stage.awaits_message() {
            return Err(self.fail(
                AlertKind::IncorrectMessage,
                format!("no message expected in stage {:?}", self.stage),
            ));
        }

        let envelope: Ukey2Message = wire::decode(message, self.config.max_message_size)
            .map_err(|e| self.fail(AlertKind::BadMessage, e.to_string()))?;

        if envelope.message_type == MessageType::Alert {
            return Err(self.peer_alert(&envelope.message_data));
        }

        match self.stage {
            Stage::ServerStart => {
                self.expect_type(&envelope, MessageType::ClientInit)?;
                self.handle_client_init(message, &envelope.message_data)?;
                Ok(None)
            }
            Stage::ClientWaitingForServerInit => {
                self.expect_type(&envelope, MessageType::ServerInit)?;
                self.handle_server_init(message, &envelope.message_data)
            }
            Stage::ServerWaitingForClientFinished => {
                self.expect_type(&envelope, MessageType::ClientFinished)?;
                self.handle_client_finished(message, &envelope.message_data)?;
                Ok(None)
            }
            _ => Err(self.fail(AlertKind::IncorrectMessage, "unexpected message")),
        }
    }

    fn expect_type(
        &mut self,
        envelope: &Ukey2Message,
        expected: MessageType,
    ) -> Result<(), HandshakeError> {
        if envelope.message_type != expected {
            return Err(self.fail(
                AlertKind::BadMessageType,
                format!("expected {expected:?}, got {:?}", envelope.message_type),
            ));
        }
        Ok(())
    }

    fn peer_alert(&mut self, data: &[u8]) -> HandshakeError {
        self.poison();
        match wire::decode::<Alert>(data, self.config.max_message_size) {
            Ok(alert) => {
                warn!(role = ?self.role, kind = ?alert.kind, "peer sent alert");
                HandshakeError::PeerAlert {
                    kind: alert.kind,
                    reason: alert.error_message,
                }
            }
            Err(e) => HandshakeError::PeerAlert {
                kind: AlertKind::BadMessageData,
                reason: format!("undecodable alert: {e}"),
            },
        }
    }

    fn check_version_and_random(&mut self, version: u32, random: &[u8]) -> Result<(), HandshakeError> {
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
            return Err(self.fail(AlertKind::BadVersion, format!("unsupported version {version}")));
        }
        if random.len() != NONCE_LEN {
            return Err(self.fail(
                AlertKind::BadRandom,
                format!("nonce must be {NONCE_LEN} bytes, got {}", random.len()),
            ));
        }
        Ok(())
    }

    fn handle_client_init(&mut self, raw: &[u8], data: &[u8]) -> Result<(), HandshakeError> {
        let client_init: ClientInit = wire::decode(data, self.config.max_message_size)
            .map_err(|e| self.fail(AlertKind::BadMessageData, e.to_string()))?;

        self.check_version_and_random(client_init.version, &client_init.random)?;

        if let Some(next_protocol) = &client_init.next_protocol {
            if *next_protocol != self.config.next_protocol {
                return Err(self.fail(
                    AlertKind::BadNextProtocol,
                    format!("unsupported next protocol {next_protocol:?}"),
                ));
            }
        }

        for (i, offer) in client_init.cipher_commitments.iter().enumerate() {
            if offer.commitment.len() != COMMITMENT_LEN {
                return Err(self.fail(AlertKind::BadMessageData, "malformed commitment"));
            }
            if client_init.cipher_commitments[..i]
                .iter()
                .any(|earlier| earlier.handshake_cipher == offer.handshake_cipher)
            {
                return Err(self.fail(AlertKind::BadMessageData, "duplicate cipher commitment"));
            }
        }

        // First offer we support, in the initiator's order of preference.
        let chosen = client_init.cipher_commitments.iter().find_map(|offer| {
            HandshakeCipher::from_id(offer.handshake_cipher)
                .filter(|cipher| self.config.ciphers.contains(cipher))
                .map(|cipher| (cipher, offer.commitment.clone()))
        });
        let Some((cipher, commitment)) = chosen else {
            return Err(self.fail(AlertKind::BadHandshakeCipher, "no supported cipher offered"));
        };

        self.advance(HandshakeEvent::ReceiveClientInit)?;
        debug!(cipher = %cipher, "responder selected cipher");
        self.cipher = Some(cipher);
        self.peer_commitment = Some(commitment);
        self.client_init = Some(raw.to_vec());
        Ok(())
    }

    fn handle_server_init(
        &mut self,
        raw: &[u8],
        data: &[u8],
    ) -> Result<Option<Vec<u8>>, HandshakeError> {
        let server_init: ServerInit = wire::decode(data, self.config.max_message_size)
            .map_err(|e| self.fail(AlertKind::BadMessageData, e.to_string()))?;

        self.check_version_and_random(server_init.version, &server_init.random)?;

        let position = HandshakeCipher::from_id(server_init.handshake_cipher).and_then(|cipher| {
            self.offered_keys
                .iter()
                .position(|key| key.cipher() == cipher)
        });
        let Some(position) = position else {
            return Err(self.fail(
                AlertKind::BadHandshakeCipher,
                format!("cipher {} was not offered", server_init.handshake_cipher),
            ));
        };
        let key = self.offered_keys.swap_remove(position);

        let shared = key
            .diffie_hellman(&server_init.public_key)
            .map_err(|e| self.fail(AlertKind::BadPublicKey, e.to_string()))?;

        self.advance(HandshakeEvent::ReceiveServerInit)?;
        self.cipher = Some(key.cipher());
        self.offered_keys.clear();
        self.local_key = Some(key);
        self.shared = Some(shared);
        self.server_init = Some(raw.to_vec());
        Ok(server_init.payload)
    }

    fn handle_client_finished(&mut self, raw: &[u8], data: &[u8]) -> Result<(), HandshakeError> {
        let finished: ClientFinished = wire::decode(data, self.config.max_message_size)
            .map_err(|e| self.fail(AlertKind::BadMessageData, e.to_string()))?;

        let (Some(cipher), Some(expected)) = (self.cipher, self.peer_commitment.as_ref()) else {
            return Err(self.fail(AlertKind::InternalError, "missing commitment"));
        };
        let actual = primitives::commitment(cipher, &finished.public_key);
        if !constant_time_eq(&actual, expected) {
            warn!(role = ?self.role, "client key does not match its commitment");
            self.poison();
            let alert_message =
                self.encode_alert(AlertKind::BadPublicKey, "public key does not match commitment");
            return Err(HandshakeError::CommitmentMismatch { alert_message });
        }

        let exchanged = match self.local_key.as_ref() {
            Some(key) => key.diffie_hellman(&finished.public_key),
            None => return Err(self.fail(AlertKind::InternalError, "missing local key")),
        };
        let shared = exchanged.map_err(|e| self.fail(AlertKind::BadPublicKey, e.to_string()))?;
        self.shared = Some(shared);
        self.derive_secrets(raw)?;
        self.advance(HandshakeEvent::ReceiveClientFinished)?;
        Ok(())
    }

    /// Verification string for out-of-band comparison, `1..=32` bytes.
    ///
    /// Both peers of an untampered handshake get the same bytes.
    pub fn verification_string(&mut self, len: usize) -> Result<Vec<u8>, HandshakeError> {
        if !matches!(
            self.stage,
            Stage::VerificationNeeded | Stage::VerificationInProgress
        ) {
            return Err(self.invalid_state("get a verification string"));
        }
        if len == 0 || len > MAX_VERIFICATION_STRING_LEN {
            return Err(HandshakeError::InvalidVerificationLength(len));
        }
        let auth = match self.secrets.as_ref() {
            Some(secrets) => secrets.auth[..len].to_vec(),
            None => return Err(self.invalid_state("get a verification string")),
        };
        self.advance(HandshakeEvent::RequestVerification)?;
        Ok(auth)
    }

    /// Record that the user confirmed the verification strings match.
    pub fn verify_handshake(&mut self) -> Result<(), HandshakeError> {
        if self.stage != Stage::VerificationInProgress {
            return Err(self.invalid_state("verify the handshake"));
        }
        self.advance(HandshakeEvent::ConfirmVerification)
    }

    /// Secret for a caller-supplied next protocol, once verified.
    pub fn next_protocol_secret(&self) -> Result<[u8; KEY_LEN], HandshakeError> {
        match (self.stage, self.secrets.as_ref()) {
            (Stage::Finished, Some(secrets)) => Ok(secrets.next),
            _ => Err(self.invalid_state("read the next protocol secret")),
        }
    }

    /// Turn a verified handshake into a connection context.
    ///
    /// Consumes the handshake, so it cannot be converted twice.
    pub fn into_connection_context(mut self) -> Result<ConnectionContext, HandshakeError> {
        if self.stage != Stage::Finished {
            return Err(self.invalid_state("convert to a connection context"));
        }
        let secrets = self
            .secrets
            .take()
            .ok_or_else(|| self.invalid_state("convert to a connection context"))?;
        self.advance(HandshakeEvent::Convert)?;

        let context = ConnectionContext::from_next_protocol_secret(&secrets.next, self.role)?;
        debug!(role = ?self.role, "handshake converted to connection context");
        Ok(context)
    }
}

impl std::fmt::Debug for HandshakeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeContext")
            .field("role", &self.role)
            .field("stage", &self.stage)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = crate::config::DEFAULT_MAX_MESSAGE_SIZE;

    fn exchange(
        initiator: &mut HandshakeContext,
        responder: &mut HandshakeContext,
    ) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let m1 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m1).unwrap();
        let m2 = responder.next_handshake_message(None).unwrap();
        initiator.parse_handshake_message(&m2).unwrap();
        let m3 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m3).unwrap();
        (m1, m2, m3)
    }

    fn pair(cipher: HandshakeCipher) -> (HandshakeContext, HandshakeContext) {
        (
            HandshakeContext::for_initiator(cipher),
            HandshakeContext::for_responder(cipher),
        )
    }

    fn inner<T: serde::de::DeserializeOwned>(message: &[u8]) -> T {
        let envelope: Ukey2Message = wire::decode(message, LIMIT).unwrap();
        wire::decode(&envelope.message_data, LIMIT).unwrap()
    }

    fn rewrap<T: serde::Serialize>(message_type: MessageType, value: &T) -> Vec<u8> {
        Ukey2Message::wrap(message_type, value, LIMIT).unwrap()
    }

    #[test]
    fn test_full_handshake_both_suites() {
        for cipher in [HandshakeCipher::Curve25519Sha512, HandshakeCipher::P256Sha512] {
            let (mut initiator, mut responder) = pair(cipher);
            exchange(&mut initiator, &mut responder);

            assert_eq!(initiator.handshake_state(), HandshakeState::VerificationNeeded);
            assert_eq!(responder.handshake_state(), HandshakeState::VerificationNeeded);
            assert_eq!(initiator.cipher(), Some(cipher));

            let a = initiator.verification_string(32).unwrap();
            let b = responder.verification_string(32).unwrap();
            assert_eq!(a, b);
            assert_eq!(
                initiator.handshake_state(),
                HandshakeState::VerificationInProgress
            );

            initiator.verify_handshake().unwrap();
            responder.verify_handshake().unwrap();
            assert_eq!(
                initiator.next_protocol_secret().unwrap(),
                responder.next_protocol_secret().unwrap()
            );

            let mut client = initiator.into_connection_context().unwrap();
            let mut server = responder.into_connection_context().unwrap();
            let ct = client.encode_message_to_peer(b"hello").unwrap();
            assert_eq!(server.decode_message_from_peer(&ct).unwrap(), b"hello");
        }
    }

    #[test]
    fn test_verification_string_prefixes_agree() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        exchange(&mut initiator, &mut responder);

        let full = initiator.verification_string(32).unwrap();
        for n in 1..=MAX_VERIFICATION_STRING_LEN {
            let a = initiator.verification_string(n).unwrap();
            assert_eq!(a, responder.verification_string(n).unwrap());
            assert_eq!(a, full[..n]);
        }
    }

    #[test]
    fn test_verification_string_length_bounds() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        exchange(&mut initiator, &mut responder);

        assert!(matches!(
            initiator.verification_string(0),
            Err(HandshakeError::InvalidVerificationLength(0))
        ));
        assert!(matches!(
            initiator.verification_string(33),
            Err(HandshakeError::InvalidVerificationLength(33))
        ));
        // A bad length is a caller mistake, not a protocol failure.
        assert_eq!(initiator.handshake_state(), HandshakeState::VerificationNeeded);
    }

    #[test]
    fn test_operations_out_of_order_are_rejected() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);

        assert!(matches!(
            initiator.verification_string(32),
            Err(HandshakeError::InvalidState { .. })
        ));
        assert!(matches!(
            initiator.verify_handshake(),
            Err(HandshakeError::InvalidState { .. })
        ));
        assert!(matches!(
            responder.next_handshake_message(None),
            Err(HandshakeError::InvalidState { .. })
        ));
        assert!(matches!(
            initiator.next_handshake_message(Some(&b"too early"[..])),
            Err(HandshakeError::InvalidState { .. })
        ));

        exchange(&mut initiator, &mut responder);
        assert!(matches!(
            initiator.verify_handshake(),
            Err(HandshakeError::InvalidState { .. })
        ));

        let (initiator, _) = pair(HandshakeCipher::Curve25519Sha512);
        assert!(matches!(
            initiator.into_connection_context(),
            Err(HandshakeError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_server_init_payload_delivered() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m1).unwrap();
        let m2 = responder.next_handshake_message(Some(&b"early data"[..])).unwrap();
        let payload = initiator.parse_handshake_message(&m2).unwrap();
        assert_eq!(payload.as_deref(), Some(&b"early data"[..]));
    }

    #[test]
    fn test_commitment_mismatch_poisons_responder() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m1).unwrap();
        let m2 = responder.next_handshake_message(None).unwrap();
        initiator.parse_handshake_message(&m2).unwrap();
        initiator.next_handshake_message(None).unwrap();

        // Substitute a key the initiator never committed to.
        let other = EphemeralKeyPair::generate(HandshakeCipher::Curve25519Sha512);
        let forged = rewrap(
            MessageType::ClientFinished,
            &ClientFinished {
                public_key: other.public_key().to_vec(),
            },
        );
        let err = responder.parse_handshake_message(&forged).unwrap_err();
        assert!(matches!(err, HandshakeError::CommitmentMismatch { .. }));
        assert!(err.is_tampering());

        // The initiator can be told why.
        let alert = err.alert_message().unwrap().to_vec();
        let envelope: Ukey2Message = wire::decode(&alert, LIMIT).unwrap();
        assert_eq!(envelope.message_type, MessageType::Alert);
        let decoded: Alert = wire::decode(&envelope.message_data, LIMIT).unwrap();
        assert_eq!(decoded.kind, AlertKind::BadPublicKey);
        assert_eq!(responder.handshake_state(), HandshakeState::Error);

        assert!(matches!(
            responder.verification_string(32),
            Err(HandshakeError::InvalidState {
                state: HandshakeState::Error,
                ..
            })
        ));
    }

    #[test]
    fn test_unsupported_version_is_version_skew() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        let mut client_init: ClientInit = inner(&m1);
        client_init.version = 2;

        let err = responder
            .parse_handshake_message(&rewrap(MessageType::ClientInit, &client_init))
            .unwrap_err();
        assert!(err.is_version_skew());
        assert!(!err.is_tampering());
        assert!(err.alert_message().is_some());
        assert_eq!(responder.handshake_state(), HandshakeState::Error);
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        let mut client_init: ClientInit = inner(&m1);
        client_init.random.truncate(31);

        let err = responder
            .parse_handshake_message(&rewrap(MessageType::ClientInit, &client_init))
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::BadRandom,
                ..
            }
        ));
    }

    #[test]
    fn test_unsupported_cipher_rejected() {
        let mut initiator = HandshakeContext::for_initiator(HandshakeCipher::P256Sha512);
        let mut responder = HandshakeContext::for_responder(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();

        let err = responder.parse_handshake_message(&m1).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::BadHandshakeCipher,
                ..
            }
        ));
        assert!(err.is_version_skew());

        // The initiator understands the alert the responder produced.
        let alert = err.alert_message().unwrap().to_vec();
        let err = initiator.parse_handshake_message(&alert).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::PeerAlert {
                kind: AlertKind::BadHandshakeCipher,
                ..
            }
        ));
        assert_eq!(initiator.handshake_state(), HandshakeState::Error);
    }

    #[test]
    fn test_cipher_negotiation_prefers_initiator_order() {
        let config = HandshakeConfig {
            ciphers: vec![HandshakeCipher::P256Sha512, HandshakeCipher::Curve25519Sha512],
            ..HandshakeConfig::default()
        };
        let mut initiator = HandshakeContext::with_config(Role::Initiator, config.clone()).unwrap();
        let mut responder = HandshakeContext::with_config(
            Role::Responder,
            HandshakeConfig {
                ciphers: vec![HandshakeCipher::Curve25519Sha512, HandshakeCipher::P256Sha512],
                ..config
            },
        )
        .unwrap();

        exchange(&mut initiator, &mut responder);
        assert_eq!(initiator.cipher(), Some(HandshakeCipher::P256Sha512));
        assert_eq!(responder.cipher(), Some(HandshakeCipher::P256Sha512));
        assert_eq!(
            initiator.verification_string(16).unwrap(),
            responder.verification_string(16).unwrap()
        );
    }

    #[test]
    fn test_resent_message_poisons() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let (m1, _, m3) = exchange(&mut initiator, &mut responder);

        let err = responder.parse_handshake_message(&m3).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::IncorrectMessage,
                ..
            }
        ));
        assert_eq!(responder.handshake_state(), HandshakeState::Error);

        let mut fresh = HandshakeContext::for_responder(HandshakeCipher::Curve25519Sha512);
        fresh.parse_handshake_message(&m1).unwrap();
        assert!(fresh.parse_handshake_message(&m1).is_err());
        assert_eq!(fresh.handshake_state(), HandshakeState::Error);
    }

    #[test]
    fn test_wrong_message_type_rejected() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m1).unwrap();
        responder.next_handshake_message(None).unwrap();

        // Responder waits for ClientFinished but gets ClientInit again.
        let err = responder.parse_handshake_message(&m1).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::BadMessageType,
                ..
            }
        ));
    }

    #[test]
    fn test_garbage_is_bad_message() {
        let mut responder = HandshakeContext::for_responder(HandshakeCipher::Curve25519Sha512);
        let err = responder.parse_handshake_message(b"not a handshake").unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::BadMessage,
                ..
            }
        ));
        assert!(matches!(
            responder.parse_handshake_message(b"again"),
            Err(HandshakeError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_bad_server_public_key() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m1).unwrap();
        let m2 = responder.next_handshake_message(None).unwrap();

        let mut server_init: ServerInit = inner(&m2);
        server_init.public_key = vec![0u8; 32];
        let err = initiator
            .parse_handshake_message(&rewrap(MessageType::ServerInit, &server_init))
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::BadPublicKey,
                ..
            }
        ));
    }

    #[test]
    fn test_altered_server_init_changes_verification_string() {
        let (mut initiator, mut responder) = pair(HandshakeCipher::Curve25519Sha512);
        let m1 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m1).unwrap();
        let m2 = responder.next_handshake_message(Some(&b"early data"[..])).unwrap();

        // Same keys, one payload byte flipped in transit.
        let mut server_init: ServerInit = inner(&m2);
        if let Some(payload) = server_init.payload.as_mut() {
            payload[0] ^= 0x01;
        }
        let altered = rewrap(MessageType::ServerInit, &server_init);
        assert_ne!(altered, m2);
        initiator.parse_handshake_message(&altered).unwrap();

        let m3 = initiator.next_handshake_message(None).unwrap();
        responder.parse_handshake_message(&m3).unwrap();
        assert_ne!(
            initiator.verification_string(32).unwrap(),
            responder.verification_string(32).unwrap()
        );
    }

    #[test]
    fn test_oversized_client_init_rejected() {
        let mut initiator = HandshakeContext::for_initiator(HandshakeCipher::P256Sha512);
        let mut responder = HandshakeContext::with_config(
            Role::Responder,
            HandshakeConfig {
                ciphers: vec![HandshakeCipher::P256Sha512],
                max_message_size: 64,
                ..HandshakeConfig::default()
            },
        )
        .unwrap();

        let m1 = initiator.next_handshake_message(None).unwrap();
        assert!(m1.len() > 64);
        let err = responder.parse_handshake_message(&m1).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Alert {
                kind: AlertKind::BadMessage,
                ..
            }
        ));
        assert_eq!(responder.handshake_state(), HandshakeState::Error);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = HandshakeConfig {
            ciphers: vec![],
            ..HandshakeConfig::default()
        };
        assert!(matches!(
            HandshakeContext::with_config(Role::Initiator, config),
            Err(HandshakeError::Config(_))
        ));
    }
}
