//! Picks between UKEY2 and the legacy exchange from what the peer sends.
//!
//! The initiator always sends a versioned ClientInit carrying a separate
//! legacy key offer. A legacy responder answers that offer; a current one
//! ignores it. The responder side recognises a bare [`LegacyHello`].
//!
//! [`LegacyHello`]: crate::wire::LegacyHello

use tracing::debug;

use crate::config::HandshakeConfig;
use crate::connection::{ConnectionContext, ProtocolVersion};
use crate::fsm::{HandshakeState, Role, Stage};
use crate::handshake::{HandshakeContext, HandshakeError};
use crate::legacy::{LegacyInitiator, LegacyResponder};
use crate::primitives::HandshakeCipher;
use crate::wire::{self, LegacyHello, LegacyResponderHello, Ukey2Message};

enum LegacyProgress {
    None,
    /// Responder received a legacy hello and still owes its reply.
    Pending(Vec<u8>),
    Done(ConnectionContext),
    Failed,
}

/// Handshake driver that falls back to the legacy exchange on demand.
pub struct VersionNegotiator {
    inner: HandshakeContext,
    legacy_key: Option<LegacyInitiator>,
    legacy: LegacyProgress,
    version: Option<ProtocolVersion>,
}

impl VersionNegotiator {
    pub fn for_initiator(cipher: HandshakeCipher) -> Self {
        Self::wrap(HandshakeContext::for_initiator(cipher))
    }

    pub fn for_responder(cipher: HandshakeCipher) -> Self {
        Self::wrap(HandshakeContext::for_responder(cipher))
    }

    pub fn with_config(role: Role, config: HandshakeConfig) -> Result<Self, HandshakeError> {
        HandshakeContext::with_config(role, config).map(Self::wrap)
    }

    fn wrap(mut inner: HandshakeContext) -> Self {
        let legacy_key = match inner.role() {
            Role::Initiator => {
                let key =
                    LegacyInitiator::new().with_max_message_size(inner.max_message_size());
                inner.set_legacy_offer(key.public_key().to_vec());
                Some(key)
            }
            Role::Responder => None,
        };
        Self {
            inner,
            legacy_key,
            legacy: LegacyProgress::None,
            version: None,
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role()
    }

    /// Protocol in use, once an exchange step under it succeeded.
    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    pub fn handshake_state(&self) -> HandshakeState {
        match &self.legacy {
            LegacyProgress::None => self.inner.handshake_state(),
            LegacyProgress::Pending(_) => HandshakeState::InProgress,
            LegacyProgress::Done(_) => HandshakeState::Finished,
            LegacyProgress::Failed => HandshakeState::Error,
        }
    }

    fn decide(&mut self, version: ProtocolVersion) {
        if self.version.is_none() {
            debug!(role = ?self.role(), version = ?version, "negotiated protocol version");
            self.version = Some(version);
        }
    }

    fn invalid_state(&self, operation: &'static str) -> HandshakeError {
        HandshakeError::InvalidState {
            operation,
            state: self.handshake_state(),
        }
    }

    pub fn next_handshake_message(
        &mut self,
        payload: Option<&[u8]>,
    ) -> Result<Vec<u8>, HandshakeError> {
        match std::mem::replace(&mut self.legacy, LegacyProgress::None) {
            LegacyProgress::None => self.inner.next_handshake_message(payload),
            LegacyProgress::Pending(hello) => {
                let responder =
                    LegacyResponder::with_max_message_size(self.inner.max_message_size());
                match responder.respond(&hello, payload) {
                    Ok((reply, context)) => {
                        self.decide(ProtocolVersion::Legacy);
                        self.legacy = LegacyProgress::Done(context);
                        Ok(reply)
                    }
                    Err(e) => {
                        self.legacy = LegacyProgress::Failed;
                        Err(e)
                    }
                }
            }
            other => {
                self.legacy = other;
                Err(self.invalid_state("produce a handshake message"))
            }
        }
    }

    pub fn parse_handshake_message(
        &mut self,
        message: &[u8],
    ) -> Result<Option<Vec<u8>>, HandshakeError> {
        if !matches!(self.legacy, LegacyProgress::None) {
            return Err(self.invalid_state("parse a handshake message"));
        }

        let limit = self.inner.max_message_size();
        let versioned = wire::decode::<Ukey2Message>(message, limit).is_ok();

        match self.inner.stage() {
            Stage::ServerStart
                if !versioned && wire::decode::<LegacyHello>(message, limit).is_ok() =>
            {
                self.legacy = LegacyProgress::Pending(message.to_vec());
                return Ok(None);
            }
            Stage::ClientWaitingForServerInit
                if !versioned && wire::decode::<LegacyResponderHello>(message, limit).is_ok() =>
            {
                let Some(key) = self.legacy_key.take() else {
                    self.legacy = LegacyProgress::Failed;
                    return Err(self.invalid_state("finish a legacy handshake"));
                };
                return match key.finish(message) {
                    Ok((context, payload)) => {
                        self.decide(ProtocolVersion::Legacy);
                        self.legacy = LegacyProgress::Done(context);
                        Ok(payload)
                    }
                    Err(e) => {
                        self.legacy = LegacyProgress::Failed;
                        Err(e)
                    }
                };
            }
            _ => {}
        }

        let payload = self.inner.parse_handshake_message(message)?;
        self.decide(ProtocolVersion::Current);
        Ok(payload)
    }

    /// Verification string of a UKEY2 outcome. Legacy outcomes have none.
    pub fn verification_string(&mut self, len: usize) -> Result<Vec<u8>, HandshakeError> {
        if !matches!(self.legacy, LegacyProgress::None) {
            return Err(self.invalid_state("get a verification string"));
        }
        self.inner.verification_string(len)
    }

    pub fn verify_handshake(&mut self) -> Result<(), HandshakeError> {
        if !matches!(self.legacy, LegacyProgress::None) {
            return Err(self.invalid_state("verify the handshake"));
        }
        self.inner.verify_handshake()
    }

    pub fn into_connection_context(self) -> Result<ConnectionContext, HandshakeError> {
        let state = self.handshake_state();
        match self.legacy {
            LegacyProgress::None => self.inner.into_connection_context(),
            LegacyProgress::Done(context) => Ok(context),
            LegacyProgress::Pending(_) | LegacyProgress::Failed => Err(HandshakeError::InvalidState {
                operation: "convert to a connection context",
                state,
            }),
        }
    }
}

impl std::fmt::Debug for VersionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionNegotiator")
            .field("inner", &self.inner)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
