//! Handshake state machine.
//!
//! [`transition`] is a pure function over ([`Stage`], [`HandshakeEvent`]).
//! [`crate::HandshakeContext`] performs the cryptographic work for each
//! step and then asks this module whether the step is legal, so every
//! illegal ordering is rejected in one place.
//!
//! ```text
//! Initiator                                Responder
//! ClientStart                              ServerStart
//!   | SendClientInit                         | ReceiveClientInit
//! ClientWaitingForServerInit               ServerAfterClientInit
//!   | ReceiveServerInit                      | SendServerInit
//! ClientAfterServerInit                    ServerWaitingForClientFinished
//!   | SendClientFinished                     | ReceiveClientFinished
//!   +---------------> VerificationNeeded <---+
//!                       | RequestVerification
//!                     VerificationInProgress
//!                       | ConfirmVerification
//!                     Finished
//!                       | Convert
//!                     AlreadyUsed
//! ```
//!
//! `Fail` moves any stage to `Error`.

use thiserror::Error;

/// Which side of the handshake a context plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Coarse handshake progress visible to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    InProgress,
    VerificationNeeded,
    VerificationInProgress,
    Finished,
    AlreadyUsed,
    Error,
}

/// Fine-grained handshake position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ClientStart,
    ClientWaitingForServerInit,
    ClientAfterServerInit,
    ServerStart,
    ServerAfterClientInit,
    ServerWaitingForClientFinished,
    VerificationNeeded,
    VerificationInProgress,
    Finished,
    AlreadyUsed,
    Error,
}

impl Stage {
    /// Starting stage for `role`.
    pub fn initial(role: Role) -> Self {
        match role {
            Role::Initiator => Stage::ClientStart,
            Role::Responder => Stage::ServerStart,
        }
    }

    /// Public view of this stage.
    pub fn public_state(self) -> HandshakeState {
        match self {
            Stage::ClientStart
            | Stage::ClientWaitingForServerInit
            | Stage::ClientAfterServerInit
            | Stage::ServerStart
            | Stage::ServerAfterClientInit
            | Stage::ServerWaitingForClientFinished => HandshakeState::InProgress,
            Stage::VerificationNeeded => HandshakeState::VerificationNeeded,
            Stage::VerificationInProgress => HandshakeState::VerificationInProgress,
            Stage::Finished => HandshakeState::Finished,
            Stage::AlreadyUsed => HandshakeState::AlreadyUsed,
            Stage::Error => HandshakeState::Error,
        }
    }

    /// True while the stage expects to consume a peer message.
    pub fn awaits_message(self) -> bool {
        matches!(
            self,
            Stage::ClientWaitingForServerInit
                | Stage::ServerStart
                | Stage::ServerWaitingForClientFinished
        )
    }

    /// True once no further operation can succeed.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::AlreadyUsed | Stage::Error)
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeEvent {
    SendClientInit,
    ReceiveServerInit,
    SendClientFinished,
    ReceiveClientInit,
    SendServerInit,
    ReceiveClientFinished,
    RequestVerification,
    ConfirmVerification,
    Convert,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event {event:?} is not allowed in stage {stage:?}")]
pub struct InvalidTransition {
    pub stage: Stage,
    pub event: HandshakeEvent,
}

/// Next stage after `event`, or the rejected pair.
pub fn transition(stage: Stage, event: HandshakeEvent) -> Result<Stage, InvalidTransition> {
    use HandshakeEvent as E;

    let next = match (stage, event) {
        (_, E::Fail) => Stage::Error,

        (Stage::ClientStart, E::SendClientInit) => Stage::ClientWaitingForServerInit,
        (Stage::ClientWaitingForServerInit, E::ReceiveServerInit) => Stage::ClientAfterServerInit,
        (Stage::ClientAfterServerInit, E::SendClientFinished) => Stage::VerificationNeeded,

        (Stage::ServerStart, E::ReceiveClientInit) => Stage::ServerAfterClientInit,
        (Stage::ServerAfterClientInit, E::SendServerInit) => Stage::ServerWaitingForClientFinished,
        (Stage::ServerWaitingForClientFinished, E::ReceiveClientFinished) => {
            Stage::VerificationNeeded
        }

        (Stage::VerificationNeeded | Stage::VerificationInProgress, E::RequestVerification) => {
            Stage::VerificationInProgress
        }
        (Stage::VerificationInProgress, E::ConfirmVerification) => Stage::Finished,
        (Stage::Finished, E::Convert) => Stage::AlreadyUsed,

        _ => return Err(InvalidTransition { stage, event }),
    };
    Ok(next)
}
