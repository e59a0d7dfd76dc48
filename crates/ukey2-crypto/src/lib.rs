//! UKEY2 authenticated key exchange.
//!
//! This crate provides:
//! - The three-message UKEY2 handshake with commitment to the initiator's key
//! - Short verification strings for out-of-band confirmation
//! - Replay-protected, authenticated connection contexts
//! - The legacy two-message exchange and version negotiation
//!
//! # Design
//!
//! Handshake progress is a pure state machine ([`fsm::transition`]); the
//! [`HandshakeContext`] drives it and owns all key material. A finished
//! handshake is consumed into a [`ConnectionContext`], which encrypts with
//! ChaCha20-Poly1305 and accepts each peer sequence number exactly once,
//! in order.

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod fsm;
pub mod handshake;
pub mod legacy;
pub mod negotiator;
pub mod primitives;
pub mod wire;

pub use config::HandshakeConfig;
pub use connection::{ConnectionContext, ConnectionError, ProtocolVersion, SequenceCounters};
pub use fsm::{HandshakeState, Role};
pub use handshake::{HandshakeContext, HandshakeError};
pub use legacy::{LegacyInitiator, LegacyResponder};
pub use negotiator::VersionNegotiator;
pub use primitives::HandshakeCipher;
pub use wire::AlertKind;
