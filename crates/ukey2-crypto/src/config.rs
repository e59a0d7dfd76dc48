//! Handshake configuration.

use serde::{Deserialize, Serialize};

use crate::primitives::HandshakeCipher;

/// Next protocol negotiated by every handshake in this crate.
pub const NEXT_PROTOCOL: &str = "CHACHA20_POLY1305";

/// Default upper bound on an encoded handshake message.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 64 * 1024;

/// Tunables for a [`crate::HandshakeContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Suites offered (initiator) or accepted (responder), most preferred first.
    pub ciphers: Vec<HandshakeCipher>,
    /// Protocol to run once the handshake completes.
    pub next_protocol: String,
    /// Largest handshake message accepted or produced.
    pub max_message_size: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            ciphers: vec![HandshakeCipher::Curve25519Sha512],
            next_protocol: NEXT_PROTOCOL.to_string(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl HandshakeConfig {
    /// Configuration offering or accepting exactly one suite.
    pub fn with_cipher(cipher: HandshakeCipher) -> Self {
        Self {
            ciphers: vec![cipher],
            ..Self::default()
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.ciphers.is_empty() {
            return Err("at least one handshake cipher is required".into());
        }
        for (i, cipher) in self.ciphers.iter().enumerate() {
            if self.ciphers[..i].contains(cipher) {
                return Err(format!("duplicate handshake cipher {cipher}"));
            }
        }
        if self.next_protocol != NEXT_PROTOCOL {
            return Err(format!("unsupported next protocol {:?}", self.next_protocol));
        }
        if self.max_message_size == 0 {
            return Err("max_message_size must be non-zero".into());
        }
        Ok(())
    }
}
