//! The session engine capability shared by every protocol variant.
//!
//! An engine owns one conversation's handshake and symmetric state. The
//! router never inspects protocol messages itself: it feeds wire bytes to
//! [`Protocol::decrypt`] and acts on the [`Decrypted`] classification.

use crate::crypto::IdentityKeyPair;
use crate::session::otr::OtrSession;
use crate::session::ratchet::RatchetSession;
use crate::utils::{MessengerError, ProtocolError, Result, SessionError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest handshake deadline accepted, in seconds (one week)
const MAX_HANDSHAKE_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Lifecycle of one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    /// Created, nothing sent or received yet
    Unstarted,
    /// Key exchange in progress
    AwaitingHandshake,
    /// Key exchange complete; application data may flow
    Encrypted,
    /// Key material cleared. Terminal.
    Ended,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "unstarted",
            Self::AwaitingHandshake => "awaiting-handshake",
            Self::Encrypted => "encrypted",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Why an engine refused an input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineFailure {
    /// Undecodable, tampered or replayed input. Only that message is lost.
    #[error("malformed input: {reason}")]
    MalformedInput { reason: String },

    /// Input not valid in the current state. Only that message is lost.
    #[error("cannot {operation} while {state}")]
    UnexpectedState {
        state: EngineState,
        operation: &'static str,
    },

    /// Key exchange failed; the engine is now ended
    #[error("handshake failed: {reason}")]
    HandshakeFailure { reason: String },
}

impl EngineFailure {
    /// Helper for [`EngineFailure::MalformedInput`]
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedInput {
            reason: reason.into(),
        }
    }

    /// Helper for [`EngineFailure::HandshakeFailure`]
    pub fn handshake<S: Into<String>>(reason: S) -> Self {
        Self::HandshakeFailure {
            reason: reason.into(),
        }
    }

    /// True if the session cannot continue after this failure
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::HandshakeFailure { .. })
    }

    /// Convert into the crate error, naming the peer for handshake failures
    pub fn into_error(self, peer: &str) -> MessengerError {
        match self {
            Self::MalformedInput { reason } => ProtocolError::InvalidMessage { reason }.into(),
            Self::UnexpectedState { state, operation } => SessionError::InvalidState {
                state: format!("cannot {operation} while {state}"),
            }
            .into(),
            Self::HandshakeFailure { reason } => SessionError::HandshakeFailure {
                peer: peer.to_string(),
                reason,
            }
            .into(),
        }
    }
}

/// Classified result of feeding one wire message to an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decrypted {
    /// Handshake output that must go back to the sender and never reach the
    /// application. May be empty (final step, or a buffered fragment).
    HandshakeContinuation(Vec<Vec<u8>>),
    /// Decrypted application plaintexts, in order
    ApplicationData(Vec<Vec<u8>>),
    /// The input was refused
    Failure(EngineFailure),
}

impl Decrypted {
    /// Empty continuation: nothing to send, nothing to deliver
    pub fn nothing() -> Self {
        Self::HandshakeContinuation(Vec::new())
    }
}

/// Session identifier agreed by both sides of a completed handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Read the id from the first 8 bytes of key material
    pub fn from_key_material(bytes: &[u8; 32]) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[..8]);
        Self(u64::from_be_bytes(id))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Value both users can compare out of band to confirm who they talk to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// SHA-256 over both identity keys in sorted order, truncated to
    /// 20 bytes. Symmetric, so both peers compute the same value.
    pub fn from_identity_keys(a: &[u8; 32], b: &[u8; 32]) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = Sha256::new();
        hasher.update(low);
        hasher.update(high);
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..20]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Protocol variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolType {
    /// OTR-style authenticated key exchange with counter-nonce data messages
    Otr,
    /// Signed ephemeral exchange followed by the Double Ratchet
    #[serde(rename = "ratchet")]
    DoubleRatchet,
}

impl ProtocolType {
    /// Configuration and wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Otr => "otr",
            Self::DoubleRatchet => "ratchet",
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = MessengerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "otr" => Ok(Self::Otr),
            "ratchet" | "double-ratchet" | "doubleratchet" => Ok(Self::DoubleRatchet),
            _ => Err(ProtocolError::UnsupportedProtocol {
                name: s.to_string(),
            }
            .into()),
        }
    }
}

/// Per-engine knobs taken from the session configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Seconds a handshake may stay incomplete
    pub handshake_timeout_secs: u64,
    /// Largest wire fragment in bytes (0 = never fragment)
    pub max_fragment_size: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: crate::defaults::DEFAULT_HANDSHAKE_TIMEOUT,
            max_fragment_size: 0,
        }
    }
}

impl EngineOptions {
    /// Deadline for a handshake entered at `now`
    pub fn handshake_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let secs = self.handshake_timeout_secs.min(MAX_HANDSHAKE_TIMEOUT_SECS);
        // Bounded above, so the cast cannot wrap.
        #[allow(clippy::cast_possible_wrap)]
        let timeout = Duration::seconds(secs as i64);
        now + timeout
    }
}

/// Capability implemented by each protocol variant.
///
/// Engines are driven under their session's lock, so `&mut self` methods
/// never race. Handshake failures move the engine to [`EngineState::Ended`]
/// before they are reported.
pub trait Protocol: Send {
    /// Variant tag, used when persisting and restoring
    fn protocol_type(&self) -> ProtocolType;

    /// Begin a key exchange as the initiator. Returns the bytes to send.
    fn new_session(&mut self) -> Result<Vec<u8>>;

    /// Consume one wire message
    fn decrypt(&mut self, wire: &[u8]) -> Decrypted;

    /// Encrypt one application plaintext into one or more wire fragments
    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<Vec<u8>>>;

    /// Clear all key material. Idempotent.
    fn end_session(&mut self);

    /// Current lifecycle state
    fn state(&self) -> EngineState;

    /// True once application data may flow
    fn is_encrypted(&self) -> bool {
        self.state() == EngineState::Encrypted
    }

    /// Agreed session id, available once encrypted
    fn session_id(&self) -> Option<SessionId>;

    /// Agreed fingerprint, available once encrypted
    fn fingerprint(&self) -> Option<Fingerprint>;

    /// The peer's authenticated identity key, available once encrypted
    fn peer_public_key(&self) -> Option<[u8; 32]>;

    /// End the engine if its handshake deadline passed before `now`.
    /// Returns true if it did.
    fn expire_handshake(&mut self, now: DateTime<Utc>) -> bool;

    /// Snapshot of an encrypted engine for [`EngineFactory::restore`]
    fn serialize(&self) -> Result<Vec<u8>>;
}

/// Builds engines bound to the local identity
#[derive(Debug, Clone)]
pub struct EngineFactory {
    keypair: IdentityKeyPair,
    options: EngineOptions,
}

impl EngineFactory {
    /// Create a factory for engines signing with `keypair`
    pub fn new(keypair: IdentityKeyPair, options: EngineOptions) -> Self {
        Self { keypair, options }
    }

    /// Options handed to every engine
    pub fn options(&self) -> EngineOptions {
        self.options
    }

    /// Fresh engine in [`EngineState::Unstarted`]
    pub fn create(&self, kind: ProtocolType) -> Box<dyn Protocol> {
        match kind {
            ProtocolType::Otr => Box::new(OtrSession::new(self.keypair.clone(), self.options)),
            ProtocolType::DoubleRatchet => {
                Box::new(RatchetSession::new(self.keypair.clone(), self.options))
            }
        }
    }

    /// Rebuild an engine from [`Protocol::serialize`] output
    pub fn restore(&self, kind: ProtocolType, bytes: &[u8]) -> Result<Box<dyn Protocol>> {
        Ok(match kind {
            ProtocolType::Otr => Box::new(OtrSession::restore(
                self.keypair.clone(),
                self.options,
                bytes,
            )?),
            ProtocolType::DoubleRatchet => Box::new(RatchetSession::restore(
                self.keypair.clone(),
                self.options,
                bytes,
            )?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_order_independent() {
        let a = IdentityKeyPair::generate().public_key_bytes();
        let b = IdentityKeyPair::generate().public_key_bytes();

        let ab = Fingerprint::from_identity_keys(&a, &b);
        assert_eq!(ab, Fingerprint::from_identity_keys(&b, &a));
        assert_eq!(ab.0.len(), 40);
        assert_ne!(ab, Fingerprint::from_identity_keys(&a, &a));
    }

    #[test]
    fn protocol_type_names() {
        assert_eq!("otr".parse::<ProtocolType>().unwrap(), ProtocolType::Otr);
        assert_eq!(
            "Ratchet".parse::<ProtocolType>().unwrap(),
            ProtocolType::DoubleRatchet
        );
        assert!("signal".parse::<ProtocolType>().is_err());
        assert_eq!(ProtocolType::DoubleRatchet.to_string(), "ratchet");
    }

    #[test]
    fn session_id_displays_as_hex() {
        let mut material = [0u8; 32];
        material[7] = 0xab;
        let id = SessionId::from_key_material(&material);

        assert_eq!(id.0, 0xab);
        assert_eq!(id.to_string(), "00000000000000ab");
    }

    #[test]
    fn failures_map_onto_error_taxonomy() {
        let fatal = EngineFailure::handshake("bad signature");
        assert!(fatal.is_session_fatal());
        assert!(fatal.into_error("10.0.0.2").is_session_fatal());

        let dropped = EngineFailure::malformed("not base64");
        assert!(!dropped.is_session_fatal());
        assert!(dropped.into_error("10.0.0.2").is_recoverable());

        let state = EngineFailure::UnexpectedState {
            state: EngineState::Unstarted,
            operation: "decrypt data",
        };
        assert!(state.into_error("10.0.0.2").is_recoverable());
    }

    #[test]
    fn deadline_is_clamped() {
        let now = Utc::now();
        let options = EngineOptions {
            handshake_timeout_secs: u64::MAX,
            max_fragment_size: 0,
        };
        assert_eq!(
            options.handshake_deadline(now),
            now + Duration::seconds(MAX_HANDSHAKE_TIMEOUT_SECS as i64)
        );
    }

    #[test]
    fn factory_creates_unstarted_engines() {
        let factory = EngineFactory::new(IdentityKeyPair::generate(), EngineOptions::default());
        for kind in [ProtocolType::Otr, ProtocolType::DoubleRatchet] {
            let engine = factory.create(kind);
            assert_eq!(engine.protocol_type(), kind);
            assert_eq!(engine.state(), EngineState::Unstarted);
            assert!(engine.session_id().is_none());
            assert!(engine.fingerprint().is_none());
            assert!(engine.serialize().is_err());
        }
    }
}
