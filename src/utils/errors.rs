//! Error types and handling for the messenger.
//!
//! Every fallible operation in the crate returns [`Result`], whose error side
//! is the [`MessengerError`] umbrella. The per-area enums below map onto the
//! failure taxonomy the router acts on: malformed wire input and address
//! mismatches are dropped, handshake failures tear a session down, storage
//! failures are surfaced to the caller and a bad at-rest key aborts startup.

use thiserror::Error;

/// Result type alias for the messenger library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all messenger operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Session management errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Message history and session record persistence errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// UTF-8 conversion errors
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },

    /// Key derivation failure
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Connection establishment failure
    #[error("Connection failed to {peer}: {reason}")]
    ConnectionFailed { peer: String, reason: String },

    /// Network transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Timeout during network operation
    #[error("Network timeout: {operation}")]
    Timeout { operation: String },

    /// Envelope addressed to somebody else
    #[error("Envelope addressed to {actual}, local address is {expected}")]
    AddressMismatch { expected: String, actual: String },
}

/// Session management errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// Session not found
    #[error("Session not found: {peer}")]
    NotFound { peer: String },

    /// Invalid session state for operation
    #[error("Invalid session state: {state}")]
    InvalidState { state: String },

    /// Key exchange failed; the session has been ended
    #[error("Handshake with {peer} failed: {reason}")]
    HandshakeFailure { peer: String, reason: String },

    /// Double Ratchet operation failure
    #[error("Double Ratchet failure: {reason}")]
    DoubleRatchetFailure { reason: String },

    /// Message ordering violation
    #[error("Message ordering violation: expected {expected}, got {actual}")]
    MessageOrdering { expected: u32, actual: u32 },

    /// Registry is full
    #[error("Session limit of {max} reached")]
    CapacityExceeded { max: usize },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Directory creation failure
    #[error("Failed to create directory: {path}")]
    DirectoryCreation { path: String },
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Unsupported protocol name
    #[error("Unsupported protocol: {name}")]
    UnsupportedProtocol { name: String },

    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Missing required message field
    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

/// Persistence errors
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// The storage backend rejected the operation
    #[error("Storage backend failure: {reason}")]
    Backend { reason: String },

    /// Backend was opened read-only
    #[error("Storage is read-only")]
    ReadOnly,

    /// A stored row could not be decoded
    #[error("Corrupt record {row_id}: {reason}")]
    Corrupt { row_id: i64, reason: String },

    /// Direction column outside the two defined values
    #[error("Invalid message direction: {value}")]
    InvalidDirection { value: i64 },

    /// A session has no id yet, so nothing can be stored against it
    #[error("Session with {peer} has no session id")]
    MissingSessionId { peer: String },
}

impl MessengerError {
    /// Returns true if this error only affects the message that caused it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(NetworkError::Timeout { .. })
                | Self::Network(NetworkError::ConnectionFailed { .. })
                | Self::Network(NetworkError::AddressMismatch { .. })
                | Self::Protocol(ProtocolError::InvalidMessage { .. })
                | Self::Protocol(ProtocolError::MessageTooLarge { .. })
                | Self::Session(SessionError::InvalidState { .. })
        )
    }

    /// Returns true if this error ended the session it occurred in
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Session(SessionError::HandshakeFailure { .. }))
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::SignatureVerification)
                | Self::Crypto(CryptoError::Decryption { .. })
                | Self::Session(SessionError::HandshakeFailure { .. })
        )
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MessengerError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<rusqlite::Error> for MessengerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Backend {
            reason: err.to_string(),
        })
    }
}
