//! # OTR Messenger
//!
//! A peer-to-peer messaging library that multiplexes off-the-record-style
//! encrypted sessions across many concurrent conversations and keeps an
//! independently encrypted message history.
//!
//! ## Features
//!
//! - **Session engines**: an OTR-style authenticated key exchange and a
//!   Double Ratchet variant behind one `Protocol` capability
//! - **Session registry**: exactly one live session per peer, created on
//!   first contact from either side
//! - **Message routing**: handshake traffic is echoed to the peer and never
//!   surfaced; application plaintext is delivered and persisted
//! - **At-rest encryption**: AES-CBC over stored bodies, independent of the
//!   session ciphers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use otr_messenger::{App, MessengerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MessengerConfig::default();
//!     let app = App::new(config)?;
//!     app.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: identity keys, HMAC/HKDF helpers and the at-rest cipher
//! - [`session`]: protocol engines and the session registry
//! - [`router`]: envelope dispatch between transport, engines and storage
//! - [`storage`]: encrypted message history and session records
//! - [`transport`]: wire envelopes and the TCP and in-memory transports
//! - [`utils`]: configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod crypto;
pub mod router;
pub mod session;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::App;
pub use crypto::{AtRestCipher, IdentityKeyPair, LocalIdentity, PeerIdentity};
pub use router::{Router, RouterEvent};
pub use session::{Decrypted, EngineFactory, Protocol, ProtocolType, SessionRegistry};
pub use storage::{Direction, EncryptedStore};
pub use transport::{Envelope, Transport};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Maximum message size in bytes (1MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default configuration values
pub mod defaults {
    /// Default port for envelope traffic
    pub const DEFAULT_PORT: u16 = 4242;

    /// Default seconds a handshake may stay incomplete
    pub const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 30;

    /// Default maximum number of live sessions
    pub const DEFAULT_MAX_SESSIONS: usize = 100;

    /// Default seconds between handshake reaper runs
    pub const DEFAULT_REAPER_INTERVAL: u64 = 5;
}
