//! Message history and session record storage.
//!
//! `EncryptedStore` is the only writer: it runs every body and every engine
//! state blob through the at-rest cipher before it reaches a
//! `StorageBackend`, so backends only ever see at-rest ciphertext.

pub mod memory;
pub mod persistence;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use persistence::{EncryptedStore, Message, TIMESTAMP_FORMAT};
pub use sqlite::SqliteBackend;

use crate::utils::{Result, StorageError};
use serde::{Deserialize, Serialize};

/// Which side wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Written by the local node
    Sent,
    /// Written by the peer
    Received,
}

impl Direction {
    /// Column value
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Sent => 0,
            Self::Received => 1,
        }
    }

    /// Parse the column value, rejecting anything but 0 and 1
    pub fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Sent),
            1 => Ok(Self::Received),
            value => Err(StorageError::InvalidDirection { value }.into()),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Received => write!(f, "received"),
        }
    }
}

/// A message row as the backend stores it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    /// Backend-assigned id, increasing in insertion order. Ignored on insert.
    pub row_id: i64,
    /// Session the message belongs to
    pub session_id: u64,
    /// At-rest ciphertext of the body
    pub ciphertext: Vec<u8>,
    /// `TIMESTAMP_FORMAT` text
    pub timestamp: String,
    /// Raw direction column
    pub direction: i64,
}

/// A persisted session record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    /// Peer network address, the record key
    pub address: String,
    /// Peer routing id
    pub routing_id: String,
    /// Peer display name
    pub display_name: String,
    /// `ProtocolType` tag
    pub protocol: String,
    /// At-rest ciphertext of the engine state blob
    pub state: Vec<u8>,
    /// `TIMESTAMP_FORMAT` text
    pub updated_at: String,
}

/// Row storage for messages and session records
pub trait StorageBackend: Send + Sync {
    /// Append a message row, returning its id
    fn insert_message(&self, row: &MessageRow) -> Result<i64>;

    /// Rows for one session in insertion order
    fn messages_for_session(&self, session_id: u64) -> Result<Vec<MessageRow>>;

    /// Every row in insertion order
    fn all_messages(&self) -> Result<Vec<MessageRow>>;

    /// Delete rows by id, returning how many went
    fn delete_messages(&self, row_ids: &[i64]) -> Result<usize>;

    /// Insert or replace the record for `row.address`
    fn upsert_session(&self, row: &SessionRow) -> Result<()>;

    /// Every session record
    fn sessions(&self) -> Result<Vec<SessionRow>>;

    /// Delete a session record. Returns false if there was none.
    fn delete_session(&self, address: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_column_values() {
        assert_eq!(Direction::Sent.as_i64(), 0);
        assert_eq!(Direction::Received.as_i64(), 1);
        assert_eq!(Direction::from_i64(1).unwrap(), Direction::Received);
        assert!(Direction::from_i64(2).is_err());
        assert!(Direction::from_i64(-1).is_err());
    }
}
