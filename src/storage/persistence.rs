//! At-rest encryption in front of a storage backend.
//!
//! Bodies are encrypted with the configured `AtRestCipher` before insertion
//! and decrypted on query. The live session ciphers never touch this path.

use crate::crypto::{AtRestCipher, PeerIdentity};
use crate::session::{ProtocolType, SessionId};
use crate::storage::{Direction, MessageRow, SessionRow, StorageBackend};
use crate::utils::{Result, StorageError};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::sync::Arc;

/// Column format for message and record timestamps (UTC, second precision)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A stored message with its body restored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Backend row id
    pub row_id: i64,
    /// Owning session
    pub session_id: SessionId,
    /// Who wrote it
    pub direction: Direction,
    /// Plaintext body
    pub text: String,
    /// When it was stored
    pub timestamp: DateTime<Utc>,
}

/// A persisted session with its engine state decrypted
#[derive(Debug, Clone)]
pub struct StoredSession {
    /// The conversation partner
    pub peer: PeerIdentity,
    /// Engine variant
    pub protocol: ProtocolType,
    /// Engine state blob for `EngineFactory::restore`
    pub state: Vec<u8>,
    /// Last save
    pub updated_at: DateTime<Utc>,
}

/// Encrypting front end over a `StorageBackend`
pub struct EncryptedStore {
    backend: Arc<dyn StorageBackend>,
    cipher: AtRestCipher,
}

impl std::fmt::Debug for EncryptedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedStore")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(row_id: i64, text: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map_err(|e| {
        StorageError::Corrupt {
            row_id,
            reason: format!("bad timestamp {text:?}: {e}"),
        }
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}

impl EncryptedStore {
    /// Wrap `backend` with `cipher`
    pub fn new(backend: Arc<dyn StorageBackend>, cipher: AtRestCipher) -> Self {
        Self { backend, cipher }
    }

    /// Encrypt `plaintext` and append it to the session's history
    pub fn append(
        &self,
        session_id: SessionId,
        direction: Direction,
        plaintext: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        let row = MessageRow {
            row_id: 0,
            session_id: session_id.0,
            ciphertext: self.cipher.encrypt(plaintext.as_bytes())?,
            timestamp: format_timestamp(timestamp),
            direction: direction.as_i64(),
        };
        let row_id = self.backend.insert_message(&row)?;
        log::debug!("Stored {direction} message {row_id} for session {session_id}");
        Ok(row_id)
    }

    /// The session's messages in insertion order
    ///
    /// # Errors
    ///
    /// Fails with `StorageError::Corrupt` or `StorageError::InvalidDirection`
    /// if any row cannot be restored
    pub fn query(&self, session_id: SessionId) -> Result<Vec<Message>> {
        self.backend
            .messages_for_session(session_id.0)?
            .iter()
            .map(|row| self.restore(row))
            .collect()
    }

    fn restore(&self, row: &MessageRow) -> Result<Message> {
        let direction = Direction::from_i64(row.direction)?;
        let body = self
            .cipher
            .decrypt(&row.ciphertext)
            .map_err(|e| StorageError::Corrupt {
                row_id: row.row_id,
                reason: e.to_string(),
            })?;
        let text = String::from_utf8(body).map_err(|e| StorageError::Corrupt {
            row_id: row.row_id,
            reason: e.to_string(),
        })?;

        Ok(Message {
            row_id: row.row_id,
            session_id: SessionId(row.session_id),
            direction,
            text,
            timestamp: parse_timestamp(row.row_id, &row.timestamp)?,
        })
    }

    /// Delete every message matching `predicate`, returning the count.
    /// Rows that cannot be restored are left alone.
    pub fn delete<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&Message) -> bool,
    {
        let mut doomed = Vec::new();
        for row in self.backend.all_messages()? {
            match self.restore(&row) {
                Ok(message) if predicate(&message) => doomed.push(row.row_id),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping unreadable message: {e}"),
            }
        }

        if doomed.is_empty() {
            return Ok(0);
        }
        self.backend.delete_messages(&doomed)
    }

    /// Retention: drop messages stored before `cutoff`
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let pruned = self.delete(|message| message.timestamp < cutoff)?;
        if pruned > 0 {
            log::info!("Pruned {pruned} messages older than {}", format_timestamp(cutoff));
        }
        Ok(pruned)
    }

    /// Drop a session's whole history
    pub fn delete_history(&self, session_id: SessionId) -> Result<usize> {
        self.delete(|message| message.session_id == session_id)
    }

    /// Encrypt and save the engine state for `peer`, replacing any earlier record
    pub fn save_session(
        &self,
        peer: &PeerIdentity,
        protocol: ProtocolType,
        state: &[u8],
    ) -> Result<()> {
        let row = SessionRow {
            address: peer.address.clone(),
            routing_id: peer.routing_id.clone(),
            display_name: peer.display_name.clone(),
            protocol: protocol.as_str().to_string(),
            state: self.cipher.encrypt(state)?,
            updated_at: format_timestamp(Utc::now()),
        };
        self.backend.upsert_session(&row)?;
        log::debug!("Saved {protocol} session record for {}", peer.address);
        Ok(())
    }

    /// Every session record. Records that cannot be decrypted or name an
    /// unknown protocol are skipped.
    pub fn load_sessions(&self) -> Result<Vec<StoredSession>> {
        let mut sessions = Vec::new();
        for row in self.backend.sessions()? {
            match self.restore_session(&row) {
                Ok(session) => sessions.push(session),
                Err(e) => log::warn!("Skipping session record for {}: {e}", row.address),
            }
        }
        Ok(sessions)
    }

    fn restore_session(&self, row: &SessionRow) -> Result<StoredSession> {
        let protocol: ProtocolType = row.protocol.parse()?;
        let state = self.cipher.decrypt(&row.state)?;
        let mut peer = PeerIdentity::new(row.address.clone(), row.routing_id.clone());
        peer.display_name = row.display_name.clone();

        Ok(StoredSession {
            peer,
            protocol,
            state,
            updated_at: parse_timestamp(0, &row.updated_at)?,
        })
    }

    /// Remove the session record for `address`
    pub fn delete_session(&self, address: &str) -> Result<bool> {
        self.backend.delete_session(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AtRestScheme;
    use crate::storage::{MemoryBackend, SqliteBackend};
    use chrono::Duration;

    const KEY: &[u8] = b"0123456789abcdef";

    fn store_over(backend: Arc<dyn StorageBackend>) -> EncryptedStore {
        EncryptedStore::new(backend, AtRestCipher::new(KEY, AtRestScheme::LegacyZeroIv).unwrap())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn test_append_then_query_restores_plaintext() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        let ssid = SessionId(0x1122_3344_5566_7788);

        store.append(ssid, Direction::Received, "Want to play fortnite?", now()).unwrap();
        store.append(ssid, Direction::Sent, "sure", now()).unwrap();
        store.append(SessionId(9), Direction::Sent, "elsewhere", now()).unwrap();

        let messages = store.query(ssid).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "Want to play fortnite?");
        assert_eq!(messages[0].direction, Direction::Received);
        assert_eq!(messages[0].timestamp, now());
        assert_eq!(messages[1].text, "sure");
        assert_eq!(messages[1].direction, Direction::Sent);

        let raw = backend.messages_for_session(ssid.0).unwrap();
        assert_ne!(raw[0].ciphertext, b"Want to play fortnite?".to_vec());
        assert_eq!(raw[0].ciphertext.len() % 16, 0);
    }

    #[test]
    fn test_block_aligned_message_round_trips_under_both_schemes() {
        let text = "sixteen bytes!!!";
        assert_eq!(text.len(), 16);

        for (scheme, iv_len) in [(AtRestScheme::LegacyZeroIv, 0), (AtRestScheme::RandomIv, 16)] {
            let backend = Arc::new(MemoryBackend::new());
            let store = EncryptedStore::new(backend.clone(), AtRestCipher::new(KEY, scheme).unwrap());

            store.append(SessionId(3), Direction::Sent, text, now()).unwrap();
            let messages = store.query(SessionId(3)).unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].text, text);

            // a full block of padding follows the aligned body
            let raw = backend.messages_for_session(3).unwrap();
            assert_eq!(raw[0].ciphertext.len(), iv_len + 32);
        }
    }

    #[test]
    fn test_invalid_direction_is_rejected_on_read() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_over(backend.clone());
        let cipher = AtRestCipher::new(KEY, AtRestScheme::LegacyZeroIv).unwrap();

        backend
            .insert_message(&MessageRow {
                row_id: 0,
                session_id: 4,
                ciphertext: cipher.encrypt(b"hello").unwrap(),
                timestamp: "2024-05-01 10:00:00".to_string(),
                direction: 7,
            })
            .unwrap();

        assert!(store.query(SessionId(4)).is_err());
    }

    #[test]
    fn test_wrong_key_is_a_storage_failure() {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        store_over(Arc::clone(&backend))
            .append(SessionId(1), Direction::Sent, "secret", now())
            .unwrap();

        let other = EncryptedStore::new(
            backend,
            AtRestCipher::new(b"fedcba9876543210", AtRestScheme::LegacyZeroIv).unwrap(),
        );
        assert!(other.query(SessionId(1)).is_err());
    }

    #[test]
    fn test_delete_and_prune() {
        let store = store_over(Arc::new(MemoryBackend::new()));
        let ssid = SessionId(2);
        store.append(ssid, Direction::Sent, "old", now() - Duration::days(40)).unwrap();
        store.append(ssid, Direction::Sent, "new", now()).unwrap();
        store.append(SessionId(3), Direction::Received, "drop me", now()).unwrap();

        assert_eq!(store.delete(|m| m.text == "drop me").unwrap(), 1);
        assert_eq!(store.prune_older_than(now() - Duration::days(30)).unwrap(), 1);

        let left = store.query(ssid).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].text, "new");
        assert_eq!(store.delete_history(ssid).unwrap(), 1);
        assert!(store.query(ssid).unwrap().is_empty());
    }

    #[test]
    fn test_session_records_are_encrypted() {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let store = store_over(backend.clone());
        let peer = PeerIdentity::new("10.0.0.2", "aa:bb:cc:dd:ee:ff");

        store.save_session(&peer, ProtocolType::DoubleRatchet, b"engine state").unwrap();
        let raw = backend.sessions().unwrap();
        assert_eq!(raw[0].protocol, "ratchet");
        assert_ne!(raw[0].state, b"engine state".to_vec());

        let loaded = store.load_sessions().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].peer, peer);
        assert_eq!(loaded[0].protocol, ProtocolType::DoubleRatchet);
        assert_eq!(loaded[0].state, b"engine state");

        assert!(store.delete_session("10.0.0.2").unwrap());
        assert!(store.load_sessions().unwrap().is_empty());
    }
}
