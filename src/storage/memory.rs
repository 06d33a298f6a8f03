//! In-process backend for tests and embedding.

use crate::storage::{MessageRow, SessionRow, StorageBackend};
use crate::utils::{Result, StorageError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    messages: Vec<MessageRow>,
    sessions: BTreeMap<String, SessionRow>,
}

/// Backend holding all rows in memory
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    read_only: AtomicBool,
}

impl MemoryBackend {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes fail with `StorageError::ReadOnly`
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| {
            StorageError::Backend {
                reason: "memory backend lock poisoned".to_string(),
            }
            .into()
        })
    }

    fn writable(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::ReadOnly.into());
        }
        self.tables()
    }
}

impl StorageBackend for MemoryBackend {
    fn insert_message(&self, row: &MessageRow) -> Result<i64> {
        let mut tables = self.writable()?;
        tables.next_id += 1;
        let row_id = tables.next_id;
        tables.messages.push(MessageRow {
            row_id,
            ..row.clone()
        });
        Ok(row_id)
    }

    fn messages_for_session(&self, session_id: u64) -> Result<Vec<MessageRow>> {
        Ok(self
            .tables()?
            .messages
            .iter()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect())
    }

    fn all_messages(&self) -> Result<Vec<MessageRow>> {
        Ok(self.tables()?.messages.clone())
    }

    fn delete_messages(&self, row_ids: &[i64]) -> Result<usize> {
        let mut tables = self.writable()?;
        let before = tables.messages.len();
        tables.messages.retain(|row| !row_ids.contains(&row.row_id));
        Ok(before - tables.messages.len())
    }

    fn upsert_session(&self, row: &SessionRow) -> Result<()> {
        self.writable()?
            .sessions
            .insert(row.address.clone(), row.clone());
        Ok(())
    }

    fn sessions(&self) -> Result<Vec<SessionRow>> {
        Ok(self.tables()?.sessions.values().cloned().collect())
    }

    fn delete_session(&self, address: &str) -> Result<bool> {
        Ok(self.writable()?.sessions.remove(address).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(session_id: u64) -> MessageRow {
        MessageRow {
            row_id: 0,
            session_id,
            ciphertext: vec![1, 2, 3],
            timestamp: "2024-01-01 00:00:00".to_string(),
            direction: 0,
        }
    }

    #[test]
    fn test_ids_increase_and_filter_by_session() {
        let backend = MemoryBackend::new();
        let a = backend.insert_message(&row(7)).unwrap();
        let b = backend.insert_message(&row(8)).unwrap();
        let c = backend.insert_message(&row(7)).unwrap();
        assert!(a < b && b < c);

        let rows = backend.messages_for_session(7).unwrap();
        assert_eq!(rows.iter().map(|r| r.row_id).collect::<Vec<_>>(), vec![a, c]);

        assert_eq!(backend.delete_messages(&[a, b]).unwrap(), 2);
        assert_eq!(backend.all_messages().unwrap().len(), 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let backend = MemoryBackend::new();
        backend.insert_message(&row(1)).unwrap();
        backend.set_read_only(true);

        assert!(backend.insert_message(&row(1)).is_err());
        assert!(backend.delete_session("x").is_err());
        assert_eq!(backend.messages_for_session(1).unwrap().len(), 1);
    }
}
