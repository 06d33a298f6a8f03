//! SQLite storage backend.

use crate::storage::{MessageRow, SessionRow, StorageBackend};
use crate::utils::{MessengerError, Result, StorageError};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Backend over a single SQLite connection
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let backend = Self {
            conn: Mutex::new(conn),
        };
        backend.create_tables()?;
        log::debug!("Opened message database {}", path.as_ref().display());
        Ok(backend)
    }

    /// Open an existing database without write access
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Fresh in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let backend = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        backend.create_tables()?;
        Ok(backend)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ssid INTEGER NOT NULL,
                message BLOB NOT NULL,
                message_timestamp TEXT NOT NULL,
                sent_or_received INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS messages_by_ssid ON messages (ssid, id)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                address TEXT PRIMARY KEY,
                routing_id TEXT NOT NULL,
                display_name TEXT NOT NULL,
                protocol TEXT NOT NULL,
                state BLOB NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| {
            StorageError::Backend {
                reason: "database lock poisoned".to_string(),
            }
            .into()
        })
    }
}

// The ssid column is a signed 64-bit integer; session ids are stored bit-cast.
fn to_column(session_id: u64) -> i64 {
    session_id as i64
}

fn from_column(value: i64) -> u64 {
    value as u64
}

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        row_id: row.get(0)?,
        session_id: from_column(row.get(1)?),
        ciphertext: row.get(2)?,
        timestamp: row.get(3)?,
        direction: row.get(4)?,
    })
}

fn write_error(err: rusqlite::Error) -> MessengerError {
    match err.sqlite_error_code() {
        Some(ErrorCode::ReadOnly) => StorageError::ReadOnly.into(),
        _ => err.into(),
    }
}

impl StorageBackend for SqliteBackend {
    fn insert_message(&self, row: &MessageRow) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages (ssid, message, message_timestamp, sent_or_received)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                to_column(row.session_id),
                row.ciphertext,
                row.timestamp,
                row.direction
            ],
        )
        .map_err(write_error)?;
        Ok(conn.last_insert_rowid())
    }

    fn messages_for_session(&self, session_id: u64) -> Result<Vec<MessageRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, ssid, message, message_timestamp, sent_or_received
             FROM messages
             WHERE ssid = ?1
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![to_column(session_id)], message_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn all_messages(&self) -> Result<Vec<MessageRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, ssid, message, message_timestamp, sent_or_received
             FROM messages
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], message_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn delete_messages(&self, row_ids: &[i64]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(write_error)?;
        let mut deleted = 0;
        for id in row_ids {
            deleted += tx
                .execute("DELETE FROM messages WHERE id = ?1", params![id])
                .map_err(write_error)?;
        }
        tx.commit().map_err(write_error)?;
        Ok(deleted)
    }

    fn upsert_session(&self, row: &SessionRow) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT INTO sessions (address, routing_id, display_name, protocol, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(address) DO UPDATE SET
                    routing_id = excluded.routing_id,
                    display_name = excluded.display_name,
                    protocol = excluded.protocol,
                    state = excluded.state,
                    updated_at = excluded.updated_at",
                params![
                    row.address,
                    row.routing_id,
                    row.display_name,
                    row.protocol,
                    row.state,
                    row.updated_at
                ],
            )
            .map_err(write_error)?;
        Ok(())
    }

    fn sessions(&self) -> Result<Vec<SessionRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, routing_id, display_name, protocol, state, updated_at
             FROM sessions
             ORDER BY address ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SessionRow {
                address: row.get(0)?,
                routing_id: row.get(1)?,
                display_name: row.get(2)?,
                protocol: row.get(3)?,
                state: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    fn delete_session(&self, address: &str) -> Result<bool> {
        let deleted = self
            .conn()?
            .execute("DELETE FROM sessions WHERE address = ?1", params![address])
            .map_err(write_error)?;
        Ok(deleted > 0)
    }
}
