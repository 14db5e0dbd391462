//! SQLite implementation of the durable backend.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params};
use silt_delta::{DeltaView, FieldRecord, HeaderSnapshot};
use tracing::debug;

use crate::backend::{SessionBackend, StoredRecord};
use crate::error::Result;

/// Durable session backend backed by SQLite.
///
/// Two tables: `sessions` holds one header row per record, `session_fields`
/// one row per field. A persist is a single transaction: header upsert,
/// modified-field upserts, removed-key deletes.
///
/// Uses WAL mode. The connection is wrapped in a mutex, serializing
/// statements from concurrent workers.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

const UPSERT_SESSION: &str = r#"
INSERT INTO sessions (
    id, node_id, app, principal,
    created_at, last_accessed_at, this_accessed_at, expires_at,
    max_idle_secs, request_count, is_new, is_valid,
    user_agent, remote_addr, remote_host, remote_port, remote_user
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
ON CONFLICT(id) DO UPDATE SET
    node_id = excluded.node_id,
    app = excluded.app,
    principal = excluded.principal,
    last_accessed_at = excluded.last_accessed_at,
    this_accessed_at = excluded.this_accessed_at,
    expires_at = excluded.expires_at,
    max_idle_secs = excluded.max_idle_secs,
    request_count = excluded.request_count,
    is_new = excluded.is_new,
    is_valid = excluded.is_valid,
    user_agent = excluded.user_agent,
    remote_addr = excluded.remote_addr,
    remote_host = excluded.remote_host,
    remote_port = excluded.remote_port,
    remote_user = excluded.remote_user
"#;

const UPSERT_FIELD: &str = r#"
INSERT INTO session_fields (session_id, key, update_count, data_len, checksum, type_tag, data)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(session_id, key) DO UPDATE SET
    update_count = excluded.update_count,
    data_len = excluded.data_len,
    checksum = excluded.checksum,
    type_tag = excluded.type_tag,
    data = excluded.data
"#;

impl SqliteBackend {
    /// Open or create a backend at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Open an in-memory backend, mainly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                node_id TEXT NOT NULL,
                app TEXT NOT NULL,
                principal TEXT,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL,
                this_accessed_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                max_idle_secs INTEGER NOT NULL,
                request_count INTEGER NOT NULL,
                is_new INTEGER NOT NULL,
                is_valid INTEGER NOT NULL,
                user_agent TEXT,
                remote_addr TEXT,
                remote_host TEXT,
                remote_port TEXT,
                remote_user TEXT
            );

            CREATE TABLE IF NOT EXISTS session_fields (
                session_id TEXT NOT NULL,
                key TEXT NOT NULL,
                update_count INTEGER NOT NULL,
                data_len INTEGER NOT NULL,
                checksum TEXT NOT NULL,
                type_tag TEXT NOT NULL,
                data BLOB,
                PRIMARY KEY (session_id, key)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at
                ON sessions (expires_at);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_header(row: &Row<'_>) -> rusqlite::Result<HeaderSnapshot> {
        Ok(HeaderSnapshot {
            node_id: row.get("node_id")?,
            app: row.get("app")?,
            principal: row.get("principal")?,
            created_at: parse_ts(row, "created_at")?,
            last_accessed_at: parse_ts(row, "last_accessed_at")?,
            this_accessed_at: parse_ts(row, "this_accessed_at")?,
            expires_at: parse_ts(row, "expires_at")?,
            max_idle_secs: row.get("max_idle_secs")?,
            request_count: row.get("request_count")?,
            is_new: row.get("is_new")?,
            is_valid: row.get("is_valid")?,
            user_agent: row.get("user_agent")?,
            remote_addr: row.get("remote_addr")?,
            remote_host: row.get("remote_host")?,
            remote_port: row.get("remote_port")?,
            remote_user: row.get("remote_user")?,
        })
    }

    fn row_to_field(row: &Row<'_>) -> rusqlite::Result<FieldRecord> {
        Ok(FieldRecord {
            key: row.get("key")?,
            update_count: row.get("update_count")?,
            data_len: row.get::<_, i64>("data_len")? as usize,
            checksum: row.get("checksum")?,
            type_tag: row.get("type_tag")?,
            data: row.get("data")?,
        })
    }
}

impl SessionBackend for SqliteBackend {
    fn persist(&self, delta: DeltaView<'_>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if let Some(header) = delta.header {
            tx.execute(
                UPSERT_SESSION,
                params![
                    delta.id,
                    header.node_id,
                    header.app,
                    header.principal,
                    format_ts(header.created_at),
                    format_ts(header.last_accessed_at),
                    format_ts(header.this_accessed_at),
                    format_ts(header.expires_at),
                    header.max_idle_secs,
                    header.request_count,
                    header.is_new,
                    header.is_valid,
                    header.user_agent,
                    header.remote_addr,
                    header.remote_host,
                    header.remote_port,
                    header.remote_user,
                ],
            )?;
        }

        for field in delta.modified.values() {
            tx.execute(
                UPSERT_FIELD,
                params![
                    delta.id,
                    field.key,
                    field.update_count,
                    field.data_len as i64,
                    field.checksum,
                    field.type_tag,
                    field.data,
                ],
            )?;
        }

        for key in delta.removed {
            tx.execute(
                "DELETE FROM session_fields WHERE session_id = ?1 AND key = ?2",
                params![delta.id, key],
            )?;
        }

        tx.commit()?;

        debug!(
            session_id = %delta.id,
            modified = delta.modified.len(),
            removed = delta.removed.len(),
            "Persisted session delta"
        );
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Option<StoredRecord>> {
        let conn = self.conn.lock();

        let header = {
            let mut stmt = conn.prepare("SELECT * FROM sessions WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => Some(Self::row_to_header(row)?),
                None => None,
            }
        };

        let mut fields = HashMap::new();
        {
            let mut stmt = conn.prepare(
                "SELECT key, update_count, data_len, checksum, type_tag, data
                 FROM session_fields WHERE session_id = ?1",
            )?;
            let mut rows = stmt.query(params![id])?;
            while let Some(row) = rows.next()? {
                let field = Self::row_to_field(row)?;
                fields.insert(field.key.clone(), field);
            }
        }

        if header.is_none() && fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(StoredRecord { header, fields }))
    }

    fn remove(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM session_fields WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        debug!(session_id = %id, "Removed session from backend");
        Ok(())
    }

    fn expired_keys(&self) -> Result<HashSet<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM sessions WHERE expires_at < ?1")?;
        let mut rows = stmt.query(params![format_ts(Utc::now())])?;
        let mut keys = HashSet::new();
        while let Some(row) = rows.next()? {
            keys.insert(row.get(0)?);
        }
        Ok(keys)
    }

    fn is_available(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}

/// Fixed-width UTC RFC 3339 with millisecond precision, so stored
/// timestamps order lexicographically.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
