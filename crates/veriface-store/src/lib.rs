//! SQLite enrollment store.
//!
//! Append-only embedding history per identity: the match pipeline reads the
//! most recent records and appends confirmed captures, nothing is ever
//! rewritten. Embeddings are stored as little-endian f32 BLOBs next to their
//! dimensionality; rows whose blob no longer decodes are excluded from
//! fetches rather than failing the whole read.

use std::path::Path;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use veriface_core::{Embedding, EnrollmentRecord, EnrollmentStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          TEXT PRIMARY KEY,
    display_name TEXT,
    created_at  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS enrollments (
    id            TEXT PRIMARY KEY,
    identity_id   TEXT NOT NULL REFERENCES identities(id),
    embedding     BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_enrollments_identity
    ON enrollments(identity_id, created_at DESC);
";

/// Enrollment history entry without the embedding payload.
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    pub record_id: String,
    pub created_at: String,
    pub dim: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

pub struct SqliteEnrollmentStore {
    conn: Connection,
}

impl SqliteEnrollmentStore {
    /// Open (creating if necessary) the database at `path`. The connection
    /// is scoped to one process invocation.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", path.display())))?;
        Self::init(conn)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Unavailable(format!("schema init: {e}")))?;
        Ok(Self { conn })
    }

    /// Create an identity row. Returns `false` when it already existed.
    pub fn register_identity(
        &mut self,
        identity_id: &str,
        display_name: Option<&str>,
    ) -> Result<bool, StoreError> {
        let inserted = self
            .conn
            .execute(
                "INSERT INTO identities (id, display_name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO NOTHING",
                params![identity_id, display_name, Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        Ok(inserted > 0)
    }

    /// History summaries, most recent first.
    pub fn list_records(&self, identity_id: &str) -> Result<Vec<RecordSummary>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, created_at, dim, model_version
                 FROM enrollments
                 WHERE identity_id = ?1
                 ORDER BY created_at DESC, rowid DESC",
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let rows = stmt
            .query_map(params![identity_id], |row| {
                Ok(RecordSummary {
                    record_id: row.get(0)?,
                    created_at: row.get(1)?,
                    dim: row.get::<_, i64>(2)? as usize,
                    model_version: row.get(3)?,
                })
            })
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl EnrollmentStore for SqliteEnrollmentStore {
    fn identity_exists(&self, identity_id: &str) -> Result<bool, StoreError> {
        self.conn
            .query_row(
                "SELECT 1 FROM identities WHERE id = ?1",
                params![identity_id],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn fetch_recent(
        &self,
        identity_id: &str,
        limit: usize,
    ) -> Result<Vec<EnrollmentRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, identity_id, embedding, model_version, created_at
                 FROM enrollments
                 WHERE identity_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT ?2",
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let rows = stmt
            .query_map(params![identity_id, limit as i64], |row| {
                let id: String = row.get(0)?;
                let identity_id: String = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                let model_version: Option<String> = row.get(3)?;
                let created_at: String = row.get(4)?;
                Ok((id, identity_id, blob, model_version, created_at))
            })
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (id, identity_id, blob, model_version, created_at) =
                row.map_err(|e| StoreError::Unavailable(e.to_string()))?;
            match decode_embedding(&blob) {
                Some(values) => records.push(EnrollmentRecord {
                    id,
                    identity_id,
                    embedding: Embedding::new(values, model_version),
                    created_at,
                }),
                None => {
                    // One corrupt row must not sink the whole fetch.
                    tracing::warn!(record_id = %id, "undecodable embedding blob, record excluded");
                }
            }
        }
        Ok(records)
    }

    fn append(&mut self, identity_id: &str, embedding: &Embedding) -> Result<String, StoreError> {
        let record_id = Uuid::new_v4().to_string();
        let blob = encode_embedding(embedding);

        let tx = self
            .conn
            .transaction()
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        tx.execute(
            "INSERT INTO enrollments (id, identity_id, embedding, dim, model_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record_id,
                identity_id,
                blob,
                embedding.dim() as i64,
                embedding.model_version,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| StoreError::WriteFailed(e.to_string()))?;
        tx.commit()
            .map_err(|e| StoreError::WriteFailed(e.to_string()))?;

        Ok(record_id)
    }
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.values.len() * 4);
    for value in &embedding.values {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn decode_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
