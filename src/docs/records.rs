//! Durable catalog records.
//!
//! Documents, versions and finished index entries are written through to
//! SQLite on every change and read back once when the service opens.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row, Transaction};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use super::schema::{
    ContentMetadata, ContentRef, Document, DocumentType, IndexEntry, IndexKey, IndexStatus, Version, VersionStatus,
};
use crate::error::{DocError, Result};

/// Everything needed to rebuild in-memory state after a restart.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    pub versions: Vec<Version>,
    /// Entries with the uid of the version instance they were built from.
    pub index_entries: Vec<(IndexEntry, u64)>,
}

/// Boundary to wherever catalog records are kept.
///
/// Every failure surfaces as [`DocError::Storage`].
pub trait RecordStore: Send + Sync {
    /// Upsert a document together with some of its versions, atomically.
    fn save(&self, document: &Document, versions: &[&Version]) -> Result<()>;

    /// Drop a version and its index entry. `remaining` is the document as it
    /// stands afterwards, `None` when the version was its last.
    fn remove_version(&self, key: &IndexKey, remaining: Option<&Document>) -> Result<()>;

    /// Drop a document with all of its versions and index entries.
    fn remove_document(&self, document_id: &str) -> Result<()>;

    fn save_index_entry(&self, entry: &IndexEntry, version_uid: u64) -> Result<()>;

    /// Removing an entry that was never saved is a no-op.
    fn remove_index_entry(&self, key: &IndexKey) -> Result<()>;

    fn load(&self) -> Result<Snapshot>;
}

/// SQLite-backed record store.
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(DocError::storage)?;
        }
        let conn = Connection::open(db_path).map_err(DocError::storage)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store   = MEMORY;",
        )
        .map_err(DocError::storage)?;

        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DocError::storage)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(DocError::storage)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                library          TEXT NOT NULL,
                doc_type         TEXT NOT NULL,
                description      TEXT NOT NULL,
                tags             TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                current_version  TEXT,
                seq              INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS versions (
                document_id      TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                version          TEXT NOT NULL,
                doc_type         TEXT NOT NULL,
                category         TEXT NOT NULL,
                description      TEXT NOT NULL,
                filename         TEXT,
                size_bytes       INTEGER NOT NULL,
                status           TEXT NOT NULL,
                failure_reason   TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                completed_at     TEXT,
                content_ref      TEXT,
                metadata         TEXT,
                seq              INTEGER NOT NULL,
                uid              INTEGER NOT NULL,
                completion_seq   INTEGER,
                PRIMARY KEY (document_id, version)
            );

            CREATE TABLE IF NOT EXISTS index_entries (
                document_id      TEXT NOT NULL,
                version          TEXT NOT NULL,
                status           TEXT NOT NULL,
                built_at         TEXT,
                term_count       INTEGER NOT NULL,
                token_count      INTEGER NOT NULL,
                error            TEXT,
                snippet          TEXT,
                version_uid      INTEGER NOT NULL,
                PRIMARY KEY (document_id, version),
                FOREIGN KEY (document_id, version)
                    REFERENCES versions(document_id, version) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_documents_library ON documents(library);",
        )
        .map_err(|e| DocError::storage(format!("failed to init catalog schema: {e}")))?;
        Ok(())
    }

    fn upsert_document(tx: &Transaction<'_>, doc: &Document) -> Result<()> {
        let tags = serde_json::to_string(&doc.tags).map_err(DocError::storage)?;
        tx.execute(
            "INSERT INTO documents
                (id, name, library, doc_type, description, tags, created_at, updated_at, current_version, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                library = excluded.library,
                doc_type = excluded.doc_type,
                description = excluded.description,
                tags = excluded.tags,
                updated_at = excluded.updated_at,
                current_version = excluded.current_version",
            params![
                doc.id,
                doc.name,
                doc.library,
                doc.doc_type.as_str(),
                doc.description,
                tags,
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
                doc.current_version,
                doc.seq as i64,
            ],
        )
        .map_err(DocError::storage)?;
        Ok(())
    }

    fn upsert_version(tx: &Transaction<'_>, v: &Version) -> Result<()> {
        let metadata = v
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(DocError::storage)?;
        tx.execute(
            "INSERT INTO versions
                (document_id, version, doc_type, category, description, filename, size_bytes, status,
                 failure_reason, created_at, updated_at, completed_at, content_ref, metadata, seq, uid,
                 completion_seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(document_id, version) DO UPDATE SET
                category = excluded.category,
                description = excluded.description,
                size_bytes = excluded.size_bytes,
                status = excluded.status,
                failure_reason = excluded.failure_reason,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                content_ref = excluded.content_ref,
                metadata = excluded.metadata,
                uid = excluded.uid,
                completion_seq = excluded.completion_seq",
            params![
                v.document_id,
                v.version,
                v.doc_type.as_str(),
                v.category,
                v.description,
                v.filename,
                v.size_bytes as i64,
                v.status.as_str(),
                v.failure_reason,
                v.created_at.to_rfc3339(),
                v.updated_at.to_rfc3339(),
                v.completed_at.map(|t| t.to_rfc3339()),
                v.content_ref.as_ref().map(ContentRef::as_str),
                metadata,
                v.seq as i64,
                v.uid as i64,
                v.completion_seq.map(|s| s as i64),
            ],
        )
        .map_err(DocError::storage)?;
        Ok(())
    }

    fn load_documents(conn: &Connection) -> Result<Vec<Document>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, name, library, doc_type, description, tags, created_at, updated_at,
                        current_version, seq
                 FROM documents ORDER BY seq",
            )
            .map_err(DocError::storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DocumentRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    library: row.get(2)?,
                    doc_type: row.get(3)?,
                    description: row.get(4)?,
                    tags: row.get(5)?,
                    created_at: row.get(6)?,
                    updated_at: row.get(7)?,
                    current_version: row.get(8)?,
                    seq: row.get(9)?,
                })
            })
            .map_err(DocError::storage)?;
        rows.map(|row| row.map_err(DocError::storage)?.into_document())
            .collect()
    }

    fn load_versions(conn: &Connection) -> Result<Vec<Version>> {
        let mut stmt = conn
            .prepare(
                "SELECT document_id, version, doc_type, category, description, filename, size_bytes,
                        status, failure_reason, created_at, updated_at, completed_at, content_ref,
                        metadata, seq, uid, completion_seq
                 FROM versions ORDER BY seq",
            )
            .map_err(DocError::storage)?;
        let rows = stmt
            .query_map([], VersionRow::from_row)
            .map_err(DocError::storage)?;
        rows.map(|row| row.map_err(DocError::storage)?.into_version())
            .collect()
    }

    fn load_index_entries(conn: &Connection) -> Result<Vec<(IndexEntry, u64)>> {
        let mut stmt = conn
            .prepare(
                "SELECT document_id, version, status, built_at, term_count, token_count, error, snippet,
                        version_uid
                 FROM index_entries ORDER BY document_id, version",
            )
            .map_err(DocError::storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .map_err(DocError::storage)?;

        let mut entries = Vec::new();
        for row in rows {
            let (document_id, version, status, built_at, terms, tokens, error, snippet, uid) =
                row.map_err(DocError::storage)?;
            let entry = IndexEntry {
                document_id,
                version,
                status: parse_index_status(&status)?,
                built_at: built_at.as_deref().map(parse_time).transpose()?,
                term_count: terms as usize,
                token_count: tokens as usize,
                error,
                snippet,
                ticket: 0,
            };
            entries.push((entry, uid as u64));
        }
        Ok(entries)
    }
}

impl RecordStore for SqliteRecordStore {
    fn save(&self, document: &Document, versions: &[&Version]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(DocError::storage)?;
        Self::upsert_document(&tx, document)?;
        for v in versions {
            Self::upsert_version(&tx, v)?;
        }
        tx.commit().map_err(DocError::storage)
    }

    fn remove_version(&self, key: &IndexKey, remaining: Option<&Document>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(DocError::storage)?;
        tx.execute(
            "DELETE FROM versions WHERE document_id = ?1 AND version = ?2",
            params![key.document_id, key.version],
        )
        .map_err(DocError::storage)?;
        match remaining {
            Some(document) => Self::upsert_document(&tx, document)?,
            None => {
                tx.execute("DELETE FROM documents WHERE id = ?1", params![key.document_id])
                    .map_err(DocError::storage)?;
            }
        }
        tx.commit().map_err(DocError::storage)
    }

    fn remove_document(&self, document_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM documents WHERE id = ?1", params![document_id])
            .map_err(DocError::storage)?;
        Ok(())
    }

    fn save_index_entry(&self, entry: &IndexEntry, version_uid: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO index_entries
                (document_id, version, status, built_at, term_count, token_count, error, snippet, version_uid)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.document_id,
                entry.version,
                entry.status.as_str(),
                entry.built_at.map(|t| t.to_rfc3339()),
                entry.term_count as i64,
                entry.token_count as i64,
                entry.error,
                entry.snippet,
                version_uid as i64,
            ],
        )
        .map_err(DocError::storage)?;
        Ok(())
    }

    fn remove_index_entry(&self, key: &IndexKey) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM index_entries WHERE document_id = ?1 AND version = ?2",
            params![key.document_id, key.version],
        )
        .map_err(DocError::storage)?;
        Ok(())
    }

    fn load(&self) -> Result<Snapshot> {
        let conn = self.conn.lock();
        Ok(Snapshot {
            documents: Self::load_documents(&conn)?,
            versions: Self::load_versions(&conn)?,
            index_entries: Self::load_index_entries(&conn)?,
        })
    }
}

struct DocumentRow {
    id: String,
    name: String,
    library: String,
    doc_type: String,
    description: String,
    tags: String,
    created_at: String,
    updated_at: String,
    current_version: Option<String>,
    seq: i64,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document> {
        let tags: BTreeSet<String> = serde_json::from_str(&self.tags).map_err(DocError::storage)?;
        Ok(Document {
            id: self.id,
            name: self.name,
            library: self.library,
            doc_type: self.doc_type.parse::<DocumentType>().map_err(DocError::storage)?,
            description: self.description,
            tags,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            current_version: self.current_version,
            status: None,
            version_count: 0,
            versions: Vec::new(),
            seq: self.seq as u64,
        })
    }
}

struct VersionRow {
    document_id: String,
    version: String,
    doc_type: String,
    category: String,
    description: String,
    filename: Option<String>,
    size_bytes: i64,
    status: String,
    failure_reason: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    content_ref: Option<String>,
    metadata: Option<String>,
    seq: i64,
    uid: i64,
    completion_seq: Option<i64>,
}

impl VersionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            document_id: row.get(0)?,
            version: row.get(1)?,
            doc_type: row.get(2)?,
            category: row.get(3)?,
            description: row.get(4)?,
            filename: row.get(5)?,
            size_bytes: row.get(6)?,
            status: row.get(7)?,
            failure_reason: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            completed_at: row.get(11)?,
            content_ref: row.get(12)?,
            metadata: row.get(13)?,
            seq: row.get(14)?,
            uid: row.get(15)?,
            completion_seq: row.get(16)?,
        })
    }

    fn into_version(self) -> Result<Version> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<ContentMetadata>)
            .transpose()
            .map_err(DocError::storage)?;
        Ok(Version {
            document_id: self.document_id,
            version: self.version,
            doc_type: self.doc_type.parse::<DocumentType>().map_err(DocError::storage)?,
            category: self.category,
            description: self.description,
            filename: self.filename,
            size_bytes: self.size_bytes as u64,
            status: self.status.parse::<VersionStatus>().map_err(DocError::storage)?,
            failure_reason: self.failure_reason,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            content_ref: self.content_ref.map(ContentRef),
            metadata,
            seq: self.seq as u64,
            uid: self.uid as u64,
            completion_seq: self.completion_seq.map(|s| s as u64),
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DocError::storage(format!("corrupt timestamp '{raw}': {e}")))
}

fn parse_index_status(raw: &str) -> Result<IndexStatus> {
    match raw {
        "ready" => Ok(IndexStatus::Ready),
        "failed" => Ok(IndexStatus::Failed),
        "building" => Ok(IndexStatus::Building),
        "absent" => Ok(IndexStatus::Absent),
        other => Err(DocError::storage(format!("corrupt index status '{other}'"))),
    }
}
