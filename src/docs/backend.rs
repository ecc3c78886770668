use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use super::schema::IndexKey;
use super::tokenizer::term_frequencies;
use crate::error::{DocError, Result};

/// Statistics of one indexed version for the terms of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct TermMatch {
    pub key: IndexKey,
    /// Frequency of each matched query term in this version.
    pub term_frequencies: HashMap<String, u32>,
    /// Total tokens in the version's text.
    pub length: u32,
}

/// Boundary to wherever postings are kept.
///
/// Every failure surfaces as [`DocError::IndexBackend`].
pub trait IndexBackend: Send + Sync {
    /// Replace whatever is stored for `key`. Returns the number of distinct terms.
    fn write(&self, key: &IndexKey, tokens: &[String]) -> Result<usize>;

    /// Versions in `scope` containing at least one of `terms`, most matched terms first.
    fn query(&self, terms: &[String], scope: &HashSet<IndexKey>) -> Result<Vec<TermMatch>>;

    /// Removing a key that was never written is a no-op.
    fn remove(&self, key: &IndexKey) -> Result<()>;

    fn keys(&self) -> Result<Vec<IndexKey>>;
}

fn rank_matches(mut matches: Vec<TermMatch>) -> Vec<TermMatch> {
    matches.sort_by(|a, b| {
        b.term_frequencies
            .len()
            .cmp(&a.term_frequencies.len())
            .then_with(|| a.key.cmp(&b.key))
    });
    matches
}

/// SQLite-backed postings store.
pub struct SqliteIndexBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteIndexBackend {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(DocError::index_backend)?;
        }
        let conn = Connection::open(db_path).map_err(DocError::index_backend)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA cache_size   = -2000;
             PRAGMA temp_store   = MEMORY;",
        )
        .map_err(DocError::index_backend)?;

        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DocError::index_backend)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS index_docs (
                document_id  TEXT NOT NULL,
                version      TEXT NOT NULL,
                token_count  INTEGER NOT NULL,
                PRIMARY KEY (document_id, version)
            );

            CREATE TABLE IF NOT EXISTS index_terms (
                document_id  TEXT NOT NULL,
                version      TEXT NOT NULL,
                term         TEXT NOT NULL,
                frequency    INTEGER NOT NULL,
                PRIMARY KEY (document_id, version, term)
            );

            CREATE INDEX IF NOT EXISTS idx_index_terms_term ON index_terms(term);",
        )
        .map_err(|e| DocError::index_backend(format!("failed to init index schema: {e}")))?;
        Ok(())
    }
}

impl IndexBackend for SqliteIndexBackend {
    fn write(&self, key: &IndexKey, tokens: &[String]) -> Result<usize> {
        let tf = term_frequencies(tokens);
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(DocError::index_backend)?;
        {
            tx.execute(
                "DELETE FROM index_terms WHERE document_id = ?1 AND version = ?2",
                params![key.document_id, key.version],
            )
            .map_err(DocError::index_backend)?;
            tx.execute(
                "INSERT OR REPLACE INTO index_docs (document_id, version, token_count)
                 VALUES (?1, ?2, ?3)",
                params![key.document_id, key.version, tokens.len() as i64],
            )
            .map_err(DocError::index_backend)?;

            let mut stmt = tx
                .prepare(
                    "INSERT INTO index_terms (document_id, version, term, frequency)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(DocError::index_backend)?;
            for (term, frequency) in &tf {
                stmt.execute(params![key.document_id, key.version, term, *frequency as i64])
                    .map_err(DocError::index_backend)?;
            }
        }
        tx.commit().map_err(DocError::index_backend)?;
        Ok(tf.len())
    }

    fn query(&self, terms: &[String], scope: &HashSet<IndexKey>) -> Result<Vec<TermMatch>> {
        if terms.is_empty() || scope.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; terms.len()].join(", ");
        let sql = format!(
            "SELECT t.document_id, t.version, t.term, t.frequency, d.token_count
             FROM index_terms t
             JOIN index_docs d ON d.document_id = t.document_id AND d.version = t.version
             WHERE t.term IN ({placeholders})"
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(DocError::index_backend)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(terms.iter()), |row| {
                Ok((
                    IndexKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(DocError::index_backend)?;

        let mut by_key: HashMap<IndexKey, TermMatch> = HashMap::new();
        for row in rows {
            let (key, term, frequency, length) = row.map_err(DocError::index_backend)?;
            if !scope.contains(&key) {
                continue;
            }
            by_key
                .entry(key.clone())
                .or_insert_with(|| TermMatch {
                    key,
                    term_frequencies: HashMap::new(),
                    length: length as u32,
                })
                .term_frequencies
                .insert(term, frequency as u32);
        }
        Ok(rank_matches(by_key.into_values().collect()))
    }

    fn remove(&self, key: &IndexKey) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(DocError::index_backend)?;
        tx.execute(
            "DELETE FROM index_terms WHERE document_id = ?1 AND version = ?2",
            params![key.document_id, key.version],
        )
        .map_err(DocError::index_backend)?;
        tx.execute(
            "DELETE FROM index_docs WHERE document_id = ?1 AND version = ?2",
            params![key.document_id, key.version],
        )
        .map_err(DocError::index_backend)?;
        tx.commit().map_err(DocError::index_backend)
    }

    fn keys(&self) -> Result<Vec<IndexKey>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT document_id, version FROM index_docs ORDER BY document_id, version")
            .map_err(DocError::index_backend)?;
        let rows = stmt
            .query_map([], |row| Ok(IndexKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(DocError::index_backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(DocError::index_backend)
    }
}

#[derive(Debug, Clone)]
struct MemoryPostings {
    term_frequencies: HashMap<String, u32>,
    length: u32,
}

/// Volatile postings store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryIndexBackend {
    entries: RwLock<HashMap<IndexKey, MemoryPostings>>,
}

impl MemoryIndexBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexBackend for MemoryIndexBackend {
    fn write(&self, key: &IndexKey, tokens: &[String]) -> Result<usize> {
        let tf = term_frequencies(tokens);
        let distinct = tf.len();
        self.entries.write().insert(
            key.clone(),
            MemoryPostings {
                term_frequencies: tf,
                length: tokens.len() as u32,
            },
        );
        Ok(distinct)
    }

    fn query(&self, terms: &[String], scope: &HashSet<IndexKey>) -> Result<Vec<TermMatch>> {
        let entries = self.entries.read();
        let matches = scope
            .iter()
            .filter_map(|key| {
                let postings = entries.get(key)?;
                let matched: HashMap<String, u32> = terms
                    .iter()
                    .filter_map(|t| postings.term_frequencies.get(t).map(|f| (t.clone(), *f)))
                    .collect();
                (!matched.is_empty()).then(|| TermMatch {
                    key: key.clone(),
                    term_frequencies: matched,
                    length: postings.length,
                })
            })
            .collect();
        Ok(rank_matches(matches))
    }

    fn remove(&self, key: &IndexKey) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<IndexKey>> {
        let mut keys: Vec<IndexKey> = self.entries.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docs::tokenizer::tokenize;
    use tempfile::TempDir;

    fn scope(keys: &[&IndexKey]) -> HashSet<IndexKey> {
        keys.iter().map(|k| (*k).clone()).collect()
    }

    fn exercise(backend: &dyn IndexBackend) {
        let a = IndexKey::new("d1", "1.0");
        let b = IndexKey::new("d1", "2.0");
        let c = IndexKey::new("d2", "1.0");

        assert_eq!(backend.write(&a, &tokenize("foo bar foo")).unwrap(), 2);
        backend.write(&b, &tokenize("bar baz")).unwrap();
        backend.write(&c, &tokenize("foo baz qux")).unwrap();

        let terms = vec!["foo".to_string(), "baz".to_string()];
        let all = scope(&[&a, &b, &c]);
        let matches = backend.query(&terms, &all).unwrap();
        assert_eq!(matches.len(), 3);
        // c matches both terms, so it ranks first
        assert_eq!(matches[0].key, c);
        let a_match = matches.iter().find(|m| m.key == a).unwrap();
        assert_eq!(a_match.term_frequencies["foo"], 2);
        assert_eq!(a_match.length, 3);

        // scope restricts results
        let only_b = backend.query(&terms, &scope(&[&b])).unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].key, b);

        // rewrite replaces
        backend.write(&a, &tokenize("zzz")).unwrap();
        assert!(backend
            .query(&["foo".to_string()], &scope(&[&a]))
            .unwrap()
            .is_empty());

        backend.remove(&a).unwrap();
        backend.remove(&a).unwrap();
        assert_eq!(backend.keys().unwrap(), vec![b, c]);
    }

    #[test]
    fn memory_backend_contract() {
        exercise(&MemoryIndexBackend::new());
    }

    #[test]
    fn sqlite_backend_contract() {
        exercise(&SqliteIndexBackend::in_memory().unwrap());
    }

    #[test]
    fn sqlite_backend_persists_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("index.db");
        let key = IndexKey::new("d1", "1.0");
        {
            let backend = SqliteIndexBackend::open(&path).unwrap();
            backend.write(&key, &tokenize("persisted terms")).unwrap();
        }
        let reopened = SqliteIndexBackend::open(&path).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec![key]);
    }

    #[test]
    fn empty_terms_or_scope_match_nothing() {
        let backend = MemoryIndexBackend::new();
        let key = IndexKey::new("d1", "1.0");
        backend.write(&key, &tokenize("foo")).unwrap();
        assert!(backend.query(&[], &scope(&[&key])).unwrap().is_empty());
        assert!(backend.query(&["foo".into()], &HashSet::new()).unwrap().is_empty());
    }
}
