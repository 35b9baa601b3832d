//! Transactional key-value metadata store on an embedded SQLite database.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use projhub_core::{KeyValueStore, ProjectError};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

/// File name of the database inside the registry root.
pub const METADATA_DB_FILE: &str = "metadata.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
"#;

/// Embedded key-value store holding project records.
pub struct MetadataStore {
    conn: Mutex<Option<Connection>>,
    path: Option<PathBuf>,
}

/// Read-only view of the store inside a transaction.
pub struct ReadTx<'a> {
    tx: Transaction<'a>,
}

/// Read-write view of the store inside a transaction.
pub struct WriteTx<'a> {
    tx: Transaction<'a>,
}

fn store_err(op: &str, e: rusqlite::Error) -> ProjectError {
    ProjectError::Store(format!("{}: {}", op, e))
}

fn get_value(tx: &Transaction<'_>, key: &str) -> Result<Option<Vec<u8>>, ProjectError> {
    tx.query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get::<_, Vec<u8>>(0)
    })
    .optional()
    .map_err(|e| store_err(&format!("get {}", key), e))
}

impl ReadTx<'_> {
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProjectError> {
        get_value(&self.tx, key)
    }

    /// Keys starting with `prefix`, in ascending order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, ProjectError> {
        let err = |e: rusqlite::Error| store_err(&format!("list {}*", prefix), e);
        let mut stmt = self
            .tx
            .prepare("SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .map_err(err)?;
        let keys = stmt
            .query_map(params![prefix], |row| row.get::<_, String>(0))
            .map_err(err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(err)?;
        Ok(keys)
    }
}

impl WriteTx<'_> {
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProjectError> {
        get_value(&self.tx, key)
    }

    /// Upsert a value, returning the previous one if the key existed.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<Option<Vec<u8>>, ProjectError> {
        let previous = get_value(&self.tx, key)?;
        self.tx
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map_err(|e| store_err(&format!("set {}", key), e))?;
        Ok(previous)
    }

    pub fn delete(&self, key: &str) -> Result<bool, ProjectError> {
        let removed = self
            .tx
            .execute("DELETE FROM kv WHERE key = ?1", params![key])
            .map_err(|e| store_err(&format!("delete {}", key), e))?;
        Ok(removed > 0)
    }
}

impl MetadataStore {
    /// Open or create the store inside `dir`.
    pub fn open(dir: &Path) -> Result<Self, ProjectError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            ProjectError::StoreOpen(format!("failed to create {}: {}", dir.display(), e))
        })?;

        let path = dir.join(METADATA_DB_FILE);
        let conn = Connection::open(&path)
            .map_err(|e| ProjectError::StoreOpen(format!("{}: {}", path.display(), e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ProjectError::StoreOpen(format!("{}: {}", path.display(), e)))?;

        info!("Opened metadata store at {}", path.display());
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: Some(path),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, ProjectError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ProjectError::StoreOpen(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ProjectError::StoreOpen(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn connection(&self) -> Result<MutexGuard<'_, Option<Connection>>, ProjectError> {
        self.conn
            .lock()
            .map_err(|_| ProjectError::Store("metadata store lock poisoned".to_string()))
    }

    /// Run `read` inside a read transaction.
    pub fn view<T>(
        &self,
        read: impl FnOnce(&ReadTx<'_>) -> Result<T, ProjectError>,
    ) -> Result<T, ProjectError> {
        let mut guard = self.connection()?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ProjectError::Store("metadata store is closed".to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| store_err("begin read transaction", e))?;
        let view = ReadTx { tx };
        let result = read(&view)?;
        view.tx
            .commit()
            .map_err(|e| store_err("end read transaction", e))?;
        Ok(result)
    }

    /// Run `write` inside a write transaction. Nothing is applied unless
    /// `write` returns `Ok`.
    pub fn update<T>(
        &self,
        write: impl FnOnce(&WriteTx<'_>) -> Result<T, ProjectError>,
    ) -> Result<T, ProjectError> {
        let mut guard = self.connection()?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| ProjectError::Store("metadata store is closed".to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| store_err("begin write transaction", e))?;
        let update = WriteTx { tx };
        // An early return drops the transaction, which rolls it back.
        let result = write(&update)?;
        update
            .tx
            .commit()
            .map_err(|e| store_err("commit", e))?;
        Ok(result)
    }

    /// Close the underlying database. Later operations fail.
    pub fn close(&self) -> Result<(), ProjectError> {
        let mut guard = self.connection()?;
        match guard.take() {
            Some(conn) => {
                if let Err((_, e)) = conn.close() {
                    warn!("Error while closing metadata store: {}", e);
                    return Err(store_err("close", e));
                }
                debug!("Closed metadata store");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl KeyValueStore for MetadataStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ProjectError> {
        self.view(|tx| tx.get(key))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<Option<Vec<u8>>, ProjectError> {
        self.update(|tx| tx.set(key, value))
    }

    fn delete(&self, key: &str) -> Result<bool, ProjectError> {
        self.update(|tx| tx.delete(key))
    }
}
