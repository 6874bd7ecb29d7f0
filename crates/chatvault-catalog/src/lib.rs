//! Encrypted persistent catalog: files, chunks, and transfer recovery state.
//!
//! A single SQLCipher-encrypted SQLite file. All mutations that touch more
//! than one table run inside one transaction, so a process kill at any point
//! leaves either the whole operation visible or none of it.

pub mod files;
pub mod migrations;
pub mod transfers;

use std::path::Path;
use std::sync::Mutex;

use chatvault_types::VaultError;
use rusqlite::Connection;
use tracing::info;

/// Single-connection catalog wrapper.
///
/// Uses `Mutex` because `rusqlite::Connection` is `Send` but not `Sync`
/// (it contains internal `RefCell`s). Engines serialize their short
/// transactions through this lock; chunk transfers spend their time in
/// network I/O, not here.
#[derive(Debug)]
pub struct Catalog {
    conn: Mutex<Connection>,
}

/// Map a rusqlite error into the domain error.
pub(crate) fn db_err(e: rusqlite::Error) -> VaultError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => VaultError::NotFound("no such row".into()),
        other => VaultError::Internal(format!("catalog: {other}")),
    }
}

impl Catalog {
    /// Open an existing catalog. `NotFound` if the file is absent,
    /// `BadPassword` if the key check fails, `Corrupt` if the file is
    /// unreadable.
    pub fn open(path: &Path, password: &str) -> Result<Self, VaultError> {
        if !path.exists() {
            return Err(VaultError::NotFound(format!(
                "catalog not found at {}",
                path.display()
            )));
        }
        let conn = Self::open_keyed(path, password)?;
        // The key is only verified on first page read. A wrong passphrase
        // makes the file look like garbage, which SQLite reports as NotADb.
        match conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::NotADatabase =>
            {
                return Err(VaultError::BadPassword);
            }
            Err(e) => return Err(VaultError::Corrupt(format!("catalog unreadable: {e}"))),
        }
        migrations::run(&conn).map_err(db_err)?;
        info!("Catalog opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create a new catalog: establish the schema, leave an empty but valid
    /// encrypted store on disk.
    pub fn create(path: &Path, password: &str) -> Result<Self, VaultError> {
        if path.exists() {
            return Err(VaultError::Internal(format!(
                "catalog already exists at {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Self::open_keyed(path, password)?;
        migrations::run(&conn).map_err(db_err)?;
        info!("Catalog created at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the catalog, creating it first if absent.
    pub fn open_or_create(path: &Path, password: &str) -> Result<Self, VaultError> {
        match Self::open(path, password) {
            Err(VaultError::NotFound(_)) => Self::create(path, password),
            other => other,
        }
    }

    fn open_keyed(path: &Path, password: &str) -> Result<Connection, VaultError> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "key", password).map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        Ok(conn)
    }

    pub fn close(self) {
        // Dropping the connection flushes and closes the store.
    }

    /// Run read-only queries against the store.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, VaultError>
    where
        F: FnOnce(&Connection) -> Result<T, VaultError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("catalog lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Run a mutation inside one transaction. Commits on `Ok`, rolls back on
    /// `Err`, so a kill between begin and commit leaves no partial state.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, VaultError>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T, VaultError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| VaultError::Internal(format!("catalog lock poisoned: {e}")))?;
        let tx = conn.unchecked_transaction().map_err(db_err)?;
        let out = f(&tx)?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_types::ErrorKind;

    #[test]
    fn create_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");

        let cat = Catalog::create(&path, "pw").unwrap();
        cat.close();

        Catalog::open(&path, "pw").unwrap();
    }

    #[test]
    fn open_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Catalog::open(&dir.path().join("absent.db"), "pw").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn wrong_password_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        Catalog::create(&path, "right").unwrap().close();

        let err = Catalog::open(&path, "wrong").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPassword);
    }

    #[test]
    fn create_over_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        Catalog::create(&path, "pw").unwrap().close();
        assert!(Catalog::create(&path, "pw").is_err());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.db");
        let cat = Catalog::create(&path, "pw").unwrap();

        let result: Result<(), VaultError> = cat.with_tx(|tx| {
            tx.execute(
                "INSERT INTO files (file_id, name, size, mime, category, uploaded_at, owner_credential)
                 VALUES ('f1', 'a', 1, 'x', 'direct', 'now', 'cred')",
                [],
            )
            .map_err(db_err)?;
            Err(VaultError::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count = cat
            .with_conn(|conn| {
                conn.query_row("SELECT count(*) FROM files", [], |r| r.get::<_, i64>(0))
                    .map_err(db_err)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
