use rusqlite::Connection;
use tracing::info;

/// Current schema version. Increment and append to `MIGRATIONS` when the
/// schema changes.
const CURRENT_VERSION: u32 = 1;

type MigrationFn = fn(&Connection) -> Result<(), rusqlite::Error>;

/// Ordered list of migrations. Index 0 = version 1.
const MIGRATIONS: &[MigrationFn] = &[migrate_v1];

pub fn run(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER NOT NULL,
            applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    if current >= CURRENT_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=CURRENT_VERSION {
        let idx = (version - 1) as usize;
        info!("Applying catalog migration v{}", version);
        MIGRATIONS[idx](conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    }

    info!("Catalog schema at v{}", CURRENT_VERSION);
    Ok(())
}

/// Version 1: files, chunks, and the two transfer recovery tables.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS files (
            file_id             TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            size                INTEGER NOT NULL,
            mime                TEXT NOT NULL,
            category            TEXT NOT NULL,
            uploaded_at         TEXT NOT NULL,
            is_encrypted        INTEGER NOT NULL DEFAULT 0,
            owner_credential    TEXT NOT NULL,
            direct_transport_id TEXT,
            direct_message_id   INTEGER
        );

        CREATE TABLE IF NOT EXISTS chunks (
            file_id          TEXT NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
            chunk_index      INTEGER NOT NULL,
            total            INTEGER NOT NULL,
            size_bytes       INTEGER NOT NULL,
            content_hash     TEXT NOT NULL,
            transport_id     TEXT,
            message_id       INTEGER,
            owner_credential TEXT,
            state            TEXT NOT NULL DEFAULT 'pending',
            PRIMARY KEY (file_id, chunk_index)
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_state
            ON chunks(file_id, state);

        CREATE TABLE IF NOT EXISTS upload_states (
            file_id           TEXT PRIMARY KEY REFERENCES files(file_id) ON DELETE CASCADE,
            source_path       TEXT NOT NULL,
            total_bytes       INTEGER NOT NULL,
            total_chunks      INTEGER NOT NULL,
            completed_chunks  INTEGER NOT NULL DEFAULT 0,
            state             TEXT NOT NULL DEFAULT 'active',
            file_content_hash TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS download_states (
            download_id              TEXT PRIMARY KEY,
            file_id                  TEXT NOT NULL,
            destination_path         TEXT NOT NULL,
            scratch_directory        TEXT NOT NULL,
            total_chunks             INTEGER NOT NULL,
            completed_chunks         INTEGER NOT NULL DEFAULT 0,
            state                    TEXT NOT NULL DEFAULT 'active',
            is_encrypted             INTEGER NOT NULL DEFAULT 0,
            envelope_password_needed INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_download_states_file
            ON download_states(file_id);
        ",
    )
}
