//! Shared SQLite connection setup for every store

use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;

/// Apply the PRAGMAs every store connection runs with
///
/// - WAL journal (in-memory databases report `memory` and stay that way)
/// - `synchronous = NORMAL`: durable across process crashes under WAL
/// - busy timeout so a concurrent reader never fails a write outright
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    log::debug!("SQLite journal_mode={}", mode);
    Ok(())
}

/// Open a database file, creating its parent directory if needed
pub fn open_with_pragmas(db_path: impl AsRef<Path>) -> rusqlite::Result<Connection> {
    if let Some(parent) = db_path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create database directory {}: {}", parent.display(), e);
            }
        }
    }

    let conn = Connection::open(db_path)?;
    apply_optimized_pragmas(&conn)?;
    Ok(conn)
}

pub fn open_in_memory_with_pragmas() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_optimized_pragmas(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempdir().unwrap();
        let conn = open_with_pragmas(dir.path().join("nested").join("test.db")).unwrap();
        let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
