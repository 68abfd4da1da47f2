use crate::core::broker::DbBroker;
use crate::core::error::MembankError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};

pub fn db_connect(db_path: &str) -> Result<Connection, MembankError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA foreign_keys=ON;", [])?;
    Ok(conn)
}

pub fn decisions_db_path(root: &Path) -> PathBuf {
    root.join(schemas::DECISIONS_DB_NAME)
}

/// Create the decision log with its append-only triggers. Idempotent.
pub fn initialize_decisions_db(root: &Path) -> Result<(), MembankError> {
    fs::create_dir_all(root).map_err(MembankError::IoError)?;
    let db_path = decisions_db_path(root);

    let broker = DbBroker::new(root);
    broker.with_conn(&db_path, "membank", None, "decisions.init", |conn| {
        for stmt in schemas::DECISIONS_DB_STATEMENTS {
            conn.execute(stmt, [])?;
        }
        Ok(())
    })
}
