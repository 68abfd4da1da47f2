//! SQLite schema definitions for membank's decision log.
//!
//! Knowledge records, requirement documents and plans are flat files behind
//! [`crate::core::store::StoreBackend`]; only the append-only decision log
//! lives in SQLite.

pub const DECISIONS_DB_NAME: &str = "decisions.db";

pub const DECISIONS_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS decisions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        ts_ms INTEGER NOT NULL,
        kind TEXT NOT NULL CHECK (kind IN ('decision', 'progress', 'blocker', 'completion')),
        content TEXT NOT NULL,
        ref_doc TEXT,
        actor TEXT NOT NULL
    )
";

pub const DECISIONS_DB_INDEX_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_decisions_kind ON decisions(kind, seq)";

pub const DECISIONS_DB_INDEX_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_decisions_ts ON decisions(ts_ms)";

pub const DECISIONS_DB_NO_UPDATE: &str = "
    CREATE TRIGGER IF NOT EXISTS decisions_no_update
    BEFORE UPDATE ON decisions
    BEGIN
        SELECT RAISE(ABORT, 'decision log is append-only');
    END
";

pub const DECISIONS_DB_NO_DELETE: &str = "
    CREATE TRIGGER IF NOT EXISTS decisions_no_delete
    BEFORE DELETE ON decisions
    BEGIN
        SELECT RAISE(ABORT, 'decision log is append-only');
    END
";

/// Statements applied in order when the decision log is opened.
pub const DECISIONS_DB_STATEMENTS: &[&str] = &[
    DECISIONS_DB_SCHEMA,
    DECISIONS_DB_INDEX_KIND,
    DECISIONS_DB_INDEX_TS,
    DECISIONS_DB_NO_UPDATE,
    DECISIONS_DB_NO_DELETE,
];
