use crate::core::broker::DbBroker;
use crate::core::db;
use crate::core::error::MembankError;
use crate::core::store::Store;
use crate::core::time;
use clap::{Parser, Subcommand, ValueEnum};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Decision,
    Progress,
    Blocker,
    Completion,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Decision => "decision",
            DecisionKind::Progress => "progress",
            DecisionKind::Blocker => "blocker",
            DecisionKind::Completion => "completion",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionKind {
    type Err = MembankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "decision" => Ok(DecisionKind::Decision),
            "progress" => Ok(DecisionKind::Progress),
            "blocker" => Ok(DecisionKind::Blocker),
            "completion" => Ok(DecisionKind::Completion),
            other => Err(MembankError::ValidationError(format!(
                "unknown decision kind '{other}' (expected decision, progress, blocker or completion)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionEntry {
    pub seq: i64,
    pub id: String,
    pub ts: u64,
    pub kind: DecisionKind,
    pub content: String,
    pub ref_doc: Option<String>,
    pub actor: String,
}

impl DecisionEntry {
    /// One-line rendering used by the condenser and `decision list`.
    pub fn render_line(&self) -> String {
        let mut line = format!(
            "- [{}] {}: {}",
            time::format_ms_utc(self.ts),
            self.kind,
            self.content.lines().next().unwrap_or_default()
        );
        if let Some(doc) = &self.ref_doc {
            line.push_str(&format!(" ({doc})"));
        }
        line
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<DecisionEntry, rusqlite::Error> {
    let kind: String = row.get(3)?;
    let kind = kind.parse::<DecisionKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DecisionEntry {
        seq: row.get(0)?,
        id: row.get(1)?,
        ts: row.get::<_, i64>(2)?.max(0) as u64,
        kind,
        content: row.get(4)?,
        ref_doc: row.get(5)?,
        actor: row.get(6)?,
    })
}

const SELECT_COLUMNS: &str = "SELECT seq, id, ts_ms, kind, content, ref_doc, actor FROM decisions";

/// Append an entry. Timestamps never go backwards relative to the log.
pub fn record(
    store: &Store,
    kind: DecisionKind,
    content: &str,
    ref_doc: Option<&str>,
    actor: &str,
) -> Result<DecisionEntry, MembankError> {
    if content.trim().is_empty() {
        return Err(MembankError::Invalid(vec![
            "decision content must not be empty".to_string(),
        ]));
    }
    db::initialize_decisions_db(&store.root)?;

    let broker = DbBroker::new(&store.root);
    let db_path = db::decisions_db_path(&store.root);
    let id = format!("DE_{}", Ulid::new());

    let entry = broker.with_conn(&db_path, actor, ref_doc, "decisions.record", |conn| {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let last: Option<i64> = tx
            .query_row("SELECT MAX(ts_ms) FROM decisions", [], |r| r.get(0))
            .optional()?
            .flatten();
        let ts = time::now_epoch_ms().max(last.unwrap_or(0).max(0) as u64);
        tx.execute(
            "INSERT INTO decisions(id, ts_ms, kind, content, ref_doc, actor) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, ts as i64, kind.as_str(), content, ref_doc, actor],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(DecisionEntry {
            seq,
            id: id.clone(),
            ts,
            kind,
            content: content.to_string(),
            ref_doc: ref_doc.map(str::to_string),
            actor: actor.to_string(),
        })
    })?;

    info!(id = %entry.id, kind = %entry.kind, ref_doc = ?entry.ref_doc, "decision recorded");
    Ok(entry)
}

/// Entries in append order, optionally filtered by kind and minimum timestamp.
pub fn query(
    store: &Store,
    kind: Option<DecisionKind>,
    since: Option<u64>,
) -> Result<Vec<DecisionEntry>, MembankError> {
    let db_path = db::decisions_db_path(&store.root);
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "membank", None, "decisions.query", |conn| {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE (?1 IS NULL OR kind = ?1) AND ts_ms >= ?2 ORDER BY seq ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![kind.map(|k| k.as_str()), since.map_or(0, |s| i64::try_from(s).unwrap_or(i64::MAX))],
            row_to_entry,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    })
}

/// The last `n` entries, oldest first.
pub fn recent(store: &Store, n: usize) -> Result<Vec<DecisionEntry>, MembankError> {
    let db_path = db::decisions_db_path(&store.root);
    if n == 0 || !db_path.exists() {
        return Ok(Vec::new());
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "membank", None, "decisions.recent", |conn| {
        let sql = format!("{SELECT_COLUMNS} ORDER BY seq DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![n as i64], row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        out.reverse();
        Ok(out)
    })
}

pub fn count(store: &Store) -> Result<usize, MembankError> {
    let db_path = db::decisions_db_path(&store.root);
    if !db_path.exists() {
        return Ok(0);
    }
    let broker = DbBroker::new(&store.root);
    broker.with_conn(&db_path, "membank", None, "decisions.count", |conn| {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM decisions", [], |r| r.get(0))?;
        Ok(n.max(0) as usize)
    })
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "decision", about = "Append-only log of decisions, progress, blockers and completions.")]
pub struct DecisionCli {
    #[clap(subcommand)]
    pub command: DecisionCommand,
}

#[derive(Subcommand, Debug)]
pub enum DecisionCommand {
    /// Append an entry to the decision log.
    Record {
        #[clap(long, value_enum, default_value = "decision")]
        kind: DecisionKind,
        /// Entry text
        #[clap(long)]
        content: String,
        /// Requirement id this entry refers to
        #[clap(long = "ref")]
        ref_doc: Option<String>,
        #[clap(long, default_value = "membank")]
        actor: String,
    },
    /// List entries in append order.
    List {
        #[clap(long, value_enum)]
        kind: Option<DecisionKind>,
        /// Only entries at or after this epoch-ms stamp
        #[clap(long)]
        since: Option<u64>,
        /// Only the last N entries (ignores the filters)
        #[clap(long)]
        last: Option<usize>,
    },
    /// Show the most recent brokered database operations.
    Audit {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "decision",
        "version": "0.3.0",
        "description": "Append-only decision log with non-decreasing timestamps",
        "commands": [
            { "name": "record", "parameters": ["kind", "content", "ref", "actor"] },
            { "name": "list", "parameters": ["kind", "since", "last"] },
            { "name": "audit", "parameters": ["limit"] }
        ],
        "kinds": ["decision", "progress", "blocker", "completion"],
        "storage": ["decisions.db"]
    })
}

pub fn run_decision_cli(store: &Store, cli: DecisionCli) -> Result<(), MembankError> {
    match cli.command {
        DecisionCommand::Record {
            kind,
            content,
            ref_doc,
            actor,
        } => {
            let entry = record(store, kind, &content, ref_doc.as_deref(), &actor)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        DecisionCommand::List { kind, since, last } => {
            let entries = match last {
                Some(n) => recent(store, n)?,
                None => query(store, kind, since)?,
            };
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        DecisionCommand::Audit { limit } => {
            let events = crate::core::broker::read_audit(&store.root, limit)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
    }
    Ok(())
}
