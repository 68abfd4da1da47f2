use crate::core::error::MembankError;
use crate::core::store::Store;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

pub const KNOWLEDGE_DIR: &str = "knowledge";

/// The fixed set of named knowledge records, in condenser order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RecordName {
    Overview,
    ActiveFocus,
    Patterns,
    Environment,
    Progress,
}

impl RecordName {
    pub const ALL: [RecordName; 5] = [
        RecordName::Overview,
        RecordName::ActiveFocus,
        RecordName::Patterns,
        RecordName::Environment,
        RecordName::Progress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordName::Overview => "overview",
            RecordName::ActiveFocus => "active-focus",
            RecordName::Patterns => "patterns",
            RecordName::Environment => "environment",
            RecordName::Progress => "progress",
        }
    }

    pub fn rel_path(&self) -> String {
        format!("{KNOWLEDGE_DIR}/{}.md", self.as_str())
    }
}

impl fmt::Display for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordName {
    type Err = MembankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordName::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| {
                MembankError::ValidationError(format!(
                    "unknown knowledge record '{s}' (expected one of: {})",
                    RecordName::ALL.map(|r| r.as_str()).join(", ")
                ))
            })
    }
}

pub fn load_record(store: &Store, name: RecordName) -> Result<String, MembankError> {
    debug!(record = %name, "knowledge.load");
    store
        .backend()
        .load(&name.rel_path())?
        .ok_or_else(|| MembankError::NotFound(format!("knowledge record '{name}'")))
}

/// Overwrite a record. Readers observe either the old or the new body.
pub fn save_record(store: &Store, name: RecordName, content: &str) -> Result<(), MembankError> {
    store.backend().save(&name.rel_path(), content)?;
    info!(record = %name, bytes = content.len(), "knowledge record saved");
    Ok(())
}

/// Append to a record, creating it when absent. Concurrent appends never lose
/// each other's text.
pub fn append_record(store: &Store, name: RecordName, content: &str) -> Result<(), MembankError> {
    store.backend().update(&name.rel_path(), &mut |current| {
        let mut next = current.unwrap_or_default().to_string();
        if !next.is_empty() && !next.ends_with('\n') {
            next.push('\n');
        }
        next.push_str(content);
        if !next.ends_with('\n') {
            next.push('\n');
        }
        Ok(next)
    })?;
    info!(record = %name, bytes = content.len(), "knowledge record appended");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordStatus {
    pub name: RecordName,
    pub present: bool,
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Presence of every record; unreadable records are reported, not raised.
pub fn record_statuses(store: &Store) -> Vec<RecordStatus> {
    RecordName::ALL
        .into_iter()
        .map(|name| match store.backend().load(&name.rel_path()) {
            Ok(Some(body)) => RecordStatus {
                name,
                present: true,
                bytes: body.len(),
                error: None,
            },
            Ok(None) => RecordStatus {
                name,
                present: false,
                bytes: 0,
                error: None,
            },
            Err(e) => RecordStatus {
                name,
                present: true,
                bytes: 0,
                error: Some(e.to_string()),
            },
        })
        .collect()
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "knowledge", about = "Read and write the named project knowledge records.")]
pub struct KnowledgeCli {
    #[clap(subcommand)]
    pub command: KnowledgeCommand,
}

#[derive(Subcommand, Debug)]
pub enum KnowledgeCommand {
    /// Print a record, or the status of every record when no name is given.
    Show {
        #[clap(value_enum)]
        name: Option<RecordName>,
    },
    /// Overwrite a record.
    Set {
        #[clap(value_enum)]
        name: RecordName,
        #[clap(long)]
        content: String,
    },
    /// Append text to a record.
    Append {
        #[clap(value_enum)]
        name: RecordName,
        #[clap(long)]
        content: String,
    },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "knowledge",
        "version": "0.3.0",
        "description": "Named free-text project knowledge records",
        "records": RecordName::ALL.map(|r| r.as_str()),
        "commands": [
            { "name": "show", "parameters": ["name"] },
            { "name": "set", "parameters": ["name", "content"] },
            { "name": "append", "parameters": ["name", "content"] }
        ],
        "storage": ["knowledge/<name>.md"]
    })
}

pub fn run_knowledge_cli(store: &Store, cli: KnowledgeCli) -> Result<(), MembankError> {
    match cli.command {
        KnowledgeCommand::Show { name: Some(name) } => {
            print!("{}", load_record(store, name)?);
        }
        KnowledgeCommand::Show { name: None } => {
            println!("{}", serde_json::to_string_pretty(&record_statuses(store))?);
        }
        KnowledgeCommand::Set { name, content } => {
            save_record(store, name, &content)?;
            println!("Saved knowledge record '{name}'");
        }
        KnowledgeCommand::Append { name, content } => {
            append_record(store, name, &content)?;
            println!("Appended to knowledge record '{name}'");
        }
    }
    Ok(())
}
