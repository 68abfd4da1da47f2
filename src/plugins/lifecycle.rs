//! Requirement lifecycle: the transition table, its guards, and the
//! operations that move a document through it.
//!
//! | From                 | To          | Guard                                   |
//! |----------------------|-------------|-----------------------------------------|
//! | Draft                | Review      | every section present                   |
//! | Review               | Approved    | every gate checked, every section present |
//! | Approved             | In Progress | `start_implementation`                  |
//! | Approved/In Progress | Review      | `reopen`; clears the ready gate         |
//! | In Progress          | Completed   | `complete`                              |
//! | Completed            | Review      | only with `lifecycle.allow_completed_reopen` |

use crate::core::config::LifecycleConfig;
use crate::core::error::MembankError;
use crate::core::store::Store;
use crate::plugins::decide::{self, DecisionKind};
use crate::plugins::requirement::{
    self, Gate, RequirementDocument, SectionKey, Status,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const ACTOR: &str = "membank";
const MAX_SLUG_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Submit,
    Approve,
    Start,
    Reopen,
    Complete,
}

/// Table lookup. `None` means the transition does not exist.
pub fn edge(from: Status, to: Status, config: &LifecycleConfig) -> Option<Edge> {
    match (from, to) {
        (Status::Draft, Status::Review) => Some(Edge::Submit),
        (Status::Review, Status::Approved) => Some(Edge::Approve),
        (Status::Approved, Status::InProgress) => Some(Edge::Start),
        (Status::Approved | Status::InProgress, Status::Review) => Some(Edge::Reopen),
        (Status::Completed, Status::Review) if config.allow_completed_reopen => Some(Edge::Reopen),
        (Status::InProgress, Status::Completed) => Some(Edge::Complete),
        _ => None,
    }
}

/// Statuses reachable from `from` in one step.
pub fn targets(from: Status, config: &LifecycleConfig) -> Vec<Status> {
    Status::ALL
        .into_iter()
        .filter(|to| edge(from, *to, config).is_some())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub missing_sections: Vec<SectionKey>,
    pub unmet_gates: Vec<Gate>,
}

impl ValidationReport {
    pub fn is_empty(&self) -> bool {
        self.missing_sections.is_empty() && self.unmet_gates.is_empty()
    }

    pub fn unmet(&self) -> Vec<String> {
        self.missing_sections
            .iter()
            .map(|s| s.key().to_string())
            .chain(self.unmet_gates.iter().map(|g| g.key().to_string()))
            .collect()
    }
}

pub fn missing_sections(doc: &RequirementDocument) -> Vec<SectionKey> {
    SectionKey::ALL
        .into_iter()
        .filter(|k| !doc.has_section(*k))
        .collect()
}

pub fn missing_gates(doc: &RequirementDocument) -> Vec<Gate> {
    Gate::ALL
        .into_iter()
        .filter(|g| !doc.checklist.get(*g))
        .collect()
}

pub fn validate(doc: &RequirementDocument) -> ValidationReport {
    ValidationReport {
        missing_sections: missing_sections(doc),
        unmet_gates: missing_gates(doc),
    }
}

fn guard(doc: &RequirementDocument, edge: Edge) -> Vec<String> {
    match edge {
        Edge::Submit => missing_sections(doc)
            .iter()
            .map(|s| s.key().to_string())
            .collect(),
        Edge::Approve | Edge::Start => validate(doc).unmet(),
        Edge::Reopen | Edge::Complete => Vec::new(),
    }
}

fn violation(doc: &RequirementDocument, to: Status, unmet: Vec<String>) -> MembankError {
    MembankError::GateViolation {
        id: doc.id.clone(),
        from: doc.status.label().to_string(),
        to: to.label().to_string(),
        unmet,
    }
}

fn require_editable(doc: &RequirementDocument) -> Result<(), MembankError> {
    if doc.status.is_editable() {
        Ok(())
    } else {
        Err(violation(
            doc,
            doc.status,
            vec![format!(
                "document is {}; sections and gates are editable only in Draft or Review",
                doc.status
            )],
        ))
    }
}

/// Create a Draft from a title; the id is the slug, suffixed `-1`, `-2`… on collision.
pub fn create_requirement(store: &Store, title: &str) -> Result<RequirementDocument, MembankError> {
    let title = title.trim();
    if title.is_empty() || title.contains('\n') {
        return Err(MembankError::Invalid(vec![
            "title must be a single non-empty line".to_string(),
        ]));
    }
    let base = requirement::slugify(title);
    for attempt in 0..MAX_SLUG_ATTEMPTS {
        let id = requirement::slug_candidate(&base, attempt);
        let draft = RequirementDocument::new(&id, title);
        match requirement::save_requirement(store, &draft, 0) {
            Ok(doc) => {
                info!(id = %doc.id, "requirement created");
                return Ok(doc);
            }
            Err(MembankError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(MembankError::Invalid(vec![format!(
        "no free id for '{base}' after {MAX_SLUG_ATTEMPTS} attempts"
    )]))
}

pub fn set_section(
    store: &Store,
    doc: &RequirementDocument,
    key: SectionKey,
    body: &str,
) -> Result<RequirementDocument, MembankError> {
    require_editable(doc)?;
    let mut next = doc.clone();
    next.put_section(key, body)?;
    requirement::save_requirement(store, &next, doc.version)
}

/// Check a gate. Already-checked gates are left alone and nothing is written.
pub fn approve_gate(
    store: &Store,
    doc: &RequirementDocument,
    gate: Gate,
) -> Result<RequirementDocument, MembankError> {
    require_editable(doc)?;
    if doc.checklist.get(gate) {
        return Ok(doc.clone());
    }
    let mut next = doc.clone();
    next.checklist.set(gate, true);
    requirement::save_requirement(store, &next, doc.version)
}

/// Apply the table edge from `doc.status` to `target`.
pub fn advance(
    store: &Store,
    doc: &RequirementDocument,
    target: Status,
) -> Result<RequirementDocument, MembankError> {
    transition(store, doc, target, None)
}

fn transition(
    store: &Store,
    doc: &RequirementDocument,
    target: Status,
    note: Option<&str>,
) -> Result<RequirementDocument, MembankError> {
    let Some(edge) = edge(doc.status, target, &store.config.lifecycle) else {
        return Err(violation(
            doc,
            target,
            vec![format!("no transition from {} to {}", doc.status, target)],
        ));
    };
    let unmet = guard(doc, edge);
    if !unmet.is_empty() {
        return Err(violation(doc, target, unmet));
    }

    let mut next = doc.clone();
    next.status = target;
    if edge == Edge::Reopen {
        next.checklist.set(Gate::ReadyForImplementation, false);
    }
    let saved = requirement::save_requirement(store, &next, doc.version)?;
    info!(id = %saved.id, from = %doc.status, to = %saved.status, "requirement advanced");

    let entry = match edge {
        Edge::Start => Some((
            DecisionKind::Progress,
            format!("Started implementation of '{}'", saved.title),
        )),
        Edge::Complete => Some((
            DecisionKind::Completion,
            format!("Completed '{}'", saved.title),
        )),
        Edge::Reopen => Some((
            DecisionKind::Decision,
            match note {
                Some(reason) if !reason.trim().is_empty() => {
                    format!("Reopened '{}' for review: {}", saved.title, reason.trim())
                }
                _ => format!("Reopened '{}' for review", saved.title),
            },
        )),
        Edge::Submit | Edge::Approve => None,
    };
    // Already persisted: a log append failure is reported, not returned.
    if let Some((kind, content)) = entry {
        if let Err(e) = decide::record(store, kind, &content, Some(&saved.id), ACTOR) {
            warn!(id = %saved.id, to = %saved.status, error = %e, "decision log append failed after transition");
        }
    }
    Ok(saved)
}

/// Succeeds iff the document is Approved and fully validated.
pub fn start_implementation(
    store: &Store,
    doc: &RequirementDocument,
) -> Result<RequirementDocument, MembankError> {
    transition(store, doc, Status::InProgress, None)
}

pub fn reopen(
    store: &Store,
    doc: &RequirementDocument,
    reason: &str,
) -> Result<RequirementDocument, MembankError> {
    transition(store, doc, Status::Review, Some(reason))
}

pub fn complete(
    store: &Store,
    doc: &RequirementDocument,
) -> Result<RequirementDocument, MembankError> {
    transition(store, doc, Status::Completed, None)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "req", about = "Create requirement documents and move them through review and implementation.")]
pub struct RequirementCli {
    #[clap(subcommand)]
    pub command: RequirementCommand,
}

#[derive(Subcommand, Debug)]
pub enum RequirementCommand {
    /// Create a Draft requirement from a title.
    New {
        #[clap(long)]
        title: String,
    },
    /// List requirements, most recently updated first.
    List {
        #[clap(long)]
        json: bool,
    },
    /// Print a requirement document.
    Show {
        id: String,
        #[clap(long)]
        json: bool,
    },
    /// Report missing sections and unchecked gates.
    Validate {
        id: String,
        #[clap(long)]
        json: bool,
    },
    /// Set a section body (Draft/Review only).
    Set {
        id: String,
        /// Section key, e.g. problem, goal, scope-out
        #[clap(long)]
        section: String,
        #[clap(long)]
        body: String,
    },
    /// Check an approval gate (Draft/Review only).
    Approve {
        id: String,
        /// Gate key, e.g. problem-approved
        #[clap(long)]
        gate: String,
    },
    /// Move to a target status along the transition table.
    Advance {
        id: String,
        /// draft, review, approved, in-progress, completed
        #[clap(long)]
        to: String,
    },
    /// Approved -> In Progress.
    Start { id: String },
    /// Back to Review; clears the ready gate.
    Reopen {
        id: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// In Progress -> Completed.
    Complete { id: String },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "req",
        "version": "0.3.0",
        "description": "Gated requirement lifecycle",
        "statuses": Status::ALL.map(|s| s.label()),
        "sections": SectionKey::ALL.map(|k| k.key()),
        "gates": Gate::ALL.map(|g| g.key()),
        "commands": [
            { "name": "new", "parameters": ["title"] },
            { "name": "list", "parameters": ["json"] },
            { "name": "show", "parameters": ["id", "json"] },
            { "name": "validate", "parameters": ["id", "json"] },
            { "name": "set", "parameters": ["id", "section", "body"] },
            { "name": "approve", "parameters": ["id", "gate"] },
            { "name": "advance", "parameters": ["id", "to"] },
            { "name": "start", "parameters": ["id"] },
            { "name": "reopen", "parameters": ["id", "reason"] },
            { "name": "complete", "parameters": ["id"] }
        ],
        "storage": ["requirements/<id>.md"]
    })
}

fn status_colored(status: Status) -> colored::ColoredString {
    match status {
        Status::Draft => status.label().bright_black(),
        Status::Review => status.label().yellow(),
        Status::Approved => status.label().green(),
        Status::InProgress => status.label().bright_cyan(),
        Status::Completed => status.label().blue(),
    }
}

fn print_listing(listing: &requirement::RequirementListing) {
    if listing.requirements.is_empty() {
        println!("{}", "No requirements yet. Create one with `membank req new --title ...`".dimmed());
    }
    for req in &listing.requirements {
        println!(
            "{:<12} {}  {} {}",
            status_colored(req.status),
            req.id.bold(),
            req.title,
            format!("(v{})", req.version).dimmed()
        );
    }
    for omitted in &listing.omitted {
        println!("{} {}: {}", "omitted".red().bold(), omitted.id, omitted.reason);
    }
}

fn print_report(doc: &RequirementDocument, report: &ValidationReport) {
    println!("{} [{}]", doc.id.bold(), status_colored(doc.status));
    for key in SectionKey::ALL {
        let mark = if report.missing_sections.contains(&key) {
            "✗".red()
        } else {
            "✓".green()
        };
        println!("  {mark} {}", key.heading());
    }
    for gate in Gate::ALL {
        let mark = if report.unmet_gates.contains(&gate) {
            "☐".yellow()
        } else {
            "☑".green()
        };
        println!("  {mark} {}", gate.label());
    }
    if report.is_empty() {
        println!("{}", "Ready for implementation".green().bold());
    }
}

pub fn run_requirement_cli(store: &Store, cli: RequirementCli) -> Result<(), MembankError> {
    match cli.command {
        RequirementCommand::New { title } => {
            let doc = create_requirement(store, &title)?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        RequirementCommand::List { json } => {
            let listing = requirement::list_requirements(store)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                print_listing(&listing);
            }
        }
        RequirementCommand::Show { id, json } => {
            let doc = requirement::load_requirement(store, &id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print!("{}", doc.to_markdown());
            }
        }
        RequirementCommand::Validate { id, json } => {
            let doc = requirement::load_requirement(store, &id)?;
            let report = validate(&doc);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&doc, &report);
            }
        }
        RequirementCommand::Set { id, section, body } => {
            let doc = requirement::load_requirement(store, &id)?;
            let saved = set_section(store, &doc, section.parse()?, &body)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        RequirementCommand::Approve { id, gate } => {
            let doc = requirement::load_requirement(store, &id)?;
            let saved = approve_gate(store, &doc, gate.parse()?)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        RequirementCommand::Advance { id, to } => {
            let doc = requirement::load_requirement(store, &id)?;
            let saved = advance(store, &doc, to.parse()?)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        RequirementCommand::Start { id } => {
            let doc = requirement::load_requirement(store, &id)?;
            let saved = start_implementation(store, &doc)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        RequirementCommand::Reopen { id, reason } => {
            let doc = requirement::load_requirement(store, &id)?;
            let saved = reopen(store, &doc, &reason)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
        RequirementCommand::Complete { id } => {
            let doc = requirement::load_requirement(store, &id)?;
            let saved = complete(store, &doc)?;
            println!("{}", serde_json::to_string_pretty(&saved)?);
        }
    }
    Ok(())
}
