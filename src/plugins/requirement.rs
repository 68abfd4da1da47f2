//! Requirement documents: data model, markdown codec and versioned persistence.
//!
//! A document is stored as `requirements/<id>.md`. Every persisted change goes
//! through [`save_requirement`], which compares the caller's expected version
//! against the stored one inside the backend's per-path critical section.

use crate::core::error::MembankError;
use crate::core::store::Store;
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

pub const REQUIREMENTS_DIR: &str = "requirements";
pub const MAX_SLUG_LEN: usize = 50;

const TITLE_PREFIX: &str = "# Requirement: ";
const CHECKLIST_HEADER: &str = "## Approval Checklist";

static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,49}$").unwrap());
static META_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*(Id|Status|Version|Created|Updated)\*\*:\s*(.*)$").unwrap());
static CHECK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^- \[( |x|X)\] (.+)$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Draft,
    Review,
    Approved,
    InProgress,
    Completed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Draft,
        Status::Review,
        Status::Approved,
        Status::InProgress,
        Status::Completed,
    ];

    /// Label used in the document text.
    pub fn label(&self) -> &'static str {
        match self {
            Status::Draft => "Draft",
            Status::Review => "Review",
            Status::Approved => "Approved",
            Status::InProgress => "In Progress",
            Status::Completed => "Completed",
        }
    }

    /// Sections and gates may only be edited before approval.
    pub fn is_editable(&self) -> bool {
        matches!(self, Status::Draft | Status::Review)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Status {
    type Err = MembankError;

    /// Accepts the document label as well as `in-progress`/`inprogress` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        Status::ALL
            .into_iter()
            .find(|st| {
                st.label()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect::<String>()
                    .eq_ignore_ascii_case(&normalized)
            })
            .ok_or_else(|| MembankError::ValidationError(format!("unknown status '{s}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SectionKey {
    Problem,
    Goal,
    Approach,
    FunctionalRequirements,
    NonFunctionalRequirements,
    SuccessMetrics,
    ScopeIn,
    ScopeOut,
    Constraints,
}

impl SectionKey {
    pub const ALL: [SectionKey; 9] = [
        SectionKey::Problem,
        SectionKey::Goal,
        SectionKey::Approach,
        SectionKey::FunctionalRequirements,
        SectionKey::NonFunctionalRequirements,
        SectionKey::SuccessMetrics,
        SectionKey::ScopeIn,
        SectionKey::ScopeOut,
        SectionKey::Constraints,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            SectionKey::Problem => "problem",
            SectionKey::Goal => "goal",
            SectionKey::Approach => "approach",
            SectionKey::FunctionalRequirements => "functional-requirements",
            SectionKey::NonFunctionalRequirements => "non-functional-requirements",
            SectionKey::SuccessMetrics => "success-metrics",
            SectionKey::ScopeIn => "scope-in",
            SectionKey::ScopeOut => "scope-out",
            SectionKey::Constraints => "constraints",
        }
    }

    pub fn heading(&self) -> &'static str {
        match self {
            SectionKey::Problem => "Problem Statement",
            SectionKey::Goal => "Goal",
            SectionKey::Approach => "Solution Approach",
            SectionKey::FunctionalRequirements => "Functional Requirements",
            SectionKey::NonFunctionalRequirements => "Non-Functional Requirements",
            SectionKey::SuccessMetrics => "Success Metrics",
            SectionKey::ScopeIn => "In Scope",
            SectionKey::ScopeOut => "Out of Scope",
            SectionKey::Constraints => "Constraints",
        }
    }

    fn header_line(&self) -> String {
        format!("## {}", self.heading())
    }

    fn from_header_line(line: &str) -> Option<SectionKey> {
        let heading = line.strip_prefix("## ")?;
        SectionKey::ALL.into_iter().find(|k| k.heading() == heading)
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for SectionKey {
    type Err = MembankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectionKey::ALL
            .into_iter()
            .find(|k| k.key() == s)
            .ok_or_else(|| {
                MembankError::ValidationError(format!(
                    "unknown section '{s}' (expected one of: {})",
                    SectionKey::ALL.map(|k| k.key()).join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Gate {
    ProblemApproved,
    RequirementsApproved,
    ApproachApproved,
    ReadyForImplementation,
}

impl Gate {
    pub const ALL: [Gate; 4] = [
        Gate::ProblemApproved,
        Gate::RequirementsApproved,
        Gate::ApproachApproved,
        Gate::ReadyForImplementation,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Gate::ProblemApproved => "problem-approved",
            Gate::RequirementsApproved => "requirements-approved",
            Gate::ApproachApproved => "approach-approved",
            Gate::ReadyForImplementation => "ready-for-implementation",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Gate::ProblemApproved => "Problem Statement Approved",
            Gate::RequirementsApproved => "Requirements Approved",
            Gate::ApproachApproved => "Solution Approach Approved",
            Gate::ReadyForImplementation => "Ready for Implementation",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Gate {
    type Err = MembankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Gate::ALL
            .into_iter()
            .find(|g| g.key() == s)
            .ok_or_else(|| {
                MembankError::ValidationError(format!(
                    "unknown gate '{s}' (expected one of: {})",
                    Gate::ALL.map(|g| g.key()).join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checklist {
    pub problem_approved: bool,
    pub requirements_approved: bool,
    pub approach_approved: bool,
    pub ready_for_implementation: bool,
}

impl Checklist {
    pub fn get(&self, gate: Gate) -> bool {
        match gate {
            Gate::ProblemApproved => self.problem_approved,
            Gate::RequirementsApproved => self.requirements_approved,
            Gate::ApproachApproved => self.approach_approved,
            Gate::ReadyForImplementation => self.ready_for_implementation,
        }
    }

    pub fn set(&mut self, gate: Gate, value: bool) {
        match gate {
            Gate::ProblemApproved => self.problem_approved = value,
            Gate::RequirementsApproved => self.requirements_approved = value,
            Gate::ApproachApproved => self.approach_approved = value,
            Gate::ReadyForImplementation => self.ready_for_implementation = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementDocument {
    pub id: String,
    pub title: String,
    pub status: Status,
    /// Present sections only; bodies are normalised and never blank.
    pub sections: BTreeMap<SectionKey, String>,
    pub checklist: Checklist,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl RequirementDocument {
    /// Fresh Draft with no sections. Version 0 means "not yet persisted".
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.trim().to_string(),
            status: Status::Draft,
            sections: BTreeMap::new(),
            checklist: Checklist::default(),
            version: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub fn section(&self, key: SectionKey) -> Option<&str> {
        self.sections.get(&key).map(String::as_str)
    }

    pub fn has_section(&self, key: SectionKey) -> bool {
        self.sections.contains_key(&key)
    }

    /// Set or clear a section body. A blank body removes the section.
    pub fn put_section(&mut self, key: SectionKey, body: &str) -> Result<(), MembankError> {
        if let Some(line) = body.lines().find(|l| is_reserved_line(l.trim_end())) {
            return Err(MembankError::Invalid(vec![format!(
                "section '{key}' body contains reserved header line '{}'",
                line.trim_end()
            )]));
        }
        let normalized = normalize_body(body);
        if normalized.is_empty() {
            self.sections.remove(&key);
        } else {
            self.sections.insert(key, normalized);
        }
        Ok(())
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{TITLE_PREFIX}{}\n\n", self.title));
        out.push_str(&format!("**Id**: {}\n", self.id));
        out.push_str(&format!("**Status**: {}\n", self.status.label()));
        out.push_str(&format!("**Version**: {}\n", self.version));
        out.push_str(&format!("**Created**: {}\n", self.created_at));
        out.push_str(&format!("**Updated**: {}\n\n", self.updated_at));

        for key in SectionKey::ALL {
            out.push_str(&key.header_line());
            out.push('\n');
            if let Some(body) = self.section(key) {
                out.push_str(body);
                out.push('\n');
            }
            out.push('\n');
        }

        out.push_str(CHECKLIST_HEADER);
        out.push('\n');
        for gate in Gate::ALL {
            let mark = if self.checklist.get(gate) { "x" } else { " " };
            out.push_str(&format!("- [{mark}] {}\n", gate.label()));
        }
        out
    }

    /// Parse the document text. `what` names the source in `Corrupted` errors.
    pub fn from_markdown(text: &str, what: &str) -> Result<Self, MembankError> {
        let corrupt = |reason: String| MembankError::corrupted(what, reason);

        let mut lines = text.lines();
        let title = lines
            .next()
            .and_then(|l| l.strip_prefix(TITLE_PREFIX))
            .ok_or_else(|| corrupt(format!("first line must start with '{TITLE_PREFIX}'")))?
            .trim()
            .to_string();

        let mut meta: BTreeMap<String, String> = BTreeMap::new();
        let mut sections: BTreeMap<SectionKey, String> = BTreeMap::new();
        let mut checklist = Checklist::default();
        let mut seen_checklist = false;

        enum Block {
            Meta,
            Section(SectionKey, Vec<String>),
            Checklist,
        }
        let mut block = Block::Meta;

        let flush = |block: Block, sections: &mut BTreeMap<SectionKey, String>| -> Result<(), MembankError> {
            if let Block::Section(key, body) = block {
                if sections.contains_key(&key) {
                    return Err(MembankError::corrupted(what, format!("duplicate section '{key}'")));
                }
                let normalized = normalize_body(&body.join("\n"));
                if !normalized.is_empty() {
                    sections.insert(key, normalized);
                }
            }
            Ok(())
        };

        for raw in lines {
            let line = raw.trim_end();
            if let Some(key) = SectionKey::from_header_line(line) {
                if seen_checklist {
                    return Err(corrupt(format!("section '{key}' after approval checklist")));
                }
                let done = std::mem::replace(&mut block, Block::Section(key, Vec::new()));
                flush(done, &mut sections)?;
                continue;
            }
            if line == CHECKLIST_HEADER {
                if seen_checklist {
                    return Err(corrupt("duplicate approval checklist".to_string()));
                }
                seen_checklist = true;
                let done = std::mem::replace(&mut block, Block::Checklist);
                flush(done, &mut sections)?;
                continue;
            }
            match &mut block {
                Block::Meta => {
                    if line.is_empty() {
                        continue;
                    }
                    let caps = META_RE
                        .captures(line)
                        .ok_or_else(|| corrupt(format!("unexpected header line '{line}'")))?;
                    meta.insert(caps[1].to_string(), caps[2].trim().to_string());
                }
                Block::Section(_, body) => body.push(raw.to_string()),
                Block::Checklist => {
                    if line.is_empty() {
                        continue;
                    }
                    let caps = CHECK_RE
                        .captures(line)
                        .ok_or_else(|| corrupt(format!("unexpected checklist line '{line}'")))?;
                    let gate = Gate::ALL
                        .into_iter()
                        .find(|g| g.label() == caps[2].trim())
                        .ok_or_else(|| corrupt(format!("unknown checklist item '{}'", &caps[2])))?;
                    checklist.set(gate, &caps[1] != " ");
                }
            }
        }
        flush(block, &mut sections)?;

        let field = |name: &str| -> Result<&String, MembankError> {
            meta.get(name)
                .ok_or_else(|| MembankError::corrupted(what, format!("missing **{name}** field")))
        };
        let number = |name: &str| -> Result<u64, MembankError> {
            field(name)?.parse::<u64>().map_err(|e| {
                MembankError::corrupted(what, format!("**{name}** is not a number: {e}"))
            })
        };

        let id = field("Id")?.clone();
        if !is_valid_slug(&id) {
            return Err(corrupt(format!("invalid id '{id}'")));
        }
        let status = field("Status")?
            .parse::<Status>()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(Self {
            id,
            title,
            status,
            sections,
            checklist,
            version: number("Version")?,
            created_at: number("Created")?,
            updated_at: number("Updated")?,
        })
    }
}

fn is_reserved_line(line: &str) -> bool {
    line == CHECKLIST_HEADER || SectionKey::from_header_line(line).is_some()
}

/// Drop leading blank lines and trailing whitespace.
fn normalize_body(body: &str) -> String {
    let lines: Vec<&str> = body
        .lines()
        .skip_while(|l| l.trim().is_empty())
        .collect();
    lines.join("\n").trim_end().to_string()
}

pub fn is_valid_slug(id: &str) -> bool {
    SLUG_RE.is_match(id)
}

/// Lowercase, keep ASCII alphanumerics, collapse whitespace runs to `-`,
/// cap at [`MAX_SLUG_LEN`].
pub fn slugify(title: &str) -> String {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    let mut slug = cleaned.split_whitespace().collect::<Vec<_>>().join("-");
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "requirement".to_string()
    } else {
        slug
    }
}

/// `base`, then `base-1`, `base-2`… each capped at [`MAX_SLUG_LEN`].
pub fn slug_candidate(base: &str, attempt: usize) -> String {
    if attempt == 0 {
        return base.to_string();
    }
    let suffix = format!("-{attempt}");
    let keep = MAX_SLUG_LEN.saturating_sub(suffix.len());
    let stem = base[..base.len().min(keep)].trim_end_matches('-');
    format!("{stem}{suffix}")
}

pub fn rel_path(id: &str) -> String {
    format!("{REQUIREMENTS_DIR}/{id}.md")
}

fn check_id(id: &str) -> Result<(), MembankError> {
    if is_valid_slug(id) {
        Ok(())
    } else {
        Err(MembankError::ValidationError(format!(
            "invalid requirement id '{id}' (expected [a-z0-9-]+, at most {MAX_SLUG_LEN} chars)"
        )))
    }
}

pub fn load_requirement(store: &Store, id: &str) -> Result<RequirementDocument, MembankError> {
    check_id(id)?;
    debug!(id, "requirement.load");
    let what = format!("requirement '{id}'");
    let text = store
        .backend()
        .load(&rel_path(id))?
        .ok_or_else(|| MembankError::NotFound(what.clone()))?;
    let doc = RequirementDocument::from_markdown(&text, &what)?;
    if doc.id != id {
        return Err(MembankError::corrupted(
            what,
            format!("stored id '{}' does not match file name", doc.id),
        ));
    }
    Ok(doc)
}

/// Persist `doc` if the stored version still equals `expected_version`
/// (0 = must not exist yet). Returns the document as written, carrying
/// `expected_version + 1`.
pub fn save_requirement(
    store: &Store,
    doc: &RequirementDocument,
    expected_version: u64,
) -> Result<RequirementDocument, MembankError> {
    check_id(&doc.id)?;
    if doc.title.is_empty() || doc.title.contains('\n') {
        return Err(MembankError::Invalid(vec![
            "title must be a single non-empty line".to_string(),
        ]));
    }

    let now = time::now_epoch_ms();
    let mut next = doc.clone();
    next.version = expected_version + 1;
    next.updated_at = now.max(doc.updated_at);
    if expected_version == 0 {
        next.created_at = next.updated_at;
    }
    let rendered = next.to_markdown();
    let what = format!("requirement '{}'", doc.id);

    store.backend().update(&rel_path(&doc.id), &mut |current| {
        let actual = match current {
            None => 0,
            Some(text) => RequirementDocument::from_markdown(text, &what)?.version,
        };
        if actual != expected_version {
            return Err(MembankError::Conflict {
                id: next.id.clone(),
                expected: expected_version,
                actual,
            });
        }
        Ok(rendered.clone())
    })?;

    info!(id = %next.id, status = %next.status, version = next.version, "requirement saved");
    Ok(next)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSummary {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub version: u64,
    pub updated_at: u64,
}

impl From<&RequirementDocument> for RequirementSummary {
    fn from(doc: &RequirementDocument) -> Self {
        Self {
            id: doc.id.clone(),
            title: doc.title.clone(),
            status: doc.status,
            version: doc.version,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Omitted {
    pub id: String,
    pub reason: String,
}

/// Every readable document, most recently updated first (ties by id), plus
/// the documents that could not be read.
pub fn load_all(store: &Store) -> Result<(Vec<RequirementDocument>, Vec<Omitted>), MembankError> {
    let mut docs = Vec::new();
    let mut omitted = Vec::new();
    for id in store.backend().list(REQUIREMENTS_DIR, "md")? {
        match load_requirement(store, &id) {
            Ok(doc) => docs.push(doc),
            Err(e) => {
                warn!(id = %id, error = %e, "skipping unreadable requirement");
                omitted.push(Omitted {
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }
    docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    Ok((docs, omitted))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementListing {
    pub requirements: Vec<RequirementSummary>,
    pub omitted: Vec<Omitted>,
}

pub fn list_requirements(store: &Store) -> Result<RequirementListing, MembankError> {
    let (docs, omitted) = load_all(store)?;
    Ok(RequirementListing {
        requirements: docs.iter().map(RequirementSummary::from).collect(),
        omitted,
    })
}
