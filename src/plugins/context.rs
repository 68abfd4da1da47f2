//! Context condenser: a bounded, deterministic summary of the store for the
//! start of a session.
//!
//! Sections are emitted in fixed priority order. When the output is over
//! budget, lines are removed from the end of the lowest-priority section
//! first. Nothing time- or environment-dependent reaches the output.

use crate::core::config::{BudgetUnit, CondenserConfig};
use crate::core::error::MembankError;
use crate::core::store::Store;
use crate::plugins::decide;
use crate::plugins::knowledge::{self, RecordName};
use crate::plugins::requirement::{self, RequirementDocument, SectionKey, Status};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use tiktoken_rs::CoreBPE;
use tracing::{debug, warn};

pub const BOOTSTRAP_MARKER: &str = "No knowledge store found";

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "cl100k tokenizer unavailable, measuring in bytes");
        None
    }
});

const FOCUS_KEYWORDS: &[(&str, &[&str])] = &[
    ("api", &["api", "endpoint", "route", "service", "rest"]),
    ("testing", &["test", "coverage", "tdd", "quality"]),
    ("features", &["feature", "functionality", "requirement", "user"]),
    ("performance", &["performance", "optimization", "benchmark", "latency"]),
    ("deployment", &["deploy", "docker", "production", "infrastructure"]),
];

/// Keyword set of a recognised focus tag.
pub fn focus_keywords(tag: &str) -> Option<&'static [&'static str]> {
    let tag = tag.trim().to_lowercase();
    FOCUS_KEYWORDS
        .iter()
        .find(|(name, _)| *name == tag)
        .map(|(_, words)| *words)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    Small,
    #[default]
    Medium,
    Large,
}

impl Scale {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scale::Small => "small",
            Scale::Medium => "medium",
            Scale::Large => "large",
        }
    }
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scale {
    type Err = MembankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(Scale::Small),
            "medium" => Ok(Scale::Medium),
            "large" => Ok(Scale::Large),
            other => Err(MembankError::ValidationError(format!(
                "unknown scale '{other}' (expected small, medium or large)"
            ))),
        }
    }
}

/// Size of `text` in the configured unit.
pub fn measure(text: &str, unit: BudgetUnit) -> usize {
    match (unit, CL100K.as_ref()) {
        (BudgetUnit::Tokens, Some(bpe)) => bpe.encode_with_special_tokens(text).len(),
        _ => text.len(),
    }
}

/// Longest prefix of `text`, cut on a char boundary, that fits `budget`.
fn cut_to_budget(text: &str, budget: usize, unit: BudgetUnit) -> String {
    if measure(text, unit) <= budget {
        return text.to_string();
    }
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let (mut lo, mut hi) = (0usize, bounds.len() - 1);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if measure(&text[..bounds[mid]], unit) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    text[..bounds[lo]].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Section {
    title: String,
    lines: Vec<String>,
}

/// First `limit` non-blank lines, skipping a leading `# ` title.
pub fn excerpt(body: &str, limit: usize) -> Vec<String> {
    let mut lines = body
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .peekable();
    if lines.peek().is_some_and(|l| l.starts_with("# ")) {
        lines.next();
    }
    lines.take(limit).map(str::to_string).collect()
}

/// Collapse whitespace and cap at `max` chars.
fn cap_chars(text: &str, max: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let mut out: String = flat.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn requirement_lines(docs: &[RequirementDocument], cfg: &CondenserConfig) -> Vec<String> {
    let mut lines = Vec::new();
    for doc in docs
        .iter()
        .filter(|d| matches!(d.status, Status::Approved | Status::InProgress))
        .take(cfg.max_requirements)
    {
        lines.push(format!(
            "- {} ({}) [{}, v{}]",
            doc.title, doc.id, doc.status, doc.version
        ));
        for (label, key) in [("Goal", SectionKey::Goal), ("Problem", SectionKey::Problem)] {
            if let Some(body) = doc.section(key) {
                lines.push(format!("  {label}: {}", cap_chars(body, cfg.summary_chars)));
            }
        }
    }
    lines
}

fn focus_lines(records: &[(RecordName, String)], keywords: &[&str], limit: usize) -> Vec<String> {
    let mut lines = Vec::new();
    for (name, body) in records {
        let body_lines: Vec<&str> = body.lines().collect();
        let hit = body_lines.iter().position(|l| {
            let lower = l.to_lowercase();
            keywords.iter().any(|k| lower.contains(k))
        });
        let Some(i) = hit else { continue };
        lines.push(format!("- {name}:"));
        let start = i.saturating_sub(1);
        let end = (i + 3).min(body_lines.len());
        for l in &body_lines[start..end] {
            if !l.trim().is_empty() {
                lines.push(format!("  {}", l.trim_end()));
            }
        }
        if lines.len() >= limit {
            break;
        }
    }
    lines.truncate(limit);
    lines
}

fn render(header: &[String], sections: &[Section], footer: &[String]) -> String {
    let mut out = header.join("\n");
    out.push_str("\n\n");
    for section in sections {
        out.push_str(&format!("## {}\n", section.title));
        out.push_str(&section.lines.join("\n"));
        out.push_str("\n\n");
    }
    out.push_str(&footer.join("\n"));
    out.push('\n');
    out
}

/// Drop trailing lines of the lowest-priority sections until the text fits.
fn fit(header: &[String], mut sections: Vec<Section>, footer: &[String], cfg: &CondenserConfig) -> String {
    loop {
        let text = render(header, &sections, footer);
        if measure(&text, cfg.budget_unit) <= cfg.budget {
            return text;
        }
        let Some(last) = sections.last_mut() else {
            return cut_to_budget(&text, cfg.budget, cfg.budget_unit);
        };
        last.lines.pop();
        if last.lines.is_empty() {
            sections.pop();
        }
    }
}

fn bootstrap(cfg: &CondenserConfig) -> String {
    let mut text = format!("# Project Context\n\n{BOOTSTRAP_MARKER}.\n\n");
    text.push_str("Run `membank init`, then capture:\n");
    for (name, hint) in [
        (RecordName::Overview, "what the project is and who it serves"),
        (RecordName::ActiveFocus, "what is being worked on right now"),
        (RecordName::Patterns, "architecture, conventions, recurring decisions"),
        (RecordName::Environment, "toolchain, services, local setup"),
        (RecordName::Progress, "milestones reached and open work"),
    ] {
        text.push_str(&format!("- {name}: {hint}\n"));
    }
    cut_to_budget(&text, cfg.budget, cfg.budget_unit)
}

/// Summarise the store within the configured budget.
pub fn condense(store: &Store, focus: Option<&str>, scale: Scale) -> String {
    let cfg = &store.config.condenser;
    if !store.exists() {
        return bootstrap(cfg);
    }
    let mut notices = Vec::new();

    let mut records: Vec<(RecordName, String)> = Vec::new();
    for name in RecordName::ALL {
        match knowledge::load_record(store, name) {
            Ok(body) => records.push((name, body)),
            Err(MembankError::NotFound(_)) => {}
            Err(e) => {
                warn!(record = %name, error = %e, "omitting knowledge record from context");
                notices.push(format!("Omitted: knowledge record '{name}' ({e})"));
            }
        }
    }
    let record = |name: RecordName| -> Option<&str> {
        records.iter().find(|(n, _)| *n == name).map(|(_, b)| b.as_str())
    };

    let (docs, omitted) = match requirement::load_all(store) {
        Ok(found) => found,
        Err(e) => {
            notices.push(format!("Omitted: requirements ({e})"));
            (Vec::new(), Vec::new())
        }
    };
    for o in &omitted {
        notices.push(format!("Omitted: requirement '{}' ({})", o.id, o.reason));
    }

    let window = match scale {
        Scale::Small => store.config.decisions.window_small,
        Scale::Medium => store.config.decisions.window_medium,
        Scale::Large => store.config.decisions.window_large,
    };
    let decisions = decide::recent(store, window).unwrap_or_else(|e| {
        notices.push(format!("Omitted: decision log ({e})"));
        Vec::new()
    });
    let decision_total = decide::count(store).unwrap_or(decisions.len());

    if records.is_empty() && docs.is_empty() && omitted.is_empty() && decisions.is_empty() && notices.is_empty() {
        return bootstrap(cfg);
    }

    let n = cfg.section_lines;
    let excerpt_of = |name| record(name).map(|b| excerpt(b, n)).unwrap_or_default();
    let mut patterns = excerpt_of(RecordName::Patterns);
    patterns.extend(excerpt_of(RecordName::Environment));
    let mut recent = excerpt_of(RecordName::Progress);
    recent.extend(decisions.iter().map(|d| d.render_line()));

    let mut sections = vec![
        Section { title: "Project Overview".into(), lines: excerpt_of(RecordName::Overview) },
        Section { title: "Active Focus".into(), lines: excerpt_of(RecordName::ActiveFocus) },
        Section { title: "Architecture & Patterns".into(), lines: patterns },
        Section { title: "Recent Decisions".into(), lines: recent },
        Section { title: "Requirement Summaries".into(), lines: requirement_lines(&docs, cfg) },
    ];
    let focus_tag = focus.map(str::trim).filter(|f| !f.is_empty());
    if let Some(tag) = focus_tag {
        match focus_keywords(tag) {
            Some(words) => sections.push(Section {
                title: format!("Focus: {}", tag.to_lowercase()),
                lines: focus_lines(&records, words, n),
            }),
            None => debug!(focus = tag, "unrecognised focus tag, no extension"),
        }
    }
    sections.retain(|s| !s.lines.is_empty());

    let mut header = vec![
        "# Project Context".to_string(),
        format!("Focus: {} | Scale: {scale}", focus_tag.unwrap_or("general")),
    ];
    header.extend(notices);

    let count = |status: Status| docs.iter().filter(|d| d.status == status).count();
    let footer = vec![
        "---".to_string(),
        format!(
            "Records: {}/{} | Requirements: {} Draft, {} Review, {} Approved, {} In Progress, {} Completed | Decisions: {}",
            records.len(),
            RecordName::ALL.len(),
            count(Status::Draft),
            count(Status::Review),
            count(Status::Approved),
            count(Status::InProgress),
            count(Status::Completed),
            decision_total
        ),
    ];

    fit(&header, sections, &footer, cfg)
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "context", about = "Print a bounded summary of the project store.")]
pub struct ContextCli {
    /// Focus tag: api, testing, features, performance, deployment
    #[clap(long)]
    pub focus: Option<String>,
    #[clap(long, value_enum, default_value = "medium")]
    pub scale: Scale,
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "context",
        "version": "0.3.0",
        "description": "Deterministic, budgeted context summary",
        "focus_tags": FOCUS_KEYWORDS.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
        "scales": ["small", "medium", "large"],
        "parameters": ["focus", "scale"]
    })
}

pub fn run_context_cli(store: &Store, cli: ContextCli) -> Result<(), MembankError> {
    print!("{}", condense(store, cli.focus.as_deref(), cli.scale));
    Ok(())
}
