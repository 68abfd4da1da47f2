//! Work segmentation: decompose an approved requirement into segments, order
//! them, and keep the plan stable across replans.
//!
//! Segment ids are derived from the objective text, so a segment keeps its id
//! (and its completed flag) for as long as its objective survives replanning.

use crate::core::error::MembankError;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::requirement::{self, RequirementDocument, SectionKey, Status};
use clap::{Parser, Subcommand};
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::LazyLock;
use tracing::{debug, info};

pub const PLANS_DIR: &str = "plans";

pub const CONFIRM_OBJECTIVE: &str = "Confirm approach and interfaces";
pub const VERIFY_OBJECTIVE: &str = "Verify success metrics";

const HIGH_COMPLEXITY: &[&str] = &[
    "complex",
    "integrate",
    "refactor",
    "architecture",
    "security",
    "performance",
];
const MEDIUM_COMPLEXITY: &[&str] = &["implement", "create", "build", "design", "configure"];

static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*]\s+|\d+[.)]\s+)(.*)$").unwrap());
static ANNOTATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)\s*\{([^{}]*)\}\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Small,
    Medium,
    Large,
}

impl Bucket {
    /// Nominal minutes used for progress accounting.
    pub fn minutes(&self) -> u64 {
        match self {
            Bucket::Small => 15,
            Bucket::Medium => 30,
            Bucket::Large => 60,
        }
    }

    fn from_token(token: &str) -> Option<Bucket> {
        match token {
            "small" => Some(Bucket::Small),
            "medium" => Some(Bucket::Medium),
            "large" => Some(Bucket::Large),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Sequential,
    Parallel,
}

/// Estimated minutes for a piece of work described by `text`.
pub fn estimate_minutes(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let mut minutes = 20.0;
    if HIGH_COMPLEXITY.iter().any(|w| lower.contains(w)) {
        minutes *= 2.5;
    } else if MEDIUM_COMPLEXITY.iter().any(|w| lower.contains(w)) {
        minutes *= 1.5;
    }
    if text.chars().count() > 100 {
        minutes *= 1.3;
    }
    minutes
}

pub fn bucket_for(text: &str) -> Bucket {
    let minutes = estimate_minutes(text);
    if minutes <= 20.0 {
        Bucket::Small
    } else if minutes <= 45.0 {
        Bucket::Medium
    } else {
        Bucket::Large
    }
}

/// Input to [`build_plan`]. Prerequisites name other specs by `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub key: String,
    pub bucket: Bucket,
    pub mode: Mode,
    pub prerequisites: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

impl SegmentSpec {
    pub fn new(key: &str, mode: Mode, prerequisites: &[&str]) -> Self {
        Self {
            key: key.to_string(),
            bucket: bucket_for(key),
            mode,
            prerequisites: prerequisites.iter().map(|p| p.to_string()).collect(),
            acceptance_criteria: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSegment {
    pub id: String,
    pub objective: String,
    pub bucket: Bucket,
    pub mode: Mode,
    pub prerequisites: Vec<String>,
    pub completed: bool,
    pub acceptance_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPlan {
    pub requirement_id: String,
    pub requirement_version: u64,
    pub content_hash: String,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub segments: Vec<WorkSegment>,
}

impl WorkPlan {
    pub fn segment(&self, id: &str) -> Option<&WorkSegment> {
        self.segments.iter().find(|s| s.id == id)
    }
}

pub fn segment_id(objective: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(objective.as_bytes()));
    format!("SEG-{}", &digest[..10])
}

fn content_hash(specs: &[SegmentSpec]) -> Result<String, MembankError> {
    let canonical = serde_json::to_string(specs)?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Validate references, reject cycles, and order segments topologically
/// (ties broken by declaration order). Pure: nothing is persisted.
pub fn build_plan(requirement_id: &str, specs: &[SegmentSpec]) -> Result<WorkPlan, MembankError> {
    let mut reasons = Vec::new();
    let mut index: FxHashMap<&str, usize> = FxHashMap::default();
    let mut ids: FxHashMap<String, usize> = FxHashMap::default();
    for (i, spec) in specs.iter().enumerate() {
        if spec.key.trim().is_empty() {
            reasons.push(format!("segment #{} has an empty objective", i + 1));
            continue;
        }
        if index.insert(spec.key.as_str(), i).is_some() {
            reasons.push(format!("duplicate segment objective '{}'", spec.key));
        }
        if let Some(other) = ids.insert(segment_id(&spec.key), i) {
            if specs[other].key != spec.key {
                reasons.push(format!(
                    "objectives '{}' and '{}' hash to the same segment id",
                    specs[other].key, spec.key
                ));
            }
        }
    }

    let mut prereqs: Vec<Vec<usize>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut seen = FxHashSet::default();
        let mut deps = Vec::new();
        for p in &spec.prerequisites {
            match index.get(p.as_str()) {
                Some(&j) => {
                    if seen.insert(j) {
                        deps.push(j);
                    }
                }
                None => reasons.push(format!(
                    "segment '{}' depends on unknown segment '{}'",
                    spec.key, p
                )),
            }
        }
        prereqs.push(deps);
    }
    if !reasons.is_empty() {
        return Err(MembankError::Invalid(reasons));
    }

    if let Some(cycle) = find_cycle(&prereqs) {
        let ids = cycle.iter().map(|&i| segment_id(&specs[i].key)).collect();
        return Err(MembankError::Cycle(ids));
    }

    let order = topological_order(&prereqs);
    let segments = order
        .into_iter()
        .map(|i| {
            let spec = &specs[i];
            WorkSegment {
                id: segment_id(&spec.key),
                objective: spec.key.clone(),
                bucket: spec.bucket,
                mode: spec.mode,
                prerequisites: prereqs[i]
                    .iter()
                    .map(|&j| segment_id(&specs[j].key))
                    .collect(),
                completed: false,
                acceptance_criteria: spec.acceptance_criteria.clone(),
            }
        })
        .collect();

    Ok(WorkPlan {
        requirement_id: requirement_id.to_string(),
        requirement_version: 0,
        content_hash: content_hash(specs)?,
        version: 0,
        created_at: 0,
        updated_at: 0,
        segments,
    })
}

/// Members of the first cycle found, sorted by declaration index.
///
/// Iterative DFS: each frame is a node and the index of its next edge.
fn find_cycle(prereqs: &[Vec<usize>]) -> Option<Vec<usize>> {
    const UNSEEN: u8 = 0;
    const ON_PATH: u8 = 1;
    const DONE: u8 = 2;

    let mut state = vec![UNSEEN; prereqs.len()];
    let mut frames: Vec<(usize, usize)> = Vec::new();
    for root in 0..prereqs.len() {
        if state[root] != UNSEEN {
            continue;
        }
        state[root] = ON_PATH;
        frames.push((root, 0));
        while let Some(frame) = frames.last_mut() {
            let (node, edge) = *frame;
            let Some(&next) = prereqs[node].get(edge) else {
                state[node] = DONE;
                frames.pop();
                continue;
            };
            frame.1 += 1;
            match state[next] {
                UNSEEN => {
                    state[next] = ON_PATH;
                    frames.push((next, 0));
                }
                ON_PATH => {
                    let start = frames.iter().position(|&(n, _)| n == next).unwrap_or(0);
                    let mut cycle: Vec<usize> = frames[start..].iter().map(|&(n, _)| n).collect();
                    cycle.sort_unstable();
                    return Some(cycle);
                }
                _ => {}
            }
        }
    }
    None
}

/// Kahn's algorithm; the graph is known to be acyclic.
fn topological_order(prereqs: &[Vec<usize>]) -> Vec<usize> {
    let mut indegree: Vec<usize> = prereqs.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); prereqs.len()];
    for (node, deps) in prereqs.iter().enumerate() {
        for &d in deps {
            dependents[d].push(node);
        }
    }
    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(prereqs.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for &dep in &dependents[node] {
            indegree[dep] -= 1;
            if indegree[dep] == 0 {
                ready.push(Reverse(dep));
            }
        }
    }
    order
}

/// List items of a section body: `- `, `* ` and `N.` lines when any exist,
/// otherwise every non-blank line.
pub fn list_items(body: &str) -> Vec<String> {
    let marked: Vec<String> = body
        .lines()
        .filter_map(|l| LIST_ITEM_RE.captures(l).map(|c| c[1].trim().to_string()))
        .filter(|item| !item.is_empty())
        .collect();
    if !marked.is_empty() {
        return marked;
    }
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Annotation {
    parallel: bool,
    bucket: Option<Bucket>,
    after: Vec<usize>,
}

/// Split a trailing `{...}` annotation off an item. Braces whose tokens are
/// not all recognised stay part of the text.
fn parse_annotation(item: &str) -> (String, Annotation) {
    let Some(caps) = ANNOTATION_RE.captures(item) else {
        return (item.to_string(), Annotation::default());
    };
    let mut ann = Annotation::default();
    for token in caps[2].split(',').map(|t| t.trim().to_lowercase()) {
        if token.is_empty() {
            continue;
        }
        if token == "parallel" {
            ann.parallel = true;
        } else if token == "sequential" {
            ann.parallel = false;
        } else if let Some(bucket) = Bucket::from_token(&token) {
            ann.bucket = Some(bucket);
        } else if let Some(n) = token
            .strip_prefix("after=")
            .and_then(|n| n.trim().parse::<usize>().ok())
        {
            ann.after.push(n);
        } else {
            return (item.to_string(), Annotation::default());
        }
    }
    (caps[1].trim().to_string(), ann)
}

fn excerpt_lines(body: Option<&str>, limit: usize) -> Vec<String> {
    body.map(|b| {
        b.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(limit)
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Derive segment specs from a document's approach, functional,
/// non-functional and success-metric sections.
pub fn decompose(doc: &RequirementDocument) -> Result<Vec<SegmentSpec>, MembankError> {
    let approach = doc.section(SectionKey::Approach);
    let mut specs = vec![SegmentSpec {
        key: CONFIRM_OBJECTIVE.to_string(),
        bucket: bucket_for(approach.unwrap_or(CONFIRM_OBJECTIVE)),
        mode: Mode::Sequential,
        prerequisites: Vec::new(),
        acceptance_criteria: excerpt_lines(approach, 3),
    }];

    let functional: Vec<(String, Annotation)> = doc
        .section(SectionKey::FunctionalRequirements)
        .map(list_items)
        .unwrap_or_default()
        .iter()
        .map(|item| parse_annotation(item))
        .collect();
    let implement_keys: Vec<String> = functional
        .iter()
        .map(|(text, _)| format!("Implement: {text}"))
        .collect();

    let mut reasons = Vec::new();
    for (i, (text, ann)) in functional.iter().enumerate() {
        let mut prerequisites = if ann.parallel || i == 0 {
            vec![CONFIRM_OBJECTIVE.to_string()]
        } else {
            vec![implement_keys[i - 1].clone()]
        };
        for &n in &ann.after {
            match implement_keys.get(n.wrapping_sub(1)) {
                Some(key) if n > 0 => prerequisites.push(key.clone()),
                _ => reasons.push(format!(
                    "functional item {} refers to missing item {n}",
                    i + 1
                )),
            }
        }
        specs.push(SegmentSpec {
            key: implement_keys[i].clone(),
            bucket: ann.bucket.unwrap_or_else(|| bucket_for(text)),
            mode: if ann.parallel { Mode::Parallel } else { Mode::Sequential },
            prerequisites,
            acceptance_criteria: vec![text.clone()],
        });
    }
    if !reasons.is_empty() {
        return Err(MembankError::Invalid(reasons));
    }

    let anchor = implement_keys
        .last()
        .cloned()
        .unwrap_or_else(|| CONFIRM_OBJECTIVE.to_string());
    for item in doc
        .section(SectionKey::NonFunctionalRequirements)
        .map(list_items)
        .unwrap_or_default()
    {
        let (text, ann) = parse_annotation(&item);
        specs.push(SegmentSpec {
            key: format!("Satisfy: {text}"),
            bucket: ann.bucket.unwrap_or_else(|| bucket_for(&text)),
            mode: Mode::Parallel,
            prerequisites: vec![anchor.clone()],
            acceptance_criteria: vec![text],
        });
    }

    // Drop repeated objectives, keeping the first occurrence.
    let mut seen = FxHashSet::default();
    specs.retain(|s| seen.insert(s.key.clone()));

    let depended: FxHashSet<&str> = specs
        .iter()
        .flat_map(|s| s.prerequisites.iter().map(String::as_str))
        .collect();
    let sinks: Vec<String> = specs
        .iter()
        .filter(|s| !depended.contains(s.key.as_str()))
        .map(|s| s.key.clone())
        .collect();
    let metrics = doc
        .section(SectionKey::SuccessMetrics)
        .map(list_items)
        .unwrap_or_default();
    specs.push(SegmentSpec {
        key: VERIFY_OBJECTIVE.to_string(),
        bucket: bucket_for(&metrics.join(" ")),
        mode: Mode::Sequential,
        prerequisites: sinks,
        acceptance_criteria: metrics,
    });
    Ok(specs)
}

fn prepare(doc: &RequirementDocument) -> Result<WorkPlan, MembankError> {
    let specs = decompose(doc)?;
    let mut plan = build_plan(&doc.id, &specs)?;
    plan.requirement_version = doc.version;
    Ok(plan)
}

/// Carry completed flags over from `previous` for objectives that persist.
pub fn merge(previous: &WorkPlan, mut fresh: WorkPlan) -> WorkPlan {
    let done: FxHashSet<&str> = previous
        .segments
        .iter()
        .filter(|s| s.completed)
        .map(|s| s.objective.as_str())
        .collect();
    for seg in &mut fresh.segments {
        seg.completed = done.contains(seg.objective.as_str());
    }
    fresh.version = previous.version;
    fresh.created_at = previous.created_at;
    fresh.updated_at = previous.updated_at;
    fresh
}

pub fn rel_path(requirement_id: &str) -> String {
    format!("{PLANS_DIR}/{requirement_id}.json")
}

pub fn load_plan(store: &Store, requirement_id: &str) -> Result<WorkPlan, MembankError> {
    if !requirement::is_valid_slug(requirement_id) {
        return Err(MembankError::ValidationError(format!(
            "invalid requirement id '{requirement_id}'"
        )));
    }
    debug!(id = requirement_id, "plan.load");
    let what = format!("plan '{requirement_id}'");
    let text = store
        .backend()
        .load(&rel_path(requirement_id))?
        .ok_or_else(|| MembankError::NotFound(what.clone()))?;
    serde_json::from_str(&text).map_err(|e| MembankError::corrupted(what, e.to_string()))
}

fn load_plan_opt(store: &Store, requirement_id: &str) -> Result<Option<WorkPlan>, MembankError> {
    match load_plan(store, requirement_id) {
        Ok(plan) => Ok(Some(plan)),
        Err(MembankError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Same optimistic contract as requirement documents.
pub fn save_plan(store: &Store, plan: &WorkPlan, expected_version: u64) -> Result<WorkPlan, MembankError> {
    let now = time::now_epoch_ms();
    let mut next = plan.clone();
    next.version = expected_version + 1;
    next.updated_at = now.max(plan.updated_at);
    if expected_version == 0 {
        next.created_at = next.updated_at;
    }
    let rendered = serde_json::to_string_pretty(&next)?;
    let what = format!("plan '{}'", plan.requirement_id);

    store
        .backend()
        .update(&rel_path(&plan.requirement_id), &mut |current| {
            let actual = match current {
                None => 0,
                Some(text) => {
                    serde_json::from_str::<WorkPlan>(text)
                        .map_err(|e| MembankError::corrupted(what.as_str(), e.to_string()))?
                        .version
                }
            };
            if actual != expected_version {
                return Err(MembankError::Conflict {
                    id: next.requirement_id.clone(),
                    expected: expected_version,
                    actual,
                });
            }
            Ok(rendered.clone())
        })?;
    info!(id = %next.requirement_id, version = next.version, segments = next.segments.len(), "plan saved");
    Ok(next)
}

fn require_status(doc: &RequirementDocument, allowed: &[Status], op: &str) -> Result<(), MembankError> {
    if allowed.contains(&doc.status) {
        return Ok(());
    }
    Err(MembankError::GateViolation {
        id: doc.id.clone(),
        from: doc.status.label().to_string(),
        to: op.to_string(),
        unmet: vec![format!(
            "requirement must be {} (is {})",
            allowed.iter().map(Status::label).collect::<Vec<_>>().join(" or "),
            doc.status
        )],
    })
}

fn merge_and_save(store: &Store, previous: WorkPlan, fresh: WorkPlan) -> Result<WorkPlan, MembankError> {
    let merged = merge(&previous, fresh);
    if merged.segments == previous.segments && merged.content_hash == previous.content_hash {
        debug!(id = %previous.requirement_id, "plan unchanged");
        return Ok(previous);
    }
    let expected = previous.version;
    save_plan(store, &merged, expected)
}

/// First plan for an Approved requirement. An existing plan is merged.
pub fn plan(store: &Store, doc: &RequirementDocument) -> Result<WorkPlan, MembankError> {
    require_status(doc, &[Status::Approved], "Planned")?;
    let fresh = prepare(doc)?;
    match load_plan_opt(store, &doc.id)? {
        Some(previous) => merge_and_save(store, previous, fresh),
        None => save_plan(store, &fresh, 0),
    }
}

/// Recompute from the current document and merge by objective. Writes
/// nothing when the result matches the stored plan.
pub fn replan(store: &Store, doc: &RequirementDocument) -> Result<WorkPlan, MembankError> {
    require_status(doc, &[Status::Approved, Status::InProgress], "Replanned")?;
    let fresh = prepare(doc)?;
    match load_plan_opt(store, &doc.id)? {
        Some(previous) => merge_and_save(store, previous, fresh),
        None => save_plan(store, &fresh, 0),
    }
}

/// Mark a segment done. Every prerequisite must already be complete.
pub fn complete_segment(store: &Store, plan: &WorkPlan, segment_id: &str) -> Result<WorkPlan, MembankError> {
    let segment = plan.segment(segment_id).ok_or_else(|| {
        MembankError::NotFound(format!(
            "segment '{segment_id}' in plan '{}'",
            plan.requirement_id
        ))
    })?;
    if segment.completed {
        return Ok(plan.clone());
    }
    let unmet: Vec<String> = segment
        .prerequisites
        .iter()
        .filter(|p| !plan.segment(p).is_some_and(|s| s.completed))
        .cloned()
        .collect();
    if !unmet.is_empty() {
        return Err(MembankError::GateViolation {
            id: segment_id.to_string(),
            from: "pending".to_string(),
            to: "completed".to_string(),
            unmet,
        });
    }
    let mut next = plan.clone();
    for seg in &mut next.segments {
        if seg.id == segment_id {
            seg.completed = true;
        }
    }
    save_plan(store, &next, plan.version)
}

/// Incomplete segments whose prerequisites are all complete, in plan order.
pub fn next_available(plan: &WorkPlan) -> Vec<&WorkSegment> {
    let done: FxHashSet<&str> = plan
        .segments
        .iter()
        .filter(|s| s.completed)
        .map(|s| s.id.as_str())
        .collect();
    plan.segments
        .iter()
        .filter(|s| !s.completed && s.prerequisites.iter().all(|p| done.contains(p.as_str())))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProgress {
    pub total_segments: usize,
    pub completed_segments: usize,
    pub total_minutes: u64,
    pub completed_minutes: u64,
    pub completion_percentage: f64,
}

pub fn progress(plan: &WorkPlan) -> PlanProgress {
    let total_minutes: u64 = plan.segments.iter().map(|s| s.bucket.minutes()).sum();
    let completed_minutes: u64 = plan
        .segments
        .iter()
        .filter(|s| s.completed)
        .map(|s| s.bucket.minutes())
        .sum();
    let completion_percentage = if total_minutes == 0 {
        0.0
    } else {
        (completed_minutes as f64 * 1000.0 / total_minutes as f64).round() / 10.0
    };
    PlanProgress {
        total_segments: plan.segments.len(),
        completed_segments: plan.segments.iter().filter(|s| s.completed).count(),
        total_minutes,
        completed_minutes,
        completion_percentage,
    }
}

/// Cumulative minutes after which a milestone is closed.
pub const MILESTONE_MINUTES: u64 = 240;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    /// Segments covered from the start of the plan up to this milestone.
    pub segment_count: usize,
    /// Minutes of work since the previous milestone.
    pub minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTimeline {
    pub sequential_minutes: u64,
    /// Length of the critical path, i.e. the duration with unlimited parallelism.
    pub parallel_minutes: u64,
    pub milestones: Vec<Milestone>,
    pub critical_path: Vec<String>,
}

/// Timeline over the stored segment order, which is already topological.
///
/// The critical path is the prerequisite chain with the most bucket minutes;
/// ties go to the earlier segment.
pub fn timeline(plan: &WorkPlan) -> PlanTimeline {
    let position: FxHashMap<&str, usize> = plan
        .segments
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut finish = vec![0u64; plan.segments.len()];
    let mut via: Vec<Option<usize>> = vec![None; plan.segments.len()];
    for (i, seg) in plan.segments.iter().enumerate() {
        let mut best: Option<usize> = None;
        for p in &seg.prerequisites {
            if let Some(&j) = position.get(p.as_str()) {
                if best.is_none_or(|b| finish[j] > finish[b]) {
                    best = Some(j);
                }
            }
        }
        finish[i] = seg.bucket.minutes() + best.map_or(0, |b| finish[b]);
        via[i] = best;
    }

    let mut critical_path = Vec::new();
    let mut end = None;
    for (i, &f) in finish.iter().enumerate() {
        if end.is_none_or(|e: usize| f > finish[e]) {
            end = Some(i);
        }
    }
    let parallel_minutes = end.map_or(0, |e| finish[e]);
    while let Some(i) = end {
        critical_path.push(plan.segments[i].id.clone());
        end = via[i];
    }
    critical_path.reverse();

    let mut milestones = Vec::new();
    let mut since_last = 0;
    for (i, seg) in plan.segments.iter().enumerate() {
        since_last += seg.bucket.minutes();
        let last = i + 1 == plan.segments.len();
        if since_last >= MILESTONE_MINUTES || last {
            milestones.push(Milestone {
                name: format!("Milestone {}: {}", milestones.len() + 1, seg.objective),
                segment_count: i + 1,
                minutes: since_last,
            });
            since_last = 0;
        }
    }

    PlanTimeline {
        sequential_minutes: plan.segments.iter().map(|s| s.bucket.minutes()).sum(),
        parallel_minutes,
        milestones,
        critical_path,
    }
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "plan", about = "Dependency-ordered work plans for approved requirements.")]
pub struct PlanCli {
    #[clap(subcommand)]
    pub command: PlanCommand,
}

#[derive(Subcommand, Debug)]
pub enum PlanCommand {
    /// Build the plan for an Approved requirement.
    Create { id: String },
    /// Recompute the plan, keeping completed segments that still apply.
    Replan { id: String },
    /// Print the plan with its progress and timeline.
    Show { id: String },
    /// Mark a segment as completed.
    Done {
        id: String,
        #[clap(long)]
        segment: String,
    },
    /// List segments that can be started now.
    Next { id: String },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "plan",
        "version": "0.3.0",
        "description": "Acyclic work segmentation with stable segment ids",
        "annotations": ["parallel", "sequential", "small", "medium", "large", "after=N"],
        "commands": [
            { "name": "create", "parameters": ["id"] },
            { "name": "replan", "parameters": ["id"] },
            { "name": "show", "parameters": ["id"] },
            { "name": "done", "parameters": ["id", "segment"] },
            { "name": "next", "parameters": ["id"] }
        ],
        "storage": ["plans/<id>.json"]
    })
}

pub fn run_plan_cli(store: &Store, cli: PlanCli) -> Result<(), MembankError> {
    match cli.command {
        PlanCommand::Create { id } => {
            let doc = requirement::load_requirement(store, &id)?;
            println!("{}", serde_json::to_string_pretty(&plan(store, &doc)?)?);
        }
        PlanCommand::Replan { id } => {
            let doc = requirement::load_requirement(store, &id)?;
            println!("{}", serde_json::to_string_pretty(&replan(store, &doc)?)?);
        }
        PlanCommand::Show { id } => {
            let plan = load_plan(store, &id)?;
            let out = serde_json::json!({
                "plan": plan,
                "progress": progress(&plan),
                "timeline": timeline(&plan),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        PlanCommand::Done { id, segment } => {
            let plan = load_plan(store, &id)?;
            let saved = complete_segment(store, &plan, &segment)?;
            println!("{}", serde_json::to_string_pretty(&progress(&saved))?);
        }
        PlanCommand::Next { id } => {
            let plan = load_plan(store, &id)?;
            println!("{}", serde_json::to_string_pretty(&next_available(&plan))?);
        }
    }
    Ok(())
}
