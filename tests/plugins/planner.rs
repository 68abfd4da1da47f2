use membank::core::error::MembankError;
use membank::core::store::{self, Store};
use membank::plugins::lifecycle::{
    advance, approve_gate, create_requirement, reopen, set_section, start_implementation,
};
use membank::plugins::planner::{
    Bucket, CONFIRM_OBJECTIVE, Mode, SegmentSpec, VERIFY_OBJECTIVE, WorkPlan, build_plan,
    complete_segment, load_plan, next_available, plan, progress, replan, save_plan, segment_id,
    timeline,
};
use membank::plugins::requirement::{Gate, RequirementDocument, SectionKey, Status};
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = store::init_project(tmp.path()).unwrap();
    (tmp, store)
}

fn approved_with(store: &Store, title: &str, functional: &str) -> RequirementDocument {
    let mut doc = create_requirement(store, title).unwrap();
    for key in SectionKey::ALL {
        let body = match key {
            SectionKey::FunctionalRequirements => functional.to_string(),
            SectionKey::NonFunctionalRequirements => "- Handles 100 req/s".to_string(),
            SectionKey::SuccessMetrics => "- Error rate below 1%\n- p95 under 300ms".to_string(),
            SectionKey::Approach => "Add a REST endpoint.\nStore sessions in SQLite.".to_string(),
            other => format!("{} text", other.key()),
        };
        doc = set_section(store, &doc, key, &body).unwrap();
    }
    doc = advance(store, &doc, Status::Review).unwrap();
    for gate in Gate::ALL {
        doc = approve_gate(store, &doc, gate).unwrap();
    }
    advance(store, &doc, Status::Approved).unwrap()
}

fn sized(key: &str, bucket: Bucket, prerequisites: &[&str]) -> SegmentSpec {
    let mut spec = SegmentSpec::new(key, Mode::Sequential, prerequisites);
    spec.bucket = bucket;
    spec
}

fn position(plan: &WorkPlan, objective: &str) -> usize {
    plan.segments
        .iter()
        .position(|s| s.objective == objective)
        .unwrap()
}

#[test]
fn sequential_edge_orders_dependents_after_prerequisites() {
    let specs = vec![
        SegmentSpec::new("A", Mode::Sequential, &[]),
        SegmentSpec::new("B", Mode::Sequential, &["A"]),
        SegmentSpec::new("C", Mode::Parallel, &[]),
    ];
    let plan = build_plan("r", &specs).unwrap();
    assert_eq!(plan.segments.len(), 3);
    assert!(position(&plan, "A") < position(&plan, "B"));
    assert_ne!(plan.segments[0].objective, "B");
    let b = &plan.segments[position(&plan, "B")];
    assert_eq!(b.prerequisites, vec![segment_id("A")]);
}

#[test]
fn mutual_dependency_is_reported_as_cycle() {
    let specs = vec![
        SegmentSpec::new("A", Mode::Sequential, &["B"]),
        SegmentSpec::new("B", Mode::Sequential, &["A"]),
    ];
    match build_plan("r", &specs) {
        Err(MembankError::Cycle(ids)) => assert_eq!(ids, vec![segment_id("A"), segment_id("B")]),
        other => panic!("expected Cycle, got {other:?}"),
    }
}

#[test]
fn unknown_and_duplicate_references_are_invalid() {
    let specs = vec![
        SegmentSpec::new("A", Mode::Sequential, &["ghost"]),
        SegmentSpec::new("A", Mode::Sequential, &[]),
    ];
    match build_plan("r", &specs) {
        Err(MembankError::Invalid(reasons)) => {
            assert_eq!(reasons.len(), 2);
            assert!(reasons.iter().any(|r| r.contains("duplicate")));
            assert!(reasons.iter().any(|r| r.contains("ghost")));
        }
        other => panic!("expected Invalid, got {other:?}"),
    }
}

#[test]
fn decomposition_follows_document_sections() {
    let (_tmp, store) = test_store();
    let doc = approved_with(
        &store,
        "Checkout",
        "- Cart page\n- Payment form\n- Receipt email {parallel, small}",
    );
    let plan = plan(&store, &doc).unwrap();
    assert_eq!(plan.version, 1);
    assert_eq!(plan.requirement_version, doc.version);

    let objectives: Vec<&str> = plan.segments.iter().map(|s| s.objective.as_str()).collect();
    assert_eq!(objectives[0], CONFIRM_OBJECTIVE);
    assert_eq!(*objectives.last().unwrap(), VERIFY_OBJECTIVE);

    let confirm = segment_id(CONFIRM_OBJECTIVE);
    let payment = &plan.segments[position(&plan, "Implement: Payment form")];
    assert_eq!(payment.prerequisites, vec![segment_id("Implement: Cart page")]);
    assert_eq!(payment.mode, Mode::Sequential);

    let receipt = &plan.segments[position(&plan, "Implement: Receipt email")];
    assert_eq!(receipt.mode, Mode::Parallel);
    assert_eq!(receipt.prerequisites, vec![confirm.clone()]);

    let satisfy = &plan.segments[position(&plan, "Satisfy: Handles 100 req/s")];
    assert_eq!(satisfy.prerequisites, vec![segment_id("Implement: Receipt email")]);

    let verify = plan.segments.last().unwrap();
    assert_eq!(verify.acceptance_criteria, vec!["Error rate below 1%", "p95 under 300ms"]);
    assert!(verify.prerequisites.contains(&segment_id("Implement: Payment form")));
    assert!(verify.prerequisites.contains(&satisfy.id));

    assert_eq!(load_plan(&store, &doc.id).unwrap(), plan);
}

#[test]
fn annotation_cycle_fails_without_persisting() {
    let (_tmp, store) = test_store();
    let doc = approved_with(&store, "Loop", "- First {after=2}\n- Second");
    match plan(&store, &doc) {
        Err(MembankError::Cycle(ids)) => assert_eq!(
            ids,
            vec![segment_id("Implement: First"), segment_id("Implement: Second")]
        ),
        other => panic!("expected Cycle, got {other:?}"),
    }
    assert!(matches!(
        load_plan(&store, &doc.id),
        Err(MembankError::NotFound(_))
    ));
}

#[test]
fn planning_requires_approval() {
    let (_tmp, store) = test_store();
    let doc = create_requirement(&store, "Draft only").unwrap();
    assert!(matches!(
        plan(&store, &doc),
        Err(MembankError::GateViolation { .. })
    ));
    assert!(matches!(
        replan(&store, &doc),
        Err(MembankError::GateViolation { .. })
    ));
}

#[test]
fn replan_is_idempotent() {
    let (_tmp, store) = test_store();
    let doc = approved_with(&store, "Stable", "- One\n- Two");
    let first = plan(&store, &doc).unwrap();
    let again = replan(&store, &doc).unwrap();
    let third = replan(&store, &doc).unwrap();
    assert_eq!(first, again);
    assert_eq!(again, third);
    assert_eq!(load_plan(&store, &doc.id).unwrap().version, 1);
}

#[test]
fn replan_keeps_completed_segments_that_survive() {
    let (_tmp, store) = test_store();
    let doc = approved_with(&store, "Evolving", "- Keep me\n- Drop me");
    let initial = plan(&store, &doc).unwrap();

    let confirm = segment_id(CONFIRM_OBJECTIVE);
    let keep = segment_id("Implement: Keep me");
    let after_confirm = complete_segment(&store, &initial, &confirm).unwrap();
    let after_keep = complete_segment(&store, &after_confirm, &keep).unwrap();
    assert_eq!(after_keep.version, 3);

    let started = start_implementation(&store, &doc).unwrap();
    let mut revised = reopen(&store, &started, "split work").unwrap();
    revised = set_section(
        &store,
        &revised,
        SectionKey::FunctionalRequirements,
        "- Keep me\n- Brand new",
    )
    .unwrap();
    revised = approve_gate(&store, &revised, Gate::ReadyForImplementation).unwrap();
    revised = advance(&store, &revised, Status::Approved).unwrap();

    let updated = replan(&store, &revised).unwrap();
    assert_eq!(updated.version, 4);
    assert!(updated.segment(&confirm).unwrap().completed);
    assert!(updated.segment(&keep).unwrap().completed);
    assert!(updated.segment(&segment_id("Implement: Drop me")).is_none());
    assert!(!updated.segment(&segment_id("Implement: Brand new")).unwrap().completed);

    assert_eq!(replan(&store, &revised).unwrap(), updated);
}

#[test]
fn segments_complete_in_dependency_order() {
    let (_tmp, store) = test_store();
    let doc = approved_with(&store, "Order", "- Step one\n- Step two");
    let plan = plan(&store, &doc).unwrap();
    let step_two = segment_id("Implement: Step two");

    match complete_segment(&store, &plan, &step_two) {
        Err(MembankError::GateViolation { unmet, .. }) => {
            assert_eq!(unmet, vec![segment_id("Implement: Step one")]);
        }
        other => panic!("expected GateViolation, got {other:?}"),
    }

    let next: Vec<&str> = next_available(&plan).iter().map(|s| s.objective.as_str()).collect();
    assert_eq!(next, vec![CONFIRM_OBJECTIVE]);
    assert_eq!(progress(&plan).completed_segments, 0);

    assert!(matches!(
        complete_segment(&store, &plan, "SEG-nope"),
        Err(MembankError::NotFound(_))
    ));
}

#[test]
fn stale_plan_write_conflicts() {
    let (_tmp, store) = test_store();
    let doc = approved_with(&store, "Shared", "- Only item");
    let stored = plan(&store, &doc).unwrap();
    complete_segment(&store, &stored, &segment_id(CONFIRM_OBJECTIVE)).unwrap();

    let err = save_plan(&store, &stored, stored.version).unwrap_err();
    assert!(matches!(
        err,
        MembankError::Conflict { expected: 1, actual: 2, .. }
    ));
}

#[test]
fn critical_path_follows_the_heaviest_chain() {
    let specs = vec![
        sized("Schema", Bucket::Large, &[]),
        sized("Labels", Bucket::Small, &["Schema"]),
        sized("Importer", Bucket::Medium, &["Schema"]),
        sized("Release", Bucket::Small, &["Labels", "Importer"]),
    ];
    let plan = build_plan("r", &specs).unwrap();
    let t = timeline(&plan);
    assert_eq!(t.sequential_minutes, 120);
    assert_eq!(t.parallel_minutes, 105);
    assert_eq!(
        t.critical_path,
        vec![segment_id("Schema"), segment_id("Importer"), segment_id("Release")]
    );
    assert_eq!(t.milestones.len(), 1);
    assert_eq!(t.milestones[0].name, "Milestone 1: Release");
    assert_eq!(t.milestones[0].segment_count, 4);
    assert_eq!(t.milestones[0].minutes, 120);
}

#[test]
fn milestones_close_every_four_hours() {
    let specs = vec![
        sized("S1", Bucket::Large, &[]),
        sized("S2", Bucket::Large, &["S1"]),
        sized("S3", Bucket::Large, &["S2"]),
        sized("S4", Bucket::Large, &["S3"]),
        sized("S5", Bucket::Large, &["S4"]),
    ];
    let t = timeline(&build_plan("r", &specs).unwrap());
    let marks: Vec<(usize, u64)> = t
        .milestones
        .iter()
        .map(|m| (m.segment_count, m.minutes))
        .collect();
    assert_eq!(marks, vec![(4, 240), (5, 60)]);
    assert_eq!(t.parallel_minutes, t.sequential_minutes);
    assert_eq!(t.critical_path.len(), 5);
}

#[test]
fn stored_plan_timeline_spans_confirm_to_verify() {
    let (_tmp, store) = test_store();
    let doc = approved_with(&store, "Timeline", "- Cart page\n- Receipt email {parallel, small}");
    let stored = plan(&store, &doc).unwrap();
    let t = timeline(&stored);
    assert_eq!(t.sequential_minutes, progress(&stored).total_minutes);
    assert!(t.parallel_minutes <= t.sequential_minutes);
    assert_eq!(t.critical_path.first(), Some(&segment_id(CONFIRM_OBJECTIVE)));
    assert_eq!(t.critical_path.last(), Some(&segment_id(VERIFY_OBJECTIVE)));
    assert_eq!(t.milestones.last().unwrap().segment_count, stored.segments.len());
}
