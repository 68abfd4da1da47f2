use membank::core::config::MembankConfig;
use membank::core::db;
use membank::core::error::MembankError;
use membank::core::store::{self, Store};
use membank::plugins::decide::{self, DecisionKind};
use membank::plugins::lifecycle::{
    advance, approve_gate, complete, create_requirement, missing_gates, missing_sections, reopen,
    set_section, start_implementation, validate,
};
use membank::plugins::requirement::{
    Gate, RequirementDocument, SectionKey, Status, list_requirements, load_requirement,
};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = store::init_project(tmp.path()).unwrap();
    (tmp, store)
}

fn body_for(key: SectionKey) -> String {
    match key {
        SectionKey::FunctionalRequirements => "- Login form\n- Password reset".to_string(),
        SectionKey::NonFunctionalRequirements => "- Responds within 200ms".to_string(),
        SectionKey::SuccessMetrics => "- 95% of logins succeed".to_string(),
        other => format!("Details for {}", other.key()),
    }
}

fn filled(store: &Store, title: &str) -> RequirementDocument {
    let mut doc = create_requirement(store, title).unwrap();
    for key in SectionKey::ALL {
        doc = set_section(store, &doc, key, &body_for(key)).unwrap();
    }
    doc
}

fn approved(store: &Store, title: &str) -> RequirementDocument {
    let mut doc = advance(store, &filled(store, title), Status::Review).unwrap();
    for gate in Gate::ALL {
        doc = approve_gate(store, &doc, gate).unwrap();
    }
    advance(store, &doc, Status::Approved).unwrap()
}

#[test]
fn create_starts_in_draft_at_version_one() {
    let (_tmp, store) = test_store();
    let doc = create_requirement(&store, "User Login!").unwrap();
    assert_eq!(doc.id, "user-login");
    assert_eq!(doc.status, Status::Draft);
    assert_eq!(doc.version, 1);
    assert_eq!(load_requirement(&store, "user-login").unwrap(), doc);
}

#[test]
fn colliding_titles_get_numbered_ids() {
    let (_tmp, store) = test_store();
    let a = create_requirement(&store, "Search").unwrap();
    let b = create_requirement(&store, "search").unwrap();
    let c = create_requirement(&store, "SEARCH").unwrap();
    assert_eq!(
        vec![a.id.as_str(), b.id.as_str(), c.id.as_str()],
        vec!["search", "search-1", "search-2"]
    );
}

#[test]
fn partial_document_reports_seven_missing_sections() {
    let (_tmp, store) = test_store();
    let doc = create_requirement(&store, "Partial").unwrap();
    let doc = set_section(&store, &doc, SectionKey::Problem, "It hurts").unwrap();
    let doc = set_section(&store, &doc, SectionKey::Goal, "Stop the hurt").unwrap();

    let report = validate(&doc);
    let keys: Vec<&str> = report.missing_sections.iter().map(|k| k.key()).collect();
    assert_eq!(
        keys,
        vec![
            "approach",
            "functional-requirements",
            "non-functional-requirements",
            "success-metrics",
            "scope-in",
            "scope-out",
            "constraints"
        ]
    );
    assert_eq!(doc.status, Status::Draft);
    assert_eq!(missing_sections(&doc), report.missing_sections);
    assert_eq!(missing_gates(&doc).len(), 4);
}

#[test]
fn submit_without_scope_out_is_a_gate_violation() {
    let (_tmp, store) = test_store();
    let doc = filled(&store, "Scoped");
    let doc = set_section(&store, &doc, SectionKey::ScopeOut, "").unwrap();
    let before = doc.version;

    let err = advance(&store, &doc, Status::Review).unwrap_err();
    match err {
        MembankError::GateViolation { unmet, from, to, .. } => {
            assert_eq!(unmet, vec!["scope-out".to_string()]);
            assert_eq!(from, "Draft");
            assert_eq!(to, "Review");
        }
        other => panic!("expected GateViolation, got {other:?}"),
    }
    let stored = load_requirement(&store, &doc.id).unwrap();
    assert_eq!(stored.status, Status::Draft);
    assert_eq!(stored.version, before);
}

#[test]
fn approval_needs_every_gate() {
    let (_tmp, store) = test_store();
    let mut doc = advance(&store, &filled(&store, "Gates"), Status::Review).unwrap();
    doc = approve_gate(&store, &doc, Gate::ProblemApproved).unwrap();
    let err = advance(&store, &doc, Status::Approved).unwrap_err();
    match err {
        MembankError::GateViolation { unmet, .. } => assert_eq!(
            unmet,
            vec![
                "requirements-approved".to_string(),
                "approach-approved".to_string(),
                "ready-for-implementation".to_string()
            ]
        ),
        other => panic!("expected GateViolation, got {other:?}"),
    }
}

#[test]
fn approving_a_checked_gate_writes_nothing() {
    let (_tmp, store) = test_store();
    let doc = create_requirement(&store, "Idem").unwrap();
    let once = approve_gate(&store, &doc, Gate::ProblemApproved).unwrap();
    let twice = approve_gate(&store, &once, Gate::ProblemApproved).unwrap();
    assert_eq!(once.version, twice.version);
    assert_eq!(load_requirement(&store, "idem").unwrap().version, once.version);
}

#[test]
fn start_implementation_only_from_approved() {
    let (_tmp, store) = test_store();
    let review = advance(&store, &filled(&store, "Early"), Status::Review).unwrap();
    assert!(matches!(
        start_implementation(&store, &review),
        Err(MembankError::GateViolation { .. })
    ));

    let doc = approved(&store, "Ready");
    assert!(validate(&doc).is_empty());
    let started = start_implementation(&store, &doc).unwrap();
    assert_eq!(started.status, Status::InProgress);

    let progress = decide::query(&store, Some(DecisionKind::Progress), None).unwrap();
    assert_eq!(progress.len(), 1);
    assert_eq!(progress[0].ref_doc.as_deref(), Some("ready"));
}

#[test]
fn in_progress_is_unreachable_from_draft() {
    let (_tmp, store) = test_store();
    let doc = filled(&store, "Skip");
    let err = advance(&store, &doc, Status::InProgress).unwrap_err();
    assert!(matches!(err, MembankError::GateViolation { .. }));
}

#[test]
fn sections_are_frozen_after_approval() {
    let (_tmp, store) = test_store();
    let doc = approved(&store, "Frozen");
    let err = set_section(&store, &doc, SectionKey::Goal, "changed").unwrap_err();
    assert!(matches!(err, MembankError::GateViolation { .. }));
    let err = approve_gate(&store, &doc, Gate::ProblemApproved).unwrap_err();
    assert!(matches!(err, MembankError::GateViolation { .. }));
}

#[test]
fn reopen_clears_only_the_ready_gate() {
    let (_tmp, store) = test_store();
    let doc = start_implementation(&store, &approved(&store, "Reopen")).unwrap();
    let reopened = reopen(&store, &doc, "scope changed").unwrap();
    assert_eq!(reopened.status, Status::Review);
    assert!(!reopened.checklist.ready_for_implementation);
    assert!(reopened.checklist.problem_approved);
    assert!(reopened.checklist.requirements_approved);
    assert!(reopened.checklist.approach_approved);

    let decisions = decide::query(&store, Some(DecisionKind::Decision), None).unwrap();
    assert_eq!(decisions.len(), 1);
    assert!(decisions[0].content.contains("scope changed"));

    let again = approve_gate(&store, &reopened, Gate::ReadyForImplementation).unwrap();
    assert_eq!(advance(&store, &again, Status::Approved).unwrap().status, Status::Approved);
}

#[test]
fn completed_reopen_follows_config() {
    let (_tmp, store) = test_store();
    let doc = start_implementation(&store, &approved(&store, "Done")).unwrap();
    let done = complete(&store, &doc).unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(
        decide::query(&store, Some(DecisionKind::Completion), None).unwrap().len(),
        1
    );
    assert!(matches!(
        reopen(&store, &done, "regression"),
        Err(MembankError::GateViolation { .. })
    ));

    let mut config = MembankConfig::default();
    config.lifecycle.allow_completed_reopen = true;
    let permissive = Store::with_config(&store.root, config);
    let reopened = reopen(&permissive, &done, "regression").unwrap();
    assert_eq!(reopened.status, Status::Review);
}

#[test]
fn stale_copy_cannot_overwrite() {
    let (_tmp, store) = test_store();
    let doc = create_requirement(&store, "Race").unwrap();
    let copy = doc.clone();
    set_section(&store, &doc, SectionKey::Goal, "first writer").unwrap();
    let err = set_section(&store, &copy, SectionKey::Goal, "second writer").unwrap_err();
    match err {
        MembankError::Conflict { expected, actual, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected Conflict, got {other:?}"),
    }
    let stored = load_requirement(&store, "race").unwrap();
    assert_eq!(stored.section(SectionKey::Goal), Some("first writer"));
}

#[test]
fn listing_orders_by_update_and_reports_corrupted_files() {
    let (_tmp, store) = test_store();
    create_requirement(&store, "Alpha").unwrap();
    std::thread::sleep(Duration::from_millis(5));
    let beta = create_requirement(&store, "Beta").unwrap();
    std::thread::sleep(Duration::from_millis(5));
    fs::write(store.root.join("requirements/broken.md"), "not a requirement").unwrap();

    let listing = list_requirements(&store).unwrap();
    let ids: Vec<&str> = listing.requirements.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["beta", "alpha"]);
    assert_eq!(listing.omitted.len(), 1);
    assert_eq!(listing.omitted[0].id, "broken");

    std::thread::sleep(Duration::from_millis(5));
    let alpha = load_requirement(&store, "alpha").unwrap();
    set_section(&store, &alpha, SectionKey::Goal, "touch").unwrap();
    let listing = list_requirements(&store).unwrap();
    assert_eq!(listing.requirements[0].id, "alpha");
    assert_eq!(listing.requirements[1].id, beta.id);
}

#[test]
fn transition_stands_when_decision_log_is_unwritable() {
    let (_tmp, store) = test_store();
    let doc = approved(&store, "Unlogged");
    let db_path = db::decisions_db_path(&store.root);
    let _ = fs::remove_file(&db_path);
    fs::create_dir_all(&db_path).unwrap();

    let started = start_implementation(&store, &doc).unwrap();
    assert_eq!(started.status, Status::InProgress);
    assert_eq!(started.version, doc.version + 1);
    let stored = load_requirement(&store, "unlogged").unwrap();
    assert_eq!(stored, started);

    let done = complete(&store, &stored).unwrap();
    assert_eq!(done.status, Status::Completed);
    assert_eq!(load_requirement(&store, "unlogged").unwrap().status, Status::Completed);
}
