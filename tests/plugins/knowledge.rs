use membank::core::error::MembankError;
use membank::core::store::{self, Store};
use membank::plugins::knowledge::{
    RecordName, append_record, load_record, record_statuses, save_record,
};
use std::fs;
use std::sync::{Arc, Barrier};
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = store::init_project(tmp.path()).unwrap();
    (tmp, store)
}

#[test]
fn save_then_load_returns_latest_body() {
    let (_tmp, store) = test_store();
    save_record(&store, RecordName::Overview, "# Overview\nA CLI for notes.\n").unwrap();
    save_record(&store, RecordName::Overview, "# Overview\nA CLI for tasks.\n").unwrap();
    assert_eq!(
        load_record(&store, RecordName::Overview).unwrap(),
        "# Overview\nA CLI for tasks.\n"
    );
}

#[test]
fn absent_record_is_not_found() {
    let (_tmp, store) = test_store();
    let err = load_record(&store, RecordName::Environment).unwrap_err();
    assert!(matches!(err, MembankError::NotFound(_)));
}

#[test]
fn records_live_under_knowledge_dir() {
    let (_tmp, store) = test_store();
    save_record(&store, RecordName::ActiveFocus, "auth").unwrap();
    let path = store.root.join("knowledge").join("active-focus.md");
    assert_eq!(fs::read_to_string(path).unwrap(), "auth");
}

#[test]
fn non_utf8_record_is_corrupted() {
    let (_tmp, store) = test_store();
    fs::write(store.root.join("knowledge/patterns.md"), [0xc3, 0x28]).unwrap();
    let err = load_record(&store, RecordName::Patterns).unwrap_err();
    assert!(matches!(err, MembankError::Corrupted { .. }));

    let statuses = record_statuses(&store);
    let patterns = statuses
        .iter()
        .find(|s| s.name == RecordName::Patterns)
        .unwrap();
    assert!(patterns.error.is_some());
}

#[test]
fn concurrent_appends_keep_every_line() {
    let (_tmp, store) = test_store();
    let store = Arc::new(store);
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for j in 0..5 {
                    append_record(&store, RecordName::Progress, &format!("t{i}-{j}")).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let body = load_record(&store, RecordName::Progress).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), threads * 5);
    for i in 0..threads {
        for j in 0..5 {
            assert!(lines.contains(&format!("t{i}-{j}").as_str()));
        }
    }
    assert!(!store.root.join(".locks/knowledge__progress.md.lock").exists());
}
