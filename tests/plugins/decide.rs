use membank::core::db;
use membank::core::error::MembankError;
use membank::core::store::{self, Store};
use membank::core::time;
use membank::plugins::decide::{DecisionKind, count, query, recent, record};
use std::sync::{Arc, Barrier};
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = store::init_project(tmp.path()).unwrap();
    (tmp, store)
}

#[test]
fn entries_come_back_in_append_order() {
    let (_tmp, store) = test_store();
    record(&store, DecisionKind::Decision, "Use SQLite", None, "alice").unwrap();
    record(&store, DecisionKind::Progress, "Schema done", Some("storage"), "bob").unwrap();
    record(&store, DecisionKind::Blocker, "CI is red", None, "alice").unwrap();

    let all = query(&store, None, None).unwrap();
    let contents: Vec<&str> = all.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["Use SQLite", "Schema done", "CI is red"]);
    assert!(all.windows(2).all(|w| w[0].seq < w[1].seq && w[0].ts <= w[1].ts));
    assert!(all.iter().all(|e| e.id.starts_with("DE_")));
    assert_eq!(all[1].ref_doc.as_deref(), Some("storage"));
}

#[test]
fn query_filters_by_kind_and_since() {
    let (_tmp, store) = test_store();
    let first = record(&store, DecisionKind::Decision, "one", None, "t").unwrap();
    record(&store, DecisionKind::Progress, "two", None, "t").unwrap();
    let third = record(&store, DecisionKind::Decision, "three", None, "t").unwrap();

    let decisions = query(&store, Some(DecisionKind::Decision), None).unwrap();
    assert_eq!(decisions.len(), 2);
    assert_eq!(decisions[0].id, first.id);
    assert_eq!(decisions[1].id, third.id);

    let later = query(&store, None, Some(third.ts + 1)).unwrap();
    assert!(later.is_empty());
    let from_first = query(&store, None, Some(first.ts)).unwrap();
    assert_eq!(from_first.len(), 3);
}

#[test]
fn recent_returns_tail_oldest_first() {
    let (_tmp, store) = test_store();
    for i in 0..6 {
        record(&store, DecisionKind::Decision, &format!("d{i}"), None, "t").unwrap();
    }
    let tail = recent(&store, 3).unwrap();
    let contents: Vec<&str> = tail.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["d3", "d4", "d5"]);
    assert_eq!(recent(&store, 100).unwrap().len(), 6);
    assert!(recent(&store, 0).unwrap().is_empty());
}

#[test]
fn log_rejects_update_and_delete() {
    let (_tmp, store) = test_store();
    record(&store, DecisionKind::Decision, "immutable", None, "t").unwrap();

    let conn = db::db_connect(&db::decisions_db_path(&store.root).to_string_lossy()).unwrap();
    let update = conn.execute("UPDATE decisions SET content = 'edited'", []);
    assert!(update.is_err());
    let delete = conn.execute("DELETE FROM decisions", []);
    assert!(delete.is_err());

    let all = query(&store, None, None).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].content, "immutable");
}

#[test]
fn blank_content_is_rejected() {
    let (_tmp, store) = test_store();
    let err = record(&store, DecisionKind::Completion, "\n\t", None, "t").unwrap_err();
    assert!(matches!(err, MembankError::Invalid(_)));
    assert_eq!(count(&store).unwrap(), 0);
}

#[test]
fn parallel_sessions_append_without_loss() {
    let (_tmp, store) = test_store();
    let store = Arc::new(store);
    let threads = 6;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for j in 0..4 {
                    record(&store, DecisionKind::Progress, &format!("s{i}-{j}"), None, "t").unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let all = query(&store, None, None).unwrap();
    assert_eq!(all.len(), threads * 4);
    assert!(all.windows(2).all(|w| w[0].ts <= w[1].ts));
}

#[test]
fn timestamps_never_precede_the_latest_entry() {
    let (_tmp, store) = test_store();
    record(&store, DecisionKind::Decision, "seed", None, "t").unwrap();
    let ahead = time::now_epoch_ms() + 3_600_000;
    let conn = db::db_connect(&db::decisions_db_path(&store.root).to_string_lossy()).unwrap();
    conn.execute(
        "INSERT INTO decisions(id, ts_ms, kind, content, actor) VALUES ('DE_future', ?1, 'decision', 'from a fast clock', 'other')",
        [ahead as i64],
    )
    .unwrap();
    drop(conn);

    let entry = record(&store, DecisionKind::Progress, "after skew", None, "t").unwrap();
    assert!(entry.ts >= ahead);
    let all = query(&store, None, None).unwrap();
    assert!(all.windows(2).all(|w| w[0].ts <= w[1].ts));
}

#[test]
fn since_beyond_any_timestamp_matches_nothing() {
    let (_tmp, store) = test_store();
    record(&store, DecisionKind::Decision, "only", None, "t").unwrap();
    assert!(query(&store, None, Some(u64::MAX)).unwrap().is_empty());
    assert!(query(&store, None, Some(i64::MAX as u64 + 1)).unwrap().is_empty());
    assert_eq!(query(&store, None, Some(0)).unwrap().len(), 1);
}
