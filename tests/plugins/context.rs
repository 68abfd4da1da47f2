use membank::core::config::{BudgetUnit, MembankConfig};
use membank::core::store::{self, Store};
use membank::plugins::context::{BOOTSTRAP_MARKER, Scale, condense, measure};
use membank::plugins::decide::{self, DecisionKind};
use membank::plugins::knowledge::{RecordName, save_record};
use membank::plugins::lifecycle::{advance, approve_gate, create_requirement, set_section};
use membank::plugins::requirement::{Gate, SectionKey, Status};
use std::fs;
use tempfile::tempdir;

fn test_store() -> (tempfile::TempDir, Store) {
    let tmp = tempdir().unwrap();
    let store = store::init_project(tmp.path()).unwrap();
    (tmp, store)
}

fn with_budget(store: &Store, budget: usize, unit: BudgetUnit) -> Store {
    let mut config = MembankConfig::default();
    config.condenser.budget = budget;
    config.condenser.budget_unit = unit;
    Store::with_config(&store.root, config)
}

fn populate(store: &Store) {
    save_record(
        store,
        RecordName::Overview,
        "# Overview\nInvoice tracker for small agencies.\nRust CLI with a SQLite backend.\n",
    )
    .unwrap();
    save_record(store, RecordName::ActiveFocus, "Wiring the REST api for invoices\n").unwrap();
    save_record(
        store,
        RecordName::Patterns,
        "# Patterns\nHandlers return Result and never panic.\nEvery endpoint is versioned under /v1.\n",
    )
    .unwrap();
    for i in 0..12 {
        decide::record(
            store,
            DecisionKind::Decision,
            &format!("Decision number {i} about the invoice pipeline"),
            None,
            "t",
        )
        .unwrap();
    }
}

fn approve(store: &Store, title: &str) {
    let mut doc = create_requirement(store, title).unwrap();
    for key in SectionKey::ALL {
        doc = set_section(store, &doc, key, &format!("{title} {}", key.key())).unwrap();
    }
    doc = advance(store, &doc, Status::Review).unwrap();
    for gate in Gate::ALL {
        doc = approve_gate(store, &doc, gate).unwrap();
    }
    advance(store, &doc, Status::Approved).unwrap();
}

#[test]
fn missing_store_yields_bootstrap_guidance() {
    let tmp = tempdir().unwrap();
    let store = Store::at(&tmp.path().join(".membank/data"));
    let out = condense(&store, None, Scale::Medium);
    assert!(out.contains(BOOTSTRAP_MARKER));
    assert!(out.contains("overview"));
    assert!(!tmp.path().join(".membank").exists());
}

#[test]
fn empty_store_yields_bootstrap_guidance() {
    let (_tmp, store) = test_store();
    let out = condense(&store, Some("api"), Scale::Small);
    assert!(out.contains(BOOTSTRAP_MARKER));
}

#[test]
fn same_store_same_output() {
    let (_tmp, store) = test_store();
    populate(&store);
    approve(&store, "Export invoices");
    let first = condense(&store, Some("api"), Scale::Large);
    let second = condense(&store, Some("api"), Scale::Large);
    assert_eq!(first, second);
    assert!(first.starts_with("# Project Context\nFocus: api | Scale: large\n"));
}

#[test]
fn output_fits_byte_budget_and_keeps_overview() {
    let (_tmp, store) = test_store();
    populate(&store);
    let tight = with_budget(&store, 420, BudgetUnit::Bytes);
    let out = condense(&tight, None, Scale::Large);
    assert!(out.len() <= 420, "{} bytes:\n{out}", out.len());
    assert!(out.contains("## Project Overview"));
    assert!(out.contains("Invoice tracker for small agencies."));
    assert!(!out.contains("Decision number 11"));

    let roomy = condense(&store, None, Scale::Large);
    assert!(roomy.contains("Decision number 11"));
}

#[test]
fn output_fits_token_budget() {
    let (_tmp, store) = test_store();
    populate(&store);
    approve(&store, "Export invoices");
    let tight = with_budget(&store, 120, BudgetUnit::Tokens);
    let out = condense(&tight, Some("api"), Scale::Large);
    assert!(measure(&out, BudgetUnit::Tokens) <= 120);
    assert!(out.starts_with("# Project Context"));
}

#[test]
fn scale_controls_decision_window() {
    let (_tmp, store) = test_store();
    populate(&store);
    let small = condense(&store, None, Scale::Small);
    assert!(small.contains("Decision number 11"));
    assert!(small.contains("Decision number 9"));
    assert!(!small.contains("Decision number 8"));
    assert!(small.contains("Decisions: 12"));
}

#[test]
fn unreadable_record_is_noted_not_fatal() {
    let (_tmp, store) = test_store();
    populate(&store);
    fs::write(store.root.join("knowledge/environment.md"), [0xc3, 0x28]).unwrap();
    let out = condense(&store, None, Scale::Medium);
    assert!(out.contains("Omitted: knowledge record 'environment'"));
    assert!(out.contains("## Project Overview"));
}

#[test]
fn known_focus_adds_a_section() {
    let (_tmp, store) = test_store();
    populate(&store);
    let api = condense(&store, Some("api"), Scale::Medium);
    assert!(api.contains("## Focus: api"));
    assert!(api.contains("Wiring the REST api for invoices"));

    let unknown = condense(&store, Some("astrology"), Scale::Medium);
    assert!(!unknown.contains("## Focus:"));
    assert!(unknown.contains("Focus: astrology | Scale: medium"));
}

#[test]
fn only_active_requirements_are_summarised() {
    let (_tmp, store) = test_store();
    populate(&store);
    approve(&store, "Export invoices");
    create_requirement(&store, "Dark mode").unwrap();
    let out = condense(&store, None, Scale::Medium);
    assert!(out.contains("## Requirement Summaries"));
    assert!(out.contains("- Export invoices (export-invoices) [Approved, v"));
    assert!(out.contains("Goal: Export invoices goal"));
    assert!(!out.contains("(dark-mode)"));
    assert!(out.contains("1 Draft, 0 Review, 1 Approved"));
}
