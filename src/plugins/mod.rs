//! Subsystems built on the core store.
//!
//! - `knowledge`: named free-text project records
//! - `requirement`: requirement documents and their markdown format
//! - `lifecycle`: gated status transitions for requirements
//! - `planner`: dependency-ordered work plans
//! - `decide`: append-only decision log
//! - `context`: budgeted session summary

pub mod context;
pub mod decide;
pub mod knowledge;
pub mod lifecycle;
pub mod planner;
pub mod requirement;
