//! Core modules for membank: storage seam, configuration, error taxonomy,
//! the SQLite broker and the RPC surface.
//!
//! Everything the plugins share lives here.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod rpc;
pub mod schemas;
pub mod store;
pub mod time;
