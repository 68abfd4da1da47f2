//! membank: local-first project memory for agent sessions.
//!
//! A project's `.membank/` directory holds named knowledge records, requirement
//! documents that move through a gated lifecycle, dependency-ordered work
//! plans derived from approved requirements, and an append-only decision log.
//! Sessions start by asking for a condensed context and end by recording what
//! they decided.
//!
//! # Layout
//!
//! ```text
//! .membank/
//!   config.toml
//!   data/
//!     knowledge/<name>.md
//!     requirements/<id>.md
//!     plans/<id>.json
//!     decisions.db
//!     broker.events.jsonl
//! ```
//!
//! # Concurrency
//!
//! Several sessions may share one store. Requirement and plan writes carry the
//! version they were read at and fail with `Conflict` when someone else got
//! there first; the caller reloads and retries.
//!
//! # Examples
//!
//! ```bash
//! membank init
//! membank req new --title "User login"
//! membank req set user-login --section problem --body "Users cannot sign in"
//! membank context --focus api --scale small
//! echo '{"op":"validate_requirement","params":{"id":"user-login"}}' | membank rpc
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store seam, config, errors, SQLite broker, RPC
//! - [`plugins`]: knowledge, requirement, lifecycle, planner, decide, context

pub mod core;
pub mod plugins;

use crate::core::{
    db,
    error::MembankError,
    rpc,
    store::{self, Store},
    time,
};
use crate::plugins::{context, decide, knowledge, lifecycle, planner};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    name = "membank",
    version = env!("CARGO_PKG_VERSION"),
    about = "Project memory, gated requirements and work plans for agent sessions"
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[clap(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Project directory (defaults to the nearest ancestor containing .membank)
    #[clap(long, global = true)]
    pub project: Option<PathBuf>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create .membank/ with a default config
    #[clap(name = "init")]
    Init,

    /// Print the condensed session context
    #[clap(name = "context", visible_alias = "ctx")]
    Context(context::ContextCli),

    /// Requirement documents and their lifecycle
    #[clap(name = "req", visible_alias = "r")]
    Req(lifecycle::RequirementCli),

    /// Work plans for approved requirements
    #[clap(name = "plan", visible_alias = "p")]
    Plan(planner::PlanCli),

    /// Decision log
    #[clap(name = "decision", visible_alias = "d")]
    Decision(decide::DecisionCli),

    /// Knowledge records
    #[clap(name = "knowledge", visible_alias = "k")]
    Knowledge(knowledge::KnowledgeCli),

    /// Run one JSON request (from --op/--params or stdin)
    #[clap(name = "rpc")]
    Rpc(RpcCli),

    /// Print the JSON schema of every subsystem
    #[clap(name = "schema")]
    Schema,
}

#[derive(clap::Args, Debug)]
pub struct RpcCli {
    /// Operation name; when absent a full request is read from stdin
    #[clap(long)]
    pub op: Option<String>,
    /// JSON parameters for --op
    #[clap(long)]
    pub params: Option<String>,
}

fn project_root(explicit: Option<&Path>) -> Result<PathBuf, MembankError> {
    match explicit {
        Some(dir) => Ok(dir.to_path_buf()),
        None => store::find_project_root(&std::env::current_dir()?),
    }
}

/// Store for read paths that degrade gracefully when no store exists yet.
fn open_or_empty(explicit: Option<&Path>) -> Result<Store, MembankError> {
    match project_root(explicit) {
        Ok(root) => Store::open(&root),
        Err(MembankError::NotFound(_)) => {
            let cwd = std::env::current_dir()?;
            Ok(Store::at(&cwd.join(store::PROJECT_DIR).join(store::DATA_DIR)))
        }
        Err(e) => Err(e),
    }
}

fn read_request(cli: RpcCli) -> Result<rpc::RpcRequest, MembankError> {
    match cli.op {
        Some(op) => {
            let params = match cli.params {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                    MembankError::Invalid(vec![format!("--params is not valid JSON: {e}")])
                })?,
                None => serde_json::Value::Null,
            };
            Ok(rpc::RpcRequest {
                op,
                params,
                id: rpc::default_request_id(),
            })
        }
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            serde_json::from_str(&raw)
                .map_err(|e| MembankError::Invalid(vec![format!("request is not valid JSON: {e}")]))
        }
    }
}

pub fn schemas() -> serde_json::Value {
    serde_json::json!({
        "name": "membank",
        "version": env!("CARGO_PKG_VERSION"),
        "subsystems": [
            knowledge::schema(),
            lifecycle::schema(),
            planner::schema(),
            decide::schema(),
            context::schema(),
            rpc::schema(),
            crate::core::broker::schema(),
        ]
    })
}

pub fn run(cli: Cli) -> Result<(), MembankError> {
    let explicit = cli.project.as_deref();
    match cli.command {
        Command::Init => {
            let root = match explicit {
                Some(dir) => dir.to_path_buf(),
                None => std::env::current_dir()?,
            };
            let store = store::init_project(&root)?;
            db::initialize_decisions_db(&store.root)?;
            eprintln!(
                "{} {}",
                "membank initialized at".green().bold(),
                store.root.display().to_string().bright_white()
            );
            let envelope = time::command_envelope(
                "init",
                "ok",
                serde_json::json!({ "root": store.root.display().to_string() }),
            );
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        Command::Context(ctx) => {
            context::run_context_cli(&open_or_empty(explicit)?, ctx)?;
        }
        Command::Req(req) => {
            let store = Store::open(&project_root(explicit)?)?;
            lifecycle::run_requirement_cli(&store, req)?;
        }
        Command::Plan(plan) => {
            let store = Store::open(&project_root(explicit)?)?;
            planner::run_plan_cli(&store, plan)?;
        }
        Command::Decision(decision) => {
            let store = Store::open(&project_root(explicit)?)?;
            decide::run_decision_cli(&store, decision)?;
        }
        Command::Knowledge(k) => {
            let store = Store::open(&project_root(explicit)?)?;
            knowledge::run_knowledge_cli(&store, k)?;
        }
        Command::Rpc(rpc_cli) => {
            let request = read_request(rpc_cli)?;
            let store = if request.op == "get_context" {
                open_or_empty(explicit)?
            } else {
                Store::open(&project_root(explicit)?)?
            };
            let response = rpc::dispatch(&store, &request);
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Schema => {
            println!("{}", serde_json::to_string_pretty(&schemas())?);
        }
    }
    Ok(())
}
