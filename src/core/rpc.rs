//! membank RPC interface
//!
//! Agents talk to membank with structured JSON messages: one [`RpcRequest`]
//! in, one [`RpcResponse`] out. Every response carries a receipt with input
//! and output hashes, the store paths the operation touched, and the
//! operations that make sense next.

use crate::core::error::{MembankError, ResultCode};
use crate::core::store::Store;
use crate::plugins::context::{self, Scale};
use crate::plugins::decide::{self, DecisionKind};
use crate::plugins::knowledge::{self, RecordName};
use crate::plugins::lifecycle;
use crate::plugins::planner;
use crate::plugins::requirement::{self, Status};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Digest;
use tracing::{debug, warn};

/// Standard RPC request envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcRequest {
    /// Operation to perform
    pub op: String,
    /// Operation parameters
    #[serde(default)]
    pub params: Value,
    /// Request ID for correlation
    #[serde(default = "default_request_id")]
    pub id: String,
}

pub fn default_request_id() -> String {
    ulid::Ulid::new().to_string()
}

/// Standard RPC response envelope
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcResponse {
    pub id: String,
    pub success: bool,
    pub code: ResultCode,
    pub receipt: Receipt,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub allowed_next_ops: Vec<AllowedOp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Receipt documenting what happened
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Receipt {
    pub op: String,
    /// Epoch seconds, `Z`-suffixed
    pub timestamp: String,
    /// Content hash of inputs
    pub inputs_hash: String,
    /// Content hash of outputs
    pub outputs_hash: String,
    /// Store-relative paths the operation wrote
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub touched_paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AllowedOp {
    pub op: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub required_params: Vec<String>,
}

fn next_op(op: &str, reason: &str, required: &[&str]) -> AllowedOp {
    AllowedOp {
        op: op.to_string(),
        reason: reason.to_string(),
        required_params: required.iter().map(|p| p.to_string()).collect(),
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RpcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

pub const OPS: &[&str] = &[
    "get_context",
    "create_requirement",
    "list_requirements",
    "show_requirement",
    "validate_requirement",
    "set_section",
    "approve_gate",
    "advance_requirement",
    "start_implementation",
    "reopen_requirement",
    "complete_requirement",
    "plan_work",
    "replan_work",
    "show_plan",
    "complete_segment",
    "record_decision",
    "query_decisions",
    "load_record",
    "save_record",
    "append_record",
];

fn hash_json<T: Serialize>(value: &T) -> String {
    format!(
        "{:x}",
        sha2::Sha256::digest(serde_json::to_string(value).unwrap_or_default())
    )
}

pub fn success_response(
    request_id: String,
    op: String,
    params: &Value,
    result: Value,
    touched_paths: Vec<String>,
    allowed_next_ops: Vec<AllowedOp>,
) -> RpcResponse {
    RpcResponse {
        id: request_id,
        success: true,
        code: ResultCode::Success,
        receipt: Receipt {
            op,
            timestamp: crate::core::time::now_epoch_z(),
            inputs_hash: hash_json(params),
            outputs_hash: hash_json(&result),
            touched_paths,
        },
        result: Some(result),
        allowed_next_ops,
        error: None,
    }
}

pub fn error_response(request_id: String, op: String, params: &Value, err: &MembankError) -> RpcResponse {
    let code = err.code();
    RpcResponse {
        id: request_id,
        success: false,
        code,
        receipt: Receipt {
            op,
            timestamp: crate::core::time::now_epoch_z(),
            inputs_hash: hash_json(params),
            outputs_hash: format!("{:x}", sha2::Sha256::digest("error")),
            touched_paths: vec![],
        },
        result: None,
        allowed_next_ops: recovery_ops(err),
        error: Some(RpcError {
            code: code.as_str().to_string(),
            message: err.to_string(),
            details: err.details(),
        }),
    }
}

fn recovery_ops(err: &MembankError) -> Vec<AllowedOp> {
    match err {
        MembankError::Conflict { id, .. } => vec![next_op(
            "show_requirement",
            &format!("reload '{id}' and retry with the current version"),
            &["id"],
        )],
        MembankError::GateViolation { .. } => vec![next_op(
            "validate_requirement",
            "inspect which sections or gates are still missing",
            &["id"],
        )],
        _ => vec![],
    }
}

// --- Parameter helpers ---

fn str_param<'a>(params: &'a Value, name: &str) -> Result<&'a str, MembankError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| MembankError::Invalid(vec![format!("missing string parameter '{name}'")]))
}

fn opt_str_param<'a>(params: &'a Value, name: &str) -> Option<&'a str> {
    params.get(name).and_then(Value::as_str)
}

fn parsed<T>(params: &Value, name: &str) -> Result<T, MembankError>
where
    T: std::str::FromStr<Err = MembankError>,
{
    str_param(params, name)?.parse()
}

fn opt_parsed<T>(params: &Value, name: &str) -> Result<Option<T>, MembankError>
where
    T: std::str::FromStr<Err = MembankError>,
{
    opt_str_param(params, name).map(str::parse).transpose()
}

fn opt_u64_param(params: &Value, name: &str) -> Result<Option<u64>, MembankError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            MembankError::Invalid(vec![format!("parameter '{name}' must be a non-negative integer")])
        }),
    }
}

/// Load the document and, when the caller supplies `version`, insist it is
/// still current so stale sessions get `Conflict` instead of silently
/// acting on newer state.
fn load_doc(store: &Store, params: &Value) -> Result<requirement::RequirementDocument, MembankError> {
    let id = str_param(params, "id")?;
    let doc = requirement::load_requirement(store, id)?;
    if let Some(expected) = opt_u64_param(params, "version")? {
        if expected != doc.version {
            return Err(MembankError::Conflict {
                id: doc.id,
                expected,
                actual: doc.version,
            });
        }
    }
    Ok(doc)
}

fn doc_next_ops(status: Status) -> Vec<AllowedOp> {
    match status {
        Status::Draft => vec![
            next_op("set_section", "fill the missing sections", &["id", "section", "body"]),
            next_op("advance_requirement", "submit for review once complete", &["id", "to"]),
        ],
        Status::Review => vec![
            next_op("approve_gate", "check the approval gates", &["id", "gate"]),
            next_op("advance_requirement", "approve once every gate is checked", &["id", "to"]),
        ],
        Status::Approved => vec![
            next_op("plan_work", "derive the work plan", &["id"]),
            next_op("start_implementation", "begin implementation", &["id"]),
        ],
        Status::InProgress => vec![
            next_op("show_plan", "pick the next segment", &["id"]),
            next_op("complete_requirement", "close out when done", &["id"]),
        ],
        Status::Completed => vec![],
    }
}

type Outcome = (Value, Vec<String>, Vec<AllowedOp>);

fn doc_outcome(doc: &requirement::RequirementDocument) -> Result<Outcome, MembankError> {
    Ok((
        serde_json::to_value(doc)?,
        vec![requirement::rel_path(&doc.id)],
        doc_next_ops(doc.status),
    ))
}

fn execute(store: &Store, op: &str, params: &Value) -> Result<Outcome, MembankError> {
    match op {
        "get_context" => {
            let scale = opt_parsed::<Scale>(params, "scale")?.unwrap_or_default();
            let text = context::condense(store, opt_str_param(params, "focus"), scale);
            Ok((serde_json::json!({ "context": text }), vec![], vec![]))
        }
        "create_requirement" => {
            let doc = lifecycle::create_requirement(store, str_param(params, "title")?)?;
            doc_outcome(&doc)
        }
        "list_requirements" => {
            let listing = requirement::list_requirements(store)?;
            Ok((serde_json::to_value(listing)?, vec![], vec![]))
        }
        "show_requirement" => {
            let doc = load_doc(store, params)?;
            let next = doc_next_ops(doc.status);
            Ok((serde_json::to_value(&doc)?, vec![], next))
        }
        "validate_requirement" => {
            let doc = load_doc(store, params)?;
            let report = lifecycle::validate(&doc);
            let result = serde_json::json!({
                "id": doc.id,
                "status": doc.status,
                "version": doc.version,
                "missing_sections": report.missing_sections,
                "unmet_gates": report.unmet_gates,
                "complete": report.is_empty(),
            });
            Ok((result, vec![], doc_next_ops(doc.status)))
        }
        "set_section" => {
            let doc = load_doc(store, params)?;
            let saved = lifecycle::set_section(
                store,
                &doc,
                parsed(params, "section")?,
                str_param(params, "body")?,
            )?;
            doc_outcome(&saved)
        }
        "approve_gate" => {
            let doc = load_doc(store, params)?;
            let saved = lifecycle::approve_gate(store, &doc, parsed(params, "gate")?)?;
            doc_outcome(&saved)
        }
        "advance_requirement" => {
            let doc = load_doc(store, params)?;
            let saved = lifecycle::advance(store, &doc, parsed(params, "to")?)?;
            doc_outcome(&saved)
        }
        "start_implementation" => {
            let doc = load_doc(store, params)?;
            doc_outcome(&lifecycle::start_implementation(store, &doc)?)
        }
        "reopen_requirement" => {
            let doc = load_doc(store, params)?;
            let reason = opt_str_param(params, "reason").unwrap_or_default();
            doc_outcome(&lifecycle::reopen(store, &doc, reason)?)
        }
        "complete_requirement" => {
            let doc = load_doc(store, params)?;
            doc_outcome(&lifecycle::complete(store, &doc)?)
        }
        "plan_work" | "replan_work" => {
            let doc = load_doc(store, params)?;
            let plan = if op == "plan_work" {
                planner::plan(store, &doc)?
            } else {
                planner::replan(store, &doc)?
            };
            let result = serde_json::json!({
                "plan": plan,
                "progress": planner::progress(&plan),
                "timeline": planner::timeline(&plan),
                "next": planner::next_available(&plan),
            });
            Ok((
                result,
                vec![planner::rel_path(&doc.id)],
                vec![next_op("complete_segment", "mark finished segments", &["id", "segment"])],
            ))
        }
        "show_plan" => {
            let plan = planner::load_plan(store, str_param(params, "id")?)?;
            let result = serde_json::json!({
                "plan": plan,
                "progress": planner::progress(&plan),
                "timeline": planner::timeline(&plan),
                "next": planner::next_available(&plan),
            });
            Ok((result, vec![], vec![]))
        }
        "complete_segment" => {
            let id = str_param(params, "id")?;
            let plan = planner::load_plan(store, id)?;
            if let Some(expected) = opt_u64_param(params, "version")? {
                if expected != plan.version {
                    return Err(MembankError::Conflict {
                        id: id.to_string(),
                        expected,
                        actual: plan.version,
                    });
                }
            }
            let saved = planner::complete_segment(store, &plan, str_param(params, "segment")?)?;
            let result = serde_json::json!({
                "plan": saved,
                "progress": planner::progress(&saved),
                "next": planner::next_available(&saved),
            });
            Ok((result, vec![planner::rel_path(id)], vec![]))
        }
        "record_decision" => {
            let kind = opt_parsed::<DecisionKind>(params, "kind")?.unwrap_or(DecisionKind::Decision);
            let entry = decide::record(
                store,
                kind,
                str_param(params, "content")?,
                opt_str_param(params, "ref"),
                opt_str_param(params, "actor").unwrap_or("agent"),
            )?;
            Ok((serde_json::to_value(entry)?, vec![crate::core::schemas::DECISIONS_DB_NAME.to_string()], vec![]))
        }
        "query_decisions" => {
            let entries = match opt_u64_param(params, "last")? {
                Some(n) => decide::recent(store, n as usize)?,
                None => decide::query(
                    store,
                    opt_parsed::<DecisionKind>(params, "kind")?,
                    opt_u64_param(params, "since")?,
                )?,
            };
            Ok((serde_json::to_value(entries)?, vec![], vec![]))
        }
        "load_record" => {
            let name: RecordName = parsed(params, "name")?;
            let body = knowledge::load_record(store, name)?;
            Ok((serde_json::json!({ "name": name, "content": body }), vec![], vec![]))
        }
        "save_record" | "append_record" => {
            let name: RecordName = parsed(params, "name")?;
            let content = str_param(params, "content")?;
            if op == "save_record" {
                knowledge::save_record(store, name, content)?;
            } else {
                knowledge::append_record(store, name, content)?;
            }
            Ok((serde_json::json!({ "name": name }), vec![name.rel_path()], vec![]))
        }
        other => Err(MembankError::Invalid(vec![format!(
            "unknown op '{other}' (expected one of: {})",
            OPS.join(", ")
        )])),
    }
}

/// Run one request against the store. Never fails: errors become envelopes.
pub fn dispatch(store: &Store, request: &RpcRequest) -> RpcResponse {
    debug!(op = %request.op, id = %request.id, "rpc");
    match execute(store, &request.op, &request.params) {
        Ok((result, touched, next)) => success_response(
            request.id.clone(),
            request.op.clone(),
            &request.params,
            result,
            touched,
            next,
        ),
        Err(err) => {
            warn!(op = %request.op, code = err.code().as_str(), error = %err, "rpc failed");
            error_response(request.id.clone(), request.op.clone(), &request.params, &err)
        }
    }
}

pub fn schema() -> Value {
    serde_json::json!({
        "name": "rpc",
        "version": "0.3.0",
        "description": "JSON request/response surface over every store operation",
        "ops": OPS,
        "result_codes": ["SUCCESS", "NOT_FOUND", "CORRUPTED", "INVALID", "GATE_VIOLATION", "CONFLICT", "CYCLE_ERROR", "INTERNAL"]
    })
}
