use super::{authed, reply, require_student_access, Ctx, Outcome};
use crate::authz::{self, Operation};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::results as reconciler;
use crate::validate;
use serde_json::{json, Value};

fn results_record(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::RecordResults)?;
    let entries = validate::results_batch(params)?;
    let outcome = reconciler::record(ctx.conn, &ctx.caller, &entries, ctx.now)?;
    let message = if outcome.count == 1 {
        "Result recorded".to_string()
    } else {
        format!("{} results recorded", outcome.count)
    };
    reply(message, json!(outcome))
}

fn results_for_student(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let student_id = validate::required_str(params, "studentId")?;
    require_student_access(ctx, &student_id)?;
    let view = reconciler::for_student(ctx.conn, &student_id)?;
    reply(format!("{} results", view.results.len()), json!(view))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.record" => Some(authed(state, req, results_record)),
        "results.forStudent" => Some(authed(state, req, results_for_student)),
        _ => None,
    }
}
