use super::{authed, reply, require_student_access, Ctx, Outcome};
use crate::authz::{self, Operation};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::attendance as reconciler;
use crate::validate;
use serde_json::{json, Value};

/// Order matters: the caller's role is checked before any input, then the
/// whole batch is validated before anything is written.
fn attendance_record(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::RecordAttendance)?;
    let batch = validate::attendance_batch(params, ctx.today())?;
    let outcome = reconciler::record(ctx.conn, &ctx.caller, &batch, ctx.now)?;
    reply(
        format!("Attendance marked for {} students", outcome.count),
        json!(outcome),
    )
}

fn attendance_for_student(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let student_id = validate::required_str(params, "studentId")?;
    let from = match validate::optional_str(params, "from")? {
        Some(raw) => Some(validate::calendar_date("from", &raw)?),
        None => None,
    };
    let to = match validate::optional_str(params, "to")? {
        Some(raw) => Some(validate::calendar_date("to", &raw)?),
        None => None,
    };
    require_student_access(ctx, &student_id)?;

    let records = reconciler::for_student(ctx.conn, &student_id, from, to)?;
    let summary = reconciler::summarize(&records);
    reply(
        format!("{} attendance records", records.len()),
        json!({ "studentId": student_id, "records": records, "summary": summary }),
    )
}

fn attendance_for_date(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ViewRoster)?;
    let raw = validate::required_str(params, "date")?;
    let date = validate::calendar_date("date", &raw)?;
    let class_id = validate::optional_str(params, "classId")?;
    let records = reconciler::for_date(ctx.conn, date, class_id.as_deref())?;
    reply(
        format!("{} attendance records", records.len()),
        json!({ "date": date.format("%Y-%m-%d").to_string(), "records": records }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(authed(state, req, attendance_record)),
        "attendance.forStudent" => Some(authed(state, req, attendance_for_student)),
        "attendance.forDate" => Some(authed(state, req, attendance_for_date)),
        _ => None,
    }
}
