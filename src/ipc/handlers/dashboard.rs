use super::{authed, reply, Ctx, Outcome};
use crate::authz::{self, Operation, Role};
use crate::error::{ServiceResult, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::reconcile::{attendance, results};
use rusqlite::Connection;
use serde_json::{json, Value};

const AUDIT_DEFAULT_LIMIT: i64 = 100;
const AUDIT_MAX_LIMIT: i64 = 500;

fn count(conn: &Connection, sql: &str, arg: Option<&str>) -> ServiceResult<i64> {
    let n = match arg {
        Some(a) => conn.query_row(sql, [a], |r| r.get(0))?,
        None => conn.query_row(sql, [], |r| r.get(0))?,
    };
    Ok(n)
}

fn admin_summary(ctx: &Ctx<'_>) -> ServiceResult<Value> {
    Ok(json!({
        "students": count(ctx.conn, "SELECT COUNT(*) FROM students", None)?,
        "staff": count(ctx.conn, "SELECT COUNT(*) FROM staff", None)?,
        "classes": count(ctx.conn, "SELECT COUNT(*) FROM classes", None)?,
        "announcements": count(ctx.conn, "SELECT COUNT(*) FROM announcements", None)?,
    }))
}

fn teacher_summary(ctx: &Ctx<'_>) -> ServiceResult<Value> {
    let today = ctx.today().format("%Y-%m-%d").to_string();
    let marked_today: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM attendance WHERE recorded_by = ? AND date = ?",
        (ctx.actor(), &today),
        |r| r.get(0),
    )?;
    Ok(json!({
        "classes": count(
            ctx.conn,
            "SELECT COUNT(*) FROM classes WHERE teacher_id = ?",
            Some(ctx.actor()),
        )?,
        "students": count(
            ctx.conn,
            "SELECT COUNT(*) FROM students s
             JOIN classes c ON c.id = s.class_id
             WHERE c.teacher_id = ?",
            Some(ctx.actor()),
        )?,
        "attendanceMarkedToday": marked_today,
    }))
}

fn student_summary(conn: &Connection, student_id: &str) -> ServiceResult<Value> {
    let records = attendance::for_student(conn, student_id, None, None)?;
    let summary = attendance::summarize(&records);
    let view = results::for_student(conn, student_id)?;
    Ok(json!({
        "attendanceRate": summary.rate,
        "attendanceRecords": summary.total,
        "results": view.results.len(),
        "average": view.average,
        "overallGrade": view.overall_grade,
    }))
}

fn parent_summary(ctx: &Ctx<'_>) -> ServiceResult<Value> {
    let mut stmt = ctx.conn.prepare(
        "SELECT s.id, s.name
         FROM guardians g
         JOIN student_guardians sg ON sg.guardian_id = g.id
         JOIN students s ON s.id = sg.student_id
         WHERE g.user_id = ?
         ORDER BY s.name COLLATE NOCASE",
    )?;
    let kids = stmt
        .query_map([ctx.actor()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut children = Vec::with_capacity(kids.len());
    for (id, name) in kids {
        let mut entry = student_summary(ctx.conn, &id)?;
        entry["id"] = json!(id);
        entry["name"] = json!(name);
        children.push(entry);
    }
    Ok(json!({ "children": children }))
}

/// One section per role the caller holds.
fn dashboard_summary(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    let mut data = json!({ "roles": ctx.caller.role_names() });
    if ctx.caller.has(Role::Admin) {
        data["admin"] = admin_summary(ctx)?;
    }
    if ctx.caller.has(Role::Teacher) {
        data["teacher"] = teacher_summary(ctx)?;
    }
    if ctx.caller.has(Role::Student) {
        data["student"] = student_summary(ctx.conn, ctx.actor())?;
    }
    if ctx.caller.has(Role::Parent) {
        data["parent"] = parent_summary(ctx)?;
    }
    reply("OK", data)
}

fn audit_list(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ViewAudit)?;
    let limit = match params.get("limit") {
        None | Some(Value::Null) => AUDIT_DEFAULT_LIMIT,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=AUDIT_MAX_LIMIT).contains(&n) => n,
            _ => {
                return Err(ValidationError::new(
                    "limit",
                    "limit_range",
                    format!("limit must be an integer from 1 to {}", AUDIT_MAX_LIMIT),
                )
                .into())
            }
        },
    };
    let mut stmt = ctx.conn.prepare(
        "SELECT id, actor, action, resource_type, resource_id, details, created_at
         FROM audit_logs
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?",
    )?;
    let entries = stmt
        .query_map([limit], |r| {
            let details: String = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "actor": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "resourceType": r.get::<_, String>(3)?,
                "resourceId": r.get::<_, Option<String>>(4)?,
                "details": serde_json::from_str::<Value>(&details).unwrap_or(Value::Null),
                "createdAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(
        format!("{} audit entries", entries.len()),
        json!({ "entries": entries }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.summary" => Some(authed(state, req, dashboard_summary)),
        "audit.list" => Some(authed(state, req, audit_list)),
        _ => None,
    }
}
