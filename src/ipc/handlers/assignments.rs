use super::{authed, class_exists, reply, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Operation, Role};
use crate::db;
use crate::error::{AuthorizationError, ServiceError, ServiceResult, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

/// Staff read any class. Students read their own class; guardians read the
/// classes of their linked children.
fn require_class_access(ctx: &Ctx<'_>, class_id: &str) -> ServiceResult<()> {
    if ctx.caller.is_staff() {
        return Ok(());
    }
    let member: Option<i64> = ctx
        .conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ?1 AND class_id = ?2
             UNION
             SELECT 1
             FROM guardians g
             JOIN student_guardians sg ON sg.guardian_id = g.id
             JOIN students s ON s.id = sg.student_id
             WHERE g.user_id = ?1 AND s.class_id = ?2
             LIMIT 1",
            (ctx.actor(), class_id),
            |r| r.get(0),
        )
        .optional()?;
    if member.is_none() {
        return Err(AuthorizationError {
            message: "You do not have access to this class".to_string(),
        }
        .into());
    }
    Ok(())
}

fn assignments_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::CreateAssignment)?;
    let class_id = validate::required_str(params, "classId")?;
    let title = validate::text("title", &validate::required_str(params, "title")?, 200)?;
    let description = match validate::optional_str(params, "description")? {
        Some(d) => Some(validate::text("description", &d, 5000)?),
        None => None,
    };
    let raw_due = validate::required_str(params, "dueDate")?;
    let due = validate::calendar_date("dueDate", &raw_due)?;
    if due < ctx.today() {
        return Err(ValidationError::new(
            "dueDate",
            "date_past",
            "Due date cannot be in the past",
        )
        .into());
    }
    if !class_exists(ctx.conn, &class_id)? {
        return Err(ServiceError::not_found("Class not found"));
    }

    let id = Uuid::new_v4().to_string();
    let due_date = due.format("%Y-%m-%d").to_string();
    ctx.conn.execute(
        "INSERT INTO assignments(id, class_id, title, description, due_date, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_id,
            &title,
            &description,
            &due_date,
            ctx.actor(),
            db::ts(ctx.now),
        ),
    )?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "assignment_created",
            resource_type: "assignment",
            resource_id: Some(&id),
            details: json!({ "classId": class_id, "dueDate": due_date }),
        },
        ctx.now,
    );
    reply(
        "Assignment created",
        json!({
            "assignment": {
                "id": id,
                "classId": class_id,
                "title": title,
                "description": description,
                "dueDate": due_date,
                "createdBy": ctx.actor(),
            }
        }),
    )
}

fn assignments_list(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let class_id = validate::required_str(params, "classId")?;
    require_class_access(ctx, &class_id)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT a.id, a.title, a.description, a.due_date, a.created_by, u.name, a.created_at
         FROM assignments a
         LEFT JOIN users u ON u.id = a.created_by
         WHERE a.class_id = ?
         ORDER BY a.due_date, a.title COLLATE NOCASE",
    )?;
    let assignments = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "dueDate": r.get::<_, String>(3)?,
                "createdBy": r.get::<_, String>(4)?,
                "teacherName": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(
        format!("{} assignments", assignments.len()),
        json!({ "classId": class_id, "assignments": assignments }),
    )
}

fn assignments_delete(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::CreateAssignment)?;
    let id = validate::required_str(params, "assignmentId")?;
    let owner: Option<String> = ctx
        .conn
        .query_row(
            "SELECT created_by FROM assignments WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(owner) = owner else {
        return Err(ServiceError::not_found("Assignment not found"));
    };
    if owner != ctx.caller.user_id && !ctx.caller.has(Role::Admin) {
        return Err(AuthorizationError {
            message: "Only the teacher who created this assignment can delete it".to_string(),
        }
        .into());
    }
    ctx.conn.execute("DELETE FROM assignments WHERE id = ?", [&id])?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "assignment_deleted",
            resource_type: "assignment",
            resource_id: Some(&id),
            details: json!({}),
        },
        ctx.now,
    );
    reply("Assignment deleted", json!({ "assignmentId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(authed(state, req, assignments_create)),
        "assignments.list" => Some(authed(state, req, assignments_list)),
        "assignments.delete" => Some(authed(state, req, assignments_delete)),
        _ => None,
    }
}
