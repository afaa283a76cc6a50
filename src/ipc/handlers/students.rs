use super::auth::queue_verification;
use super::{authed, class_exists, reply, require_student_access, student_exists, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::auth;
use crate::authz::{self, Operation, Role};
use crate::db;
use crate::error::{ServiceError, ServiceResult, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::model::NewStudent;
use crate::validate::{self, IMPORT_BATCH_MAX};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

const STUDENT_COLUMNS: &str = "SELECT s.id, s.name, s.email, s.roll_number, s.class_id, c.name,
            s.guardian_id, s.created_at
     FROM students s
     LEFT JOIN classes c ON c.id = s.class_id";

fn student_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "rollNumber": r.get::<_, String>(3)?,
        "classId": r.get::<_, Option<String>>(4)?,
        "className": r.get::<_, Option<String>>(5)?,
        "guardianId": r.get::<_, Option<String>>(6)?,
        "createdAt": r.get::<_, String>(7)?,
    }))
}

fn load_student(conn: &Connection, student_id: &str) -> ServiceResult<Option<Value>> {
    Ok(conn
        .query_row(
            &format!("{} WHERE s.id = ?", STUDENT_COLUMNS),
            [student_id],
            student_row,
        )
        .optional()?)
}

fn roll_taken(conn: &Connection, roll: &str, except: Option<&str>) -> ServiceResult<bool> {
    let other: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE roll_number = ?",
            [roll],
            |r| r.get(0),
        )
        .optional()?;
    Ok(matches!(other, Some(id) if Some(id.as_str()) != except))
}

/// Account, student row and optional guardian link in one transaction.
fn create_student(ctx: &Ctx<'_>, student: &NewStudent) -> ServiceResult<String> {
    if let Some(cid) = &student.class_id {
        if !class_exists(ctx.conn, cid)? {
            return Err(ServiceError::not_found("Class not found"));
        }
    }
    if let Some(gid) = &student.guardian_id {
        let found: Option<i64> = ctx
            .conn
            .query_row("SELECT 1 FROM guardians WHERE id = ?", [gid], |r| r.get(0))
            .optional()?;
        if found.is_none() {
            return Err(ServiceError::not_found("Guardian not found"));
        }
    }
    if roll_taken(ctx.conn, &student.roll_number, None)? {
        return Err(ServiceError::conflict(format!(
            "Roll number {} is already in use",
            student.roll_number
        )));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    let user_id = auth::create_account(&tx, &student.account, &[Role::Student], ctx.now)?;
    tx.execute(
        "INSERT INTO students(
            id, name, email, roll_number, class_id, guardian_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &student.account.name,
            &student.account.email,
            &student.roll_number,
            &student.class_id,
            &student.guardian_id,
            db::ts(ctx.now),
            db::ts(ctx.now),
        ),
    )?;
    if let Some(gid) = &student.guardian_id {
        tx.execute(
            "INSERT OR IGNORE INTO student_guardians(student_id, guardian_id, relationship)
             VALUES(?, ?, 'parent')",
            (&user_id, gid),
        )?;
    }
    tx.commit()?;

    if let Err(e) = queue_verification(
        ctx.conn,
        ctx.config,
        &ctx.outbox(),
        &user_id,
        &student.account.email,
        &student.account.name,
        ctx.now,
    ) {
        tracing::warn!(student = %user_id, error = %e, "verification email not queued");
    }
    Ok(user_id)
}

fn students_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageStudents)?;
    let student = validate::new_student(params)?;
    let student_id = create_student(ctx, &student)?;

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "student_registered",
            resource_type: "student",
            resource_id: Some(&student_id),
            details: json!({
                "email": student.account.email,
                "rollNumber": student.roll_number,
                "classId": student.class_id,
            }),
        },
        ctx.now,
    );
    tracing::info!(actor = %ctx.actor(), student = %student_id, "student registered");
    let record = load_student(ctx.conn, &student_id)?;
    reply("Student registered", json!({ "student": record }))
}

/// Every entry is validated and created on its own; one bad row does not
/// stop the rest.
fn students_bulk_import(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::BulkImport)?;
    let rows = validate::required_array(params, "students")?;
    validate::batch_len("students", rows.len(), IMPORT_BATCH_MAX)?;

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for (index, row) in rows.iter().enumerate() {
        let email = row.get("email").and_then(|v| v.as_str()).unwrap_or_default();
        let outcome = validate::new_student(row)
            .map_err(ServiceError::from)
            .and_then(|s| create_student(ctx, &s).map(|id| (id, s)));
        match outcome {
            Ok((id, s)) => results.push(json!({
                "index": index,
                "id": id,
                "email": s.account.email,
                "rollNumber": s.roll_number,
            })),
            Err(e) => errors.push(json!({
                "index": index,
                "email": email,
                "error": e.to_string(),
            })),
        }
    }

    let total = rows.len();
    let succeeded = results.len();
    let failed = errors.len();
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "bulk_import_students",
            resource_type: "student",
            resource_id: None,
            details: json!({ "total": total, "succeeded": succeeded, "failed": failed }),
        },
        ctx.now,
    );
    tracing::info!(actor = %ctx.actor(), total, succeeded, failed, "bulk import finished");
    reply(
        format!("Imported {} of {} students", succeeded, total),
        json!({
            "total": total,
            "succeeded": succeeded,
            "failed": failed,
            "results": results,
            "errors": errors,
        }),
    )
}

fn students_list(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ViewRoster)?;
    let class_id = validate::optional_str(params, "classId")?;
    let mut stmt = ctx.conn.prepare(&format!(
        "{} WHERE ?1 IS NULL OR s.class_id = ?1 ORDER BY s.name COLLATE NOCASE",
        STUDENT_COLUMNS
    ))?;
    let students = stmt
        .query_map([&class_id], student_row)?
        .collect::<Result<Vec<_>, _>>()?;
    reply(
        format!("{} students", students.len()),
        json!({ "students": students }),
    )
}

fn students_get(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let student_id = validate::required_str(params, "studentId")?;
    require_student_access(ctx, &student_id)?;
    let Some(student) = load_student(ctx.conn, &student_id)? else {
        return Err(ServiceError::not_found("Student not found"));
    };
    let mut stmt = ctx.conn.prepare(
        "SELECT g.id, g.name, g.email, g.phone, sg.relationship
         FROM student_guardians sg
         JOIN guardians g ON g.id = sg.guardian_id
         WHERE sg.student_id = ?
         ORDER BY g.name COLLATE NOCASE",
    )?;
    let guardians = stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "phone": r.get::<_, Option<String>>(3)?,
                "relationship": r.get::<_, String>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply("OK", json!({ "student": student, "guardians": guardians }))
}

fn students_update(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageStudents)?;
    let student_id = validate::required_str(params, "studentId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(ValidationError::new("patch", "type", "patch must be an object").into());
    };
    let patch = Value::Object(patch.clone());

    let name = match validate::optional_str(&patch, "name")? {
        Some(raw) => Some(validate::name("name", &raw)?),
        None => None,
    };
    let roll = match validate::optional_str(&patch, "rollNumber")? {
        Some(raw) => Some(validate::roll_number("rollNumber", &raw)?),
        None => None,
    };
    let class_change = match patch.get("classId") {
        None => None,
        Some(Value::Null) => Some(None),
        Some(_) => Some(Some(validate::required_str(&patch, "classId")?)),
    };

    if !student_exists(ctx.conn, &student_id)? {
        return Err(ServiceError::not_found("Student not found"));
    }
    if let Some(Some(cid)) = &class_change {
        if !class_exists(ctx.conn, cid)? {
            return Err(ServiceError::not_found("Class not found"));
        }
    }
    if let Some(r) = &roll {
        if roll_taken(ctx.conn, r, Some(&student_id))? {
            return Err(ServiceError::conflict(format!("Roll number {} is already in use", r)));
        }
    }

    let stamp = db::ts(ctx.now);
    let tx = ctx.conn.unchecked_transaction()?;
    if let Some(n) = &name {
        tx.execute(
            "UPDATE students SET name = ?, updated_at = ? WHERE id = ?",
            (n, &stamp, &student_id),
        )?;
        tx.execute("UPDATE users SET name = ? WHERE id = ?", (n, &student_id))?;
    }
    if let Some(r) = &roll {
        tx.execute(
            "UPDATE students SET roll_number = ?, updated_at = ? WHERE id = ?",
            (r, &stamp, &student_id),
        )?;
    }
    if let Some(c) = &class_change {
        tx.execute(
            "UPDATE students SET class_id = ?, updated_at = ? WHERE id = ?",
            (c, &stamp, &student_id),
        )?;
    }
    tx.commit()?;

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "student_updated",
            resource_type: "student",
            resource_id: Some(&student_id),
            details: patch,
        },
        ctx.now,
    );
    let student = load_student(ctx.conn, &student_id)?;
    reply("Student updated", json!({ "student": student }))
}

fn students_delete(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageStudents)?;
    let student_id = validate::required_str(params, "studentId")?;
    if !student_exists(ctx.conn, &student_id)? {
        return Err(ServiceError::not_found("Student not found"));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    for sql in [
        "DELETE FROM attendance WHERE student_id = ?",
        "DELETE FROM results WHERE student_id = ?",
        "DELETE FROM student_guardians WHERE student_id = ?",
        "DELETE FROM students WHERE id = ?",
        "DELETE FROM notifications WHERE user_id = ?",
        "DELETE FROM sessions WHERE user_id = ?",
        "DELETE FROM login_codes WHERE user_id = ?",
        "DELETE FROM verification_tokens WHERE user_id = ?",
        "DELETE FROM user_roles WHERE user_id = ?",
        "DELETE FROM users WHERE id = ?",
    ] {
        tx.execute(sql, [&student_id])?;
    }
    tx.commit()?;

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "student_deleted",
            resource_type: "student",
            resource_id: Some(&student_id),
            details: json!({}),
        },
        ctx.now,
    );
    tracing::info!(actor = %ctx.actor(), student = %student_id, "student deleted");
    reply("Student deleted", json!({ "studentId": student_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(authed(state, req, students_create)),
        "students.bulkImport" => Some(authed(state, req, students_bulk_import)),
        "students.list" => Some(authed(state, req, students_list)),
        "students.get" => Some(authed(state, req, students_get)),
        "students.update" => Some(authed(state, req, students_update)),
        "students.delete" => Some(authed(state, req, students_delete)),
        _ => None,
    }
}
