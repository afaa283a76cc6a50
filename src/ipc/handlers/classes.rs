use super::{authed, class_exists, reply, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Operation};
use crate::db;
use crate::error::{ServiceError, ServiceResult, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn ensure_teacher(conn: &Connection, teacher_id: &str) -> ServiceResult<()> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM user_roles WHERE user_id = ? AND role = 'teacher'",
            [teacher_id],
            |r| r.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(ValidationError::new(
            "teacherId",
            "teacher_unknown",
            "teacherId must refer to a teacher",
        )
        .into());
    }
    Ok(())
}

fn class_json(conn: &Connection, class_id: &str) -> ServiceResult<Option<Value>> {
    Ok(conn
        .query_row(
            "SELECT c.id, c.name, c.teacher_id, u.name,
                    (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
             FROM classes c
             LEFT JOIN users u ON u.id = c.teacher_id
             WHERE c.id = ?",
            [class_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "teacherId": r.get::<_, Option<String>>(2)?,
                    "teacherName": r.get::<_, Option<String>>(3)?,
                    "studentCount": r.get::<_, i64>(4)?,
                }))
            },
        )
        .optional()?)
}

fn classes_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageClasses)?;
    let raw_name = validate::required_str(params, "name")?;
    let name = validate::name("name", &raw_name)?;
    let teacher_id = validate::optional_str(params, "teacherId")?;
    if let Some(t) = &teacher_id {
        ensure_teacher(ctx.conn, t)?;
    }

    let class_id = Uuid::new_v4().to_string();
    ctx.conn.execute(
        "INSERT INTO classes(id, name, teacher_id, created_at) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &teacher_id, db::ts(ctx.now)),
    )?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "class_created",
            resource_type: "class",
            resource_id: Some(&class_id),
            details: json!({ "name": name, "teacherId": teacher_id }),
        },
        ctx.now,
    );
    let class = class_json(ctx.conn, &class_id)?;
    reply("Class created", json!({ "class": class }))
}

fn classes_list(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    let mut stmt = ctx.conn.prepare(
        "SELECT c.id, c.name, c.teacher_id, u.name,
                (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
         FROM classes c
         LEFT JOIN users u ON u.id = c.teacher_id
         ORDER BY c.name COLLATE NOCASE",
    )?;
    let classes = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, Option<String>>(2)?,
                "teacherName": r.get::<_, Option<String>>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(format!("{} classes", classes.len()), json!({ "classes": classes }))
}

fn classes_update(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageClasses)?;
    let class_id = validate::required_str(params, "classId")?;
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(ValidationError::new("patch", "type", "patch must be an object").into());
    };
    let patch = Value::Object(patch.clone());

    let name = match validate::optional_str(&patch, "name")? {
        Some(raw) => Some(validate::name("name", &raw)?),
        None => None,
    };
    // Present-but-null clears the teacher.
    let teacher_change = match patch.get("teacherId") {
        None => None,
        Some(Value::Null) => Some(None),
        Some(_) => {
            let t = validate::required_str(&patch, "teacherId")?;
            ensure_teacher(ctx.conn, &t)?;
            Some(Some(t))
        }
    };
    if !class_exists(ctx.conn, &class_id)? {
        return Err(ServiceError::not_found("Class not found"));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    if let Some(n) = &name {
        tx.execute("UPDATE classes SET name = ? WHERE id = ?", (n, &class_id))?;
    }
    if let Some(t) = &teacher_change {
        tx.execute("UPDATE classes SET teacher_id = ? WHERE id = ?", (t, &class_id))?;
    }
    tx.commit()?;

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "class_updated",
            resource_type: "class",
            resource_id: Some(&class_id),
            details: patch,
        },
        ctx.now,
    );
    let class = class_json(ctx.conn, &class_id)?;
    reply("Class updated", json!({ "class": class }))
}

fn classes_delete(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageClasses)?;
    let class_id = validate::required_str(params, "classId")?;
    if !class_exists(ctx.conn, &class_id)? {
        return Err(ServiceError::not_found("Class not found"));
    }
    let enrolled: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;
    if enrolled > 0 {
        return Err(ServiceError::conflict(format!(
            "Class still has {} enrolled students",
            enrolled
        )));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute("DELETE FROM assignments WHERE class_id = ?", [&class_id])?;
    tx.execute("DELETE FROM timetable_slots WHERE class_id = ?", [&class_id])?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])?;
    tx.commit()?;

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "class_deleted",
            resource_type: "class",
            resource_id: Some(&class_id),
            details: json!({}),
        },
        ctx.now,
    );
    reply("Class deleted", json!({ "classId": class_id }))
}

fn subject_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "teacherId": r.get::<_, Option<String>>(2)?,
        "teacherName": r.get::<_, Option<String>>(3)?,
    }))
}

const SUBJECT_COLUMNS: &str = "SELECT s.id, s.name, s.teacher_id, u.name
     FROM subjects s
     LEFT JOIN users u ON u.id = s.teacher_id";

fn subjects_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageClasses)?;
    let raw_name = validate::required_str(params, "name")?;
    let name = validate::subject("name", &raw_name)?;
    let teacher_id = validate::optional_str(params, "teacherId")?;
    if let Some(t) = &teacher_id {
        ensure_teacher(ctx.conn, t)?;
    }
    let taken: Option<i64> = ctx
        .conn
        .query_row("SELECT 1 FROM subjects WHERE name = ?", [&name], |r| r.get(0))
        .optional()?;
    if taken.is_some() {
        return Err(ServiceError::conflict(format!("Subject {} already exists", name)));
    }

    let subject_id = Uuid::new_v4().to_string();
    ctx.conn.execute(
        "INSERT INTO subjects(id, name, teacher_id, created_at) VALUES(?, ?, ?, ?)",
        (&subject_id, &name, &teacher_id, db::ts(ctx.now)),
    )?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "subject_created",
            resource_type: "subject",
            resource_id: Some(&subject_id),
            details: json!({ "name": name, "teacherId": teacher_id }),
        },
        ctx.now,
    );
    let subject = ctx.conn.query_row(
        &format!("{} WHERE s.id = ?", SUBJECT_COLUMNS),
        [&subject_id],
        subject_row,
    )?;
    reply("Subject created", json!({ "subject": subject }))
}

fn subjects_list(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    let mut stmt = ctx
        .conn
        .prepare(&format!("{} ORDER BY s.name COLLATE NOCASE", SUBJECT_COLUMNS))?;
    let subjects = stmt
        .query_map([], subject_row)?
        .collect::<Result<Vec<_>, _>>()?;
    reply(format!("{} subjects", subjects.len()), json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(authed(state, req, classes_create)),
        "classes.list" => Some(authed(state, req, classes_list)),
        "classes.update" => Some(authed(state, req, classes_update)),
        "classes.delete" => Some(authed(state, req, classes_delete)),
        "subjects.create" => Some(authed(state, req, subjects_create)),
        "subjects.list" => Some(authed(state, req, subjects_list)),
        _ => None,
    }
}
