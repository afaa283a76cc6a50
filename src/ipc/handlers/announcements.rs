use super::{authed, reply, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Caller, Operation, Role};
use crate::db;
use crate::error::{ServiceError, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use serde_json::{json, Value};
use uuid::Uuid;

const AUDIENCES: [&str; 4] = ["all", "staff", "students", "parents"];

/// Audiences a caller may read. `None` means unrestricted.
fn visible_audiences(caller: &Caller) -> Option<Vec<&'static str>> {
    if caller.has(Role::Admin) {
        return None;
    }
    let mut out = vec!["all"];
    if caller.has(Role::Teacher) {
        out.push("staff");
    }
    if caller.has(Role::Student) {
        out.push("students");
    }
    if caller.has(Role::Parent) {
        out.push("parents");
    }
    Some(out)
}

fn announcements_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageAnnouncements)?;
    let title = validate::text("title", &validate::required_str(params, "title")?, 200)?;
    let body = validate::text("body", &validate::required_str(params, "body")?, 5000)?;
    let audience = validate::optional_str(params, "audience")?
        .unwrap_or_else(|| "all".to_string())
        .to_lowercase();
    if !AUDIENCES.contains(&audience.as_str()) {
        return Err(ValidationError::new(
            "audience",
            "audience_enum",
            "audience must be all, staff, students or parents",
        )
        .into());
    }

    let id = Uuid::new_v4().to_string();
    let created_at = db::ts(ctx.now);
    ctx.conn.execute(
        "INSERT INTO announcements(id, title, body, audience, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &title, &body, &audience, ctx.actor(), &created_at),
    )?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "announcement_created",
            resource_type: "announcement",
            resource_id: Some(&id),
            details: json!({ "title": title, "audience": audience }),
        },
        ctx.now,
    );
    reply(
        "Announcement published",
        json!({
            "announcement": {
                "id": id,
                "title": title,
                "body": body,
                "audience": audience,
                "createdBy": ctx.actor(),
                "createdAt": created_at,
            }
        }),
    )
}

fn announcements_list(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    let mut sql = String::from(
        "SELECT a.id, a.title, a.body, a.audience, a.created_by, u.name, a.created_at
         FROM announcements a
         LEFT JOIN users u ON u.id = a.created_by",
    );
    let mut bind: Vec<SqlValue> = Vec::new();
    if let Some(audiences) = visible_audiences(&ctx.caller) {
        let marks = vec!["?"; audiences.len()].join(", ");
        sql.push_str(&format!(" WHERE a.audience IN ({})", marks));
        bind.extend(audiences.into_iter().map(|a| SqlValue::Text(a.to_string())));
    }
    sql.push_str(" ORDER BY a.created_at DESC, a.rowid DESC");

    let mut stmt = ctx.conn.prepare(&sql)?;
    let announcements = stmt
        .query_map(params_from_iter(bind), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "body": r.get::<_, String>(2)?,
                "audience": r.get::<_, String>(3)?,
                "createdBy": r.get::<_, String>(4)?,
                "authorName": r.get::<_, Option<String>>(5)?,
                "createdAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(
        format!("{} announcements", announcements.len()),
        json!({ "announcements": announcements }),
    )
}

fn announcements_delete(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageAnnouncements)?;
    let id = validate::required_str(params, "announcementId")?;
    let n = ctx
        .conn
        .execute("DELETE FROM announcements WHERE id = ?", [&id])?;
    if n == 0 {
        return Err(ServiceError::not_found("Announcement not found"));
    }
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "announcement_deleted",
            resource_type: "announcement",
            resource_id: Some(&id),
            details: json!({}),
        },
        ctx.now,
    );
    reply("Announcement deleted", json!({ "announcementId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "announcements.create" => Some(authed(state, req, announcements_create)),
        "announcements.list" => Some(authed(state, req, announcements_list)),
        "announcements.delete" => Some(authed(state, req, announcements_delete)),
        _ => None,
    }
}
