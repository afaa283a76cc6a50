use super::{authed, reply, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Operation};
use crate::db;
use crate::error::{AuthorizationError, ServiceError, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::mailer;
use crate::validate;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use uuid::Uuid;

const KINDS: [&str; 4] = ["info", "warning", "success", "error"];

fn notifications_send(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::SendNotification)?;
    let raw_ids = validate::required_array(params, "userIds")?;
    if raw_ids.is_empty() {
        return Err(
            ValidationError::new("userIds", "batch_empty", "userIds must not be empty").into(),
        );
    }
    let mut user_ids = Vec::with_capacity(raw_ids.len());
    for (i, v) in raw_ids.iter().enumerate() {
        match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) if !user_ids.iter().any(|u: &String| u == id) => user_ids.push(id.to_string()),
            Some(_) => {}
            None => {
                return Err(ValidationError::new(
                    format!("userIds[{}]", i),
                    "type",
                    "user id must be a non-empty string",
                )
                .into())
            }
        }
    }
    let title = validate::text("title", &validate::required_str(params, "title")?, 200)?;
    let message = validate::text("message", &validate::required_str(params, "message")?, 5000)?;
    let kind = validate::optional_str(params, "type")?
        .unwrap_or_else(|| "info".to_string())
        .to_lowercase();
    if !KINDS.contains(&kind.as_str()) {
        return Err(ValidationError::new(
            "type",
            "type_enum",
            "type must be info, warning, success or error",
        )
        .into());
    }
    let send_email = validate::optional_bool(params, "sendEmail")?.unwrap_or(false);

    let mut recipients = Vec::with_capacity(user_ids.len());
    for id in &user_ids {
        let email: Option<String> = ctx
            .conn
            .query_row("SELECT email FROM users WHERE id = ?", [id], |r| r.get(0))
            .optional()?;
        match email {
            Some(e) => recipients.push((id.clone(), e)),
            None => return Err(ServiceError::not_found(format!("User {} not found", id))),
        }
    }

    let stamp = db::ts(ctx.now);
    let tx = ctx.conn.unchecked_transaction()?;
    for (id, _) in &recipients {
        tx.execute(
            "INSERT INTO notifications(id, user_id, title, message, kind, read, created_at)
             VALUES(?, ?, ?, ?, ?, 0, ?)",
            (Uuid::new_v4().to_string(), id, &title, &message, &kind, &stamp),
        )?;
    }
    tx.commit()?;

    let mut emailed = 0usize;
    if send_email {
        let outbox = ctx.outbox();
        for (_, email) in &recipients {
            if mailer::dispatch(&outbox, &mailer::notification_email(email, &title, &message)) {
                emailed += 1;
            }
        }
    }

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "notification_sent",
            resource_type: "notification",
            resource_id: None,
            details: json!({ "recipients": recipients.len(), "title": title, "emailed": emailed }),
        },
        ctx.now,
    );
    reply(
        format!("Notification sent to {} users", recipients.len()),
        json!({ "count": recipients.len(), "emailed": emailed }),
    )
}

fn notifications_list(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let unread_only = validate::optional_bool(params, "unreadOnly")?.unwrap_or(false);
    let mut stmt = ctx.conn.prepare(
        "SELECT id, title, message, kind, read, created_at
         FROM notifications
         WHERE user_id = ? AND (? = 0 OR read = 0)
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let notifications = stmt
        .query_map((ctx.actor(), unread_only as i64), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "message": r.get::<_, String>(2)?,
                "type": r.get::<_, String>(3)?,
                "read": r.get::<_, i64>(4)? != 0,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let unread: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND read = 0",
        [ctx.actor()],
        |r| r.get(0),
    )?;
    reply(
        format!("{} notifications", notifications.len()),
        json!({ "notifications": notifications, "unread": unread }),
    )
}

fn notifications_mark_read(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let id = validate::required_str(params, "notificationId")?;
    let owner: Option<String> = ctx
        .conn
        .query_row(
            "SELECT user_id FROM notifications WHERE id = ?",
            [&id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(owner) = owner else {
        return Err(ServiceError::not_found("Notification not found"));
    };
    if owner != ctx.caller.user_id {
        return Err(AuthorizationError {
            message: "You can only mark your own notifications".to_string(),
        }
        .into());
    }
    ctx.conn
        .execute("UPDATE notifications SET read = 1 WHERE id = ?", [&id])?;
    reply("Notification marked as read", json!({ "notificationId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.send" => Some(authed(state, req, notifications_send)),
        "notifications.list" => Some(authed(state, req, notifications_list)),
        "notifications.markRead" => Some(authed(state, req, notifications_mark_read)),
        _ => None,
    }
}
