//! One file per method family. Each exposes `try_handle`, which claims the
//! methods it owns and returns `None` for the rest.

pub mod announcements;
pub mod assignments;
pub mod attendance;
pub mod auth;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod notifications;
pub mod results;
pub mod setup;
pub mod students;
pub mod timetable;
pub mod users;

use crate::auth as identity;
use crate::authz::{Caller, Role};
use crate::config::Config;
use crate::error::{AuthorizationError, ServiceError, ServiceResult};
use crate::ipc::error::{service_err, success};
use crate::ipc::types::{AppState, Request};
use crate::mailer::Outbox;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

pub(crate) struct Reply {
    message: String,
    data: Value,
}

pub(crate) type Outcome = ServiceResult<Reply>;

pub(crate) fn reply(message: impl Into<String>, data: Value) -> Outcome {
    Ok(Reply {
        message: message.into(),
        data,
    })
}

/// Per-request view of the workspace for methods that need no session.
pub(crate) struct Env<'a> {
    pub conn: &'a Connection,
    pub config: &'a Config,
    pub now: DateTime<Utc>,
}

impl<'a> Env<'a> {
    pub fn outbox(&self) -> Outbox<'a> {
        Outbox::new(self.conn, &self.config.mail_from, self.now)
    }
}

/// Per-request view for authenticated methods. `caller` comes from the
/// session token, never from params.
pub(crate) struct Ctx<'a> {
    pub conn: &'a Connection,
    pub config: &'a Config,
    pub now: DateTime<Utc>,
    pub caller: Caller,
    pub token: &'a str,
}

impl<'a> Ctx<'a> {
    pub fn today(&self) -> NaiveDate {
        self.now.date_naive()
    }

    pub fn outbox(&self) -> Outbox<'a> {
        Outbox::new(self.conn, &self.config.mail_from, self.now)
    }

    pub fn actor(&self) -> &str {
        &self.caller.user_id
    }
}

fn finish(id: &str, outcome: Outcome) -> Value {
    match outcome {
        Ok(r) => success(id, r.message, r.data),
        Err(e) => service_err(id, &e),
    }
}

pub(crate) fn public(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Env<'_>, &Value) -> Outcome,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return service_err(&req.id, &ServiceError::NoWorkspace);
    };
    let env = Env {
        conn,
        config: &state.config,
        now: Utc::now(),
    };
    finish(&req.id, f(&env, &req.params))
}

/// Resolves the session first so an anonymous request is a 401 before any
/// role or input check runs.
pub(crate) fn authed(
    state: &AppState,
    req: &Request,
    f: impl FnOnce(&Ctx<'_>, &Value) -> Outcome,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return service_err(&req.id, &ServiceError::NoWorkspace);
    };
    let now = Utc::now();
    let token = req.token.as_deref().unwrap_or_default().trim();
    let caller = match identity::resolve_session(conn, Some(token), now) {
        Ok(c) => c,
        Err(e) => return service_err(&req.id, &e),
    };
    tracing::debug!(method = %req.method, user = %caller.user_id, "dispatch");
    let ctx = Ctx {
        conn,
        config: &state.config,
        now,
        caller,
        token,
    };
    finish(&req.id, f(&ctx, &req.params))
}

pub(crate) fn student_exists(conn: &Connection, student_id: &str) -> ServiceResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub(crate) fn class_exists(conn: &Connection, class_id: &str) -> ServiceResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

pub(crate) fn is_guardian_of(
    conn: &Connection,
    user_id: &str,
    student_id: &str,
) -> ServiceResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1
             FROM student_guardians sg
             JOIN guardians g ON g.id = sg.guardian_id
             WHERE g.user_id = ? AND sg.student_id = ?",
            (user_id, student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

/// Staff see every student; a student sees only themself; a guardian sees
/// their linked children.
pub(crate) fn require_student_access(ctx: &Ctx<'_>, student_id: &str) -> ServiceResult<()> {
    let allowed = ctx.caller.is_staff()
        || ctx.caller.user_id == student_id
        || (ctx.caller.has(Role::Parent)
            && is_guardian_of(ctx.conn, &ctx.caller.user_id, student_id)?);
    if !allowed {
        return Err(AuthorizationError {
            message: "You do not have access to this student's records".to_string(),
        }
        .into());
    }
    if !student_exists(ctx.conn, student_id)? {
        return Err(ServiceError::not_found("Student not found"));
    }
    Ok(())
}
