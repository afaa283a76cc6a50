use super::{authed, public, reply, Ctx, Env, Outcome};
use crate::audit::{self, AuditEntry};
use crate::auth::{self, Session, UserRecord};
use crate::error::{ServiceError, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::mailer;
use crate::validate;
use chrono::Duration;
use serde_json::{json, Value};

const CODE_SENT: &str = "If an account exists for that email, a sign-in code has been sent";

fn session_data(user: &UserRecord, session: &Session) -> Value {
    json!({
        "token": session.token,
        "expiresAt": session.expires_at,
        "user": user,
    })
}

fn login(env: &Env<'_>, params: &Value) -> Outcome {
    let email = validate::required_str(params, "email")?.to_lowercase();
    let password = match params.get("password").and_then(|v| v.as_str()) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(validate_missing("password")),
    };
    let (user, session) = auth::login(
        env.conn,
        &email,
        &password,
        env.now,
        Duration::hours(env.config.session_ttl_hours),
    )?;
    tracing::info!(user = %user.id, "signed in with password");
    reply("Login successful", session_data(&user, &session))
}

fn validate_missing(field: &str) -> ServiceError {
    ValidationError::new(field, "required", format!("{} is required", field)).into()
}

fn send_code(env: &Env<'_>, params: &Value) -> Outcome {
    let raw = validate::required_str(params, "email")?;
    let email = validate::email("email", &raw)?;
    if let Some(user_id) = auth::code_recipient(env.conn, &email)? {
        let ttl = env.config.code_ttl_minutes;
        let code = auth::issue_login_code(env.conn, &user_id, env.now, Duration::minutes(ttl))?;
        mailer::dispatch(&env.outbox(), &mailer::login_code_email(&email, &code, ttl));
        tracing::info!(user = %user_id, "sign-in code issued");
    }
    reply(CODE_SENT, json!({}))
}

fn verify_code(env: &Env<'_>, params: &Value) -> Outcome {
    let raw = validate::required_str(params, "email")?;
    let email = validate::email("email", &raw)?;
    let raw_code = validate::required_str(params, "code")?;
    let code = validate::one_time_code("code", &raw_code)?;
    let (user, session) = auth::redeem_login_code(
        env.conn,
        &email,
        &code,
        env.now,
        Duration::hours(env.config.session_ttl_hours),
    )?;
    tracing::info!(user = %user.id, "signed in with code");
    reply("Login successful", session_data(&user, &session))
}

fn verify_email(env: &Env<'_>, params: &Value) -> Outcome {
    let token = validate::required_str(params, "token")?;
    let user_id = auth::redeem_verification_token(env.conn, &token, env.now)?;
    audit::record(
        env.conn,
        AuditEntry {
            actor: &user_id,
            action: "email_verified",
            resource_type: "user",
            resource_id: Some(&user_id),
            details: json!({}),
        },
        env.now,
    );
    reply("Email verified", json!({ "userId": user_id }))
}

/// Issues a verification token and queues the link. Shared with account
/// creation paths.
pub(crate) fn queue_verification(
    conn: &rusqlite::Connection,
    config: &crate::config::Config,
    outbox: &mailer::Outbox<'_>,
    user_id: &str,
    email: &str,
    name: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<bool, ServiceError> {
    let ttl = config.verification_ttl_hours;
    let token = auth::issue_verification_token(conn, user_id, now, Duration::hours(ttl))?;
    let link = format!("{}/verify?token={}", config.app_url.trim_end_matches('/'), token);
    Ok(mailer::dispatch(
        outbox,
        &mailer::verification_email(email, name, &link, ttl),
    ))
}

fn resend_verification(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    let Some(user) = auth::load_user(ctx.conn, ctx.actor())? else {
        return Err(ServiceError::unauthenticated("Invalid session"));
    };
    if user.email_verified {
        return Err(ServiceError::conflict("Email is already verified"));
    }
    let queued = queue_verification(
        ctx.conn,
        ctx.config,
        &ctx.outbox(),
        &user.id,
        &user.email,
        &user.name,
        ctx.now,
    )?;
    reply(
        "Verification email sent",
        json!({ "emailQueued": queued }),
    )
}

fn whoami(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    let Some(user) = auth::load_user(ctx.conn, ctx.actor())? else {
        return Err(ServiceError::unauthenticated("Invalid session"));
    };
    reply("OK", json!({ "user": user }))
}

fn change_password(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let current = match params.get("currentPassword").and_then(|v| v.as_str()) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(validate_missing("currentPassword")),
    };
    let raw_new = match params.get("newPassword").and_then(|v| v.as_str()) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return Err(validate_missing("newPassword")),
    };
    let new = validate::password("newPassword", &raw_new)?;
    auth::change_password(ctx.conn, ctx.actor(), &current, &new)?;
    let revoked = auth::revoke_other_sessions(ctx.conn, ctx.actor(), ctx.token)?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "password_changed",
            resource_type: "user",
            resource_id: Some(ctx.actor()),
            details: json!({ "revokedSessions": revoked }),
        },
        ctx.now,
    );
    reply("Password changed", json!({ "revokedSessions": revoked }))
}

fn logout(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    auth::revoke_session(ctx.conn, ctx.token)?;
    reply("Logged out", json!({}))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(public(state, req, login)),
        "auth.sendCode" => Some(public(state, req, send_code)),
        "auth.verifyCode" => Some(public(state, req, verify_code)),
        "auth.verifyEmail" => Some(public(state, req, verify_email)),
        "auth.resendVerification" => Some(authed(state, req, resend_verification)),
        "auth.whoami" => Some(authed(state, req, whoami)),
        "auth.changePassword" => Some(authed(state, req, change_password)),
        "auth.logout" => Some(authed(state, req, logout)),
        _ => None,
    }
}
