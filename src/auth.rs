//! Identity and sessions: password and one-time-code sign-in, session
//! tokens, email verification tokens. Secrets other than password hashes are
//! stored only as SHA-256 digests.

use crate::authz::{Caller, Role};
use crate::db;
use crate::error::{ServiceError, ServiceResult};
use crate::model::NewAccount;
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const MAX_CODE_ATTEMPTS: i64 = 5;
const BAD_CREDENTIALS: &str = "Invalid email or password";
const BAD_CODE: &str = "Invalid or expired code";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub name: String,
    pub email_verified: bool,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub expires_at: String,
}

pub fn digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn new_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

fn new_code() -> String {
    format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000)
}

pub fn hash_password(password: &str) -> ServiceResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| ServiceError::Internal("failed to hash password".to_string()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn load_roles(conn: &Connection, user_id: &str) -> ServiceResult<BTreeSet<Role>> {
    let mut stmt = conn.prepare("SELECT role FROM user_roles WHERE user_id = ?")?;
    let names = stmt
        .query_map([user_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names.iter().filter_map(|n| Role::parse(n)).collect())
}

pub fn load_user(conn: &Connection, user_id: &str) -> ServiceResult<Option<UserRecord>> {
    let row: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, email, name, email_verified FROM users WHERE id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((id, email, name, verified)) = row else {
        return Ok(None);
    };
    let roles = load_roles(conn, &id)?.into_iter().collect();
    Ok(Some(UserRecord {
        id,
        email,
        name,
        email_verified: verified != 0,
        roles,
    }))
}

fn user_id_by_email(conn: &Connection, email: &str) -> ServiceResult<Option<String>> {
    Ok(conn
        .query_row("SELECT id FROM users WHERE email = ?", [email], |r| r.get(0))
        .optional()?)
}

pub fn email_taken(conn: &Connection, email: &str) -> ServiceResult<bool> {
    Ok(user_id_by_email(conn, email)?.is_some())
}

/// Inserts the login account and its roles. Callers that also write a profile
/// row pass a transaction so the account does not outlive a failed profile.
pub fn create_account(
    conn: &Connection,
    account: &NewAccount,
    roles: &[Role],
    now: DateTime<Utc>,
) -> ServiceResult<String> {
    if email_taken(conn, &account.email)? {
        return Err(ServiceError::conflict("An account with this email already exists"));
    }
    let user_id = Uuid::new_v4().to_string();
    let hash = hash_password(&account.password)?;
    conn.execute(
        "INSERT INTO users(id, email, name, password_hash, email_verified, created_at)
         VALUES(?, ?, ?, ?, 0, ?)",
        (&user_id, &account.email, &account.name, &hash, db::ts(now)),
    )?;
    for role in roles {
        conn.execute(
            "INSERT OR IGNORE INTO user_roles(user_id, role) VALUES(?, ?)",
            (&user_id, role.as_str()),
        )?;
    }
    Ok(user_id)
}

pub fn issue_session(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ServiceResult<Session> {
    let token = new_token();
    let expires_at = db::ts(now + ttl);
    conn.execute(
        "INSERT INTO sessions(token_hash, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (digest(&token), user_id, db::ts(now), &expires_at),
    )?;
    Ok(Session { token, expires_at })
}

/// The identity behind a request. Missing, unknown and expired tokens are all
/// `unauthenticated`; expired sessions are removed on sight.
pub fn resolve_session(
    conn: &Connection,
    token: Option<&str>,
    now: DateTime<Utc>,
) -> ServiceResult<Caller> {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return Err(ServiceError::unauthenticated("Missing session token"));
    };
    let token_hash = digest(token);
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT user_id, expires_at FROM sessions WHERE token_hash = ?",
            [&token_hash],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((user_id, expires_at)) = row else {
        return Err(ServiceError::unauthenticated("Invalid session"));
    };
    if expires_at <= db::ts(now) {
        conn.execute("DELETE FROM sessions WHERE token_hash = ?", [&token_hash])?;
        return Err(ServiceError::unauthenticated("Session expired"));
    }
    let roles = load_roles(conn, &user_id)?;
    Ok(Caller { user_id, roles })
}

pub fn revoke_session(conn: &Connection, token: &str) -> ServiceResult<()> {
    conn.execute("DELETE FROM sessions WHERE token_hash = ?", [digest(token)])?;
    Ok(())
}

pub fn revoke_other_sessions(
    conn: &Connection,
    user_id: &str,
    keep_token: &str,
) -> ServiceResult<usize> {
    Ok(conn.execute(
        "DELETE FROM sessions WHERE user_id = ? AND token_hash <> ?",
        (user_id, digest(keep_token)),
    )?)
}

/// Password sign-in. Unknown email and wrong password are indistinguishable.
pub fn login(
    conn: &Connection,
    email: &str,
    password: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ServiceResult<(UserRecord, Session)> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT id, password_hash FROM users WHERE email = ?",
            [email],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((user_id, hash)) = row else {
        return Err(ServiceError::unauthenticated(BAD_CREDENTIALS));
    };
    if !verify_password(password, &hash) {
        return Err(ServiceError::unauthenticated(BAD_CREDENTIALS));
    }
    let user = load_user(conn, &user_id)?
        .ok_or_else(|| ServiceError::unauthenticated(BAD_CREDENTIALS))?;
    let session = issue_session(conn, &user_id, now, ttl)?;
    Ok((user, session))
}

pub fn change_password(
    conn: &Connection,
    user_id: &str,
    current: &str,
    new: &str,
) -> ServiceResult<()> {
    let stored: Option<String> = conn
        .query_row("SELECT password_hash FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?;
    let Some(stored) = stored else {
        return Err(ServiceError::unauthenticated("Invalid session"));
    };
    if !verify_password(current, &stored) {
        return Err(ServiceError::unauthenticated("Current password is incorrect"));
    }
    conn.execute(
        "UPDATE users SET password_hash = ? WHERE id = ?",
        (hash_password(new)?, user_id),
    )?;
    Ok(())
}

/// Looks up the account for a code request. `None` for unknown emails; the
/// caller must answer the same way in both cases.
pub fn code_recipient(conn: &Connection, email: &str) -> ServiceResult<Option<String>> {
    user_id_by_email(conn, email)
}

/// Creates a fresh one-time code and invalidates any earlier unused ones.
pub fn issue_login_code(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ServiceResult<String> {
    let code = new_code();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE login_codes SET consumed = 1 WHERE user_id = ? AND consumed = 0",
        [user_id],
    )?;
    tx.execute(
        "INSERT INTO login_codes(id, user_id, code_hash, attempts, consumed, created_at, expires_at)
         VALUES(?, ?, ?, 0, 0, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            user_id,
            digest(&code),
            db::ts(now),
            db::ts(now + ttl),
        ),
    )?;
    tx.commit()?;
    Ok(code)
}

/// Consumes a matching code and opens a session. A code survives at most
/// `MAX_CODE_ATTEMPTS` wrong guesses.
pub fn redeem_login_code(
    conn: &Connection,
    email: &str,
    code: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ServiceResult<(UserRecord, Session)> {
    let Some(user_id) = user_id_by_email(conn, email)? else {
        return Err(ServiceError::unauthenticated(BAD_CODE));
    };
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT id, code_hash, attempts
             FROM login_codes
             WHERE user_id = ? AND consumed = 0 AND expires_at > ?
             ORDER BY created_at DESC
             LIMIT 1",
            (&user_id, db::ts(now)),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((code_id, code_hash, attempts)) = row else {
        return Err(ServiceError::unauthenticated(BAD_CODE));
    };
    if attempts >= MAX_CODE_ATTEMPTS {
        return Err(ServiceError::unauthenticated(BAD_CODE));
    }
    if digest(code) != code_hash {
        conn.execute(
            "UPDATE login_codes SET attempts = attempts + 1 WHERE id = ?",
            [&code_id],
        )?;
        return Err(ServiceError::unauthenticated(BAD_CODE));
    }
    conn.execute("UPDATE login_codes SET consumed = 1 WHERE id = ?", [&code_id])?;
    let user = load_user(conn, &user_id)?.ok_or_else(|| ServiceError::unauthenticated(BAD_CODE))?;
    let session = issue_session(conn, &user_id, now, ttl)?;
    Ok((user, session))
}

pub fn issue_verification_token(
    conn: &Connection,
    user_id: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ServiceResult<String> {
    let token = new_token();
    conn.execute(
        "INSERT INTO verification_tokens(token_hash, user_id, expires_at) VALUES(?, ?, ?)",
        (digest(&token), user_id, db::ts(now + ttl)),
    )?;
    Ok(token)
}

/// Marks the owner's email verified and burns the token. Returns the user id.
pub fn redeem_verification_token(
    conn: &Connection,
    token: &str,
    now: DateTime<Utc>,
) -> ServiceResult<String> {
    let token_hash = digest(token);
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT user_id, expires_at FROM verification_tokens WHERE token_hash = ?",
            [&token_hash],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((user_id, expires_at)) = row else {
        return Err(ServiceError::not_found("Invalid or expired verification token"));
    };
    if expires_at < db::ts(now) {
        conn.execute("DELETE FROM verification_tokens WHERE token_hash = ?", [&token_hash])?;
        return Err(ServiceError::conflict("Verification token has expired"));
    }
    let tx = conn.unchecked_transaction()?;
    tx.execute("UPDATE users SET email_verified = 1 WHERE id = ?", [&user_id])?;
    tx.execute("DELETE FROM verification_tokens WHERE token_hash = ?", [&token_hash])?;
    tx.commit()?;
    Ok(user_id)
}
