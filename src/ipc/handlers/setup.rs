use super::{public, reply, Env, Outcome};
use crate::audit::{self, AuditEntry};
use crate::auth;
use crate::authz::Role;
use crate::error::ServiceError;
use crate::ipc::types::{AppState, Request};
use crate::validate;
use serde_json::{json, Value};

/// Creates the first administrator. Only open while the workspace has no
/// accounts at all.
fn bootstrap_admin(env: &Env<'_>, params: &Value) -> Outcome {
    let users: i64 = env
        .conn
        .query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
    if users > 0 {
        return Err(ServiceError::conflict(
            "Workspace already has accounts; ask an admin to create yours",
        ));
    }
    let account = validate::account(params)?;

    let tx = env.conn.unchecked_transaction()?;
    let user_id = auth::create_account(&tx, &account, &[Role::Admin], env.now)?;
    tx.execute("UPDATE users SET email_verified = 1 WHERE id = ?", [&user_id])?;
    tx.commit()?;

    audit::record(
        env.conn,
        AuditEntry {
            actor: &user_id,
            action: "admin_bootstrapped",
            resource_type: "user",
            resource_id: Some(&user_id),
            details: json!({ "email": account.email }),
        },
        env.now,
    );
    tracing::info!(user = %user_id, "first admin created");
    reply(
        "Admin account created",
        json!({ "userId": user_id, "email": account.email }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.bootstrapAdmin" => Some(public(state, req, bootstrap_admin)),
        _ => None,
    }
}
