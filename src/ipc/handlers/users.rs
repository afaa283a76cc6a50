use super::auth::queue_verification;
use super::{authed, reply, student_exists, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::auth;
use crate::authz::{self, Operation, Role};
use crate::error::{ServiceError, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use rusqlite::OptionalExtension;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

fn users_list(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageRoles)?;
    let role = match validate::optional_str(params, "role")? {
        Some(raw) => Some(Role::parse(&raw).ok_or_else(|| {
            ValidationError::new(
                "role",
                "role_enum",
                "role must be admin, teacher, student or parent",
            )
        })?),
        None => None,
    };

    let mut stmt = ctx.conn.prepare(
        "SELECT u.id
         FROM users u
         WHERE ?1 IS NULL
            OR EXISTS (SELECT 1 FROM user_roles r WHERE r.user_id = u.id AND r.role = ?1)
         ORDER BY u.name COLLATE NOCASE",
    )?;
    let ids = stmt
        .query_map([role.map(|r| r.as_str())], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut users = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(u) = auth::load_user(ctx.conn, &id)? {
            users.push(u);
        }
    }
    let count = users.len();
    reply(format!("{} users", count), json!({ "users": users }))
}

fn users_set_roles(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageRoles)?;
    let user_id = validate::required_str(params, "userId")?;
    let raw_roles = validate::required_array(params, "roles")?;
    if raw_roles.is_empty() {
        return Err(
            ValidationError::new("roles", "roles_empty", "At least one role is required").into(),
        );
    }
    let mut roles = BTreeSet::new();
    for (i, v) in raw_roles.iter().enumerate() {
        let role = v.as_str().and_then(Role::parse).ok_or_else(|| {
            ValidationError::new(
                format!("roles[{}]", i),
                "role_enum",
                "role must be admin, teacher, student or parent",
            )
        })?;
        roles.insert(role);
    }
    if user_id == ctx.caller.user_id && !roles.contains(&Role::Admin) {
        return Err(ServiceError::conflict("You cannot remove your own admin role"));
    }
    if auth::load_user(ctx.conn, &user_id)?.is_none() {
        return Err(ServiceError::not_found("User not found"));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute("DELETE FROM user_roles WHERE user_id = ?", [&user_id])?;
    for role in &roles {
        tx.execute(
            "INSERT INTO user_roles(user_id, role) VALUES(?, ?)",
            (&user_id, role.as_str()),
        )?;
    }
    tx.commit()?;

    let names: Vec<&str> = roles.iter().map(|r| r.as_str()).collect();
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "roles_updated",
            resource_type: "user",
            resource_id: Some(&user_id),
            details: json!({ "roles": names }),
        },
        ctx.now,
    );
    reply("Roles updated", json!({ "userId": user_id, "roles": names }))
}

fn staff_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::CreateUser)?;
    let account = validate::account(params)?;
    let subject = match validate::optional_str(params, "subject")? {
        Some(s) => Some(validate::text("subject", &s, 100)?),
        None => None,
    };
    let position = match validate::optional_str(params, "position")? {
        Some(s) => Some(validate::text("position", &s, 100)?),
        None => None,
    };

    let tx = ctx.conn.unchecked_transaction()?;
    let user_id = auth::create_account(&tx, &account, &[Role::Teacher], ctx.now)?;
    tx.execute(
        "INSERT INTO staff(user_id, subject, position, created_at) VALUES(?, ?, ?, ?)",
        (&user_id, &subject, &position, crate::db::ts(ctx.now)),
    )?;
    tx.commit()?;

    let queued = queue_verification(
        ctx.conn,
        ctx.config,
        &ctx.outbox(),
        &user_id,
        &account.email,
        &account.name,
        ctx.now,
    )
    .unwrap_or_else(|e| {
        tracing::warn!(user = %user_id, error = %e, "verification email not queued");
        false
    });
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "staff_created",
            resource_type: "user",
            resource_id: Some(&user_id),
            details: json!({ "email": account.email, "subject": subject }),
        },
        ctx.now,
    );
    tracing::info!(actor = %ctx.actor(), user = %user_id, "staff created");
    reply(
        "Staff member created",
        json!({
            "id": user_id,
            "email": account.email,
            "name": account.name,
            "subject": subject,
            "position": position,
            "emailQueued": queued,
        }),
    )
}

fn staff_list(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ViewRoster)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT u.id, u.name, u.email, s.subject, s.position
         FROM staff s
         JOIN users u ON u.id = s.user_id
         ORDER BY u.name COLLATE NOCASE",
    )?;
    let staff = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "email": r.get::<_, String>(2)?,
                "subject": r.get::<_, Option<String>>(3)?,
                "position": r.get::<_, Option<String>>(4)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(format!("{} staff", staff.len()), json!({ "staff": staff }))
}

fn guardians_create(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::CreateUser)?;
    let account = validate::account(params)?;
    let phone = match validate::optional_str(params, "phone")? {
        Some(p) => Some(validate::phone("phone", &p)?),
        None => None,
    };
    let mut student_ids = Vec::new();
    if let Some(v) = params.get("studentIds").filter(|v| !v.is_null()) {
        let arr = v.as_array().ok_or_else(|| {
            ValidationError::new("studentIds", "type", "studentIds must be an array")
        })?;
        for (i, s) in arr.iter().enumerate() {
            match s.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                Some(id) => student_ids.push(id.to_string()),
                None => {
                    return Err(ValidationError::new(
                        format!("studentIds[{}]", i),
                        "type",
                        "student id must be a non-empty string",
                    )
                    .into())
                }
            }
        }
    }

    let guardian_id = Uuid::new_v4().to_string();
    let tx = ctx.conn.unchecked_transaction()?;
    let user_id = auth::create_account(&tx, &account, &[Role::Parent], ctx.now)?;
    tx.execute(
        "INSERT INTO guardians(id, user_id, name, email, phone, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &guardian_id,
            &user_id,
            &account.name,
            &account.email,
            &phone,
            crate::db::ts(ctx.now),
        ),
    )?;
    tx.commit()?;

    // Links are attempted one by one; a bad id does not undo the guardian.
    let mut linked = Vec::new();
    let mut unlinked = Vec::new();
    for sid in student_ids {
        match link(ctx, &guardian_id, &sid, "parent") {
            Ok(()) => linked.push(sid),
            Err(e) => unlinked.push(json!({ "studentId": sid, "error": e.to_string() })),
        }
    }

    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "guardian_created",
            resource_type: "guardian",
            resource_id: Some(&guardian_id),
            details: json!({ "email": account.email, "linked": linked.len() }),
        },
        ctx.now,
    );
    reply(
        "Guardian created",
        json!({
            "id": guardian_id,
            "userId": user_id,
            "email": account.email,
            "name": account.name,
            "phone": phone,
            "linked": linked,
            "unlinked": unlinked,
        }),
    )
}

fn link(
    ctx: &Ctx<'_>,
    guardian_id: &str,
    student_id: &str,
    relationship: &str,
) -> Result<(), ServiceError> {
    if !student_exists(ctx.conn, student_id)? {
        return Err(ServiceError::not_found("Student not found"));
    }
    ctx.conn.execute(
        "INSERT INTO student_guardians(student_id, guardian_id, relationship) VALUES(?, ?, ?)
         ON CONFLICT(student_id, guardian_id) DO UPDATE SET relationship = excluded.relationship",
        (student_id, guardian_id, relationship),
    )?;
    Ok(())
}

fn guardians_link(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageStudents)?;
    let guardian_id = validate::required_str(params, "guardianId")?;
    let student_id = validate::required_str(params, "studentId")?;
    let relationship = match validate::optional_str(params, "relationship")? {
        Some(r) => validate::text("relationship", &r, 50)?,
        None => "parent".to_string(),
    };
    let exists: Option<i64> = ctx
        .conn
        .query_row("SELECT 1 FROM guardians WHERE id = ?", [&guardian_id], |r| r.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(ServiceError::not_found("Guardian not found"));
    }
    link(ctx, &guardian_id, &student_id, &relationship)?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "guardian_linked",
            resource_type: "guardian",
            resource_id: Some(&guardian_id),
            details: json!({ "studentId": student_id, "relationship": relationship }),
        },
        ctx.now,
    );
    reply(
        "Guardian linked",
        json!({ "guardianId": guardian_id, "studentId": student_id, "relationship": relationship }),
    )
}

fn guardians_children(ctx: &Ctx<'_>, _params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ViewChildren)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT s.id, s.name, s.roll_number, s.class_id, c.name, sg.relationship
         FROM guardians g
         JOIN student_guardians sg ON sg.guardian_id = g.id
         JOIN students s ON s.id = sg.student_id
         LEFT JOIN classes c ON c.id = s.class_id
         WHERE g.user_id = ?
         ORDER BY s.name COLLATE NOCASE",
    )?;
    let children = stmt
        .query_map([ctx.actor()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "rollNumber": r.get::<_, String>(2)?,
                "classId": r.get::<_, Option<String>>(3)?,
                "className": r.get::<_, Option<String>>(4)?,
                "relationship": r.get::<_, String>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(
        format!("{} linked students", children.len()),
        json!({ "children": children }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.list" => Some(authed(state, req, users_list)),
        "users.setRoles" => Some(authed(state, req, users_set_roles)),
        "staff.create" => Some(authed(state, req, staff_create)),
        "staff.list" => Some(authed(state, req, staff_list)),
        "guardians.create" => Some(authed(state, req, guardians_create)),
        "guardians.link" => Some(authed(state, req, guardians_link)),
        "guardians.children" => Some(authed(state, req, guardians_children)),
        _ => None,
    }
}
