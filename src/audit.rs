use crate::db;
use crate::error::DependencyError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub actor: &'a str,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub details: serde_json::Value,
}

pub fn append(
    conn: &Connection,
    entry: &AuditEntry<'_>,
    at: DateTime<Utc>,
) -> Result<(), DependencyError> {
    conn.execute(
        "INSERT INTO audit_logs(id, actor, action, resource_type, resource_id, details, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            entry.actor,
            entry.action,
            entry.resource_type,
            entry.resource_id,
            entry.details.to_string(),
            db::ts(at),
        ),
    )
    .map_err(|e| DependencyError {
        collaborator: "audit",
        message: e.to_string(),
    })?;
    Ok(())
}

/// Best-effort: the write being described has already happened, so a failed
/// audit insert is logged and dropped.
pub fn record(conn: &Connection, entry: AuditEntry<'_>, at: DateTime<Utc>) {
    if let Err(e) = append(conn, &entry, at) {
        tracing::warn!(
            action = entry.action,
            actor = entry.actor,
            error = %e,
            "audit entry dropped"
        );
    }
}
