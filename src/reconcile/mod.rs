//! Batch writers for attendance and results. Both take already-validated
//! input plus the authenticated caller, upsert every entry inside a single
//! transaction, and append an audit entry once the batch is committed.

pub mod attendance;
pub mod results;

use crate::error::{PersistenceError, ServiceError};

fn batch_failure(
    what: &str,
    key: &str,
    e: rusqlite::Error,
    attempted: usize,
    index: usize,
) -> ServiceError {
    ServiceError::Persistence(PersistenceError {
        message: format!(
            "Failed to save {} for {}: {}. No records were saved.",
            what, key, e
        ),
        attempted,
        applied: 0,
        failed_at: Some(index),
    })
}

fn commit_failure(what: &str, e: rusqlite::Error, attempted: usize) -> ServiceError {
    ServiceError::Persistence(PersistenceError {
        message: format!("Failed to save {}: {}. No records were saved.", what, e),
        attempted,
        applied: 0,
        failed_at: None,
    })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::auth;
    use crate::authz::{Caller, Role};
    use crate::model::NewAccount;
    use chrono::Utc;
    use rusqlite::Connection;

    pub fn user(conn: &Connection, email: &str, roles: &[Role]) -> Caller {
        let id = auth::create_account(
            conn,
            &NewAccount {
                email: email.to_string(),
                password: "Secret123".to_string(),
                name: "Fixture User".to_string(),
            },
            roles,
            Utc::now(),
        )
        .unwrap();
        Caller {
            user_id: id,
            roles: roles.iter().copied().collect(),
        }
    }

    pub fn student(conn: &Connection, email: &str, roll: &str) -> String {
        let c = user(conn, email, &[Role::Student]);
        conn.execute(
            "INSERT INTO students(id, name, email, roll_number, created_at)
             VALUES(?, 'Fixture Student', ?, ?, '2025-01-01T00:00:00Z')",
            (&c.user_id, email, roll),
        )
        .unwrap();
        c.user_id
    }
}
