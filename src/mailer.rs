use crate::db;
use crate::error::DependencyError;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

pub trait Mailer {
    fn send(&self, email: &Email) -> Result<(), DependencyError>;
}

/// Queues mail in the workspace `outbox` table; delivery is somebody else's job.
pub struct Outbox<'a> {
    conn: &'a Connection,
    sender: &'a str,
    now: DateTime<Utc>,
}

impl<'a> Outbox<'a> {
    pub fn new(conn: &'a Connection, sender: &'a str, now: DateTime<Utc>) -> Self {
        Self { conn, sender, now }
    }
}

impl Mailer for Outbox<'_> {
    fn send(&self, email: &Email) -> Result<(), DependencyError> {
        self.conn
            .execute(
                "INSERT INTO outbox(id, sender, recipient, subject, body, status, created_at)
                 VALUES(?, ?, ?, ?, ?, 'queued', ?)",
                (
                    Uuid::new_v4().to_string(),
                    self.sender,
                    &email.to,
                    &email.subject,
                    &email.body,
                    db::ts(self.now),
                ),
            )
            .map_err(|e| DependencyError {
                collaborator: "mailer",
                message: e.to_string(),
            })?;
        Ok(())
    }
}

/// Fire-and-forget. Returns whether the message was handed off so callers can
/// report it, but a failure never fails the caller's operation.
pub fn dispatch(mailer: &dyn Mailer, email: &Email) -> bool {
    match mailer.send(email) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(subject = %email.subject, error = %e, "email not queued");
            false
        }
    }
}

pub fn verification_email(to: &str, name: &str, link: &str, ttl_hours: i64) -> Email {
    Email {
        to: to.to_string(),
        subject: "Verify Your Email - School Management Portal".to_string(),
        body: format!(
            "Welcome {}!\n\n\
             Thank you for joining our School Management Portal. Please verify your email \
             address by opening the link below:\n\n{}\n\n\
             This link will expire in {} hours.\n\n\
             If you didn't create an account, you can safely ignore this email.\n",
            name, link, ttl_hours
        ),
    }
}

pub fn login_code_email(to: &str, code: &str, ttl_minutes: i64) -> Email {
    Email {
        to: to.to_string(),
        subject: "Your sign-in code - School Management Portal".to_string(),
        body: format!(
            "Your sign-in code is {}\n\n\
             It expires in {} minutes and can be used once.\n\n\
             If you didn't request a code, you can ignore this email.\n",
            code, ttl_minutes
        ),
    }
}

pub fn notification_email(to: &str, title: &str, message: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: title.to_string(),
        body: format!(
            "{}\n\n{}\n\nThis is an automated notification from School Management Portal.\n",
            title, message
        ),
    }
}
