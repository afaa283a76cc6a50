use clap::Parser;
use std::path::PathBuf;

/// School records sidecar: one JSON request per stdin line, one JSON
/// response per stdout line.
#[derive(Debug, Clone, Parser)]
#[command(name = "schoolbookd", version)]
pub struct Config {
    /// Open this workspace at startup instead of waiting for `workspace.select`
    #[arg(long, env = "SCHOOLBOOK_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Lifetime of a login session
    #[arg(long, default_value_t = 168, env = "SCHOOLBOOK_SESSION_TTL_HOURS")]
    pub session_ttl_hours: i64,

    /// Lifetime of an emailed one-time sign-in code
    #[arg(long, default_value_t = 10, env = "SCHOOLBOOK_CODE_TTL_MINUTES")]
    pub code_ttl_minutes: i64,

    /// Lifetime of an email verification link
    #[arg(long, default_value_t = 24, env = "SCHOOLBOOK_VERIFICATION_TTL_HOURS")]
    pub verification_ttl_hours: i64,

    /// Sender address stamped on outbound mail
    #[arg(long, default_value = "noreply@schoolbook.local", env = "SCHOOLBOOK_MAIL_FROM")]
    pub mail_from: String,

    /// Base URL of the web app; verification links point at `<app-url>/verify`
    #[arg(long, default_value = "http://localhost:5173", env = "SCHOOLBOOK_APP_URL")]
    pub app_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            session_ttl_hours: 168,
            code_ttl_minutes: 10,
            verification_ttl_hours: 24,
            mail_from: "noreply@schoolbook.local".to_string(),
            app_url: "http://localhost:5173".to_string(),
        }
    }
}
