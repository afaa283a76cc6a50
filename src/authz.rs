use crate::error::AuthorizationError;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            _ => None,
        }
    }
}

/// The authenticated identity behind a request, as resolved from its session
/// token. Never built from request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub roles: BTreeSet<Role>,
}

impl Caller {
    pub fn has(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn is_staff(&self) -> bool {
        self.has(Role::Admin) || self.has(Role::Teacher)
    }

    pub fn role_names(&self) -> Vec<&'static str> {
        self.roles.iter().map(|r| r.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    RecordAttendance,
    RecordResults,
    ViewRoster,
    CreateAssignment,
    SendNotification,
    CreateUser,
    ManageRoles,
    ManageClasses,
    ManageStudents,
    BulkImport,
    ManageAnnouncements,
    ManageTimetable,
    ViewAudit,
    ViewChildren,
}

impl Operation {
    pub fn allowed_roles(self) -> &'static [Role] {
        match self {
            Operation::RecordAttendance
            | Operation::RecordResults
            | Operation::ViewRoster
            | Operation::CreateAssignment
            | Operation::SendNotification => &[Role::Teacher, Role::Admin],
            Operation::CreateUser
            | Operation::ManageRoles
            | Operation::ManageClasses
            | Operation::ManageStudents
            | Operation::BulkImport
            | Operation::ManageAnnouncements
            | Operation::ManageTimetable
            | Operation::ViewAudit => &[Role::Admin],
            Operation::ViewChildren => &[Role::Parent],
        }
    }

    fn denial(self) -> &'static str {
        match self {
            Operation::RecordAttendance => "Only teachers and admins can mark attendance",
            Operation::RecordResults => "Only teachers and admins can record results",
            Operation::ViewRoster => "Only teachers and admins can view the roster",
            Operation::CreateAssignment => "Only teachers and admins can manage assignments",
            Operation::SendNotification => "Only teachers and admins can send notifications",
            Operation::CreateUser => "Only admins can create accounts",
            Operation::ManageRoles => "Only admins can change roles",
            Operation::ManageClasses => "Only admins can manage classes",
            Operation::ManageStudents => "Only admins can manage student records",
            Operation::BulkImport => "Only admins can bulk import students",
            Operation::ManageAnnouncements => "Only admins can manage announcements",
            Operation::ManageTimetable => "Only admins can manage the timetable",
            Operation::ViewAudit => "Only admins can view the audit log",
            Operation::ViewChildren => "Only guardians have linked children",
        }
    }
}

/// Permits `op` when the caller holds any of its roles. The error carries
/// only the fact of denial.
pub fn require(caller: &Caller, op: Operation) -> Result<(), AuthorizationError> {
    if op.allowed_roles().iter().any(|r| caller.has(*r)) {
        Ok(())
    } else {
        Err(AuthorizationError {
            message: op.denial().to_string(),
        })
    }
}
