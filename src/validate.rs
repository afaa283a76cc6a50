//! Input checks shared by every write path. Everything here is pure: the
//! current date is passed in, nothing touches the database.

use crate::error::ValidationError;
use crate::model::{
    AttendanceBatch, AttendanceEntry, AttendanceStatus, NewAccount, NewStudent, ResultEntry,
};
use chrono::{Duration, NaiveDate};
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

pub const MAX_FUTURE_DAYS: i64 = 30;
pub const ATTENDANCE_BATCH_MAX: usize = 200;
pub const RESULTS_BATCH_MAX: usize = 200;
pub const IMPORT_BATCH_MAX: usize = 100;

const NAME_MIN: usize = 2;
const NAME_MAX: usize = 100;
const ROLL_MAX: usize = 50;
const EMAIL_MAX: usize = 255;
const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 128;
const SUBJECT_MAX: usize = 100;

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("date regex"))
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex"))
}

fn roll_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]+$").expect("roll number regex"))
}

fn phone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\+?[0-9]{10,15}$").expect("phone regex"))
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([01][0-9]|2[0-3]):[0-5][0-9]$").expect("time regex"))
}

pub fn required_str(params: &Value, key: &str) -> Result<String, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Err(ValidationError::new(
            key,
            "required",
            format!("{} is required", key),
        )),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(ValidationError::new(
            key,
            "required",
            format!("{} must not be empty", key),
        )),
        Some(_) => Err(ValidationError::new(
            key,
            "type",
            format!("{} must be a string", key),
        )),
    }
}

/// Missing, null and blank all read as "not provided".
pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(ValidationError::new(
            key,
            "type",
            format!("{} must be a string", key),
        )),
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, ValidationError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::new(
            key,
            "type",
            format!("{} must be a boolean", key),
        )),
    }
}

pub fn required_array<'a>(params: &'a Value, key: &str) -> Result<&'a Vec<Value>, ValidationError> {
    params
        .get(key)
        .and_then(|v| v.as_array())
        .ok_or_else(|| ValidationError::new(key, "type", format!("{} must be an array", key)))
}

/// `YYYY-MM-DD` grammar plus a real calendar day. No policy on how far away it is.
pub fn calendar_date(field: &str, raw: &str) -> Result<NaiveDate, ValidationError> {
    let t = raw.trim();
    if !date_re().is_match(t) {
        return Err(ValidationError::new(
            field,
            "date_format",
            "Date must be in YYYY-MM-DD format",
        ));
    }
    NaiveDate::parse_from_str(t, "%Y-%m-%d")
        .map_err(|_| ValidationError::new(field, "date_calendar", "Invalid date"))
}

/// A calendar date no more than `MAX_FUTURE_DAYS` after `today`.
pub fn record_date(field: &str, raw: &str, today: NaiveDate) -> Result<NaiveDate, ValidationError> {
    let date = calendar_date(field, raw)?;
    if date > today + Duration::days(MAX_FUTURE_DAYS) {
        return Err(ValidationError::new(
            field,
            "date_future_window",
            format!(
                "Date cannot be more than {} days in the future",
                MAX_FUTURE_DAYS
            ),
        ));
    }
    Ok(date)
}

pub fn attendance_status(field: &str, raw: &str) -> Result<AttendanceStatus, ValidationError> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        ValidationError::new(
            field,
            "status_enum",
            "Status must be one of: present, absent, late, excused",
        )
    })
}

/// Present, integral and within [0, 100]. `85.0` is rejected along with `85.5`:
/// scores are whole numbers.
pub fn score(field: &str, raw: Option<&Value>) -> Result<i64, ValidationError> {
    let v = match raw {
        None | Some(Value::Null) => {
            return Err(ValidationError::new(field, "score_missing", "Score is required"))
        }
        Some(v) => v,
    };
    let Some(n) = v.as_i64() else {
        return Err(ValidationError::new(
            field,
            "score_integer",
            "Score must be a whole number",
        ));
    };
    if !(0..=100).contains(&n) {
        return Err(ValidationError::new(
            field,
            "score_range",
            "Score must be between 0 and 100",
        ));
    }
    Ok(n)
}

pub fn batch_len(field: &str, len: usize, max: usize) -> Result<(), ValidationError> {
    if len == 0 {
        return Err(ValidationError::new(
            field,
            "batch_empty",
            format!("{} cannot be empty", field),
        ));
    }
    if len > max {
        return Err(ValidationError::new(
            field,
            "batch_size",
            format!("Maximum {} {} per request", max, field),
        ));
    }
    Ok(())
}

pub fn name(field: &str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    let n = t.chars().count();
    if !(NAME_MIN..=NAME_MAX).contains(&n) {
        return Err(ValidationError::new(
            field,
            "name_length",
            format!("{} must be {}-{} characters", field, NAME_MIN, NAME_MAX),
        ));
    }
    if t.contains(['<', '>']) {
        return Err(ValidationError::new(
            field,
            "name_charset",
            format!("{} contains invalid characters", field),
        ));
    }
    Ok(t.to_string())
}

pub fn roll_number(field: &str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    let n = t.chars().count();
    if n == 0 || n > ROLL_MAX {
        return Err(ValidationError::new(
            field,
            "roll_length",
            format!("Roll number must be 1-{} characters", ROLL_MAX),
        ));
    }
    if !roll_re().is_match(t) {
        return Err(ValidationError::new(
            field,
            "roll_charset",
            "Roll number must contain only letters, numbers, and hyphens",
        ));
    }
    Ok(t.to_string())
}

/// Returns the address lowercased; accounts are looked up case-insensitively.
pub fn email(field: &str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    if t.chars().count() > EMAIL_MAX {
        return Err(ValidationError::new(
            field,
            "email_length",
            format!("Email must be less than {} characters", EMAIL_MAX),
        ));
    }
    if !email_re().is_match(t) {
        return Err(ValidationError::new(field, "email_format", "Invalid email format"));
    }
    Ok(t.to_ascii_lowercase())
}

pub fn password(field: &str, raw: &str) -> Result<String, ValidationError> {
    let n = raw.chars().count();
    if n < PASSWORD_MIN {
        return Err(ValidationError::new(
            field,
            "password_length",
            format!("Password must be at least {} characters long", PASSWORD_MIN),
        ));
    }
    if n > PASSWORD_MAX {
        return Err(ValidationError::new(
            field,
            "password_length",
            format!("Password must be at most {} characters long", PASSWORD_MAX),
        ));
    }
    if !raw.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::new(
            field,
            "password_uppercase",
            "Password must contain at least one uppercase letter",
        ));
    }
    if !raw.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::new(
            field,
            "password_lowercase",
            "Password must contain at least one lowercase letter",
        ));
    }
    if !raw.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new(
            field,
            "password_digit",
            "Password must contain at least one number",
        ));
    }
    Ok(raw.to_string())
}

/// Spaces, dashes and parentheses are formatting; what remains must be
/// 10-15 digits with an optional leading `+`.
pub fn phone(field: &str, raw: &str) -> Result<String, ValidationError> {
    let clean: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();
    if !phone_re().is_match(&clean) {
        return Err(ValidationError::new(
            field,
            "phone_format",
            "Invalid phone number format. Must be 10-15 digits, optionally starting with +",
        ));
    }
    Ok(clean)
}

pub fn subject(field: &str, raw: &str) -> Result<String, ValidationError> {
    text(field, raw, SUBJECT_MAX)
}

pub fn text(field: &str, raw: &str, max: usize) -> Result<String, ValidationError> {
    let t = raw.trim();
    if t.is_empty() {
        return Err(ValidationError::new(
            field,
            "required",
            format!("{} must not be empty", field),
        ));
    }
    if t.chars().count() > max {
        return Err(ValidationError::new(
            field,
            "text_length",
            format!("{} must be at most {} characters", field, max),
        ));
    }
    Ok(t.to_string())
}

pub fn clock_time(field: &str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    if !time_re().is_match(t) {
        return Err(ValidationError::new(
            field,
            "time_format",
            format!("{} must be HH:MM", field),
        ));
    }
    Ok(t.to_string())
}

pub fn one_time_code(field: &str, raw: &str) -> Result<String, ValidationError> {
    let t = raw.trim();
    if t.len() != 6 || !t.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new(
            field,
            "code_format",
            "Code must be 6 digits",
        ));
    }
    Ok(t.to_string())
}

pub fn account(params: &Value) -> Result<NewAccount, ValidationError> {
    let raw_email = required_str(params, "email")?;
    let raw_password = match params.get("password") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => {
            return Err(ValidationError::new(
                "password",
                "required",
                "password is required",
            ))
        }
    };
    let raw_name = required_str(params, "name")?;
    Ok(NewAccount {
        email: email("email", &raw_email)?,
        password: password("password", &raw_password)?,
        name: name("name", &raw_name)?,
    })
}

pub fn new_student(params: &Value) -> Result<NewStudent, ValidationError> {
    let account = account(params)?;
    let raw_roll = required_str(params, "rollNumber")?;
    Ok(NewStudent {
        account,
        roll_number: roll_number("rollNumber", &raw_roll)?,
        class_id: optional_str(params, "classId")?,
        guardian_id: optional_str(params, "guardianId")?,
    })
}

/// Whole-batch check: every entry is validated before any is written. The
/// size cap is checked before the entries so an oversized batch is rejected
/// regardless of its contents.
pub fn attendance_batch(
    params: &Value,
    today: NaiveDate,
) -> Result<AttendanceBatch, ValidationError> {
    let records = required_array(params, "records")?;
    batch_len("records", records.len(), ATTENDANCE_BATCH_MAX)?;
    let raw_date = required_str(params, "date")?;
    let date = record_date("date", &raw_date, today)?;

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(records.len());
    for (i, rec) in records.iter().enumerate() {
        let student_id = required_str(rec, "studentId").map_err(|e| e.at("records", i))?;
        let raw_status = required_str(rec, "status").map_err(|e| e.at("records", i))?;
        let status = attendance_status("status", &raw_status).map_err(|e| e.at("records", i))?;
        if !seen.insert(student_id.clone()) {
            return Err(ValidationError::new(
                "studentId",
                "duplicate_entry",
                format!("Student {} appears more than once", student_id),
            )
            .at("records", i));
        }
        entries.push(AttendanceEntry { student_id, status });
    }
    Ok(AttendanceBatch { date, entries })
}

fn result_entry(value: &Value) -> Result<ResultEntry, ValidationError> {
    let student_id = required_str(value, "studentId")?;
    let raw_subject = required_str(value, "subject")?;
    let subject = subject("subject", &raw_subject)?;
    let score = score("score", value.get("score"))?;
    Ok(ResultEntry {
        student_id,
        subject,
        score,
    })
}

/// Accepts `{ results: [...] }` or a single `{ studentId, subject, score }`.
pub fn results_batch(params: &Value) -> Result<Vec<ResultEntry>, ValidationError> {
    if params.get("results").is_none() {
        return Ok(vec![result_entry(params)?]);
    }
    let results = required_array(params, "results")?;
    batch_len("results", results.len(), RESULTS_BATCH_MAX)?;

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(results.len());
    for (i, raw) in results.iter().enumerate() {
        let entry = result_entry(raw).map_err(|e| e.at("results", i))?;
        if !seen.insert((entry.student_id.clone(), entry.subject.clone())) {
            return Err(ValidationError::new(
                "subject",
                "duplicate_entry",
                format!(
                    "Student {} has more than one {} score",
                    entry.student_id, entry.subject
                ),
            )
            .at("results", i));
        }
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn date_policy_clauses() {
        let today = day("2025-03-10");
        assert_eq!(record_date("date", "2025-03-10", today), Ok(today));
        assert!(record_date("date", "2025-04-09", today).is_ok());

        let far = record_date("date", "2099-01-01", today).unwrap_err();
        assert_eq!(far.rule, "date_future_window");
        assert_eq!(
            record_date("date", "2025-04-10", today).unwrap_err().rule,
            "date_future_window"
        );
        assert_eq!(
            record_date("date", "2024-13-01", today).unwrap_err().rule,
            "date_calendar"
        );
        assert_eq!(
            record_date("date", "2023-02-29", today).unwrap_err().rule,
            "date_calendar"
        );
        assert_eq!(
            record_date("date", "2024-1-01", today).unwrap_err().rule,
            "date_format"
        );
        assert_eq!(
            record_date("date", "2024-01-01T00:00", today).unwrap_err().rule,
            "date_format"
        );
    }

    #[test]
    fn past_dates_are_accepted() {
        let today = day("2025-03-10");
        assert!(record_date("date", "2024-02-29", today).is_ok());
    }

    #[test]
    fn status_is_case_insensitive() {
        assert_eq!(attendance_status("s", "PRESENT"), Ok(AttendanceStatus::Present));
        assert_eq!(attendance_status("s", "Excused"), Ok(AttendanceStatus::Excused));
        assert_eq!(attendance_status("s", "maybe").unwrap_err().rule, "status_enum");
    }

    #[test]
    fn score_rules() {
        assert_eq!(score("score", Some(&json!(0))), Ok(0));
        assert_eq!(score("score", Some(&json!(100))), Ok(100));
        assert_eq!(score("score", None).unwrap_err().rule, "score_missing");
        assert_eq!(score("score", Some(&json!(null))).unwrap_err().rule, "score_missing");
        assert_eq!(score("score", Some(&json!(101))).unwrap_err().rule, "score_range");
        assert_eq!(score("score", Some(&json!(-1))).unwrap_err().rule, "score_range");
        assert_eq!(score("score", Some(&json!(85.5))).unwrap_err().rule, "score_integer");
        assert_eq!(score("score", Some(&json!("85"))).unwrap_err().rule, "score_integer");
    }

    #[test]
    fn string_field_policies() {
        assert!(name("name", "Al").is_ok());
        assert_eq!(name("name", "A").unwrap_err().rule, "name_length");
        assert_eq!(name("name", &"x".repeat(101)).unwrap_err().rule, "name_length");
        assert_eq!(
            name("name", "<script>x</script>").unwrap_err().rule,
            "name_charset"
        );

        assert_eq!(roll_number("r", "JSS1-042"), Ok("JSS1-042".to_string()));
        assert_eq!(roll_number("r", "").unwrap_err().rule, "roll_length");
        assert_eq!(roll_number("r", &"1".repeat(51)).unwrap_err().rule, "roll_length");
        assert_eq!(roll_number("r", "A_1").unwrap_err().rule, "roll_charset");

        assert_eq!(email("e", " Ada@School.Org "), Ok("ada@school.org".to_string()));
        assert_eq!(email("e", "ada@school").unwrap_err().rule, "email_format");

        assert!(password("p", "Passw0rd").is_ok());
        assert_eq!(password("p", "Pa0").unwrap_err().rule, "password_length");
        assert_eq!(password("p", "password1").unwrap_err().rule, "password_uppercase");
        assert_eq!(password("p", "PASSWORD1").unwrap_err().rule, "password_lowercase");
        assert_eq!(password("p", "Password").unwrap_err().rule, "password_digit");

        assert_eq!(phone("ph", "+234 (803) 123-4567"), Ok("+2348031234567".to_string()));
        assert_eq!(phone("ph", "12345").unwrap_err().rule, "phone_format");
    }

    #[test]
    fn attendance_batch_rejects_whole_batch_on_one_bad_status() {
        let today = day("2025-03-10");
        let params = json!({
            "date": "2025-03-10",
            "records": [
                { "studentId": "s1", "status": "present" },
                { "studentId": "s2", "status": "absent" },
                { "studentId": "s3", "status": "late" },
                { "studentId": "s4", "status": "maybe" }
            ]
        });
        let e = attendance_batch(&params, today).unwrap_err();
        assert_eq!(e.rule, "status_enum");
        assert_eq!(e.field, "records[3].status");
    }

    #[test]
    fn attendance_batch_cap_applies_before_entry_checks() {
        let today = day("2025-03-10");
        let records: Vec<Value> = (0..201)
            .map(|i| json!({ "studentId": format!("s{}", i), "status": "nope" }))
            .collect();
        let e = attendance_batch(&json!({ "date": "2025-03-10", "records": records }), today)
            .unwrap_err();
        assert_eq!(e.rule, "batch_size");

        let e = attendance_batch(&json!({ "date": "2025-03-10", "records": [] }), today)
            .unwrap_err();
        assert_eq!(e.rule, "batch_empty");
    }

    #[test]
    fn attendance_batch_normalizes_status_and_rejects_duplicates() {
        let today = day("2025-03-10");
        let ok = attendance_batch(
            &json!({ "date": "2025-03-09", "records": [{ "studentId": "s1", "status": "LATE" }] }),
            today,
        )
        .unwrap();
        assert_eq!(ok.date, day("2025-03-09"));
        assert_eq!(ok.entries[0].status, AttendanceStatus::Late);

        let dup = attendance_batch(
            &json!({ "date": "2025-03-09", "records": [
                { "studentId": "s1", "status": "present" },
                { "studentId": "s1", "status": "absent" }
            ] }),
            today,
        )
        .unwrap_err();
        assert_eq!(dup.rule, "duplicate_entry");
    }

    #[test]
    fn results_batch_accepts_single_and_list_forms() {
        let single = results_batch(&json!({ "studentId": "s1", "subject": " Math ", "score": 91 }))
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].subject, "Math");

        let many = results_batch(&json!({ "results": [
            { "studentId": "s1", "subject": "Math", "score": 91 },
            { "studentId": "s1", "subject": "English", "score": 64 }
        ] }))
        .unwrap();
        assert_eq!(many.len(), 2);

        let missing = results_batch(&json!({ "studentId": "s1", "subject": "Math" })).unwrap_err();
        assert_eq!(missing.rule, "score_missing");

        let dup = results_batch(&json!({ "results": [
            { "studentId": "s1", "subject": "Math", "score": 91 },
            { "studentId": "s1", "subject": "Math", "score": 40 }
        ] }))
        .unwrap_err();
        assert_eq!(dup.rule, "duplicate_entry");
    }

    #[test]
    fn new_student_collects_all_fields() {
        let s = new_student(&json!({
            "email": "kid@school.org",
            "password": "Secret123",
            "name": "Kid One",
            "rollNumber": "R-1",
            "classId": ""
        }))
        .unwrap();
        assert_eq!(s.roll_number, "R-1");
        assert_eq!(s.class_id, None);

        let e = new_student(&json!({ "email": "kid@school.org", "name": "Kid", "rollNumber": "R" }))
            .unwrap_err();
        assert_eq!(e.field, "password");
    }
}
