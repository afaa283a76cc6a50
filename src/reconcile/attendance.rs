use super::{batch_failure, commit_failure};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Caller, Operation};
use crate::db;
use crate::error::ServiceResult;
use crate::model::{AttendanceBatch, AttendanceStatus};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAttendance {
    pub id: String,
    pub student_id: String,
    pub date: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceOutcome {
    pub date: String,
    pub count: usize,
    pub records: Vec<StoredAttendance>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSummary {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
    /// Present or late over all recorded days, percent to one decimal.
    pub rate: Option<f64>,
}

/// Upserts one row per (student, date). A resubmission replaces status and
/// recorder in place; the latest commit wins.
pub fn record(
    conn: &Connection,
    caller: &Caller,
    batch: &AttendanceBatch,
    now: DateTime<Utc>,
) -> ServiceResult<AttendanceOutcome> {
    authz::require(caller, Operation::RecordAttendance)?;

    let date = batch.date.format("%Y-%m-%d").to_string();
    let stamp = db::ts(now);
    let attempted = batch.entries.len();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| commit_failure("attendance", e, attempted))?;
    let mut records = Vec::with_capacity(attempted);
    for (i, entry) in batch.entries.iter().enumerate() {
        let id: String = tx
            .query_row(
                "INSERT INTO attendance(
                    id, student_id, date, status, recorded_by, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, date) DO UPDATE SET
                   status = excluded.status,
                   recorded_by = excluded.recorded_by,
                   updated_at = excluded.updated_at
                 RETURNING id",
                (
                    Uuid::new_v4().to_string(),
                    &entry.student_id,
                    &date,
                    entry.status.as_str(),
                    &caller.user_id,
                    &stamp,
                    &stamp,
                ),
                |r| r.get(0),
            )
            .map_err(|e| batch_failure("attendance", &entry.student_id, e, attempted, i))?;
        records.push(StoredAttendance {
            id,
            student_id: entry.student_id.clone(),
            date: date.clone(),
            status: entry.status.as_str().to_string(),
        });
    }
    tx.commit()
        .map_err(|e| commit_failure("attendance", e, attempted))?;

    audit::record(
        conn,
        AuditEntry {
            actor: &caller.user_id,
            action: "attendance_marked",
            resource_type: "attendance",
            resource_id: None,
            details: json!({ "date": date, "count": attempted }),
        },
        now,
    );
    tracing::info!(actor = %caller.user_id, date = %date, count = attempted, "attendance recorded");

    Ok(AttendanceOutcome {
        date,
        count: attempted,
        records,
    })
}

fn map_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StoredAttendance> {
    Ok(StoredAttendance {
        id: r.get(0)?,
        student_id: r.get(1)?,
        date: r.get(2)?,
        status: r.get(3)?,
    })
}

/// Newest first, optionally bounded by an inclusive date range.
pub fn for_student(
    conn: &Connection,
    student_id: &str,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> ServiceResult<Vec<StoredAttendance>> {
    let mut sql = String::from(
        "SELECT id, student_id, date, status FROM attendance WHERE student_id = ?",
    );
    let mut bind: Vec<Value> = vec![Value::Text(student_id.to_string())];
    if let Some(f) = from {
        sql.push_str(" AND date >= ?");
        bind.push(Value::Text(f.format("%Y-%m-%d").to_string()));
    }
    if let Some(t) = to {
        sql.push_str(" AND date <= ?");
        bind.push(Value::Text(t.format("%Y-%m-%d").to_string()));
    }
    sql.push_str(" ORDER BY date DESC");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn for_date(
    conn: &Connection,
    date: NaiveDate,
    class_id: Option<&str>,
) -> ServiceResult<Vec<StoredAttendance>> {
    let day = date.format("%Y-%m-%d").to_string();
    let rows = match class_id {
        Some(cid) => {
            let mut stmt = conn.prepare(
                "SELECT a.id, a.student_id, a.date, a.status
                 FROM attendance a
                 JOIN students s ON s.id = a.student_id
                 WHERE a.date = ? AND s.class_id = ?
                 ORDER BY s.name",
            )?;
            let rows = stmt
                .query_map((&day, cid), map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT a.id, a.student_id, a.date, a.status
                 FROM attendance a
                 JOIN students s ON s.id = a.student_id
                 WHERE a.date = ?
                 ORDER BY s.name",
            )?;
            let rows = stmt
                .query_map([&day], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

pub fn summarize(records: &[StoredAttendance]) -> AttendanceSummary {
    let mut s = AttendanceSummary {
        total: records.len(),
        ..AttendanceSummary::default()
    };
    let mut attended = 0usize;
    for rec in records {
        let Some(status) = AttendanceStatus::parse(&rec.status) else {
            continue;
        };
        match status {
            AttendanceStatus::Present => s.present += 1,
            AttendanceStatus::Absent => s.absent += 1,
            AttendanceStatus::Late => s.late += 1,
            AttendanceStatus::Excused => s.excused += 1,
        }
        if status.is_attended() {
            attended += 1;
        }
    }
    if s.total > 0 {
        let pct = 100.0 * attended as f64 / s.total as f64;
        s.rate = Some((pct * 10.0).round() / 10.0);
    }
    s
}
