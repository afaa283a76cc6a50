use super::{batch_failure, commit_failure};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Caller, Operation};
use crate::db;
use crate::error::ServiceResult;
use crate::grading::{self, Grade};
use crate::model::ResultEntry;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResult {
    pub id: String,
    pub student_id: String,
    pub subject: String,
    pub score: i64,
    pub grade: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultsOutcome {
    pub count: usize,
    pub results: Vec<StoredResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResults {
    pub student_id: String,
    pub results: Vec<StoredResult>,
    pub average: Option<f64>,
    pub overall_grade: Option<Grade>,
}

/// Upserts one row per (student, subject). The stored grade is always the
/// classification of the stored score; callers never supply it.
pub fn record(
    conn: &Connection,
    caller: &Caller,
    entries: &[ResultEntry],
    now: DateTime<Utc>,
) -> ServiceResult<ResultsOutcome> {
    authz::require(caller, Operation::RecordResults)?;

    let stamp = db::ts(now);
    let attempted = entries.len();

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| commit_failure("results", e, attempted))?;
    let mut results = Vec::with_capacity(attempted);
    for (i, entry) in entries.iter().enumerate() {
        let grade = grading::classify(entry.score);
        let id: String = tx
            .query_row(
                "INSERT INTO results(
                    id, student_id, subject, score, grade, recorded_by, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(student_id, subject) DO UPDATE SET
                   score = excluded.score,
                   grade = excluded.grade,
                   recorded_by = excluded.recorded_by,
                   updated_at = excluded.updated_at
                 RETURNING id",
                (
                    Uuid::new_v4().to_string(),
                    &entry.student_id,
                    &entry.subject,
                    entry.score,
                    grade.as_str(),
                    &caller.user_id,
                    &stamp,
                    &stamp,
                ),
                |r| r.get(0),
            )
            .map_err(|e| batch_failure("result", &entry.student_id, e, attempted, i))?;
        results.push(StoredResult {
            id,
            student_id: entry.student_id.clone(),
            subject: entry.subject.clone(),
            score: entry.score,
            grade: grade.as_str().to_string(),
        });
    }
    tx.commit()
        .map_err(|e| commit_failure("results", e, attempted))?;

    for r in &results {
        audit::record(
            conn,
            AuditEntry {
                actor: &caller.user_id,
                action: "result_recorded",
                resource_type: "result",
                resource_id: Some(&r.id),
                details: json!({
                    "studentId": r.student_id,
                    "subject": r.subject,
                    "score": r.score,
                    "grade": r.grade,
                }),
            },
            now,
        );
    }
    tracing::info!(actor = %caller.user_id, count = attempted, "results recorded");

    Ok(ResultsOutcome {
        count: attempted,
        results,
    })
}

pub fn for_student(conn: &Connection, student_id: &str) -> ServiceResult<StudentResults> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, subject, score, grade
         FROM results WHERE student_id = ?
         ORDER BY subject COLLATE NOCASE",
    )?;
    let results = stmt
        .query_map([student_id], |r| {
            Ok(StoredResult {
                id: r.get(0)?,
                student_id: r.get(1)?,
                subject: r.get(2)?,
                score: r.get(3)?,
                grade: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let scores: Vec<i64> = results.iter().map(|r| r.score).collect();
    let average = grading::average(&scores);
    let overall_grade = grading::overall(&scores);
    Ok(StudentResults {
        student_id: student_id.to_string(),
        results,
        average,
        overall_grade,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::Role;
    use crate::reconcile::fixtures;

    fn entry(student: &str, subject: &str, score: i64) -> ResultEntry {
        ResultEntry {
            student_id: student.to_string(),
            subject: subject.to_string(),
            score,
        }
    }

    #[test]
    fn grade_is_derived_from_score() {
        let conn = crate::db::open_in_memory().unwrap();
        let teacher = fixtures::user(&conn, "t@school.test", &[Role::Teacher]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");

        let out = record(
            &conn,
            &teacher,
            &[entry(&s, "Math", 90), entry(&s, "Art", 89), entry(&s, "History", 49)],
            Utc::now(),
        )
        .unwrap();
        let grades: Vec<&str> = out.results.iter().map(|r| r.grade.as_str()).collect();
        assert_eq!(grades, vec!["A+", "A", "F"]);

        let stored: String = conn
            .query_row(
                "SELECT grade FROM results WHERE student_id = ? AND subject = 'History'",
                [&s],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(stored, "F");
    }

    #[test]
    fn rescoring_a_subject_updates_score_and_grade_in_place() {
        let conn = crate::db::open_in_memory().unwrap();
        let teacher = fixtures::user(&conn, "t@school.test", &[Role::Teacher]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");
        let now = Utc::now();

        let first = record(&conn, &teacher, &[entry(&s, "Math", 55)], now).unwrap();
        let second = record(&conn, &teacher, &[entry(&s, "Math", 91)], now).unwrap();
        assert_eq!(first.results[0].id, second.results[0].id);

        let (n, score, grade): (i64, i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(score), MAX(grade) FROM results WHERE student_id = ?",
                [&s],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((n, score, grade.as_str()), (1, 91, "A+"));
    }

    #[test]
    fn parents_are_forbidden() {
        let conn = crate::db::open_in_memory().unwrap();
        let parent = fixtures::user(&conn, "p@school.test", &[Role::Parent]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");
        let err = record(&conn, &parent, &[entry(&s, "Math", 70)], Utc::now()).unwrap_err();
        assert_eq!(err.code(), "forbidden");
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn failure_mid_batch_keeps_nothing() {
        let conn = crate::db::open_in_memory().unwrap();
        let teacher = fixtures::user(&conn, "t@school.test", &[Role::Teacher]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");
        let err = record(
            &conn,
            &teacher,
            &[entry(&s, "Math", 70), entry(&s, "Art", 80), entry("ghost", "Math", 60)],
            Utc::now(),
        )
        .unwrap_err();
        let details = err.details().unwrap();
        assert_eq!(details["failedAt"], 2);
        assert_eq!(details["applied"], 0);
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM results", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn one_audit_entry_per_result() {
        let conn = crate::db::open_in_memory().unwrap();
        let teacher = fixtures::user(&conn, "t@school.test", &[Role::Teacher]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");
        record(&conn, &teacher, &[entry(&s, "Math", 70), entry(&s, "Art", 80)], Utc::now())
            .unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE action = 'result_recorded'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 2);
    }

    #[test]
    fn for_student_averages_and_grades_the_exact_mean() {
        let conn = crate::db::open_in_memory().unwrap();
        let teacher = fixtures::user(&conn, "t@school.test", &[Role::Teacher]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");
        record(&conn, &teacher, &[entry(&s, "Math", 90), entry(&s, "Art", 89)], Utc::now())
            .unwrap();
        let view = for_student(&conn, &s).unwrap();
        assert_eq!(view.results.len(), 2);
        assert_eq!(view.average, Some(89.5));
        assert_eq!(view.overall_grade, Some(Grade::APlus));

        let empty = for_student(&conn, "nobody").unwrap();
        assert_eq!(empty.average, None);
        assert_eq!(empty.overall_grade, None);
    }

    #[test]
    fn overall_grade_does_not_round_twice_at_a_band_edge() {
        let conn = crate::db::open_in_memory().unwrap();
        let teacher = fixtures::user(&conn, "t@school.test", &[Role::Teacher]);
        let s = fixtures::student(&conn, "s@school.test", "R-1");
        let batch: Vec<ResultEntry> = (0..20)
            .map(|i| entry(&s, &format!("Subject {:02}", i), if i < 11 { 89 } else { 90 }))
            .collect();
        record(&conn, &teacher, &batch, Utc::now()).unwrap();

        let view = for_student(&conn, &s).unwrap();
        assert_eq!(view.average, Some(89.5));
        assert_eq!(view.overall_grade, Some(Grade::A));
    }
}
