use super::{authed, class_exists, reply, Ctx, Outcome};
use crate::audit::{self, AuditEntry};
use crate::authz::{self, Operation};
use crate::error::{ServiceError, ValidationError};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use serde_json::{json, Value};
use uuid::Uuid;

const WEEKDAYS: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];
const MAX_PERIOD: i64 = 12;

fn weekday_number(raw: &str) -> Option<i64> {
    let t = raw.trim().to_ascii_lowercase();
    WEEKDAYS
        .iter()
        .position(|d| *d == t)
        .map(|i| i as i64 + 1)
}

fn weekday_name(n: i64) -> &'static str {
    WEEKDAYS
        .get((n - 1).clamp(0, 6) as usize)
        .copied()
        .unwrap_or("monday")
}

fn timetable_set(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    authz::require(&ctx.caller, Operation::ManageTimetable)?;
    let class_id = validate::required_str(params, "classId")?;
    let raw_day = validate::required_str(params, "day")?;
    let weekday = weekday_number(&raw_day).ok_or_else(|| {
        ValidationError::new("day", "day_enum", "day must be a weekday name, monday to sunday")
    })?;
    let period = match params.get("period").and_then(|v| v.as_i64()) {
        Some(p) if (1..=MAX_PERIOD).contains(&p) => p,
        _ => {
            return Err(ValidationError::new(
                "period",
                "period_range",
                format!("period must be an integer from 1 to {}", MAX_PERIOD),
            )
            .into())
        }
    };
    let subject = validate::text("subject", &validate::required_str(params, "subject")?, 100)?;
    let start = match validate::optional_str(params, "startTime")? {
        Some(t) => Some(validate::clock_time("startTime", &t)?),
        None => None,
    };
    let end = match validate::optional_str(params, "endTime")? {
        Some(t) => Some(validate::clock_time("endTime", &t)?),
        None => None,
    };
    if let (Some(s), Some(e)) = (&start, &end) {
        if s >= e {
            return Err(ValidationError::new(
                "endTime",
                "time_order",
                "endTime must be after startTime",
            )
            .into());
        }
    }
    if !class_exists(ctx.conn, &class_id)? {
        return Err(ServiceError::not_found("Class not found"));
    }

    let id: String = ctx.conn.query_row(
        "INSERT INTO timetable_slots(id, class_id, weekday, period, subject, start_time, end_time)
         VALUES(?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, weekday, period) DO UPDATE SET
           subject = excluded.subject,
           start_time = excluded.start_time,
           end_time = excluded.end_time
         RETURNING id",
        (
            Uuid::new_v4().to_string(),
            &class_id,
            weekday,
            period,
            &subject,
            &start,
            &end,
        ),
        |r| r.get(0),
    )?;
    audit::record(
        ctx.conn,
        AuditEntry {
            actor: ctx.actor(),
            action: "timetable_updated",
            resource_type: "class",
            resource_id: Some(&class_id),
            details: json!({ "day": weekday_name(weekday), "period": period, "subject": subject }),
        },
        ctx.now,
    );
    reply(
        "Timetable updated",
        json!({
            "slot": {
                "id": id,
                "classId": class_id,
                "day": weekday_name(weekday),
                "period": period,
                "subject": subject,
                "startTime": start,
                "endTime": end,
            }
        }),
    )
}

fn timetable_list(ctx: &Ctx<'_>, params: &Value) -> Outcome {
    let class_id = validate::required_str(params, "classId")?;
    if !class_exists(ctx.conn, &class_id)? {
        return Err(ServiceError::not_found("Class not found"));
    }
    let mut stmt = ctx.conn.prepare(
        "SELECT id, weekday, period, subject, start_time, end_time
         FROM timetable_slots
         WHERE class_id = ?
         ORDER BY weekday, period",
    )?;
    let slots = stmt
        .query_map([&class_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "day": weekday_name(r.get(1)?),
                "period": r.get::<_, i64>(2)?,
                "subject": r.get::<_, String>(3)?,
                "startTime": r.get::<_, Option<String>>(4)?,
                "endTime": r.get::<_, Option<String>>(5)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    reply(
        format!("{} timetable slots", slots.len()),
        json!({ "classId": class_id, "slots": slots }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.set" => Some(authed(state, req, timetable_set)),
        "timetable.list" => Some(authed(state, req, timetable_list)),
        _ => None,
    }
}
