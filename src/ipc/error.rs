use crate::error::ServiceError;
use serde_json::json;

pub fn status_for(code: &str) -> u16 {
    match code {
        "unauthenticated" => 401,
        "forbidden" => 403,
        "persistence_error" | "internal_error" => 500,
        _ => 400,
    }
}

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "status": 200,
        "result": result
    })
}

/// The `{ success, message, data }` body every domain method answers with.
pub fn success(id: &str, message: impl Into<String>, data: serde_json::Value) -> serde_json::Value {
    ok(
        id,
        json!({
            "success": true,
            "message": message.into(),
            "data": data,
        }),
    )
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "status": status_for(code),
        "error": error,
    })
}

pub fn service_err(id: &str, e: &ServiceError) -> serde_json::Value {
    let code = e.code();
    if status_for(code) >= 500 {
        tracing::error!(code, error = %e, "request failed");
    }
    err(id, code, e.to_string(), e.details())
}
