use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoolbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoolbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_response(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(t) = token {
        payload["token"] = json!(t);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let value = read_response(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn error_code(v: &serde_json::Value) -> &str {
    v.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("schoolbook-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}), None);
    assert_eq!(health["ok"], true);
    assert_eq!(health["status"], 200);
    assert!(health["result"]["workspacePath"].is_null());

    let early = request(&mut stdin, &mut reader, "2", "classes.list", json!({}), None);
    assert_eq!(error_code(&early), "no_workspace");
    assert_eq!(early["status"], 400);

    let selected = request(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );
    assert_eq!(selected["ok"], true);
    assert!(workspace.join("schoolbook.sqlite3").is_file());

    let boot = request(
        &mut stdin,
        &mut reader,
        "4",
        "setup.bootstrapAdmin",
        json!({ "email": "admin@school.test", "password": "Admin1234", "name": "Head Admin" }),
        None,
    );
    assert_eq!(boot["result"]["success"], true);

    let login = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "admin@school.test", "password": "Admin1234" }),
        None,
    );
    let token = login["result"]["data"]["token"]
        .as_str()
        .expect("session token")
        .to_string();
    assert_eq!(login["result"]["data"]["user"]["roles"], json!(["admin"]));

    // Every family answers something other than not_implemented.
    let calls = [
        ("auth.whoami", json!({})),
        ("users.list", json!({})),
        ("staff.list", json!({})),
        ("classes.list", json!({})),
        ("students.list", json!({})),
        ("attendance.forDate", json!({ "date": "2025-03-10" })),
        ("results.forStudent", json!({ "studentId": "nobody" })),
        ("announcements.list", json!({})),
        ("assignments.list", json!({ "classId": "none" })),
        ("timetable.list", json!({ "classId": "none" })),
        ("notifications.list", json!({})),
        ("dashboard.summary", json!({})),
        ("audit.list", json!({})),
    ];
    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("f{}", i);
        let v = request(&mut stdin, &mut reader, &id, method, params, Some(&token));
        assert_ne!(error_code(&v), "not_implemented", "{} unrouted", method);
        assert_ne!(error_code(&v), "unauthenticated", "{} rejected token", method);
    }

    let unknown = request(&mut stdin, &mut reader, "6", "grades.explode", json!({}), Some(&token));
    assert_eq!(error_code(&unknown), "not_implemented");
    assert_eq!(unknown["status"], 400);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_lines_and_missing_tokens_are_rejected() {
    let workspace = temp_dir("schoolbook-router-reject");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let bad = read_response(&mut reader);
    assert_eq!(bad["id"], "");
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["status"], 400);
    assert_eq!(error_code(&bad), "bad_json");

    // Blank lines are skipped; the next request still gets its own answer.
    writeln!(stdin).expect("write blank");
    let anon = request(&mut stdin, &mut reader, "2", "classes.list", json!({}), None);
    assert_eq!(error_code(&anon), "unauthenticated");
    assert_eq!(anon["status"], 401);

    let forged = request(
        &mut stdin,
        &mut reader,
        "3",
        "classes.list",
        json!({}),
        Some("not-a-real-session"),
    );
    assert_eq!(error_code(&forged), "unauthenticated");

    // A role claimed in params means nothing.
    let claimed = request(
        &mut stdin,
        &mut reader,
        "4",
        "attendance.record",
        json!({ "role": "admin", "userId": "x", "date": "2025-03-10", "records": [] }),
        None,
    );
    assert_eq!(claimed["status"], 401);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn unopenable_workspace_reports_a_generic_error() {
    let dir = temp_dir("schoolbook-router-badws");
    let blocker = dir.join("not-a-directory");
    std::fs::write(&blocker, b"occupied").expect("write blocker file");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let failed = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": blocker.join("nested").to_string_lossy() }),
        None,
    );
    assert_eq!(failed["ok"], false);
    assert_eq!(failed["status"], 500);
    assert_eq!(error_code(&failed), "persistence_error");
    assert_eq!(failed["error"]["message"], "Failed to open workspace");
    assert!(!failed.to_string().contains("not-a-directory"));

    let health = request(&mut stdin, &mut reader, "2", "health", json!({}), None);
    assert!(health["result"]["workspacePath"].is_null());

    drop(stdin);
    let _ = child.wait();
}
