use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let payload = json!({ "id": method, "method": method, "params": params, "token": token });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params, token);
    assert_eq!(value["ok"], true, "{} failed: {}", method, value);
    value["result"]["data"].clone()
}

fn open_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> PathBuf {
    let workspace = temp_dir(prefix);
    request_ok(
        stdin,
        reader,
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );
    request_ok(
        stdin,
        reader,
        "setup.bootstrapAdmin",
        json!({ "email": "admin@school.test", "password": "Admin1234", "name": "Head Admin" }),
        None,
    );
    workspace
}

/// Latest queued mail body for a recipient.
fn last_mail(workspace: &Path, to: &str) -> Option<String> {
    let conn = rusqlite::Connection::open(workspace.join("schoolbook.sqlite3")).expect("open db");
    conn.query_row(
        "SELECT body FROM outbox WHERE recipient = ? ORDER BY created_at DESC, rowid DESC LIMIT 1",
        [to],
        |r| r.get(0),
    )
    .ok()
}

fn code_from(body: &str) -> String {
    let at = body.find("code is ").expect("code marker") + "code is ".len();
    body[at..at + 6].to_string()
}

fn token_from(body: &str) -> String {
    let at = body.find("token=").expect("token marker") + "token=".len();
    body[at..]
        .split_whitespace()
        .next()
        .expect("token value")
        .to_string()
}

#[test]
fn bootstrap_is_only_open_once_and_login_hides_which_part_was_wrong() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ws = open_workspace(&mut stdin, &mut reader, "schoolbook-auth-bootstrap");

    let again = request(
        &mut stdin,
        &mut reader,
        "setup.bootstrapAdmin",
        json!({ "email": "evil@school.test", "password": "Evil12345", "name": "Evil Admin" }),
        None,
    );
    assert_eq!(again["error"]["code"], "conflict");

    let wrong_pw = request(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "admin@school.test", "password": "Wrong1234" }),
        None,
    );
    let no_user = request(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "ghost@school.test", "password": "Admin1234" }),
        None,
    );
    assert_eq!(wrong_pw["status"], 401);
    assert_eq!(no_user["status"], 401);
    assert_eq!(wrong_pw["error"]["message"], no_user["error"]["message"]);

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "ADMIN@school.test", "password": "Admin1234" }),
        None,
    );
    let token = session["token"].as_str().expect("token");
    let me = request_ok(&mut stdin, &mut reader, "auth.whoami", json!({}), Some(token));
    assert_eq!(me["user"]["email"], "admin@school.test");
    assert_eq!(me["user"]["emailVerified"], true);

    request_ok(&mut stdin, &mut reader, "auth.logout", json!({}), Some(token));
    let after = request(&mut stdin, &mut reader, "auth.whoami", json!({}), Some(token));
    assert_eq!(after["status"], 401);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn emailed_code_signs_in_once_and_guessing_is_capped() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = open_workspace(&mut stdin, &mut reader, "schoolbook-auth-code");

    let unknown = request(
        &mut stdin,
        &mut reader,
        "auth.sendCode",
        json!({ "email": "nobody@school.test" }),
        None,
    );
    let known = request(
        &mut stdin,
        &mut reader,
        "auth.sendCode",
        json!({ "email": "admin@school.test" }),
        None,
    );
    assert_eq!(unknown["ok"], true);
    assert_eq!(unknown["result"]["message"], known["result"]["message"]);
    assert!(last_mail(&ws, "nobody@school.test").is_none());

    let code = code_from(&last_mail(&ws, "admin@school.test").expect("code mail"));
    let bad_format = request(
        &mut stdin,
        &mut reader,
        "auth.verifyCode",
        json!({ "email": "admin@school.test", "code": "12ab56" }),
        None,
    );
    assert_eq!(bad_format["error"]["details"]["rule"], "code_format");

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "auth.verifyCode",
        json!({ "email": "admin@school.test", "code": code }),
        None,
    );
    assert!(session["token"].as_str().is_some());

    let reused = request(
        &mut stdin,
        &mut reader,
        "auth.verifyCode",
        json!({ "email": "admin@school.test", "code": code }),
        None,
    );
    assert_eq!(reused["status"], 401);

    // Five wrong guesses burn a fresh code.
    request_ok(
        &mut stdin,
        &mut reader,
        "auth.sendCode",
        json!({ "email": "admin@school.test" }),
        None,
    );
    let fresh = code_from(&last_mail(&ws, "admin@school.test").expect("code mail"));
    let wrong = if fresh == "000000" { "111111" } else { "000000" };
    for _ in 0..5 {
        let v = request(
            &mut stdin,
            &mut reader,
            "auth.verifyCode",
            json!({ "email": "admin@school.test", "code": wrong }),
            None,
        );
        assert_eq!(v["status"], 401);
    }
    let too_late = request(
        &mut stdin,
        &mut reader,
        "auth.verifyCode",
        json!({ "email": "admin@school.test", "code": fresh }),
        None,
    );
    assert_eq!(too_late["status"], 401);

    let conn = rusqlite::Connection::open(ws.join("schoolbook.sqlite3")).expect("open db");
    let plain: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM login_codes WHERE code_hash = ?",
            [&fresh],
            |r| r.get(0),
        )
        .expect("count");
    assert_eq!(plain, 0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn verification_link_marks_email_and_password_change_revokes_other_sessions() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let ws = open_workspace(&mut stdin, &mut reader, "schoolbook-auth-verify");
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "admin@school.test", "password": "Admin1234" }),
        None,
    )["token"]
        .as_str()
        .expect("token")
        .to_string();

    let weak = request(
        &mut stdin,
        &mut reader,
        "staff.create",
        json!({ "email": "t@school.test", "password": "alllowercase1", "name": "Tess Teacher" }),
        Some(&admin),
    );
    assert_eq!(weak["error"]["details"]["rule"], "password_uppercase");

    request_ok(
        &mut stdin,
        &mut reader,
        "staff.create",
        json!({ "email": "t@school.test", "password": "Teach1234", "name": "Tess Teacher" }),
        Some(&admin),
    );
    let link_token = token_from(&last_mail(&ws, "t@school.test").expect("verification mail"));

    let laptop = request_ok(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "t@school.test", "password": "Teach1234" }),
        None,
    )["token"]
        .as_str()
        .expect("token")
        .to_string();
    let phone = request_ok(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "t@school.test", "password": "Teach1234" }),
        None,
    )["token"]
        .as_str()
        .expect("token")
        .to_string();

    let before = request_ok(&mut stdin, &mut reader, "auth.whoami", json!({}), Some(&laptop));
    assert_eq!(before["user"]["emailVerified"], false);
    request_ok(&mut stdin, &mut reader, "auth.verifyEmail", json!({ "token": link_token }), None);
    let after = request_ok(&mut stdin, &mut reader, "auth.whoami", json!({}), Some(&laptop));
    assert_eq!(after["user"]["emailVerified"], true);
    let replay = request(
        &mut stdin,
        &mut reader,
        "auth.verifyEmail",
        json!({ "token": link_token }),
        None,
    );
    assert_eq!(replay["ok"], false);

    let wrong_current = request(
        &mut stdin,
        &mut reader,
        "auth.changePassword",
        json!({ "currentPassword": "Nope12345", "newPassword": "Better1234" }),
        Some(&laptop),
    );
    assert_eq!(wrong_current["status"], 401);

    let changed = request_ok(
        &mut stdin,
        &mut reader,
        "auth.changePassword",
        json!({ "currentPassword": "Teach1234", "newPassword": "Better1234" }),
        Some(&laptop),
    );
    assert_eq!(changed["revokedSessions"], 1);
    assert_eq!(
        request(&mut stdin, &mut reader, "auth.whoami", json!({}), Some(&phone))["status"],
        401
    );
    request_ok(&mut stdin, &mut reader, "auth.whoami", json!({}), Some(&laptop));
    request_ok(
        &mut stdin,
        &mut reader,
        "auth.login",
        json!({ "email": "t@school.test", "password": "Better1234" }),
        None,
    );

    drop(stdin);
    let _ = child.wait();
}
