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
    let exe = env!("CARGO_BIN_EXE_samajd");
    let mut child = Command::new(exe)
        .env("SAMAJ_JWT_SECRET", "import-json-test-secret")
        .env("SAMAJ_ADMIN_USERNAME", "admin")
        .env("SAMAJ_ADMIN_PASSWORD", "admin123")
        .env_remove("SAMAJ_ALERT_TO")
        .env_remove("SAMAJ_STAGING_DIR")
        .env_remove("SAMAJ_MEMBERSHIP_NO_MAX")
        .env_remove("SAMAJ_MOBILE_MAX")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn samajd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
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
        payload["authorization"] = json!(format!("Bearer {}", t));
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params, token);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn open_as_admin(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> String {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );
    let login = request_ok(
        stdin,
        reader,
        "login",
        "auth.login",
        json!({ "username": "admin", "password": "admin123" }),
        None,
    );
    login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string()
}

fn member<'a>(list: &'a serde_json::Value, membership_no: &str) -> &'a serde_json::Value {
    list.get("members")
        .and_then(|v| v.as_array())
        .expect("members array")
        .iter()
        .find(|m| m.get("membershipNo").and_then(|v| v.as_str()) == Some(membership_no))
        .unwrap_or_else(|| panic!("member {} missing", membership_no))
}

#[test]
fn duplicate_rows_keep_the_first_and_strip_mobile_punctuation() {
    let workspace = temp_dir("samajd-import-dup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, &workspace);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "members.importJson",
        json!({ "rows": [
            { "membership_no": "M1", "name": "Asha", "mobile": "98-765 43210" },
            { "membership_no": "M1", "name": "Asha Dup", "mobile": "111" }
        ]}),
        Some(&token),
    );
    assert_eq!(res.get("imported").and_then(|v| v.as_u64()), Some(1));
    let warnings = res.get("warnings").and_then(|v| v.as_array()).expect("warnings");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].get("row").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(warnings[0].get("value").and_then(|v| v.as_str()), Some("M1"));
    assert!(warnings[0]
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .contains("keeping the first"));

    let list = request_ok(&mut stdin, &mut reader, "2", "members.list", json!({}), Some(&token));
    let m1 = member(&list, "M1");
    assert_eq!(m1.get("name").and_then(|v| v.as_str()), Some("Asha"));
    assert_eq!(m1.get("mobile").and_then(|v| v.as_str()), Some("9876543210"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn missing_key_rejects_row_and_blank_count_stays_absent() {
    let workspace = temp_dir("samajd-import-missing");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, &workspace);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "members.importJson",
        json!({ "rows": [{ "membership_no": "", "name": "Bina" }] }),
        Some(&token),
    );
    assert_eq!(res.get("imported").and_then(|v| v.as_u64()), Some(0));
    let warnings = res.get("warnings").and_then(|v| v.as_array()).expect("warnings");
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].get("reason").and_then(|v| v.as_str()),
        Some("missing membership_no")
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "members.importJson",
        json!({ "rows": [{ "membership_no": "M9", "name": "Chitra", "male": "3", "female": "" }] }),
        Some(&token),
    );
    let list = request_ok(&mut stdin, &mut reader, "3", "members.list", json!({}), Some(&token));
    let members = list.get("members").and_then(|v| v.as_array()).expect("members");
    assert_eq!(members.len(), 1);
    let m9 = member(&list, "M9");
    assert_eq!(m9.get("male").and_then(|v| v.as_u64()), Some(3));
    assert!(m9.get("female").map(|v| v.is_null()).unwrap_or(true));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn empty_or_non_array_rows_are_input_shape_errors() {
    let workspace = temp_dir("samajd-import-shape");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, &workspace);

    let empty = request(
        &mut stdin,
        &mut reader,
        "1",
        "members.importJson",
        json!({ "rows": [] }),
        Some(&token),
    );
    assert_eq!(error_code(&empty), "bad_params");
    assert_eq!(
        empty
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str()),
        Some("No rows supplied")
    );

    let object = request(
        &mut stdin,
        &mut reader,
        "2",
        "members.importJson",
        json!({ "rows": { "membership_no": "M1", "name": "A" } }),
        Some(&token),
    );
    assert_eq!(error_code(&object), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn oversized_key_is_rejected_and_long_mobile_truncated() {
    let workspace = temp_dir("samajd-import-limits");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, &workspace);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "members.importJson",
        json!({ "rows": [
            { "membership_no": "M1234567890", "name": "Too Long" },
            { "membershipNo": "M2", "name": "Deepa", "mobile": "+91 98765 43210" }
        ]}),
        Some(&token),
    );
    assert_eq!(res.get("imported").and_then(|v| v.as_u64()), Some(1));
    let warnings = res.get("warnings").and_then(|v| v.as_array()).expect("warnings");
    assert_eq!(warnings.len(), 2);

    let key_warning = &warnings[0];
    assert_eq!(key_warning.get("row").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(key_warning.get("field").and_then(|v| v.as_str()), Some("membership_no"));
    assert_eq!(
        key_warning.get("value").and_then(|v| v.as_str()),
        Some("M1234567890")
    );

    let mobile_warning = &warnings[1];
    assert_eq!(mobile_warning.get("row").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(mobile_warning.get("field").and_then(|v| v.as_str()), Some("mobile"));
    assert_eq!(
        mobile_warning.get("value").and_then(|v| v.as_str()),
        Some("919876543210")
    );

    let list = request_ok(&mut stdin, &mut reader, "2", "members.list", json!({}), Some(&token));
    let m2 = member(&list, "M2");
    assert_eq!(m2.get("mobile").and_then(|v| v.as_str()), Some("9198765432"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn reimporting_the_same_rows_changes_nothing() {
    let workspace = temp_dir("samajd-import-idempotent");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, &workspace);

    let rows = json!({ "rows": [
        { "membership_no": "M1", "name": "Asha", "district": "Puri", "male": 2, "female": 1.0,
          "family_members": "[{\"name\":\"Ravi\",\"relation\":\"son\",\"age\":12}]" },
        { "membership_no": "M2", "name": "Bina", "family_members": "not json" }
    ]});
    request_ok(&mut stdin, &mut reader, "1", "members.importJson", rows.clone(), Some(&token));
    let before = request_ok(&mut stdin, &mut reader, "2", "members.list", json!({}), Some(&token));
    request_ok(&mut stdin, &mut reader, "3", "members.importJson", rows, Some(&token));
    let after = request_ok(&mut stdin, &mut reader, "4", "members.list", json!({}), Some(&token));
    assert_eq!(before, after);

    let m1 = member(&after, "M1");
    assert_eq!(m1.get("female").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        m1.pointer("/familyMembers/0/relation").and_then(|v| v.as_str()),
        Some("son")
    );
    let m2 = member(&after, "M2");
    assert_eq!(
        m2.get("familyMembers").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn import_requires_an_admin_token() {
    let workspace = temp_dir("samajd-import-auth");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let token = open_as_admin(&mut stdin, &mut reader, &workspace);

    let rows = json!({ "rows": [{ "membership_no": "M1", "name": "Asha" }] });
    let anonymous = request(&mut stdin, &mut reader, "1", "members.importJson", rows.clone(), None);
    assert_eq!(error_code(&anonymous), "unauthorized");

    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "auth.register",
        json!({ "username": "clerk", "password": "clerk-pass-1" }),
        Some(&token),
    );
    let clerk = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "username": "clerk", "password": "clerk-pass-1" }),
        None,
    );
    let clerk_token = clerk.get("token").and_then(|v| v.as_str()).expect("token");
    let forbidden = request(
        &mut stdin,
        &mut reader,
        "4",
        "members.importJson",
        rows,
        Some(clerk_token),
    );
    assert_eq!(error_code(&forbidden), "forbidden");

    let list = request_ok(&mut stdin, &mut reader, "5", "members.list", json!({}), None);
    assert_eq!(
        list.get("members").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}
