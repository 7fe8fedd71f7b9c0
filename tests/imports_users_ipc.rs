mod test_support;

use serde_json::json;
use test_support::{
    count_rows, request, request_err, request_ok, select_workspace, spawn_sidecar, temp_dir,
    write_file,
};

const HEADER: &str = "Title,First name,Last name,Email\n";

#[test]
fn single_row_test_then_commit_creates_one_user() {
    let workspace = temp_dir("evapd-users-single");
    let upload = write_file(
        &workspace,
        "users.csv",
        &format!("{HEADER}Dr.,Jane,Doe,jane.doe@uni.example\n"),
    );
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "imports.test",
        json!({ "kind": "user", "inPath": upload.to_string_lossy() }),
    );
    assert_eq!(report["status"], "VALIDATED_CLEAN");
    assert_eq!(report["canCommit"], true);
    assert_eq!(report["format"], "csv");
    assert_eq!(report["rowCount"], 1);
    assert_eq!(report["fileName"], "users.csv");
    assert_eq!(report["log"], json!([]));
    assert_eq!(report.pointer("/preview/merge/created"), Some(&json!(1)));
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM users"), 0);

    let token = report["token"].as_str().expect("token").to_string();
    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "imports.commit",
        json!({ "token": token, "operation": "import" }),
    );
    assert_eq!(committed["status"], "COMMITTED");
    assert_eq!(committed.pointer("/summary/created"), Some(&json!(1)));
    assert_eq!(committed.pointer("/summary/updated"), Some(&json!(0)));
    assert_eq!(committed.pointer("/summary/deleted"), Some(&json!(0)));

    let users = request_ok(&mut stdin, &mut reader, "3", "users.list", json!({}));
    let users = users["users"].as_array().expect("users");
    assert_eq!(users.len(), 1);
    assert_eq!(users[0]["email"], "jane.doe@uni.example");
    assert_eq!(users[0]["firstName"], "Jane");

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "imports.session",
        json!({ "token": token }),
    );
    assert_eq!(session["status"], "COMMITTED");
    assert_eq!(session.pointer("/outcome/policy"), Some(&json!("merge")));
}

#[test]
fn merging_the_same_file_twice_updates_instead_of_duplicating() {
    let workspace = temp_dir("evapd-users-merge");
    let content = format!("{HEADER}Dr.,Jane,Doe,Jane.Doe@Uni.Example\n");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    for (i, expect_created, expect_updated) in [(0, 1, 0), (1, 0, 1)] {
        let report = request_ok(
            &mut stdin,
            &mut reader,
            &format!("t{i}"),
            "imports.test",
            json!({
                "kind": "user",
                "fileName": "users.csv",
                "contentBase64": base64_encode(content.as_bytes()),
            }),
        );
        assert_eq!(report["log"], json!([]), "run {i}: {report}");
        let committed = request_ok(
            &mut stdin,
            &mut reader,
            &format!("c{i}"),
            "imports.commit",
            json!({ "token": report["token"], "operation": "import" }),
        );
        assert_eq!(committed.pointer("/summary/created"), Some(&json!(expect_created)));
        assert_eq!(committed.pointer("/summary/updated"), Some(&json!(expect_updated)));
    }
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM users"), 1);
    assert_eq!(
        count_rows(
            &workspace,
            "SELECT COUNT(*) FROM users WHERE email = 'jane.doe@uni.example' AND title = 'Dr.'"
        ),
        1
    );
}

#[test]
fn replace_deletes_users_missing_from_the_upload() {
    let workspace = temp_dir("evapd-users-replace");
    let first = write_file(
        &workspace,
        "first.csv",
        &format!("{HEADER},Jane,Doe,jane.doe@uni.example\n,John,Roe,john.roe@uni.example\n"),
    );
    let second = write_file(
        &workspace,
        "second.csv",
        &format!("{HEADER},John,Roe,john.roe@uni.example\n"),
    );
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "imports.test",
        json!({ "kind": "user", "inPath": first.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "imports.commit",
        json!({ "token": report["token"], "operation": "import" }),
    );

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "imports.test",
        json!({ "kind": "user", "inPath": second.to_string_lossy() }),
    );
    assert_eq!(report.pointer("/preview/replace/deleted"), Some(&json!(1)));
    assert_eq!(report.pointer("/preview/merge/deleted"), Some(&json!(0)));
    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "imports.commit",
        json!({ "token": report["token"], "operation": "import-replace" }),
    );
    assert_eq!(committed.pointer("/summary/deleted"), Some(&json!(1)));
    assert_eq!(committed.pointer("/summary/updated"), Some(&json!(1)));
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM users"), 1);
    assert_eq!(
        count_rows(
            &workspace,
            "SELECT COUNT(*) FROM users WHERE email = 'jane.doe@uni.example'"
        ),
        0
    );
}

#[test]
fn repeated_test_runs_report_the_same_log_and_supersede_each_other() {
    let workspace = temp_dir("evapd-users-idempotent");
    let upload = write_file(
        &workspace,
        "users.csv",
        "First name,Last name,Email,Room\nJane,Doe,jane.doe@uni.example,101\nJane,Doe,jane.doe@uni.example,102\n",
    );
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let params = json!({ "kind": "user", "inPath": upload.to_string_lossy() });
    let first = request_ok(&mut stdin, &mut reader, "1", "imports.test", params.clone());
    let second = request_ok(&mut stdin, &mut reader, "2", "imports.test", params);
    assert_eq!(first["log"], second["log"]);
    assert_ne!(first["token"], second["token"]);

    let log = first["log"].as_array().expect("log");
    assert!(log
        .iter()
        .any(|e| e["category"] == "schema" && e["severity"] == "info"));
    assert!(log
        .iter()
        .any(|e| e["category"] == "ignored" && e["severity"] == "info"));
    assert!(log
        .iter()
        .any(|e| e["category"] == "duplicate" && e["severity"] == "warning" && e["line"] == 3));

    let old = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "imports.session",
        json!({ "token": first["token"] }),
    );
    assert_eq!(old["status"], "ABANDONED");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "imports.commit",
            json!({ "token": first["token"], "operation": "import" }),
        ),
        "policy_violation"
    );

    // Warnings must be acknowledged before the newest run can be confirmed.
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "5",
            "imports.commit",
            json!({ "token": second["token"], "operation": "import" }),
        ),
        "policy_violation"
    );
    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "imports.commit",
        json!({ "token": second["token"], "operation": "import", "acknowledgeWarnings": true }),
    );
    assert_eq!(committed.pointer("/summary/created"), Some(&json!(1)));
}

#[test]
fn validation_errors_block_the_commit() {
    let workspace = temp_dir("evapd-users-errors");
    let upload = write_file(
        &workspace,
        "users.csv",
        &format!("{HEADER},Jane,Doe,not-an-email\n,John,Roe,john.roe@uni.example\n"),
    );
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let report = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "imports.test",
        json!({ "kind": "user", "inPath": upload.to_string_lossy() }),
    );
    assert_eq!(report["status"], "VALIDATED_WITH_ERRORS");
    assert_eq!(report["canCommit"], false);
    assert_eq!(report["errorCount"], 1);
    assert_eq!(report["preview"], json!(null));

    let code = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "imports.commit",
        json!({ "token": report["token"], "operation": "import", "acknowledgeWarnings": true }),
    );
    assert_eq!(code, "policy_violation");
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM users"), 0);
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM change_log"), 0);
}

#[test]
fn malformed_uploads_are_rejected_without_a_session() {
    let workspace = temp_dir("evapd-users-malformed");
    let missing_column = write_file(&workspace, "bad.csv", "First name,Email\nJane,jane@uni.example\n");
    let xls = workspace.join("legacy.xls");
    std::fs::write(&xls, [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1, 0, 0]).expect("write xls");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    for (i, path) in [missing_column, xls].iter().enumerate() {
        let code = request_err(
            &mut stdin,
            &mut reader,
            &format!("m{i}"),
            "imports.test",
            json!({ "kind": "user", "inPath": path.to_string_lossy() }),
        );
        assert_eq!(code, "malformed_file");
    }
    let code = request_err(
        &mut stdin,
        &mut reader,
        "io",
        "imports.test",
        json!({ "kind": "user", "inPath": workspace.join("nope.csv").to_string_lossy() }),
    );
    assert_eq!(code, "io_failed");
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM import_sessions"), 0);
}

#[test]
fn abandoned_and_committed_sessions_cannot_be_confirmed_again() {
    let workspace = temp_dir("evapd-users-lifecycle");
    let upload = write_file(
        &workspace,
        "users.csv",
        &format!("{HEADER},Jane,Doe,jane.doe@uni.example\n"),
    );
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let params = json!({ "kind": "user", "inPath": upload.to_string_lossy(), "owner": "alice" });

    let report = request_ok(&mut stdin, &mut reader, "1", "imports.test", params.clone());
    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "imports.pending",
        json!({ "owner": "alice" }),
    );
    assert_eq!(pending["sessions"].as_array().map(|s| s.len()), Some(1));
    assert_eq!(pending.pointer("/testPassed/user"), Some(&json!(true)));
    assert!(pending.pointer("/sessions/0/log").is_none());

    let abandoned = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "imports.abandon",
        json!({ "token": report["token"] }),
    );
    assert_eq!(abandoned["status"], "ABANDONED");
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "imports.commit",
            json!({ "token": report["token"], "operation": "import" }),
        ),
        "policy_violation"
    );
    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "imports.pending",
        json!({ "owner": "alice" }),
    );
    assert_eq!(pending["sessions"], json!([]));

    let report = request_ok(&mut stdin, &mut reader, "6", "imports.test", params);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "imports.commit",
        json!({ "token": report["token"], "operation": "import", "actor": "alice" }),
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "8",
            "imports.commit",
            json!({ "token": report["token"], "operation": "import" }),
        ),
        "policy_violation"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "9",
            "imports.commit",
            json!({ "token": "no-such-token", "operation": "import" }),
        ),
        "session_not_found"
    );
    assert_eq!(count_rows(&workspace, "SELECT COUNT(*) FROM users"), 1);
}

#[test]
fn unknown_kinds_and_operations_are_bad_params() {
    let workspace = temp_dir("evapd-users-params");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let resp = request(&mut stdin, &mut reader, "0", "imports.pending", json!({}));
    assert_eq!(resp.pointer("/error/code"), Some(&json!("no_workspace")));
    select_workspace(&mut stdin, &mut reader, &workspace);

    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "1",
            "imports.test",
            json!({ "kind": "grades", "contentBase64": "" }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "2",
            "imports.test",
            json!({ "kind": "participant", "contentBase64": base64_encode(b"x") }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "3",
            "imports.commit",
            json!({ "token": "t", "operation": "test" }),
        ),
        "bad_params"
    );
    assert_eq!(
        request_err(
            &mut stdin,
            &mut reader,
            "4",
            "imports.commit",
            json!({ "token": "t", "operation": "copy-participants" }),
        ),
        "bad_params"
    );
    let resp = request(&mut stdin, &mut reader, "5", "grades.upload", json!({}));
    assert_eq!(resp.pointer("/error/code"), Some(&json!("not_implemented")));
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
