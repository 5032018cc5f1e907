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
    let exe = env!("CARGO_BIN_EXE_classbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classbookd");
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
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
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
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn str_at<'a>(v: &'a serde_json::Value, path: &[&str]) -> &'a str {
    let mut cur = v;
    for p in path {
        cur = &cur[*p];
    }
    cur.as_str().unwrap_or_else(|| panic!("missing {:?} in {}", path, v))
}

#[test]
fn clone_copies_structure_and_history_follows_enrollments() {
    let workspace = temp_dir("classbook-terms-clone");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "2", "auth.setUser", json!({ "userId": "teacher-1" }));
    let term = request_ok(&mut stdin, &mut reader, "3", "terms.create", json!({ "name": "2026.1" }));
    let term_id = str_at(&term, &["term", "id"]).to_string();
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        json!({ "termId": term_id, "name": "Pentateuco" }),
    );
    let course_id = str_at(&course, &["course", "id"]).to_string();
    let module = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "modules.add",
        json!({ "courseId": course_id, "name": "Avaliações" }),
    );
    let module_id = str_at(&module, &["module", "id"]).to_string();
    let column = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "columns.add",
        json!({ "moduleId": module_id, "name": "Prova 1", "type": "text" }),
    );
    let column_id = str_at(&column, &["column", "id"]).to_string();
    let student = request_ok(&mut stdin, &mut reader, "7", "students.create", json!({ "name": "Maria" }));
    let student_id = str_at(&student, &["student", "id"]).to_string();

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.history",
        json!({ "studentId": student_id }),
    );
    assert_eq!(empty["courses"], json!([]));

    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "enrollments.enroll",
        json!({ "courseId": course_id, "studentId": student_id }),
    );
    let enrollment_id = str_at(&enrolled, &["enrollment", "id"]).to_string();
    request_ok(&mut stdin, &mut reader, "10", "grid.open", json!({ "courseId": course_id }));
    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "grid.setCell",
        json!({
            "courseId": course_id,
            "enrollmentId": enrollment_id,
            "columnId": column_id,
            "value": "9",
        }),
    );
    request_ok(&mut stdin, &mut reader, "12", "persist.flush", json!({}));

    let history = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "students.history",
        json!({ "studentId": student_id }),
    );
    let courses = history["courses"].as_array().expect("courses").clone();
    assert_eq!(courses.len(), 1);
    assert_eq!(courses[0]["courseName"], json!("Pentateuco"));
    assert_eq!(courses[0]["termName"], json!("2026.1"));
    assert_eq!(courses[0]["modules"][0]["columns"][0]["value"], json!("9"));

    let cloned = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "terms.clone",
        json!({ "termId": term_id, "name": "2026.2" }),
    );
    let cloned_id = str_at(&cloned, &["term", "id"]).to_string();
    assert_ne!(cloned_id, term_id);

    let cloned_courses = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "courses.list",
        json!({ "termId": cloned_id }),
    );
    let cloned_course_id = cloned_courses["courses"][0]["id"]
        .as_str()
        .expect("cloned course id")
        .to_string();
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "grid.open",
        json!({ "courseId": cloned_course_id }),
    );
    assert_eq!(view["course"]["name"], json!("Pentateuco"));
    assert_eq!(view["modules"][0]["name"], json!("Avaliações"));
    assert_eq!(view["modules"][0]["columns"][0]["name"], json!("Prova 1"));
    assert_eq!(view["enrollments"], json!([]));
    assert_eq!(view["records"], json!({}));

    let missing = request(
        &mut stdin,
        &mut reader,
        "17",
        "terms.clone",
        json!({ "termId": "no-such-term", "name": "x" }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));

    // Cascade: deleting the original term leaves the clone intact.
    request_ok(&mut stdin, &mut reader, "18", "terms.delete", json!({ "termId": term_id }));
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "19",
        "students.history",
        json!({ "studentId": student_id }),
    );
    assert_eq!(after["courses"], json!([]));
    let terms = request_ok(&mut stdin, &mut reader, "20", "terms.list", json!({}));
    assert_eq!(terms["terms"].as_array().map(|t| t.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn settings_update_merges_and_drives_tie_break() {
    let workspace = temp_dir("classbook-settings");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "2", "auth.setUser", json!({ "userId": "librarian" }));

    let defaults = request_ok(&mut stdin, &mut reader, "3", "settings.get", json!({}));
    assert_eq!(defaults["settings"]["ledger"]["sameDayTieBreak"], json!("insertionOrder"));
    assert_eq!(defaults["settings"]["import"]["headerScanRows"], json!(40));

    let book = request_ok(&mut stdin, &mut reader, "4", "books.create", json!({ "title": "Levítico", "stock": 1 }));
    let book_id = str_at(&book, &["book", "id"]).to_string();
    let s = request_ok(&mut stdin, &mut reader, "5", "students.create", json!({ "name": "Davi" }));
    let sid = str_at(&s, &["student", "id"]).to_string();
    for (id, kind) in [("6", "return"), ("7", "delivery")] {
        request_ok(
            &mut stdin,
            &mut reader,
            id,
            "ledger.record",
            json!({ "studentId": sid, "bookId": book_id, "type": kind, "date": "2026-04-02" }),
        );
    }

    let today = json!({ "today": "2026-04-02" });
    let by_insertion = request_ok(&mut stdin, &mut reader, "8", "ledger.pendingReturns", today.clone());
    assert_eq!(by_insertion["pending"].as_array().map(|p| p.len()), Some(1));
    assert_eq!(by_insertion["pending"][0]["daysOutstanding"], json!(0));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "settings.update",
        json!({ "settings": { "ledger": { "sameDayTieBreak": "deliveriesFirst" } } }),
    );
    assert_eq!(updated["settings"]["ledger"]["sameDayTieBreak"], json!("deliveriesFirst"));
    assert_eq!(updated["settings"]["import"]["headerScanRows"], json!(40));

    let deliveries_first = request_ok(&mut stdin, &mut reader, "10", "ledger.pendingReturns", today);
    assert_eq!(deliveries_first["pending"], json!([]));

    let invalid = request(
        &mut stdin,
        &mut reader,
        "11",
        "settings.update",
        json!({ "settings": { "ledger": { "sameDayTieBreak": "random" } } }),
    );
    assert_eq!(invalid["error"]["code"], json!("bad_params"));
    let kept = request_ok(&mut stdin, &mut reader, "12", "settings.get", json!({}));
    assert_eq!(kept["settings"]["ledger"]["sameDayTieBreak"], json!("deliveriesFirst"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_search_folds_accented_case() {
    let workspace = temp_dir("classbook-students-search");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(&mut stdin, &mut reader, "2", "auth.setUser", json!({ "userId": "teacher-1" }));
    let jose = request_ok(&mut stdin, &mut reader, "3", "students.create", json!({ "name": "JOSÉ" }));
    let jose_id = str_at(&jose, &["student", "id"]).to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Ana", "matricula": "ÉM-01" }),
    );

    let found = request_ok(&mut stdin, &mut reader, "5", "students.search", json!({ "query": "josé" }));
    let ids: Vec<&str> = found["students"]
        .as_array()
        .expect("students")
        .iter()
        .filter_map(|s| s["id"].as_str())
        .collect();
    assert_eq!(ids, vec![jose_id.as_str()]);

    let by_matricula = request_ok(&mut stdin, &mut reader, "6", "students.search", json!({ "query": "ém-0" }));
    assert_eq!(by_matricula["students"].as_array().map(|a| a.len()), Some(1));
    assert_eq!(by_matricula["students"][0]["name"], json!("Ana"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
