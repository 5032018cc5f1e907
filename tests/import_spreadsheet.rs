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

fn count(conn: &rusqlite::Connection, sql: &str) -> i64 {
    conn.query_row(sql, [], |r| r.get(0)).expect("count query")
}

fn open_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    request_ok(
        stdin,
        reader,
        "w1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(stdin, reader, "w2", "auth.setUser", json!({ "userId": "teacher-1" }));
}

#[test]
fn csv_import_creates_records_and_reimport_duplicates_student() {
    let workspace = temp_dir("classbook-import-maria");
    let sheet = workspace.join("turma.csv");
    std::fs::write(&sheet, "Aluno,Prova 1,Prova 2\nMaria,8,F\n").expect("write sheet");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "path": sheet.to_string_lossy() }),
    );
    assert_eq!(first["count"], json!(1));
    assert_eq!(first["errors"], json!([]));
    // No row above the header, so the sheet's first cell names the course.
    assert_eq!(first["courseName"], json!("Aluno"));
    assert!(first["termName"]
        .as_str()
        .map(|s| s.starts_with("Importado "))
        .unwrap_or(false));
    assert_eq!(
        first["progress"].as_array().and_then(|p| p.last()).cloned(),
        Some(json!("Concluído!"))
    );

    let course_id = str_at(&first, &["courseId"]).to_string();
    let view = request_ok(&mut stdin, &mut reader, "2", "grid.open", json!({ "courseId": course_id }));
    let modules = view["modules"].as_array().expect("modules");
    assert_eq!(modules.len(), 1);
    assert_eq!(modules[0]["name"], json!("Dados Gerais"));
    let names: Vec<&str> = modules[0]["columns"]
        .as_array()
        .expect("columns")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Prova 1", "Prova 2"]);

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.spreadsheet",
        json!({ "path": sheet.to_string_lossy() }),
    );
    assert_ne!(second["termId"], first["termId"]);

    drop(stdin);
    let _ = child.wait();

    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM students WHERE name = 'Maria'"), 2);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM academic_terms"), 2);

    let mut stmt = conn
        .prepare(
            "SELECT r.value FROM academic_records r
             JOIN enrollments e ON e.id = r.enrollment_id
             WHERE e.course_id = ?
             ORDER BY r.value",
        )
        .expect("prepare");
    let values: Vec<String> = stmt
        .query_map([&course_id], |r| r.get(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("values");
    assert_eq!(values, vec!["8".to_string(), "F".to_string()]);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn sheet_without_name_token_fails_before_any_write() {
    let workspace = temp_dir("classbook-import-noheader");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let mut rows: Vec<serde_json::Value> = (0..40).map(|i| json!([format!("linha {}", i), "x"])).collect();
    rows.push(json!(["Aluno", "Prova"]));
    let no_header = request(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "rows": rows }),
    );
    assert_eq!(no_header["ok"], json!(false));
    assert_eq!(no_header["error"]["code"], json!("import_failed"));
    assert_eq!(no_header["error"]["details"]["kind"], json!("no_header_row"));

    // LIVRO scores, but there is no student column to read names from.
    let no_student = request(
        &mut stdin,
        &mut reader,
        "2",
        "import.spreadsheet",
        json!({ "rows": [["Livro", "Data"], ["Gênesis", "2026-02-01"]] }),
    );
    assert_eq!(no_student["error"]["details"]["kind"], json!("no_student_column"));

    let empty = request(
        &mut stdin,
        &mut reader,
        "3",
        "import.spreadsheet",
        json!({ "rows": [["Aluno"]] }),
    );
    assert_eq!(empty["error"]["details"]["kind"], json!("empty"));

    let unreadable = request(
        &mut stdin,
        &mut reader,
        "4",
        "import.spreadsheet",
        json!({ "path": workspace.join("missing.xlsx").to_string_lossy() }),
    );
    assert_eq!(unreadable["error"]["details"]["kind"], json!("unreadable"));

    drop(stdin);
    let _ = child.wait();

    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM academic_terms"), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM courses"), 0);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM course_modules"), 0);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn banner_rows_and_id_columns_are_skipped() {
    let workspace = temp_dir("classbook-import-layout");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "rows": [
            ["IBICAMP - Curso Livre", "", ""],
            ["Pentateuco", "", ""],
            ["N°", "Nome do Aluno", "Prova\n1"],
            [1, "Maria", 8.5],
            [2, "2º TRIMESTRE", ""],
            [3, "Jo", "7"],
            [4, "João", null],
        ] }),
    );
    assert_eq!(result["courseName"], json!("Pentateuco"));
    assert_eq!(result["count"], json!(2));

    let course_id = str_at(&result, &["courseId"]).to_string();
    let view = request_ok(&mut stdin, &mut reader, "2", "grid.open", json!({ "courseId": course_id }));
    let columns = view["modules"][0]["columns"].as_array().expect("columns").clone();
    assert_eq!(columns.len(), 1);
    assert_eq!(columns[0]["name"], json!("Prova 1"));
    assert_eq!(view["records"].as_object().map(|r| r.len()), Some(1));
    let student_names: Vec<&str> = view["enrollments"]
        .as_array()
        .expect("enrollments")
        .iter()
        .filter_map(|e| e["student"]["name"].as_str())
        .collect();
    assert_eq!(student_names, vec!["João", "Maria"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

fn column_names(view: &serde_json::Value) -> Vec<String> {
    view["modules"][0]["columns"]
        .as_array()
        .expect("columns")
        .iter()
        .filter_map(|c| c["name"].as_str().map(str::to_string))
        .collect()
}

fn course_values(conn: &rusqlite::Connection, course_id: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare(
            "SELECT r.value FROM academic_records r
             JOIN enrollments e ON e.id = r.enrollment_id
             WHERE e.course_id = ?
             ORDER BY r.value",
        )
        .expect("prepare");
    stmt.query_map([course_id], |r| r.get(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("values")
}

#[test]
fn quoted_header_with_line_break_stays_one_column() {
    let workspace = temp_dir("classbook-import-multiline");
    let sheet = workspace.join("turma.csv");
    std::fs::write(&sheet, "Aluno,\"Prova\n1\",Prova 2\nMaria,8,F\n").expect("write sheet");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "path": sheet.to_string_lossy() }),
    );
    assert_eq!(result["count"], json!(1));
    assert_eq!(result["errors"], json!([]));
    let course_id = str_at(&result, &["courseId"]).to_string();
    let view = request_ok(&mut stdin, &mut reader, "2", "grid.open", json!({ "courseId": course_id }));
    assert_eq!(column_names(&view), vec!["Prova 1", "Prova 2"]);

    drop(stdin);
    let _ = child.wait();

    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM students"), 1);
    assert_eq!(course_values(&conn, &course_id), vec!["8", "F"]);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn failed_row_is_reported_and_the_rest_still_imports() {
    let workspace = temp_dir("classbook-import-row-error");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    // The store refuses one student; nothing else about the sheet is wrong.
    let side = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    side.execute_batch(
        "CREATE TRIGGER reject_student BEFORE INSERT ON students
         WHEN NEW.name = 'Rejeitado'
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
    )
    .expect("create trigger");

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "rows": [
            ["Aluno", "Prova 1"],
            ["Maria", "8"],
            ["Rejeitado", "7"],
            ["João", "9"],
        ] }),
    );
    assert_eq!(result["count"], json!(3));
    assert_eq!(result["errors"], json!(["Erro ao criar aluno: Rejeitado"]));
    let progress: Vec<&str> = result["progress"]
        .as_array()
        .expect("progress")
        .iter()
        .filter_map(|p| p.as_str())
        .collect();
    assert!(progress.contains(&"Processando (2): Rejeitado"));
    assert!(progress.contains(&"Processando (3): João"));

    drop(stdin);
    let _ = child.wait();

    let course_id = str_at(&result, &["courseId"]).to_string();
    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM students"), 2);
    assert_eq!(course_values(&conn, &course_id), vec!["8", "9"]);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn column_failure_drops_by_default_and_aborts_when_configured() {
    let workspace = temp_dir("classbook-import-column-policy");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let side = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    side.execute_batch(
        "CREATE TRIGGER reject_column BEFORE INSERT ON module_columns
         WHEN NEW.name = 'Quebrada'
         BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
    )
    .expect("create trigger");

    let rows = json!([
        ["Aluno", "Quebrada", "Prova 1"],
        ["Maria", "x", "8"],
    ]);
    let dropped = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "rows": rows }),
    );
    assert_eq!(dropped["count"], json!(1));
    assert_eq!(dropped["errors"], json!(["Erro ao criar coluna: Quebrada"]));
    let course_id = str_at(&dropped, &["courseId"]).to_string();
    let view = request_ok(&mut stdin, &mut reader, "2", "grid.open", json!({ "courseId": course_id }));
    assert_eq!(column_names(&view), vec!["Prova 1"]);

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "settings.update",
        json!({ "settings": { "import": { "columnFailure": "abort" } } }),
    );
    let aborted = request(
        &mut stdin,
        &mut reader,
        "4",
        "import.spreadsheet",
        json!({ "rows": rows }),
    );
    assert_eq!(aborted["ok"], json!(false));
    assert_eq!(aborted["error"]["code"], json!("import_failed"));
    assert_eq!(aborted["error"]["details"]["kind"], json!("column_failed"));

    drop(stdin);
    let _ = child.wait();

    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(course_values(&conn, &course_id), vec!["8"]);
    // The aborted run enrolled nobody.
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM students"), 1);

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn owner_matching_reuses_an_existing_student() {
    let workspace = temp_dir("classbook-import-owner-match");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let existing = request_ok(&mut stdin, &mut reader, "1", "students.create", json!({ "name": "Maria" }));
    let existing_id = str_at(&existing, &["student", "id"]).to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "settings.update",
        json!({ "settings": { "import": { "studentMatch": "owner" } } }),
    );

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "import.spreadsheet",
        json!({ "rows": [["Aluno", "Prova 1"], ["maria", "8"], ["Pedro", "6"]] }),
    );
    assert_eq!(result["count"], json!(2));
    let course_id = str_at(&result, &["courseId"]).to_string();
    let view = request_ok(&mut stdin, &mut reader, "4", "grid.open", json!({ "courseId": course_id }));
    let enrolled: Vec<&str> = view["enrollments"]
        .as_array()
        .expect("enrollments")
        .iter()
        .filter_map(|e| e["studentId"].as_str())
        .collect();
    assert!(enrolled.contains(&existing_id.as_str()));

    drop(stdin);
    let _ = child.wait();

    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM students WHERE lower(name) = 'maria'"), 1);
    assert_eq!(count(&conn, "SELECT COUNT(*) FROM students"), 2);

    let _ = std::fs::remove_dir_all(workspace);
}

fn write_xlsx(path: &PathBuf, sheet_xml: &str) {
    let file = std::fs::File::create(path).expect("create xlsx");
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    let parts = [
        (
            "[Content_Types].xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#,
        ),
        (
            "_rels/.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#,
        ),
        (
            "xl/workbook.xml",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Turma" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        ),
        (
            "xl/_rels/workbook.xml.rels",
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#,
        ),
        ("xl/worksheets/sheet1.xml", sheet_xml),
    ];
    for (name, body) in parts {
        zip.start_file(name, options).expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish xlsx");
}

#[test]
fn workbook_import_reads_first_sheet_from_a1() {
    let workspace = temp_dir("classbook-import-xlsx");
    let book = workspace.join("turma.xlsx");
    // The used range starts at B2, so every row is shifted one column right.
    write_xlsx(
        &book,
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData><row r="2"><c r="B2" t="inlineStr"><is><t>Pentateuco</t></is></c></row><row r="3"><c r="B3" t="inlineStr"><is><t>Aluno</t></is></c><c r="C3" t="inlineStr"><is><t>Prova 1</t></is></c></row><row r="4"><c r="B4" t="inlineStr"><is><t>Maria</t></is></c><c r="C4"><v>8</v></c></row></sheetData></worksheet>"#,
    );

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    open_workspace(&mut stdin, &mut reader, &workspace);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "import.spreadsheet",
        json!({ "path": book.to_string_lossy() }),
    );
    assert_eq!(result["count"], json!(1));
    // Title inference reads column A; the title sits in B, so the fallback wins.
    assert_eq!(result["courseName"], json!("Nova Turma Importada"));
    let course_id = str_at(&result, &["courseId"]).to_string();
    let view = request_ok(&mut stdin, &mut reader, "2", "grid.open", json!({ "courseId": course_id }));
    assert_eq!(column_names(&view), vec!["Prova 1"]);

    drop(stdin);
    let _ = child.wait();

    let conn = rusqlite::Connection::open(workspace.join("classbook.sqlite3")).expect("open db");
    assert_eq!(course_values(&conn, &course_id), vec!["8"]);

    let _ = std::fs::remove_dir_all(workspace);
}
