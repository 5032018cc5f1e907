use crate::catalog;
use crate::grid::{self, GridError, GridSession, GridSnapshot};
use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, get_required_text, require_db, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::model::ColumnType;
use crate::persist::WriteOp;
use serde_json::json;
use std::collections::hash_map::Entry;
use std::time::Instant;

fn grid_view(session: &mut GridSession) -> Result<serde_json::Value, HandlerErr> {
    let saving = session.saving_keys(Instant::now());
    let mut view = serde_json::to_value(&session.snapshot)
        .map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    view["saving"] = json!(saving);
    view["failedSaves"] = json!(session.failed_saves());
    Ok(view)
}

fn load_snapshot(state: &AppState, course_id: &str) -> Result<GridSnapshot, HandlerErr> {
    let conn = require_db(&state.db)?;
    grid::materialize(conn, course_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("course not found"))
}

/// Re-reads a course from the store into its session, creating the session
/// on first open. Queued writes land first so the store view is current.
fn open_session<'a>(state: &'a mut AppState, course_id: &str) -> Result<&'a mut GridSession, HandlerErr> {
    state.flush_writes().map_err(db_err("io_failed"))?;
    let snapshot = load_snapshot(state, course_id)?;
    let debounce = state.save_debounce();
    match state.grids.entry(course_id.to_string()) {
        Entry::Occupied(o) => {
            let session = o.into_mut();
            session.replace_snapshot(snapshot);
            Ok(session)
        }
        Entry::Vacant(v) => Ok(v.insert(GridSession::new(snapshot, debounce))),
    }
}

/// Keeps an already open grid in step with structural edits.
fn refresh_if_open(state: &mut AppState, course_id: &str) -> Result<(), HandlerErr> {
    if state.grids.contains_key(course_id) {
        open_session(state, course_id)?;
    }
    Ok(())
}

fn grid_open(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let session = open_session(state, &course_id)?;
    grid_view(session)
}

fn grid_get(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_db(&state.db)?;
    let course_id = get_required_str(params, "courseId")?;
    let session = state
        .grids
        .get_mut(&course_id)
        .ok_or_else(|| HandlerErr::not_found("grid is not open; call grid.open"))?;
    grid_view(session)
}

fn grid_set_cell(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_db(&state.db)?;
    let course_id = get_required_str(params, "courseId")?;
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let column_id = get_required_str(params, "columnId")?;
    let value = get_required_str(params, "value")?;

    let session = state
        .grids
        .get_mut(&course_id)
        .ok_or_else(|| HandlerErr::not_found("grid is not open; call grid.open"))?;
    let write = session
        .set_cell(&enrollment_id, &column_id, &value)
        .map_err(|e| match e {
            GridError::NotFound(what) => {
                HandlerErr::not_found(format!("{} not found in the open grid", what))
                    .with_details(json!({ "missing": what }))
            }
            GridError::Store(inner) => HandlerErr::new("db_update_failed", format!("{inner:#}")),
        })?;
    let key = write.key();

    let submitted = match state.persister.as_ref() {
        Some(p) => p.submit(WriteOp::Cell {
            course_id: course_id.clone(),
            write,
        }),
        None => Err(anyhow::anyhow!("writer is not running")),
    };
    if let Err(e) = submitted {
        // Still shown locally; the indicator clears like any failed save.
        tracing::warn!(course_id = %course_id, key = %key, error = %e, "cell save not queued");
        if let Some(session) = state.grids.get_mut(&course_id) {
            session.confirm(&key, false, Instant::now());
        }
    }
    Ok(json!({ "key": key, "value": value, "saving": true }))
}

fn grid_export_csv(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let fresh;
    let snapshot = match state.grids.get(&course_id) {
        Some(session) => &session.snapshot,
        None => {
            fresh = load_snapshot(state, &course_id)?;
            &fresh
        }
    };
    let csv = grid::export_csv(snapshot);
    let file_name = format!("Planilha_{}.csv", snapshot.course.name);

    if let Some(out) = get_optional_str(params, "outPath") {
        std::fs::write(&out, csv.as_bytes())
            .map_err(|e| HandlerErr::new("io_failed", format!("failed to write {}: {}", out, e)))?;
        return Ok(json!({ "path": out, "fileName": file_name, "bytes": csv.len() }));
    }
    Ok(json!({ "csv": csv, "fileName": file_name }))
}

fn modules_add(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let name = get_required_text(params, "name")?;
    let conn = require_db(&state.db)?;
    if catalog::get_course(conn, &course_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("course not found"));
    }
    let module = catalog::create_module(conn, &course_id, &name).map_err(db_err("db_insert_failed"))?;
    refresh_if_open(state, &course_id)?;
    Ok(json!({ "module": module }))
}

fn modules_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let module_id = get_required_str(params, "moduleId")?;
    state.flush_writes().map_err(db_err("io_failed"))?;
    let conn = require_db(&state.db)?;
    let course_id = catalog::course_of_module(conn, &module_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("module not found"))?;
    catalog::delete_module(conn, &module_id).map_err(db_err("db_delete_failed"))?;
    refresh_if_open(state, &course_id)?;
    Ok(json!({ "ok": true }))
}

fn columns_add(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let module_id = get_required_str(params, "moduleId")?;
    let name = get_required_text(params, "name")?;
    let column_type = match params.get("type") {
        None | Some(serde_json::Value::Null) => ColumnType::Text,
        Some(v) => v
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("type must be a string"))?
            .parse::<ColumnType>()
            .map_err(HandlerErr::bad_params)?,
    };
    let conn = require_db(&state.db)?;
    let course_id = catalog::course_of_module(conn, &module_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("module not found"))?;
    let column = catalog::create_column(conn, &module_id, &name, column_type)
        .map_err(db_err("db_insert_failed"))?;
    refresh_if_open(state, &course_id)?;
    Ok(json!({ "column": column }))
}

fn columns_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let column_id = get_required_str(params, "columnId")?;
    state.flush_writes().map_err(db_err("io_failed"))?;
    let conn = require_db(&state.db)?;
    let course_id = catalog::course_of_column(conn, &column_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("column not found"))?;
    catalog::delete_column(conn, &column_id).map_err(db_err("db_delete_failed"))?;
    refresh_if_open(state, &course_id)?;
    Ok(json!({ "ok": true }))
}

fn enrollments_enroll(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;
    let conn = require_db(&state.db)?;
    if catalog::get_course(conn, &course_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("course not found"));
    }
    if catalog::get_student(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("student not found"));
    }
    let (enrollment, created) =
        catalog::enroll(conn, &course_id, &student_id).map_err(db_err("db_insert_failed"))?;
    if created {
        refresh_if_open(state, &course_id)?;
    }
    Ok(json!({ "enrollment": enrollment, "created": created }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "grid.open" | "grid.reload" => grid_open,
        "grid.get" => grid_get,
        "grid.setCell" => grid_set_cell,
        "grid.exportCsv" => grid_export_csv,
        "modules.add" => modules_add,
        "modules.delete" => modules_delete,
        "columns.add" => columns_add,
        "columns.delete" => columns_delete,
        "enrollments.enroll" => enrollments_enroll,
        _ => return None,
    };
    Some(respond(&req.id, handler(state, &req.params)))
}
