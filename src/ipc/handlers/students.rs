use crate::catalog::{self, NewStudent};
use crate::grid;
use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_required_text, require_db, require_user, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const SEARCH_LIMIT: usize = 10;

fn students_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let owner = require_user(&state.current_user)?;
    let name = get_required_text(params, "name")?;
    let matricula = get_optional_str(params, "matricula");
    let email = get_optional_str(params, "email");
    let phone = get_optional_str(params, "phone");
    let new = NewStudent {
        name: &name,
        matricula: matricula.as_deref(),
        email: email.as_deref(),
        phone: phone.as_deref(),
    };
    let student = catalog::create_student(conn, &new, &owner).map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "student": student }))
}

fn students_list(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let students = catalog::list_students(conn).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn students_search(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let query = get_required_str(params, "query")?;
    let students =
        catalog::search_students(conn, &query, SEARCH_LIMIT).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "students": students }))
}

fn students_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    state.flush_writes().map_err(db_err("io_failed"))?;
    let conn = require_db(&state.db)?;
    let courses: Vec<String> = catalog::list_student_enrollments(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .into_iter()
        .map(|e| e.course_id)
        .collect();
    if !catalog::delete_student(conn, &student_id).map_err(db_err("db_delete_failed"))? {
        return Err(HandlerErr::not_found("student not found"));
    }
    state.attendance.forget_student(&student_id);
    // Open grids of those courses lose a row.
    for course_id in courses {
        if !state.grids.contains_key(&course_id) {
            continue;
        }
        match grid::materialize(conn, &course_id) {
            Ok(Some(snapshot)) => {
                if let Some(session) = state.grids.get_mut(&course_id) {
                    session.replace_snapshot(snapshot);
                }
            }
            Ok(None) => {
                state.grids.remove(&course_id);
            }
            Err(e) => {
                tracing::warn!(course_id = %course_id, error = %e, "open grid dropped after student delete");
                state.grids.remove(&course_id);
            }
        }
    }
    Ok(json!({ "ok": true }))
}

fn students_history(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    state.flush_writes().map_err(db_err("io_failed"))?;
    let conn = require_db(&state.db)?;
    let Some(student) = catalog::get_student(conn, &student_id).map_err(db_err("db_query_failed"))? else {
        return Err(HandlerErr::not_found("student not found"));
    };
    let history = grid::student_history(conn, &student_id).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "student": student, "courses": history }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "students.create" => students_create,
        "students.list" => students_list,
        "students.search" => students_search,
        "students.delete" => students_delete,
        "students.history" => students_history,
        _ => return None,
    };
    Some(respond(&req.id, handler(state, &req.params)))
}
