use crate::catalog;
use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::helpers::{
    get_required_bool, get_required_str, get_required_text, require_db, require_user, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::model::parse_date;
use serde_json::json;

fn terms_list(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let terms = catalog::list_terms(conn).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "terms": terms }))
}

fn terms_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let owner = require_user(&state.current_user)?;
    let name = get_required_text(params, "name")?;
    let term = catalog::create_term(conn, &name, &owner).map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "term": term }))
}

fn terms_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let term_id = get_required_str(params, "termId")?;
    state.flush_writes().map_err(db_err("io_failed"))?;
    let conn = require_db(&state.db)?;
    let courses = catalog::list_courses(conn, &term_id).map_err(db_err("db_query_failed"))?;
    if !catalog::delete_term(conn, &term_id).map_err(db_err("db_delete_failed"))? {
        return Err(HandlerErr::not_found("term not found"));
    }
    for c in courses {
        state.grids.remove(&c.id);
        state.attendance.forget_course(&c.id);
    }
    Ok(json!({ "ok": true }))
}

fn terms_archive(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let term_id = get_required_str(params, "termId")?;
    let archived = get_required_bool(params, "archived")?;
    if !catalog::set_term_archived(conn, &term_id, archived).map_err(db_err("db_update_failed"))? {
        return Err(HandlerErr::not_found("term not found"));
    }
    Ok(json!({ "ok": true }))
}

fn terms_clone(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let term_id = get_required_str(params, "termId")?;
    let name = get_required_text(params, "name")?;
    match catalog::clone_term(conn, &term_id, &name).map_err(db_err("db_tx_failed"))? {
        Some(term) => Ok(json!({ "term": term })),
        None => Err(HandlerErr::not_found("term not found")),
    }
}

fn courses_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let term_id = get_required_str(params, "termId")?;
    let courses = catalog::list_courses(conn, &term_id).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "courses": courses }))
}

fn courses_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let term_id = get_required_str(params, "termId")?;
    let name = get_required_text(params, "name")?;
    if catalog::get_term(conn, &term_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("term not found"));
    }
    let course = catalog::create_course(conn, &term_id, &name).map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "course": course }))
}

fn courses_delete(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    state.flush_writes().map_err(db_err("io_failed"))?;
    let conn = require_db(&state.db)?;
    if !catalog::delete_course(conn, &course_id).map_err(db_err("db_delete_failed"))? {
        return Err(HandlerErr::not_found("course not found"));
    }
    state.grids.remove(&course_id);
    state.attendance.forget_course(&course_id);
    Ok(json!({ "ok": true }))
}

fn courses_set_schedule(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let Some(raw) = params.get("dates").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("dates must be an array"));
    };
    let mut dates = Vec::with_capacity(raw.len());
    for item in raw {
        let s = item
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("dates must contain strings"))?;
        dates.push(parse_date(s).map_err(HandlerErr::bad_params)?);
    }
    let conn = require_db(&state.db)?;
    if !catalog::set_course_schedule(conn, &course_id, &dates).map_err(db_err("db_update_failed"))? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let course = catalog::get_course(conn, &course_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("course not found"))?;
    if let Some(session) = state.grids.get_mut(&course_id) {
        session.snapshot.course = course.clone();
    }
    Ok(json!({ "course": course }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "terms.list" => terms_list,
        "terms.create" => terms_create,
        "terms.delete" => terms_delete,
        "terms.archive" => terms_archive,
        "terms.clone" => terms_clone,
        "courses.list" => courses_list,
        "courses.create" => courses_create,
        "courses.delete" => courses_delete,
        "courses.setSchedule" => courses_set_schedule,
        _ => return None,
    };
    Some(respond(&req.id, handler(state, &req.params)))
}
