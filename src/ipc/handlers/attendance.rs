use crate::attendance::{self, AttendanceKey, Toggle};
use crate::catalog;
use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::helpers::{get_required_date, get_required_str, require_db, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::model::{parse_date, Course};
use crate::persist::WriteOp;
use serde_json::json;

/// Looks the course up and loads its marks into the session view the first
/// time it is used.
fn ensure_course_loaded(state: &mut AppState, course_id: &str) -> Result<Course, HandlerErr> {
    let conn = require_db(&state.db)?;
    let course = catalog::get_course(conn, course_id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| HandlerErr::not_found("course not found"))?;
    if !state.attendance.is_loaded(course_id) {
        let marks = attendance::load_course_marks(conn, course_id).map_err(db_err("db_query_failed"))?;
        state.attendance.load_course(course_id, marks);
    }
    Ok(course)
}

fn attendance_toggle(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_db(&state.db)?;
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    ensure_course_loaded(state, &course_id)?;
    let conn = require_db(&state.db)?;
    if !catalog::is_enrolled(conn, &course_id, &student_id).map_err(db_err("db_query_failed"))? {
        return Err(HandlerErr::not_found("student is not enrolled in this course")
            .with_details(json!({ "courseId": course_id, "studentId": student_id })));
    }

    let key = AttendanceKey {
        course_id,
        student_id,
        date: date.format("%Y-%m-%d").to_string(),
    };
    match state.attendance.toggle(key.clone()) {
        Toggle::InFlight => {
            tracing::debug!(
                course_id = %key.course_id,
                student_id = %key.student_id,
                date = %key.date,
                "toggle rejected while previous write is in flight"
            );
            Ok(json!({
                "accepted": false,
                "status": state.attendance.status(&key),
            }))
        }
        Toggle::Applied { next, write } => {
            let submitted = match state.persister.as_ref() {
                Some(p) => p.submit(WriteOp::Attendance(write)),
                None => Err(anyhow::anyhow!("writer is not running")),
            };
            if let Err(e) = submitted {
                tracing::warn!(course_id = %key.course_id, error = %e, "attendance save not queued");
                state.attendance.confirm(&key);
            }
            Ok(json!({ "accepted": true, "status": next }))
        }
    }
}

fn attendance_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_db(&state.db)?;
    let course_id = get_required_str(params, "courseId")?;
    ensure_course_loaded(state, &course_id)?;
    Ok(json!({ "marks": state.attendance.course_marks(&course_id) }))
}

fn parse_dates(params: &serde_json::Value) -> Result<Option<Vec<String>>, HandlerErr> {
    let Some(raw) = params.get("dates").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params("dates must be an array"));
    };
    let mut dates = Vec::with_capacity(items.len());
    for item in items {
        let s = item
            .as_str()
            .ok_or_else(|| HandlerErr::bad_params("dates must contain strings"))?;
        let d = parse_date(s).map_err(HandlerErr::bad_params)?;
        dates.push(d.format("%Y-%m-%d").to_string());
    }
    Ok(Some(dates))
}

fn attendance_summary(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_db(&state.db)?;
    let course_id = get_required_str(params, "courseId")?;
    let dates = parse_dates(params)?;
    let course = ensure_course_loaded(state, &course_id)?;
    // An explicit date range overrides the course calendar.
    let schedule = dates.unwrap_or(course.schedule);

    let conn = require_db(&state.db)?;
    let enrollments = catalog::list_enrollments(conn, &course_id).map_err(db_err("db_query_failed"))?;
    let marks = state.attendance.course_marks(&course_id);
    let students = attendance::summarize(
        &enrollments,
        &marks,
        &schedule,
        state.settings.attendance.low_attendance_percent,
    );
    Ok(json!({
        "courseId": course_id,
        "scheduled": schedule.len(),
        "threshold": state.settings.attendance.low_attendance_percent,
        "students": students,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "attendance.toggle" => attendance_toggle,
        "attendance.list" => attendance_list,
        "attendance.summary" => attendance_summary,
        _ => return None,
    };
    Some(respond(&req.id, handler(state, &req.params)))
}
