use crate::import::{self, ImportError};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::helpers::{get_optional_str, require_db, require_user, HandlerFn};
use crate::ipc::types::{AppState, Request};
use crate::sheet::{self, Rows};
use serde_json::json;
use std::path::PathBuf;

fn import_err(e: ImportError) -> HandlerErr {
    HandlerErr::new("import_failed", e.to_string()).with_details(json!({ "kind": e.kind() }))
}

fn cell_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Inline rows as sent by a front-end that already parsed the sheet.
fn rows_from_params(raw: &serde_json::Value) -> Result<Rows, HandlerErr> {
    let Some(rows) = raw.as_array() else {
        return Err(HandlerErr::bad_params("rows must be an array of arrays"));
    };
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let cells = row
            .as_array()
            .ok_or_else(|| HandlerErr::bad_params("rows must be an array of arrays"))?;
        out.push(cells.iter().map(cell_to_string).collect());
    }
    Ok(sheet::rectangular(out))
}

fn import_spreadsheet(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    require_db(&state.db)?;
    let owner = require_user(&state.current_user)?;

    let rows = match (get_optional_str(params, "path"), params.get("rows")) {
        (Some(path), _) => {
            let path = PathBuf::from(path);
            tracing::info!(path = %path.display(), "reading spreadsheet");
            sheet::read_rows(&path).map_err(import_err)?
        }
        (None, Some(raw)) if !raw.is_null() => rows_from_params(raw)?,
        _ => return Err(HandlerErr::bad_params("missing path or rows")),
    };

    let conn = require_db(&state.db)?;
    let mut progress: Vec<String> = Vec::new();
    let mut on_progress = |msg: String| {
        tracing::debug!(progress = %msg, "import");
        progress.push(msg);
    };
    let today = chrono::Local::now().date_naive();
    let result = import::run_import(
        conn,
        &owner,
        &rows,
        &state.settings.import,
        today,
        &mut on_progress,
    );
    match result {
        Ok(r) => {
            for e in &r.errors {
                tracing::warn!(course_id = %r.course_id, error = %e, "import row failed");
            }
            let mut v = serde_json::to_value(&r).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
            v["progress"] = json!(progress);
            Ok(v)
        }
        Err(e) => {
            tracing::error!(kind = e.kind(), error = %e, "import aborted");
            Err(import_err(e))
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "import.spreadsheet" => import_spreadsheet,
        _ => return None,
    };
    Some(respond(&req.id, handler(state, &req.params)))
}
