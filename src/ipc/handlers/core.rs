use crate::config;
use crate::db;
use crate::ipc::error::{db_err, err, ok, respond, HandlerErr};
use crate::ipc::helpers::{get_required_text, require_db};
use crate::ipc::types::{AppState, Request};
use crate::persist::Persister;
use serde_json::json;
use std::path::{Path, PathBuf};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "userId": state.current_user,
        }),
    )
}

/// Opens (or creates) the workspace store and starts its writer. Any
/// previously open workspace is flushed and closed first.
pub fn open_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    if let Err(e) = state.flush_writes() {
        tracing::warn!(error = %e, "flush before workspace switch failed");
    }
    state.close_workspace();

    let conn = db::open_db(path)?;
    let settings = config::load(&conn)?;
    let persister = Persister::start(&db::db_path(path))?;

    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.persister = Some(persister);
    state.settings = settings;
    tracing::info!(workspace = %path.display(), "workspace opened");
    Ok(())
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match open_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => {
            tracing::error!(workspace = %path.display(), error = %e, "workspace open failed");
            err(&req.id, "db_open_failed", format!("{e:#}"), None)
        }
    }
}

fn handle_auth_set_user(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = get_required_text(&req.params, "userId").map(|user| {
        state.current_user = Some(user.clone());
        json!({ "userId": user })
    });
    respond(&req.id, result)
}

fn handle_auth_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "userId": state.current_user }))
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let result = require_db(&state.db).and_then(|conn| {
        let settings = config::load(conn).map_err(db_err("db_query_failed"))?;
        Ok(json!({ "settings": settings }))
    });
    respond(&req.id, result)
}

fn settings_update(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let Some(patch) = params.get("settings").filter(|v| v.is_object()) else {
        return Err(HandlerErr::bad_params("settings must be an object"));
    };
    let settings = config::update(conn, patch).map_err(db_err("bad_params"))?;
    state.settings = settings.clone();
    Ok(json!({ "settings": settings }))
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let params = req.params.clone();
    respond(&req.id, settings_update(state, &params))
}

fn handle_persist_flush(state: &mut AppState, req: &Request) -> serde_json::Value {
    if state.db.is_none() {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    }
    match state.flush_writes() {
        Ok(()) => ok(&req.id, json!({ "flushed": true })),
        Err(e) => err(&req.id, "io_failed", format!("{e:#}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "auth.setUser" => Some(handle_auth_set_user(state, req)),
        "auth.current" => Some(handle_auth_current(state, req)),
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        "persist.flush" => Some(handle_persist_flush(state, req)),
        _ => None,
    }
}
