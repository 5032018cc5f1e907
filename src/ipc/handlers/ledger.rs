use crate::catalog::{self, NewBook};
use crate::ipc::error::{db_err, respond, HandlerErr};
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_date, get_required_str, get_required_text,
    require_db, require_user, HandlerFn,
};
use crate::ipc::types::{AppState, Request};
use crate::ledger;
use crate::model::{BookTransaction, TransactionType};
use serde_json::json;

fn books_create(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let owner = require_user(&state.current_user)?;
    let title = get_required_text(params, "title")?;
    let code = get_optional_str(params, "code");
    let author = get_optional_str(params, "author");
    let category = get_optional_str(params, "category");
    let stock = match params.get("stock") {
        None | Some(serde_json::Value::Null) => 0,
        Some(v) => v
            .as_i64()
            .filter(|n| *n >= 0)
            .ok_or_else(|| HandlerErr::bad_params("stock must be a non-negative integer"))?,
    };
    let new = NewBook {
        code: code.as_deref(),
        title: &title,
        author: author.as_deref(),
        category: category.as_deref(),
        stock,
    };
    let book = catalog::create_book(conn, &new, &owner).map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "book": book }))
}

fn books_list(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let books = catalog::list_books(conn).map_err(db_err("db_query_failed"))?;
    Ok(json!({ "books": books }))
}

fn ledger_record(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let student_id = get_required_str(params, "studentId")?;
    let book_id = get_required_str(params, "bookId")?;
    let tx_type = get_required_str(params, "type")?
        .parse::<TransactionType>()
        .map_err(HandlerErr::bad_params)?;
    let date = get_required_date(params, "date")?;

    if catalog::get_student(conn, &student_id)
        .map_err(db_err("db_query_failed"))?
        .is_none()
    {
        return Err(HandlerErr::not_found("student not found"));
    }
    let books = catalog::list_books(conn).map_err(db_err("db_query_failed"))?;
    if !books.iter().any(|b| b.id == book_id) {
        return Err(HandlerErr::not_found("book not found"));
    }

    let tx = ledger::record_transaction(conn, &student_id, &book_id, tx_type, date)
        .map_err(db_err("db_insert_failed"))?;
    Ok(json!({ "transaction": tx }))
}

fn ledger_list(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let student_id = get_optional_str(params, "studentId");
    let book_id = get_optional_str(params, "bookId");
    let entries = ledger::load_ledger(conn).map_err(db_err("db_query_failed"))?;
    let tie = state.settings.ledger.same_day_tie_break;
    let filtered: Vec<&ledger::LedgerEntry> = ledger::chronological(&entries, tie)
        .into_iter()
        .filter(|e| student_id.as_deref().map(|s| e.tx.student_id == s).unwrap_or(true))
        .filter(|e| book_id.as_deref().map(|b| e.tx.book_id == b).unwrap_or(true))
        .collect();
    Ok(json!({ "transactions": filtered }))
}

fn ledger_pending_returns(state: &mut AppState, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let today = get_optional_date(params, "today")?.unwrap_or_else(|| chrono::Local::now().date_naive());
    let entries = ledger::load_ledger(conn).map_err(db_err("db_query_failed"))?;
    let pending = ledger::pending_returns(&entries, today, state.settings.ledger.same_day_tie_break);
    Ok(json!({ "today": today, "pending": pending }))
}

fn books_inventory(state: &mut AppState, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(&state.db)?;
    let books = catalog::list_books(conn).map_err(db_err("db_query_failed"))?;
    let transactions: Vec<BookTransaction> = ledger::load_ledger(conn)
        .map_err(db_err("db_query_failed"))?
        .into_iter()
        .map(|e| e.tx)
        .collect();
    Ok(json!({ "books": ledger::inventory(&books, &transactions) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let handler: HandlerFn = match req.method.as_str() {
        "books.create" => books_create,
        "books.list" => books_list,
        "books.inventory" => books_inventory,
        "ledger.record" => ledger_record,
        "ledger.list" => ledger_list,
        "ledger.pendingReturns" => ledger_pending_returns,
        _ => return None,
    };
    Some(respond(&req.id, handler(state, &req.params)))
}
