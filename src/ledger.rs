//! Book lending ledger. The transaction log is append-only; both views below
//! are derived from it on every call.
//!
//! Two definitions of "outstanding" coexist:
//! - `pending_returns`: a (student, book) pair is out when its chronologically
//!   last transaction is a delivery.
//! - `inventory`: copies out per book are `deliveries - returns` by count.
//!
//! They disagree for repeated loans of the same book and are kept separate.

use crate::db::now_timestamp;
use crate::model::{column_from_sql, Book, BookTransaction, TransactionType};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SameDayTieBreak {
    /// Same-date transactions keep the order they were written in.
    #[default]
    InsertionOrder,
    /// Same-date deliveries sort before returns, so a same-day return settles.
    DeliveriesFirst,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub tx: BookTransaction,
    pub student_name: String,
    pub book_title: String,
    pub book_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReturn {
    pub transaction_id: String,
    pub student_id: String,
    pub student_name: String,
    pub book_id: String,
    pub book_title: String,
    pub book_code: Option<String>,
    pub delivery_date: NaiveDate,
    pub days_outstanding: i64,
}

pub fn record_transaction(
    conn: &Connection,
    student_id: &str,
    book_id: &str,
    tx_type: TransactionType,
    date: NaiveDate,
) -> anyhow::Result<BookTransaction> {
    let tx = BookTransaction {
        id: Uuid::new_v4().to_string(),
        student_id: student_id.to_string(),
        book_id: book_id.to_string(),
        tx_type,
        date,
        created_at: now_timestamp(),
    };
    conn.execute(
        "INSERT INTO book_transactions(id, student_id, book_id, type, date, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &tx.id,
            &tx.student_id,
            &tx.book_id,
            tx.tx_type.as_str(),
            tx.date.format("%Y-%m-%d").to_string(),
            &tx.created_at,
        ),
    )?;
    Ok(tx)
}

/// The full log joined with student and book, in insertion order.
pub fn load_ledger(conn: &Connection) -> anyhow::Result<Vec<LedgerEntry>> {
    let mut stmt = conn.prepare(
        "SELECT t.id, t.student_id, t.book_id, t.type, t.date, t.created_at,
                s.name, b.title, b.code
         FROM book_transactions t
         JOIN students s ON s.id = t.student_id
         JOIN library_books b ON b.id = t.book_id
         ORDER BY t.rowid",
    )?;
    let rows = stmt
        .query_map([], |r| {
            let raw_date: String = r.get(4)?;
            let date = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d").map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
            Ok(LedgerEntry {
                tx: BookTransaction {
                    id: r.get(0)?,
                    student_id: r.get(1)?,
                    book_id: r.get(2)?,
                    tx_type: column_from_sql(3, r.get(3)?)?,
                    date,
                    created_at: r.get(5)?,
                },
                student_name: r.get(6)?,
                book_title: r.get(7)?,
                book_code: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Stable chronological order; `tie` only decides between same-date entries.
pub fn chronological<'a>(entries: &'a [LedgerEntry], tie: SameDayTieBreak) -> Vec<&'a LedgerEntry> {
    let mut sorted: Vec<&LedgerEntry> = entries.iter().collect();
    match tie {
        SameDayTieBreak::InsertionOrder => sorted.sort_by_key(|e| e.tx.date),
        SameDayTieBreak::DeliveriesFirst => sorted.sort_by_key(|e| {
            let rank = match e.tx.tx_type {
                TransactionType::Delivery => 0,
                TransactionType::Return => 1,
            };
            (e.tx.date, rank)
        }),
    }
    sorted
}

/// Loans whose last transaction for the (student, book) pair is a delivery.
pub fn pending_returns(
    entries: &[LedgerEntry],
    today: NaiveDate,
    tie: SameDayTieBreak,
) -> Vec<PendingReturn> {
    let mut last: HashMap<(&str, &str), &LedgerEntry> = HashMap::new();
    for e in chronological(entries, tie) {
        last.insert((e.tx.student_id.as_str(), e.tx.book_id.as_str()), e);
    }

    let mut out: Vec<PendingReturn> = last
        .into_values()
        .filter(|e| e.tx.tx_type == TransactionType::Delivery)
        .map(|e| PendingReturn {
            transaction_id: e.tx.id.clone(),
            student_id: e.tx.student_id.clone(),
            student_name: e.student_name.clone(),
            book_id: e.tx.book_id.clone(),
            book_title: e.book_title.clone(),
            book_code: e.book_code.clone(),
            delivery_date: e.tx.date,
            days_outstanding: (today - e.tx.date).num_days(),
        })
        .collect();
    out.sort_by(|a, b| {
        a.delivery_date
            .cmp(&b.delivery_date)
            .then_with(|| a.student_name.cmp(&b.student_name))
            .then_with(|| a.book_title.cmp(&b.book_title))
    });
    out
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookAvailability {
    pub book: Book,
    pub delivered: i64,
    pub returned: i64,
    pub out: i64,
    pub available: i64,
}

/// `available = stock - (deliveries - returns)` per book, plain counts.
pub fn inventory(books: &[Book], transactions: &[BookTransaction]) -> Vec<BookAvailability> {
    let mut counts: HashMap<&str, (i64, i64)> = HashMap::new();
    for t in transactions {
        let c = counts.entry(t.book_id.as_str()).or_default();
        match t.tx_type {
            TransactionType::Delivery => c.0 += 1,
            TransactionType::Return => c.1 += 1,
        }
    }
    books
        .iter()
        .map(|b| {
            let (delivered, returned) = counts.get(b.id.as_str()).copied().unwrap_or((0, 0));
            let out = delivered - returned;
            BookAvailability {
                book: b.clone(),
                delivered,
                returned,
                out,
                available: b.stock - out,
            }
        })
        .collect()
}
