//! Spreadsheet import: finds the header row of a human-authored sheet, turns
//! its headers into grid columns of one new course and writes each student
//! row as sparse cells.
//!
//! Structural problems are fatal and detected before anything is written.
//! Per-row problems are collected into `ImportResult::errors` and the import
//! carries on with the next row.

use crate::catalog::{self, NewStudent};
use crate::config::{ColumnFailure, ImportSettings, StudentMatch};
use crate::grid::{self, CellWrite};
use crate::model::ColumnType;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Tokens that identify a header row, with their weight.
pub const HEADER_TOKENS: [(&str, u32); 5] = [
    ("ALUNO", 10),
    ("NOME", 5),
    ("LIVRO", 2),
    ("AULA", 2),
    ("PROVA", 2),
];

const MIN_NAME_CHARS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("arquivo ilegível: {0}")]
    Unreadable(String),
    #[error("arquivo vazio ou formato inválido")]
    Empty,
    #[error("não foi possível identificar a linha de cabeçalho (procurei por 'ALUNO' ou 'NOME' nas primeiras {scanned} linhas)")]
    NoHeaderRow { scanned: usize },
    #[error("coluna de aluno não encontrada na linha {row}")]
    NoStudentColumn { row: usize },
    #[error("falha ao criar a coluna {header:?}: {source}")]
    ColumnFailed {
        header: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl ImportError {
    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::Unreadable(_) => "unreadable",
            ImportError::Empty => "empty",
            ImportError::NoHeaderRow { .. } => "no_header_row",
            ImportError::NoStudentColumn { .. } => "no_student_column",
            ImportError::ColumnFailed { .. } => "column_failed",
            ImportError::Store(_) => "store",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub count: usize,
    pub errors: Vec<String>,
    pub course_name: String,
    pub term_name: String,
    pub term_id: String,
    pub course_id: String,
}

fn row_score(row: &[String]) -> u32 {
    let joined = row
        .iter()
        .map(|c| c.to_uppercase())
        .collect::<Vec<_>>()
        .join(" ");
    HEADER_TOKENS
        .iter()
        .filter(|(token, _)| joined.contains(token))
        .map(|(_, weight)| weight)
        .sum()
}

/// Index of the best-scoring row among the first `scan_rows`. Ties keep the
/// earliest row; a sheet where nothing scores is rejected rather than guessed.
pub fn detect_header(rows: &[Vec<String>], scan_rows: usize) -> Option<usize> {
    let mut best: Option<(usize, u32)> = None;
    for (idx, row) in rows.iter().take(scan_rows).enumerate() {
        let score = row_score(row);
        if score > best.map(|(_, s)| s).unwrap_or(0) {
            best = Some((idx, score));
        }
    }
    best.map(|(idx, _)| idx)
}

fn is_student_header(cell: &str) -> bool {
    let upper = cell.trim().to_uppercase();
    upper.contains("ALUNO") || upper == "NOME"
}

pub fn student_column(header: &[String]) -> Option<usize> {
    header.iter().position(|h| is_student_header(h))
}

/// Course name: the first cell above the header, else the sheet's first cell,
/// else `fallback`. Long titles are cut at `max_chars` and marked with "...".
pub fn infer_title(rows: &[Vec<String>], header_idx: usize, fallback: &str, max_chars: usize) -> String {
    let first_cell = |idx: usize| {
        rows.get(idx)
            .and_then(|r| r.first())
            .filter(|c| !c.trim().is_empty())
            .cloned()
    };
    let above = header_idx.checked_sub(1).and_then(first_cell);
    let title = above
        .or_else(|| first_cell(0))
        .unwrap_or_else(|| fallback.to_string());

    if title.chars().count() > max_chars {
        let cut: String = title.chars().take(max_chars).collect();
        format!("{}...", cut)
    } else {
        title
    }
}

pub fn term_name(today: NaiveDate) -> String {
    format!("Importado {}", today.format("%d/%m/%Y"))
}

/// Trimmed header text with embedded line breaks flattened, or `None` for a
/// column that should not become a grid column.
pub fn column_name(raw: &str) -> Option<String> {
    let name = raw
        .trim()
        .replace("\r\n", " ")
        .replace(['\r', '\n'], " ");
    if name.is_empty() {
        return None;
    }
    let upper = name.to_uppercase();
    if is_student_header(&name) || matches!(upper.as_str(), "N°" | "Nº" | "#" | "ID") {
        return None;
    }
    Some(name)
}

/// The trimmed student name of a data row, or `None` for rows that are not
/// students: blanks, short strings, repeated header tokens and banners.
pub fn student_name<'a>(cell: &'a str, banner_tokens: &[String]) -> Option<&'a str> {
    let name = cell.trim();
    if name.chars().count() < MIN_NAME_CHARS {
        return None;
    }
    let upper = name.to_uppercase();
    if upper == "ALUNO" || upper == "NOME" {
        return None;
    }
    if banner_tokens.iter().any(|t| upper.contains(&t.to_uppercase())) {
        return None;
    }
    Some(name)
}

pub fn run_import(
    conn: &Connection,
    owner: &str,
    rows: &[Vec<String>],
    settings: &ImportSettings,
    today: NaiveDate,
    progress: &mut dyn FnMut(String),
) -> Result<ImportResult, ImportError> {
    if rows.len() < 2 {
        return Err(ImportError::Empty);
    }

    progress("Analisando estrutura do arquivo...".to_string());
    let scanned = rows.len().min(settings.header_scan_rows);
    let header_idx =
        detect_header(rows, settings.header_scan_rows).ok_or(ImportError::NoHeaderRow { scanned })?;
    let header = &rows[header_idx];
    let name_idx = student_column(header).ok_or(ImportError::NoStudentColumn {
        row: header_idx + 1,
    })?;
    tracing::debug!(header_row = header_idx, name_column = name_idx, "header detected");

    let course_name = infer_title(
        rows,
        header_idx,
        &settings.fallback_course_name,
        settings.title_max_chars,
    );
    let term_name = term_name(today);

    progress(format!("Criando Turma: {}...", course_name));
    let term = catalog::create_term(conn, &term_name, owner)?;
    let course = catalog::create_course(conn, &term.id, &course_name)?;
    let module = catalog::create_module(conn, &course.id, &settings.default_module_name)?;
    tracing::info!(term_id = %term.id, course_id = %course.id, "import structure created");

    let mut errors: Vec<String> = Vec::new();

    progress("Criando colunas...".to_string());
    let mut column_map: BTreeMap<usize, String> = BTreeMap::new();
    for (idx, raw) in header.iter().enumerate() {
        let Some(name) = column_name(raw) else {
            continue;
        };
        match catalog::create_column(conn, &module.id, &name, ColumnType::Text) {
            Ok(col) => {
                column_map.insert(idx, col.id);
            }
            Err(e) => {
                tracing::warn!(header = %name, error = %e, "column creation failed");
                if settings.column_failure == ColumnFailure::Abort {
                    return Err(ImportError::ColumnFailed {
                        header: name,
                        source: e,
                    });
                }
                errors.push(format!("Erro ao criar coluna: {}", name));
            }
        }
    }

    let mut known_students: HashMap<String, String> = HashMap::new();
    let mut count = 0usize;
    for row in rows.iter().skip(header_idx + 1) {
        let Some(name) = row
            .get(name_idx)
            .and_then(|c| student_name(c, &settings.banner_tokens))
        else {
            continue;
        };

        count += 1;
        progress(format!("Processando ({}): {}", count, name));

        let student_id = match resolve_student(conn, owner, name, settings.student_match, &mut known_students) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(student = %name, error = %e, "student creation failed");
                errors.push(format!("Erro ao criar aluno: {}", name));
                continue;
            }
        };

        let enrollment = match catalog::enroll(conn, &course.id, &student_id) {
            Ok((e, _)) => e,
            Err(e) => {
                tracing::warn!(student = %name, error = %e, "enrollment failed");
                errors.push(format!("Erro ao matricular: {}", name));
                continue;
            }
        };

        let writes: Vec<CellWrite> = column_map
            .iter()
            .filter(|(idx, _)| **idx != name_idx)
            .filter_map(|(idx, column_id)| {
                let value = row.get(*idx).map(|v| v.trim()).unwrap_or("");
                (!value.is_empty()).then(|| CellWrite::new(&enrollment.id, column_id, value))
            })
            .collect();
        if writes.is_empty() {
            continue;
        }
        if let Err(e) = grid::upsert_records_batch(conn, &writes) {
            tracing::warn!(student = %name, error = %e, "record batch failed");
            errors.push(format!("Falha em {}: {}", name, e));
        }
    }

    progress("Concluído!".to_string());
    tracing::info!(count, errors = errors.len(), course_id = %course.id, "import finished");
    Ok(ImportResult {
        count,
        errors,
        course_name,
        term_name,
        term_id: term.id,
        course_id: course.id,
    })
}

fn resolve_student(
    conn: &Connection,
    owner: &str,
    name: &str,
    scope: StudentMatch,
    known: &mut HashMap<String, String>,
) -> anyhow::Result<String> {
    let needle = name.to_lowercase();
    if let Some(id) = known.get(&needle) {
        return Ok(id.clone());
    }
    let existing = match scope {
        StudentMatch::PerImport => None,
        StudentMatch::Owner => catalog::find_student_by_name(conn, owner, name)?,
    };
    let id = match existing {
        Some(s) => s.id,
        None => {
            let new = NewStudent {
                name,
                matricula: None,
                email: None,
                phone: None,
            };
            catalog::create_student(conn, &new, owner)?.id
        }
    };
    known.insert(needle, id.clone());
    Ok(id)
}
