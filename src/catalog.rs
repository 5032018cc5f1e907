//! Row-level store operations for the academic catalog: terms, courses,
//! modules, columns, students, enrollments and books.

use crate::db::now_timestamp;
use crate::model::{column_from_sql, Book, Column, ColumnType, Course, Enrollment, Module, Student, Term};
use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

fn term_from_row(r: &Row<'_>) -> rusqlite::Result<Term> {
    Ok(Term {
        id: r.get(0)?,
        name: r.get(1)?,
        is_archived: r.get::<_, i64>(2)? != 0,
        owner: r.get(3)?,
        created_at: r.get(4)?,
    })
}

fn student_from_row(r: &Row<'_>, base: usize) -> rusqlite::Result<Student> {
    Ok(Student {
        id: r.get(base)?,
        name: r.get(base + 1)?,
        matricula: r.get(base + 2)?,
        email: r.get(base + 3)?,
        phone: r.get(base + 4)?,
        owner: r.get(base + 5)?,
    })
}

const STUDENT_COLS: &str = "s.id, s.name, s.matricula, s.email, s.phone, s.user_id";

// --- terms ---

pub fn list_terms(conn: &Connection) -> anyhow::Result<Vec<Term>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, is_archived, user_id, created_at
         FROM academic_terms
         ORDER BY created_at DESC, rowid DESC",
    )?;
    let rows = stmt
        .query_map([], term_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_term(conn: &Connection, name: &str, owner: &str) -> anyhow::Result<Term> {
    let term = Term {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        is_archived: false,
        owner: owner.to_string(),
        created_at: now_timestamp(),
    };
    conn.execute(
        "INSERT INTO academic_terms(id, name, is_archived, user_id, created_at)
         VALUES(?, ?, 0, ?, ?)",
        (&term.id, &term.name, &term.owner, &term.created_at),
    )
    .context("failed to create term")?;
    Ok(term)
}

pub fn get_term(conn: &Connection, term_id: &str) -> anyhow::Result<Option<Term>> {
    let term = conn
        .query_row(
            "SELECT id, name, is_archived, user_id, created_at FROM academic_terms WHERE id = ?",
            [term_id],
            term_from_row,
        )
        .optional()?;
    Ok(term)
}

pub fn set_term_archived(conn: &Connection, term_id: &str, archived: bool) -> anyhow::Result<bool> {
    let changed = conn.execute(
        "UPDATE academic_terms SET is_archived = ? WHERE id = ?",
        (archived as i64, term_id),
    )?;
    Ok(changed > 0)
}

/// Deletes the term; courses, modules, columns, enrollments, records and
/// attendance go with it through the schema cascade.
pub fn delete_term(conn: &Connection, term_id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM academic_terms WHERE id = ?", [term_id])?;
    Ok(changed > 0)
}

/// Copies a term's structure (courses, modules, columns) under a new name for
/// the same owner. Students, enrollments and cell values stay behind.
pub fn clone_term(conn: &Connection, source_term_id: &str, new_name: &str) -> anyhow::Result<Option<Term>> {
    let Some(source) = get_term(conn, source_term_id)? else {
        return Ok(None);
    };

    let tx = conn.unchecked_transaction()?;
    let term = create_term(&tx, new_name, &source.owner)?;

    for course in list_courses(&tx, source_term_id)? {
        let new_course = create_course(&tx, &term.id, &course.name)?;
        for module in list_modules(&tx, &course.id)? {
            let new_module_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO course_modules(id, course_id, name, order_index, created_at)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    &new_module_id,
                    &new_course.id,
                    &module.name,
                    module.order_index,
                    now_timestamp(),
                ),
            )?;
            for col in &module.columns {
                tx.execute(
                    "INSERT INTO module_columns(id, module_id, name, type, order_index, created_at)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &new_module_id,
                        &col.name,
                        col.column_type.as_str(),
                        col.order_index,
                        now_timestamp(),
                    ),
                )?;
            }
        }
    }

    tx.commit()?;
    Ok(Some(term))
}

// --- courses ---

const COURSE_COLS: &str = "id, term_id, name, schedule_json";

fn course_from_row(r: &Row<'_>) -> rusqlite::Result<Course> {
    let raw: String = r.get(3)?;
    let schedule: Vec<String> = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Course {
        id: r.get(0)?,
        term_id: r.get(1)?,
        name: r.get(2)?,
        schedule,
    })
}

pub fn list_courses(conn: &Connection, term_id: &str) -> anyhow::Result<Vec<Course>> {
    let sql = format!("SELECT {} FROM courses WHERE term_id = ? ORDER BY name", COURSE_COLS);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([term_id], course_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn create_course(conn: &Connection, term_id: &str, name: &str) -> anyhow::Result<Course> {
    let course = Course {
        id: Uuid::new_v4().to_string(),
        term_id: term_id.to_string(),
        name: name.to_string(),
        schedule: Vec::new(),
    };
    conn.execute(
        "INSERT INTO courses(id, term_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&course.id, &course.term_id, &course.name, now_timestamp()),
    )
    .context("failed to create course")?;
    Ok(course)
}

pub fn get_course(conn: &Connection, course_id: &str) -> anyhow::Result<Option<Course>> {
    let sql = format!("SELECT {} FROM courses WHERE id = ?", COURSE_COLS);
    let course = conn.query_row(&sql, [course_id], course_from_row).optional()?;
    Ok(course)
}

/// Replaces a course's class calendar. Dates are stored sorted and
/// de-duplicated; returns false when the course does not exist.
pub fn set_course_schedule(conn: &Connection, course_id: &str, dates: &[NaiveDate]) -> anyhow::Result<bool> {
    let schedule: Vec<String> = dates
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect();
    let changed = conn.execute(
        "UPDATE courses SET schedule_json = ? WHERE id = ?",
        (serde_json::to_string(&schedule)?, course_id),
    )?;
    Ok(changed > 0)
}

pub fn delete_course(conn: &Connection, course_id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM courses WHERE id = ?", [course_id])?;
    Ok(changed > 0)
}

// --- modules / columns ---

/// Modules of a course in display order, each carrying its columns in display order.
pub fn list_modules(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<Module>> {
    let mut stmt = conn.prepare(
        "SELECT id, course_id, name, order_index
         FROM course_modules
         WHERE course_id = ?
         ORDER BY order_index, rowid",
    )?;
    let mut modules = stmt
        .query_map([course_id], |r| {
            Ok(Module {
                id: r.get(0)?,
                course_id: r.get(1)?,
                name: r.get(2)?,
                order_index: r.get(3)?,
                columns: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut col_stmt = conn.prepare(
        "SELECT id, module_id, name, type, order_index
         FROM module_columns
         WHERE module_id = ?
         ORDER BY order_index, rowid",
    )?;
    for module in modules.iter_mut() {
        module.columns = col_stmt
            .query_map([&module.id], |r| {
                Ok(Column {
                    id: r.get(0)?,
                    module_id: r.get(1)?,
                    name: r.get(2)?,
                    column_type: column_from_sql(3, r.get(3)?)?,
                    order_index: r.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
    }
    Ok(modules)
}

pub fn create_module(conn: &Connection, course_id: &str, name: &str) -> anyhow::Result<Module> {
    let next_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(order_index) + 1, 0) FROM course_modules WHERE course_id = ?",
        [course_id],
        |r| r.get(0),
    )?;
    let module = Module {
        id: Uuid::new_v4().to_string(),
        course_id: course_id.to_string(),
        name: name.to_string(),
        order_index: next_order,
        columns: Vec::new(),
    };
    conn.execute(
        "INSERT INTO course_modules(id, course_id, name, order_index, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &module.id,
            &module.course_id,
            &module.name,
            module.order_index,
            now_timestamp(),
        ),
    )
    .context("failed to create module")?;
    Ok(module)
}

pub fn course_of_module(conn: &Connection, module_id: &str) -> anyhow::Result<Option<String>> {
    let course_id = conn
        .query_row(
            "SELECT course_id FROM course_modules WHERE id = ?",
            [module_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(course_id)
}

pub fn course_of_column(conn: &Connection, column_id: &str) -> anyhow::Result<Option<String>> {
    let course_id = conn
        .query_row(
            "SELECT m.course_id
             FROM module_columns c
             JOIN course_modules m ON m.id = c.module_id
             WHERE c.id = ?",
            [column_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(course_id)
}

pub fn delete_module(conn: &Connection, module_id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM course_modules WHERE id = ?", [module_id])?;
    Ok(changed > 0)
}

/// Inserts a typed column. The type is written as-is; a store that refuses it
/// fails the call instead of falling back to text.
pub fn create_column(
    conn: &Connection,
    module_id: &str,
    name: &str,
    column_type: ColumnType,
) -> anyhow::Result<Column> {
    let next_order: i64 = conn.query_row(
        "SELECT COALESCE(MAX(order_index) + 1, 0) FROM module_columns WHERE module_id = ?",
        [module_id],
        |r| r.get(0),
    )?;
    let column = Column {
        id: Uuid::new_v4().to_string(),
        module_id: module_id.to_string(),
        name: name.to_string(),
        column_type,
        order_index: next_order,
    };
    conn.execute(
        "INSERT INTO module_columns(id, module_id, name, type, order_index, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &column.id,
            &column.module_id,
            &column.name,
            column.column_type.as_str(),
            column.order_index,
            now_timestamp(),
        ),
    )
    .with_context(|| format!("failed to create column {:?}", name))?;
    Ok(column)
}

pub fn delete_column(conn: &Connection, column_id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM module_columns WHERE id = ?", [column_id])?;
    Ok(changed > 0)
}

// --- students ---

pub struct NewStudent<'a> {
    pub name: &'a str,
    pub matricula: Option<&'a str>,
    pub email: Option<&'a str>,
    pub phone: Option<&'a str>,
}

pub fn create_student(conn: &Connection, new: &NewStudent<'_>, owner: &str) -> anyhow::Result<Student> {
    let student = Student {
        id: Uuid::new_v4().to_string(),
        name: new.name.to_string(),
        matricula: new.matricula.map(str::to_string),
        email: new.email.map(str::to_string),
        phone: new.phone.map(str::to_string),
        owner: owner.to_string(),
    };
    conn.execute(
        "INSERT INTO students(id, name, matricula, phone, email, user_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &student.id,
            &student.name,
            &student.matricula,
            &student.phone,
            &student.email,
            &student.owner,
            now_timestamp(),
        ),
    )
    .with_context(|| format!("failed to create student {:?}", new.name))?;
    Ok(student)
}

pub fn get_student(conn: &Connection, student_id: &str) -> anyhow::Result<Option<Student>> {
    let sql = format!("SELECT {} FROM students s WHERE s.id = ?", STUDENT_COLS);
    let student = conn
        .query_row(&sql, [student_id], |r| student_from_row(r, 0))
        .optional()?;
    Ok(student)
}

pub fn list_students(conn: &Connection) -> anyhow::Result<Vec<Student>> {
    let sql = format!(
        "SELECT {} FROM students s ORDER BY s.name COLLATE NOCASE, s.rowid",
        STUDENT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| student_from_row(r, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Case-insensitive substring match on name or matricula. Folding happens in
/// Rust because SQLite's `lower()` only folds ASCII ("JOSÉ" vs "josé").
pub fn search_students(conn: &Connection, query: &str, limit: usize) -> anyhow::Result<Vec<Student>> {
    let needle = query.trim().to_lowercase();
    let matches = |field: &str| field.to_lowercase().contains(&needle);
    let found = list_students(conn)?
        .into_iter()
        .filter(|s| matches(&s.name) || s.matricula.as_deref().map(matches).unwrap_or(false))
        .take(limit)
        .collect();
    Ok(found)
}

/// Exact, case-insensitive name lookup within one owner's students. Oldest
/// match wins when the owner already has duplicates.
pub fn find_student_by_name(conn: &Connection, owner: &str, name: &str) -> anyhow::Result<Option<Student>> {
    let needle = name.trim().to_lowercase();
    let sql = format!(
        "SELECT {} FROM students s WHERE s.user_id = ? ORDER BY s.rowid",
        STUDENT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([owner])?;
    while let Some(row) = rows.next()? {
        let student = student_from_row(row, 0)?;
        if student.name.trim().to_lowercase() == needle {
            return Ok(Some(student));
        }
    }
    Ok(None)
}

pub fn delete_student(conn: &Connection, student_id: &str) -> anyhow::Result<bool> {
    let changed = conn.execute("DELETE FROM students WHERE id = ?", [student_id])?;
    Ok(changed > 0)
}

// --- enrollments ---

/// Enrolls a student, returning the existing enrollment when the pair is
/// already present. The `(course_id, student_id)` unique key decides, so two
/// racing callers still end up with one row. The flag is true when a row was
/// written by this call.
pub fn enroll(conn: &Connection, course_id: &str, student_id: &str) -> anyhow::Result<(Enrollment, bool)> {
    let inserted = conn
        .execute(
            "INSERT INTO enrollments(id, course_id, student_id, created_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(course_id, student_id) DO NOTHING",
            (
                Uuid::new_v4().to_string(),
                course_id,
                student_id,
                now_timestamp(),
            ),
        )
        .context("failed to enroll student")?;

    let sql = format!(
        "SELECT e.id, e.course_id, e.student_id, {}
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.course_id = ? AND e.student_id = ?",
        STUDENT_COLS
    );
    let enrollment = conn
        .query_row(&sql, (course_id, student_id), enrollment_from_row)
        .context("enrollment missing after insert")?;
    Ok((enrollment, inserted > 0))
}

pub fn is_enrolled(conn: &Connection, course_id: &str, student_id: &str) -> anyhow::Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE course_id = ? AND student_id = ?",
            (course_id, student_id),
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn enrollment_from_row(r: &Row<'_>) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: r.get(0)?,
        course_id: r.get(1)?,
        student_id: r.get(2)?,
        student: student_from_row(r, 3)?,
    })
}

/// Enrollments of a course joined with their students, in fetch order.
pub fn list_enrollments(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<Enrollment>> {
    let sql = format!(
        "SELECT e.id, e.course_id, e.student_id, {}
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.course_id = ?
         ORDER BY e.created_at, e.rowid",
        STUDENT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([course_id], enrollment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_student_enrollments(conn: &Connection, student_id: &str) -> anyhow::Result<Vec<Enrollment>> {
    let sql = format!(
        "SELECT e.id, e.course_id, e.student_id, {}
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.student_id = ?
         ORDER BY e.created_at, e.rowid",
        STUDENT_COLS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([student_id], enrollment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// --- books ---

pub struct NewBook<'a> {
    pub code: Option<&'a str>,
    pub title: &'a str,
    pub author: Option<&'a str>,
    pub category: Option<&'a str>,
    pub stock: i64,
}

pub fn create_book(conn: &Connection, new: &NewBook<'_>, owner: &str) -> anyhow::Result<Book> {
    let book = Book {
        id: Uuid::new_v4().to_string(),
        code: new.code.map(str::to_string),
        title: new.title.to_string(),
        author: new.author.map(str::to_string),
        category: new.category.map(str::to_string),
        stock: new.stock,
        owner: owner.to_string(),
    };
    conn.execute(
        "INSERT INTO library_books(id, code, title, author, category, stock, user_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &book.id,
            &book.code,
            &book.title,
            &book.author,
            &book.category,
            book.stock,
            &book.owner,
            now_timestamp(),
        ),
    )
    .context("failed to create book")?;
    Ok(book)
}

pub fn list_books(conn: &Connection) -> anyhow::Result<Vec<Book>> {
    let mut stmt = conn.prepare(
        "SELECT id, code, title, author, category, stock, user_id
         FROM library_books
         ORDER BY title COLLATE NOCASE, rowid",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(Book {
                id: r.get(0)?,
                code: r.get(1)?,
                title: r.get(2)?,
                author: r.get(3)?,
                category: r.get(4)?,
                stock: r.get(5)?,
                owner: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
