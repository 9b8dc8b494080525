use crate::db::CourseDb;
use crate::errors::ExecutionError;
use crate::models::Scalar;
use crate::registry::RenderedQuery;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::time::{Duration, Instant};

/// SQLite VM instructions between deadline checks.
const PROGRESS_INTERVAL: i32 = 1_000;

pub fn execute(query: &RenderedQuery, db: &CourseDb) -> Result<Scalar, ExecutionError> {
    let conn = db.connection()?;
    execute_on(query, &conn, db.query_timeout())
}

/// Runs a rendered metric query and returns its single value.
pub fn execute_on(query: &RenderedQuery, conn: &Connection, timeout: Duration) -> Result<Scalar, ExecutionError> {
    // A timeout past the clock's range means no deadline.
    let deadline = Instant::now().checked_add(timeout);
    conn.progress_handler(
        PROGRESS_INTERVAL,
        Some(move || deadline.is_some_and(|deadline| Instant::now() >= deadline)),
    );
    let result = run_single_value(query, conn);
    conn.progress_handler(0, None::<fn() -> bool>);

    match result {
        Ok(outcome) => outcome,
        Err(error) if error.sqlite_error_code() == Some(rusqlite::ErrorCode::OperationInterrupted) => {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(timeout_ms, "metric query interrupted");
            Err(ExecutionError::Timeout(timeout_ms))
        }
        Err(error) => Err(ExecutionError::from(error)),
    }
}

fn run_single_value(
    query: &RenderedQuery,
    conn: &Connection,
) -> Result<Result<Scalar, ExecutionError>, rusqlite::Error> {
    let mut stmt = conn.prepare(&query.sql)?;
    if !stmt.readonly() {
        return Ok(Err(ExecutionError::Database(
            "metric query is not read-only".to_string(),
        )));
    }
    let columns = stmt.column_count();
    let params = query.named_params();
    let mut rows = stmt.query(params.as_slice())?;

    let mut seen = 0usize;
    let mut first = None;
    while let Some(row) = rows.next()? {
        seen += 1;
        if seen > 1 {
            break;
        }
        if columns >= 1 {
            first = Some(scalar_from(row.get_ref(0)?));
        }
    }

    match first {
        Some(value) if seen == 1 && columns == 1 => {
            tracing::debug!(rows = seen, "metric query finished");
            Ok(Ok(value))
        }
        _ => Ok(Err(ExecutionError::Shape { rows: seen, columns })),
    }
}

fn scalar_from(value: ValueRef<'_>) -> Scalar {
    match value {
        ValueRef::Null => Scalar::Null,
        ValueRef::Integer(value) => Scalar::Integer(value),
        ValueRef::Real(value) => Scalar::Real(value),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Scalar::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}
