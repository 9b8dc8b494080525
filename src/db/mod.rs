use crate::errors::{AppError, AppResult, ExecutionError, ResolutionError};
use crate::models::{RatingSummary, Reference};
use crate::resolver::ReferenceLookup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Read-only handle on the course database. Safe to reuse across sequential questions.
#[derive(Debug)]
pub struct CourseDb {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    query_timeout: Duration,
}

impl CourseDb {
    pub fn open_read_only(path: &Path, busy_timeout: Duration, query_timeout: Duration) -> AppResult<Self> {
        if !path.is_file() {
            return Err(AppError::Config(format!("database not found: {}", path.display())));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA query_only = ON;")?;

        tracing::debug!(path = %path.display(), "opened course database read-only");
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            query_timeout,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>, ExecutionError> {
        self.conn
            .lock()
            .map_err(|_| ExecutionError::Database("database mutex poisoned".to_string()))
    }

    pub fn module_name(&self, module_id: i64) -> AppResult<Option<String>> {
        let conn = self.connection()?;
        let name = conn
            .query_row(
                "SELECT module_name FROM modules WHERE module_id = ?1",
                params![module_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name)
    }

    pub fn rating_summary(&self, module_id: i64) -> AppResult<RatingSummary> {
        let conn = self.connection()?;
        let summary = conn.query_row(
            "SELECT COUNT(rating),
                    AVG(rating),
                    COALESCE(SUM(CASE WHEN rating = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN rating = 2 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN rating = 3 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN rating = 4 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN rating = 5 THEN 1 ELSE 0 END), 0)
             FROM student_module_completions
             WHERE module_id = ?1 AND rating IS NOT NULL",
            params![module_id],
            |row| {
                Ok(RatingSummary {
                    count: row.get(0)?,
                    average: row.get(1)?,
                    r1: row.get(2)?,
                    r2: row.get(3)?,
                    r3: row.get(4)?,
                    r4: row.get(5)?,
                    r5: row.get(6)?,
                })
            },
        )?;
        Ok(summary)
    }

    /// Non-blank free-text comments for a module, oldest student first.
    pub fn module_comments(&self, module_id: i64) -> AppResult<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT TRIM(feedback)
             FROM student_module_completions
             WHERE module_id = ?1 AND feedback IS NOT NULL AND TRIM(feedback) <> ''
             ORDER BY student_id, completed_at",
        )?;
        let rows = stmt.query_map(params![module_id], |row| row.get::<_, String>(0))?;
        let mut comments = Vec::new();
        for row in rows {
            comments.push(row?);
        }
        Ok(comments)
    }

    /// Modules that have at least one completion row.
    pub fn active_module_ids(&self) -> AppResult<Vec<i64>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT module_id FROM student_module_completions ORDER BY module_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}

impl ReferenceLookup for CourseDb {
    fn find_ids(&self, reference: Reference, name: &str) -> Result<Vec<i64>, ResolutionError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ResolutionError::Lookup("database mutex poisoned".to_string()))?;
        let lookup = |error: rusqlite::Error| ResolutionError::Lookup(error.to_string());

        let mut stmt = conn.prepare(reference.lookup_sql()).map_err(lookup)?;
        let rows = stmt
            .query_map(params![name.trim()], |row| row.get::<_, i64>(0))
            .map_err(lookup)?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row.map_err(lookup)?);
        }
        Ok(ids)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::seeded_db;
    use super::CourseDb;
    use crate::errors::{AppError, ResolutionError};
    use crate::models::Reference;
    use crate::resolver::ReferenceLookup;
    use std::time::Duration;

    #[test]
    fn missing_database_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let error = CourseDb::open_read_only(
            &dir.path().join("absent.db"),
            Duration::from_millis(10),
            Duration::from_millis(10),
        )
        .expect_err("missing file");
        assert!(matches!(error, AppError::Config(_)));
        assert!(!dir.path().join("absent.db").exists());
    }

    #[test]
    fn connection_refuses_writes() {
        let (_dir, db) = seeded_db();
        let conn = db.connection().expect("conn");
        assert!(conn.execute("DELETE FROM students", []).is_err());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 8);
    }

    #[test]
    fn name_lookup_is_case_insensitive_and_exact() {
        let (_dir, db) = seeded_db();
        assert_eq!(
            db.find_ids(Reference::Module, "foundations of education").expect("lookup"),
            vec![1]
        );
        assert_eq!(db.find_ids(Reference::Assessment, "Final Exam").expect("lookup"), vec![3]);
        assert_eq!(db.find_ids(Reference::Student, "DONALD KNUTH").expect("lookup"), vec![7]);
        assert!(db.find_ids(Reference::Module, "Foundations").expect("lookup").is_empty());
    }

    #[test]
    fn rating_summary_counts_each_band() {
        let (_dir, db) = seeded_db();
        let summary = db.rating_summary(1).expect("summary");
        assert_eq!(summary.count, 5);
        assert_eq!(summary.average, Some(3.8));
        assert_eq!((summary.r1, summary.r2, summary.r3, summary.r4, summary.r5), (0, 1, 1, 1, 2));

        let empty = db.rating_summary(99).expect("summary");
        assert_eq!(empty.count, 0);
        assert_eq!(empty.average, None);
    }

    #[test]
    fn comments_skip_blank_feedback() {
        let (_dir, db) = seeded_db();
        assert_eq!(
            db.module_comments(1).expect("comments"),
            vec!["Great introduction", "Very practical", "Slides were dense"]
        );
        assert_eq!(db.active_module_ids().expect("ids"), vec![1, 2, 3]);
        assert_eq!(db.module_name(2).expect("name").as_deref(), Some("Learning Theories"));
        assert_eq!(db.module_name(42).expect("name"), None);
    }

    #[test]
    fn lookup_errors_are_reported_as_lookup_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.db");
        rusqlite::Connection::open(&path)
            .and_then(|conn| conn.execute_batch("CREATE TABLE unrelated (x INTEGER);"))
            .expect("create");
        let db = CourseDb::open_read_only(&path, Duration::from_millis(10), Duration::from_millis(10))
            .expect("open");
        assert!(matches!(
            db.find_ids(Reference::Module, "Anything"),
            Err(ResolutionError::Lookup(_))
        ));
    }
}
