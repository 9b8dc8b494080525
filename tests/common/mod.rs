#![allow(dead_code)]

use course_metrics::adapters::{ChatRequest, LlmTransport};
use course_metrics::db::CourseDb;
use course_metrics::errors::TransportError;
use course_metrics::registry::MetricRegistry;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const SCHEMA_SQL: &str = include_str!("../fixtures/schema.sql");
pub const SEED_SQL: &str = include_str!("../fixtures/seed.sql");

pub fn catalog_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("metrics.json")
}

/// Writes the fixture database into a fresh temp dir and returns its path.
pub fn seeded_db_file() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("user.db");
    let conn = rusqlite::Connection::open(&path).expect("create db");
    conn.execute_batch(SCHEMA_SQL).expect("schema");
    conn.execute_batch(SEED_SQL).expect("seed");
    drop(conn);
    (dir, path)
}

pub fn open_db(path: &Path) -> CourseDb {
    CourseDb::open_read_only(path, Duration::from_millis(2_000), Duration::from_millis(5_000)).expect("open db")
}

pub fn catalog() -> MetricRegistry {
    MetricRegistry::load(&catalog_path()).expect("catalog")
}

/// Returns the same reply to every request. `calls` stays readable after boxing.
pub struct CannedTransport {
    reply: Option<String>,
    pub calls: Arc<Mutex<usize>>,
}

impl CannedTransport {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            reply: None,
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn counter(&self) -> Arc<Mutex<usize>> {
        Arc::clone(&self.calls)
    }
}

impl LlmTransport for CannedTransport {
    fn name(&self) -> &str {
        "canned"
    }

    fn complete(&self, _request: &ChatRequest) -> Result<String, TransportError> {
        *self.calls.lock().expect("lock") += 1;
        self.reply
            .clone()
            .ok_or_else(|| TransportError::Network("connection refused".to_string()))
    }
}
