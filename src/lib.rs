pub mod adapters;
pub mod config;
pub mod db;
pub mod errors;
pub mod executor;
pub mod feedback;
pub mod harness;
pub mod intent;
pub mod models;
pub mod redaction;
pub mod registry;
pub mod resolver;

use crate::adapters::LlmTransport;
use crate::config::Settings;
use crate::db::CourseDb;
use crate::errors::AppResult;
use crate::intent::Orchestrator;
use crate::models::{AuditTrailer, ModuleFeedback, Scalar};
use crate::registry::MetricRegistry;
use std::collections::BTreeMap;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// The value for stdout and the trailer for stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub value: Scalar,
    pub trailer: AuditTrailer,
}

/// Registry, database and optional model, shared by every command of one process.
pub struct CourseMetrics {
    registry: MetricRegistry,
    db: CourseDb,
    transport: Option<Box<dyn LlmTransport>>,
}

impl CourseMetrics {
    pub fn new(registry: MetricRegistry, db: CourseDb, transport: Option<Box<dyn LlmTransport>>) -> Self {
        Self {
            registry,
            db,
            transport,
        }
    }

    /// Registry problems surface before the database is touched.
    pub fn open(settings: &Settings, transport: Option<Box<dyn LlmTransport>>) -> AppResult<Self> {
        let registry = MetricRegistry::load(&settings.registry_path)?;
        tracing::debug!(metrics = registry.len(), path = %settings.registry_path.display(), "registry loaded");
        let db = CourseDb::open_read_only(&settings.db_path, settings.busy_timeout, settings.query_timeout)?;
        Ok(Self::new(registry, db, transport))
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn db(&self) -> &CourseDb {
        &self.db
    }

    pub fn ask(&self, question: &str) -> AppResult<Answer> {
        let span = tracing::info_span!("ask", request_id = %uuid::Uuid::new_v4());
        let _entered = span.enter();
        tracing::debug!(question, llm = self.transport.is_some(), "answering question");

        let orchestrator = Orchestrator::new(&self.registry, self.transport.as_deref(), &self.db);
        let resolved = orchestrator.resolve(question)?;
        let query = self.registry.render(&resolved.metric, &resolved.params)?;
        let value = executor::execute(&query, &self.db)?;
        tracing::info!(metric = %resolved.metric.name, answer = %value, "question answered");

        Ok(Answer {
            value,
            trailer: AuditTrailer {
                metric: resolved.metric.name,
                params: resolved.params,
                source: resolved.source,
            },
        })
    }

    pub fn module_feedback(&self, module_id: i64) -> AppResult<ModuleFeedback> {
        feedback::module_feedback(&self.db, module_id, self.transport.as_deref())
    }

    pub fn course_feedback(&self) -> AppResult<BTreeMap<i64, ModuleFeedback>> {
        feedback::course_feedback(&self.db, self.transport.as_deref())
    }
}

/// JSON lines to a daily file when `log_dir` is set, compact text on stderr otherwise.
pub fn init_tracing(log_dir: Option<&Path>) -> Result<(), String> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    let Some(log_dir) = log_dir else {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .compact()
            .try_init()
            .map_err(|error| error.to_string());
    };

    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "course-metrics.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}
