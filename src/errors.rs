use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("REGISTRY_IO: {0}")]
    Io(String),
    #[error("REGISTRY_MALFORMED: {0}")]
    Malformed(String),
    #[error("REGISTRY_DUPLICATE: metric '{0}' is declared more than once")]
    DuplicateMetric(String),
    #[error("REGISTRY_PLACEHOLDER_MISMATCH: metric '{metric}': {detail}")]
    PlaceholderMismatch { metric: String, detail: String },
    #[error("REGISTRY_INVALID: metric '{metric}': {detail}")]
    InvalidMetric { metric: String, detail: String },
    #[error("UNKNOWN_METRIC: {0}")]
    NotFound(String),
    #[error("RENDER_MISMATCH: metric '{metric}': {detail}")]
    RenderMismatch { metric: String, detail: String },
}

/// Transport-level failures of the LLM endpoint. Opaque to the parsers beyond pass/fail.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("LLM_NOT_CONFIGURED: {0}")]
    NotConfigured(String),
    #[error("LLM_TIMEOUT: {0}")]
    Timeout(String),
    #[error("LLM_HTTP: status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("LLM_NETWORK: {0}")]
    Network(String),
    #[error("LLM_RESPONSE: {0}")]
    Response(String),
}

/// Soft failures of the LLM intent parser. Every variant drives the rules fallback.
#[derive(Debug, Error)]
pub enum ParseFailure {
    #[error("malformed LLM response: {0}")]
    MalformedResponse(String),
    #[error("LLM chose unknown metric '{0}'")]
    UnknownMetric(String),
    #[error("LLM omitted parameter '{param}' for metric '{metric}'")]
    MissingParam { metric: String, param: String },
    #[error("LLM transport failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no rule matched the question")]
pub struct NoMatch;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("no {entity} named '{name}'")]
    UnresolvedName { entity: &'static str, name: String },
    #[error("{count} {entity}s are named '{name}'")]
    AmbiguousName {
        entity: &'static str,
        name: String,
        count: usize,
    },
    #[error("parameter '{param}' expects {expected}, got {got}")]
    TypeCoercionError {
        param: String,
        expected: String,
        got: String,
    },
    #[error("parameter '{0}' has no value")]
    MissingValue(String),
    #[error("lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("database error: {0}")]
    Database(String),
    #[error("metric query returned {rows} row(s) and {columns} column(s); expected exactly one value")]
    Shape { rows: usize, columns: usize },
    #[error("query exceeded {0} ms and was interrupted")]
    Timeout(u64),
}

impl From<rusqlite::Error> for ExecutionError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Database(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("UNANSWERABLE: could not understand the question")]
    Unanswerable,
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// 2 asks the instructor to rephrase, 1 is a data/system problem, 3 a setup problem.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Unanswerable => 2,
            Self::Resolution(ResolutionError::Lookup(_)) => 1,
            Self::Resolution(_) => 2,
            Self::Execution(_) | Self::Io(_) | Self::Internal(_) => 1,
            Self::Registry(_) | Self::Config(_) => 3,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Execution(ExecutionError::from(value))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
