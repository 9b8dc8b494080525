use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ─── Registry vocabulary ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Integer,
    Number,
    String,
    Date,
    Enum,
    ModuleId,
    AssessmentId,
    StudentId,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Number => "number",
            Self::String => "string",
            Self::Date => "date",
            Self::Enum => "enum",
            Self::ModuleId => "module_id",
            Self::AssessmentId => "assessment_id",
            Self::StudentId => "student_id",
        }
    }

    /// Identifier types whose values may arrive as display names.
    pub fn reference(self) -> Option<Reference> {
        match self {
            Self::ModuleId => Some(Reference::Module),
            Self::AssessmentId => Some(Reference::Assessment),
            Self::StudentId => Some(Reference::Student),
            _ => None,
        }
    }
}

/// Reference tables used for name to identifier resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Module,
    Assessment,
    Student,
}

impl Reference {
    pub fn entity(self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Assessment => "assessment",
            Self::Student => "student",
        }
    }

    pub fn lookup_sql(self) -> &'static str {
        match self {
            Self::Module => "SELECT module_id FROM modules WHERE LOWER(module_name) = LOWER(?1) ORDER BY module_id",
            Self::Assessment => {
                "SELECT assessment_id FROM assessments WHERE LOWER(assessment_name) = LOWER(?1) ORDER BY assessment_id"
            }
            Self::Student => {
                "SELECT student_id FROM students WHERE LOWER(student_name) = LOWER(?1) ORDER BY student_id"
            }
        }
    }

    /// Words that introduce a value of this reference in a question.
    pub fn anchors(self) -> &'static [&'static str] {
        match self {
            Self::Module => &["module"],
            Self::Assessment => &["assessment", "project"],
            Self::Student => &["student"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricExample {
    pub question: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// One record of the registry document, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricRecord {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub sql: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub examples: Vec<MetricExample>,
}

// ─── Intents ────────────────────────────────────────────────────────────────

/// Untyped parameter candidate as produced by a parser.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Integer(i64),
    Number(f64),
    Text(String),
    Null,
}

impl RawValue {
    /// Scalars only; arrays, objects and booleans are not parameter candidates.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::String(text) => Some(Self::Text(text.clone())),
            serde_json::Value::Number(number) => number
                .as_i64()
                .map(Self::Integer)
                .or_else(|| number.as_f64().map(Self::Number)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Integer(value) => value.to_string(),
            Self::Number(value) => value.to_string(),
            Self::Text(text) => format!("'{}'", text),
            Self::Null => "null".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedIntent {
    pub metric_name: String,
    pub raw_params: BTreeMap<String, RawValue>,
}

impl ParsedIntent {
    pub fn new(metric_name: impl Into<String>) -> Self {
        Self {
            metric_name: metric_name.into(),
            raw_params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: RawValue) -> Self {
        self.raw_params.insert(name.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentSource {
    Llm,
    Rules,
}

impl IntentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Rules => "rules",
        }
    }
}

// ─── Resolved parameters and results ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Date(NaiveDate),
}

impl ParamValue {
    pub fn to_sql_value(&self) -> rusqlite::types::Value {
        use rusqlite::types::Value;
        match self {
            Self::Integer(value) => Value::Integer(*value),
            Self::Real(value) => Value::Real(*value),
            Self::Text(text) => Value::Text(text.clone()),
            Self::Date(date) => Value::Text(date.format("%Y-%m-%d").to_string()),
        }
    }
}

/// Parameters coerced to their declared types; keys equal the metric's params.
pub type ResolvedParams = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "no data"),
            Self::Integer(value) => write!(f, "{}", value),
            Self::Real(value) => {
                let fixed = format!("{:.2}", value);
                let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
                write!(f, "{}", trimmed)
            }
            Self::Text(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditTrailer {
    pub metric: String,
    pub params: ResolvedParams,
    pub source: IntentSource,
}

// ─── Feedback reports ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub count: i64,
    pub average: Option<f64>,
    pub r1: i64,
    pub r2: i64,
    pub r3: i64,
    pub r4: i64,
    pub r5: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackInsights {
    pub summary: String,
    pub themes: Vec<String>,
    pub praise: Vec<String>,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleFeedback {
    pub module_id: i64,
    pub module_name: Option<String>,
    pub quantitative: RatingSummary,
    pub comments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<FeedbackInsights>,
}
