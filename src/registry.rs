use crate::errors::RegistryError;
use crate::models::{MetricExample, MetricRecord, ParamSpec, ParamType, ParamValue, ResolvedParams};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"));
static STRING_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid regex"));
/// Bind forms SQLite accepts besides `:name`; none of them can be tied to a declared param.
static OTHER_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\?[0-9]*|[@$][A-Za-z_][A-Za-z0-9_]*").expect("valid regex"));

/// A validated, immutable metric. Built only through [`MetricRegistry`].
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    pub name: String,
    pub description: Option<String>,
    pub params: Vec<ParamSpec>,
    pub sql: String,
    pub triggers: Vec<Regex>,
    pub exclude: Vec<String>,
    pub examples: Vec<MetricExample>,
}

impl MetricDefinition {
    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|param| param.name == name)
    }

    /// `name(module_id: module_id, ...)`, never the SQL text.
    pub fn signature(&self) -> String {
        let params = self
            .params
            .iter()
            .map(|param| {
                if param.kind == ParamType::Enum {
                    format!("{}: enum[{}]", param.name, param.values.join("|"))
                } else {
                    format!("{}: {}", param.name, param.kind.as_str())
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.name, params)
    }
}

/// SQL text plus named bind values, in declared parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub binds: Vec<(String, rusqlite::types::Value)>,
}

impl RenderedQuery {
    pub fn named_params(&self) -> Vec<(&str, &dyn rusqlite::ToSql)> {
        self.binds
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn rusqlite::ToSql))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricRegistry {
    metrics: Vec<MetricDefinition>,
    index: HashMap<String, usize>,
}

impl MetricRegistry {
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| RegistryError::Io(format!("{}: {}", path.display(), err)))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);
        let registry = if is_yaml {
            Self::from_yaml_str(&raw)?
        } else {
            Self::from_json_str(&raw)?
        };
        tracing::debug!(path = %path.display(), metrics = registry.len(), "loaded metric registry");
        Ok(registry)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, RegistryError> {
        let records: Vec<MetricRecord> =
            serde_json::from_str(raw).map_err(|err| RegistryError::Malformed(err.to_string()))?;
        Self::from_records(records)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, RegistryError> {
        let records: Vec<MetricRecord> =
            serde_yaml::from_str(raw).map_err(|err| RegistryError::Malformed(err.to_string()))?;
        Self::from_records(records)
    }

    pub fn from_records(records: Vec<MetricRecord>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for record in records {
            let definition = validate_record(record)?;
            if registry.index.contains_key(&definition.name) {
                return Err(RegistryError::DuplicateMetric(definition.name));
            }
            registry
                .index
                .insert(definition.name.clone(), registry.metrics.len());
            registry.metrics.push(definition);
        }
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.index.get(name).map(|idx| &self.metrics[*idx])
    }

    pub fn lookup(&self, name: &str) -> Result<&MetricDefinition, RegistryError> {
        self.get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// Metrics in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.iter().map(|metric| metric.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// One line per metric with its parameter signature and description.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for metric in &self.metrics {
            let _ = write!(out, "- {}", metric.signature());
            if let Some(description) = &metric.description {
                let _ = write!(out, ": {}", description);
            }
            out.push('\n');
        }
        out
    }

    pub fn render(
        &self,
        metric: &MetricDefinition,
        resolved: &ResolvedParams,
    ) -> Result<RenderedQuery, RegistryError> {
        // Only registry-owned SQL is ever rendered.
        let owned = self.lookup(&metric.name)?;

        let declared: BTreeSet<&str> = owned.params.iter().map(|param| param.name.as_str()).collect();
        let supplied: BTreeSet<&str> = resolved.keys().map(String::as_str).collect();
        if declared != supplied {
            return Err(RegistryError::RenderMismatch {
                metric: owned.name.clone(),
                detail: format!(
                    "expected params {:?}, got {:?}",
                    declared.iter().collect::<Vec<_>>(),
                    supplied.iter().collect::<Vec<_>>()
                ),
            });
        }

        let mut binds = Vec::with_capacity(owned.params.len());
        for param in &owned.params {
            let Some(value) = resolved.get(&param.name) else {
                continue;
            };
            if !value_matches(param.kind, value) {
                return Err(RegistryError::RenderMismatch {
                    metric: owned.name.clone(),
                    detail: format!("param '{}' is not a {}", param.name, param.kind.as_str()),
                });
            }
            binds.push((format!(":{}", param.name), value.to_sql_value()));
        }

        Ok(RenderedQuery {
            sql: owned.sql.clone(),
            binds,
        })
    }
}

fn value_matches(kind: ParamType, value: &ParamValue) -> bool {
    match kind {
        ParamType::Integer | ParamType::ModuleId | ParamType::AssessmentId | ParamType::StudentId => {
            matches!(value, ParamValue::Integer(_))
        }
        ParamType::Number => matches!(value, ParamValue::Real(_) | ParamValue::Integer(_)),
        ParamType::String | ParamType::Enum => matches!(value, ParamValue::Text(_)),
        ParamType::Date => matches!(value, ParamValue::Date(_)),
    }
}

/// Named placeholders in `sql`, ignoring text inside single-quoted literals.
pub fn placeholders(sql: &str) -> BTreeSet<String> {
    let stripped = STRING_LITERAL.replace_all(sql, "''");
    PLACEHOLDER
        .captures_iter(&stripped)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

fn validate_record(record: MetricRecord) -> Result<MetricDefinition, RegistryError> {
    let name = record.name.trim().to_string();
    let invalid = |detail: String| RegistryError::InvalidMetric {
        metric: name.clone(),
        detail,
    };

    if name.is_empty() {
        return Err(RegistryError::Malformed("metric with empty name".to_string()));
    }

    let mut declared = BTreeSet::new();
    for param in &record.params {
        if !declared.insert(param.name.clone()) {
            return Err(invalid(format!("parameter '{}' is declared twice", param.name)));
        }
        if param.kind == ParamType::Enum && param.values.is_empty() {
            return Err(invalid(format!("enum parameter '{}' has no values", param.name)));
        }
    }

    let stripped = STRING_LITERAL.replace_all(&record.sql, "''");
    let statement = stripped.trim().trim_end_matches(';').trim_end();
    if statement.contains(';') {
        return Err(invalid("sql must be a single statement".to_string()));
    }
    let head = statement
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if head != "SELECT" && head != "WITH" {
        return Err(invalid("sql must be a SELECT or WITH query".to_string()));
    }

    if let Some(token) = OTHER_PLACEHOLDER.find(&stripped) {
        return Err(RegistryError::PlaceholderMismatch {
            metric: name.clone(),
            detail: format!("unsupported placeholder '{}'; use :name", token.as_str()),
        });
    }

    let found = placeholders(&record.sql);
    if found != declared {
        let unbound: Vec<_> = found.difference(&declared).cloned().collect();
        let unused: Vec<_> = declared.difference(&found).cloned().collect();
        return Err(RegistryError::PlaceholderMismatch {
            metric: name.clone(),
            detail: format!(
                "placeholders without params {:?}, params without placeholders {:?}",
                unbound, unused
            ),
        });
    }

    let mut triggers = Vec::with_capacity(record.triggers.len());
    for pattern in &record.triggers {
        let compiled = Regex::new(pattern).map_err(|err| invalid(format!("trigger '{}': {}", pattern, err)))?;
        triggers.push(compiled);
    }

    for example in &record.examples {
        let keys: BTreeSet<String> = example.params.keys().cloned().collect();
        if keys != declared {
            return Err(invalid(format!(
                "example '{}' does not supply exactly the declared params",
                example.question
            )));
        }
    }

    Ok(MetricDefinition {
        name,
        description: record.description,
        params: record.params,
        sql: record.sql,
        triggers,
        exclude: record
            .exclude
            .iter()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty())
            .collect(),
        examples: record.examples,
    })
}

#[cfg(test)]
mod tests {
    use super::{placeholders, MetricRegistry};
    use crate::errors::RegistryError;
    use crate::models::ParamValue;
    use std::collections::BTreeMap;

    const CATALOG: &str = r#"[
        {"name": "enrollment_count", "params": [], "sql": "SELECT COUNT(*) FROM students"},
        {"name": "students_completed_module",
         "params": [{"name": "module_id", "type": "module_id"}],
         "sql": "SELECT COUNT(DISTINCT student_id) FROM student_module_completions WHERE module_id = :module_id",
         "triggers": ["how many.*completed.*module"]}
    ]"#;

    #[test]
    fn loads_catalog_in_declaration_order() {
        let registry = MetricRegistry::from_json_str(CATALOG).expect("registry");
        assert_eq!(registry.names(), vec!["enrollment_count", "students_completed_module"]);
        assert!(registry.lookup("students_completed_module").is_ok());
        assert!(matches!(registry.lookup("nope"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn shipped_catalog_is_self_consistent() {
        let raw = include_str!("../metrics.json");
        let registry = MetricRegistry::from_json_str(raw).expect("shipped registry loads");
        for metric in registry.iter() {
            let declared: std::collections::BTreeSet<String> =
                metric.params.iter().map(|param| param.name.clone()).collect();
            assert_eq!(placeholders(&metric.sql), declared, "metric {}", metric.name);
        }
        assert!(registry.get("enrollment_count").is_some());
        assert!(registry.get("student_average_score").is_some());
    }

    #[test]
    fn rejects_placeholder_without_param() {
        let raw = r#"[{"name": "m", "params": [], "sql": "SELECT COUNT(*) FROM modules WHERE module_id = :module_id"}]"#;
        let err = MetricRegistry::from_json_str(raw).expect_err("mismatch");
        assert!(matches!(err, RegistryError::PlaceholderMismatch { .. }));
    }

    #[test]
    fn rejects_param_without_placeholder() {
        let raw = r#"[{"name": "m", "params": [{"name": "module_id", "type": "module_id"}], "sql": "SELECT 1"}]"#;
        let err = MetricRegistry::from_json_str(raw).expect_err("mismatch");
        assert!(matches!(err, RegistryError::PlaceholderMismatch { .. }));
    }

    #[test]
    fn rejects_duplicate_names_and_bad_json() {
        let raw = r#"[{"name": "m", "sql": "SELECT 1"}, {"name": "m", "sql": "SELECT 2"}]"#;
        assert!(matches!(
            MetricRegistry::from_json_str(raw),
            Err(RegistryError::DuplicateMetric(name)) if name == "m"
        ));
        assert!(matches!(
            MetricRegistry::from_json_str("{not json"),
            Err(RegistryError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_write_statements_and_batches() {
        let raw = r#"[{"name": "m", "sql": "DELETE FROM students"}]"#;
        assert!(matches!(
            MetricRegistry::from_json_str(raw),
            Err(RegistryError::InvalidMetric { .. })
        ));
        let raw = r#"[{"name": "m", "sql": "SELECT 1; DROP TABLE students"}]"#;
        assert!(matches!(
            MetricRegistry::from_json_str(raw),
            Err(RegistryError::InvalidMetric { .. })
        ));
    }

    #[test]
    fn rejects_positional_and_prefixed_placeholders() {
        for sql in [
            "SELECT COUNT(*) FROM students WHERE student_id = ?",
            "SELECT COUNT(*) FROM students WHERE student_id = ?1",
            "SELECT COUNT(*) FROM students WHERE student_id = @student_id",
            "SELECT COUNT(*) FROM students WHERE student_id = $student_id",
        ] {
            let raw = serde_json::json!([{"name": "m", "params": [], "sql": sql}]).to_string();
            let err = MetricRegistry::from_json_str(&raw).expect_err(sql);
            assert!(matches!(err, RegistryError::PlaceholderMismatch { .. }), "{}", sql);
        }

        let literal = r#"[{"name": "m", "sql": "SELECT COUNT(*) FROM students WHERE name <> '$x?@y'"}]"#;
        assert!(MetricRegistry::from_json_str(literal).is_ok());
    }

    #[test]
    fn ignores_colons_inside_literals() {
        let found = placeholders("SELECT COUNT(*) FROM t WHERE at > '10:30' AND id = :id");
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec!["id".to_string()]);
    }

    #[test]
    fn render_binds_values_without_touching_sql() {
        let registry = MetricRegistry::from_json_str(CATALOG).expect("registry");
        let metric = registry.lookup("students_completed_module").expect("metric");
        let mut resolved = BTreeMap::new();
        resolved.insert("module_id".to_string(), ParamValue::Integer(3));

        let rendered = registry.render(metric, &resolved).expect("render");
        assert_eq!(rendered.sql, metric.sql);
        assert_eq!(
            rendered.binds,
            vec![(":module_id".to_string(), rusqlite::types::Value::Integer(3))]
        );
    }

    #[test]
    fn render_rejects_extra_missing_or_mistyped_params() {
        let registry = MetricRegistry::from_json_str(CATALOG).expect("registry");
        let metric = registry.lookup("students_completed_module").expect("metric");

        let empty = BTreeMap::new();
        assert!(registry.render(metric, &empty).is_err());

        let mut mistyped = BTreeMap::new();
        mistyped.insert("module_id".to_string(), ParamValue::Text("2".to_string()));
        assert!(registry.render(metric, &mistyped).is_err());

        let enrollment = registry.lookup("enrollment_count").expect("metric");
        let mut extra = BTreeMap::new();
        extra.insert("module_id".to_string(), ParamValue::Integer(1));
        assert!(registry.render(enrollment, &extra).is_err());
    }

    #[test]
    fn summary_lists_signatures_but_never_sql() {
        let registry = MetricRegistry::from_json_str(CATALOG).expect("registry");
        let summary = registry.summary();
        assert!(summary.contains("students_completed_module(module_id: module_id)"));
        assert!(!summary.contains("SELECT"));
    }

    #[test]
    fn loads_yaml_documents() {
        let raw = "- name: enrollment_count\n  sql: SELECT COUNT(*) FROM students\n";
        let registry = MetricRegistry::from_yaml_str(raw).expect("yaml registry");
        assert_eq!(registry.len(), 1);
    }
}
