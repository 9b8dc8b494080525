use crate::errors::ResolutionError;
use crate::models::{ParamSpec, ParamType, ParamValue, ParsedIntent, RawValue, Reference, ResolvedParams};
use crate::registry::MetricDefinition;
use chrono::NaiveDate;

/// Name to identifier lookups against the reference tables.
pub trait ReferenceLookup {
    /// Every identifier whose display name equals `name`, ignoring case.
    fn find_ids(&self, reference: Reference, name: &str) -> Result<Vec<i64>, ResolutionError>;
}

/// Coerces every declared parameter of `metric`. One failure fails the whole intent.
pub fn resolve(
    metric: &MetricDefinition,
    intent: &ParsedIntent,
    lookup: &dyn ReferenceLookup,
) -> Result<ResolvedParams, ResolutionError> {
    let mut resolved = ResolvedParams::new();
    for spec in &metric.params {
        let raw = match intent.raw_params.get(&spec.name) {
            Some(raw) if !raw.is_null() => raw,
            _ => return Err(ResolutionError::MissingValue(spec.name.clone())),
        };
        let value = coerce(spec, raw, lookup)?;
        tracing::debug!(param = %spec.name, raw = %raw.describe(), "resolved parameter");
        resolved.insert(spec.name.clone(), value);
    }
    Ok(resolved)
}

fn coerce(spec: &ParamSpec, raw: &RawValue, lookup: &dyn ReferenceLookup) -> Result<ParamValue, ResolutionError> {
    let mismatch = || ResolutionError::TypeCoercionError {
        param: spec.name.clone(),
        expected: spec.kind.as_str().to_string(),
        got: raw.describe(),
    };

    match spec.kind {
        ParamType::ModuleId | ParamType::AssessmentId | ParamType::StudentId => {
            if let Some(id) = as_integer(raw) {
                return Ok(ParamValue::Integer(id));
            }
            let RawValue::Text(name) = raw else {
                return Err(mismatch());
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(mismatch());
            }
            let Some(reference) = spec.kind.reference() else {
                return Err(mismatch());
            };
            resolve_name(reference, name, lookup).map(ParamValue::Integer)
        }
        ParamType::Integer => as_integer(raw).map(ParamValue::Integer).ok_or_else(mismatch),
        ParamType::Number => match raw {
            RawValue::Integer(value) => Ok(ParamValue::Real(*value as f64)),
            RawValue::Number(value) => Ok(ParamValue::Real(*value)),
            RawValue::Text(text) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(ParamValue::Real)
                .ok_or_else(mismatch),
            RawValue::Null => Err(mismatch()),
        },
        ParamType::String => match raw {
            RawValue::Text(text) if !text.trim().is_empty() => Ok(ParamValue::Text(text.trim().to_string())),
            RawValue::Integer(value) => Ok(ParamValue::Text(value.to_string())),
            _ => Err(mismatch()),
        },
        ParamType::Enum => {
            let candidate = match raw {
                RawValue::Text(text) => text.trim().to_string(),
                RawValue::Integer(value) => value.to_string(),
                _ => return Err(mismatch()),
            };
            spec.values
                .iter()
                .find(|allowed| allowed.eq_ignore_ascii_case(&candidate))
                .map(|allowed| ParamValue::Text(allowed.clone()))
                .ok_or_else(mismatch)
        }
        ParamType::Date => match raw {
            RawValue::Text(text) => NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d")
                .map(ParamValue::Date)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        },
    }
}

/// Integers, integral floats and digit strings; anything else is not an identifier.
fn as_integer(raw: &RawValue) -> Option<i64> {
    match raw {
        RawValue::Integer(value) => Some(*value),
        RawValue::Number(value) if value.fract() == 0.0 && value.abs() < i64::MAX as f64 => Some(*value as i64),
        RawValue::Text(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Exact match first; "Final Exam Assessment" then falls back to "Final Exam".
fn resolve_name(reference: Reference, name: &str, lookup: &dyn ReferenceLookup) -> Result<i64, ResolutionError> {
    let ids = lookup.find_ids(reference, name)?;
    let unresolved = || ResolutionError::UnresolvedName {
        entity: reference.entity(),
        name: name.to_string(),
    };
    match ids.as_slice() {
        [] => match without_trailing_anchor(reference, name) {
            Some(shorter) => match resolve_name(reference, shorter, lookup) {
                Err(ResolutionError::UnresolvedName { .. }) => Err(unresolved()),
                other => other,
            },
            None => Err(unresolved()),
        },
        [id] => Ok(*id),
        _ => Err(ResolutionError::AmbiguousName {
            entity: reference.entity(),
            name: name.to_string(),
            count: ids.len(),
        }),
    }
}

fn without_trailing_anchor(reference: Reference, name: &str) -> Option<&str> {
    let (head, last) = name.trim_end().rsplit_once(char::is_whitespace)?;
    let last = last.to_lowercase();
    let is_anchor = reference
        .anchors()
        .iter()
        .any(|anchor| last == *anchor || last == format!("{}s", anchor));
    let head = head.trim_end();
    (is_anchor && !head.is_empty()).then_some(head)
}
