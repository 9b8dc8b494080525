use crate::errors::NoMatch;
use crate::models::{ParamSpec, ParamType, ParsedIntent, RawValue, Reference};
use crate::registry::{MetricDefinition, MetricRegistry};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::ops::Range;

/// A run of capitalised words joined by short connectors ("Foundations of Education").
const NAME_RUN: &str = r"[A-Z][\w'’-]*(?:\s+(?:(?:of|and|the|to|in|for|on|&)\s+)*[A-Z][\w'’-]*)*";

static MODULE_VALUE: Lazy<Regex> = Lazy::new(|| anchored(Reference::Module));
static ASSESSMENT_VALUE: Lazy<Regex> = Lazy::new(|| anchored(Reference::Assessment));
static STUDENT_VALUE: Lazy<Regex> = Lazy::new(|| anchored(Reference::Student));
static MODULE_NAME_BEFORE: Lazy<Regex> = Lazy::new(|| named_before(Reference::Module));
static ASSESSMENT_NAME_BEFORE: Lazy<Regex> = Lazy::new(|| named_before(Reference::Assessment));
static STUDENT_NAME_BEFORE: Lazy<Regex> = Lazy::new(|| named_before(Reference::Student));
static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").expect("valid regex"));
static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid regex"));
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)"|“([^”]+)”"#).expect("valid regex"));

/// "module 3", "assessment \"Final Exam\"", "student Ada Lovelace's".
fn anchored(reference: Reference) -> Regex {
    let words = reference.anchors().join("|");
    Regex::new(&format!(
        r#"\b(?i:{})s?\s+(?:#\s*)?(?P<value>\d+\b|"[^"]+"|'[^']+'|“[^”]+”|{})"#,
        words, NAME_RUN
    ))
    .expect("valid regex")
}

/// "the Final Exam assessment", or "the Midterm Project" where the anchor is part of the title.
fn named_before(reference: Reference) -> Regex {
    let words = reference.anchors().join("|");
    Regex::new(&format!(r"(?P<value>{})\s+(?P<anchor>(?i:{})s?)\b", NAME_RUN, words)).expect("valid regex")
}

fn anchored_patterns(reference: Reference) -> [&'static Regex; 2] {
    match reference {
        Reference::Module => [&*MODULE_VALUE, &*MODULE_NAME_BEFORE],
        Reference::Assessment => [&*ASSESSMENT_VALUE, &*ASSESSMENT_NAME_BEFORE],
        Reference::Student => [&*STUDENT_VALUE, &*STUDENT_NAME_BEFORE],
    }
}

/// Lowercase, punctuation replaced by spaces, whitespace collapsed.
pub fn normalize_question(question: &str) -> String {
    question
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c.is_whitespace() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic keyword parser used as the fallback of last resort.
#[derive(Debug, Clone, Copy)]
pub struct RulesParser<'a> {
    registry: &'a MetricRegistry,
}

impl<'a> RulesParser<'a> {
    pub fn new(registry: &'a MetricRegistry) -> Self {
        Self { registry }
    }

    pub fn parse(&self, question: &str) -> Result<ParsedIntent, NoMatch> {
        let normalized = normalize_question(question);
        if normalized.is_empty() {
            return Err(NoMatch);
        }

        // First metric in declaration order whose triggers fire decides the question.
        let Some(metric) = self
            .registry
            .iter()
            .find(|metric| triggers_fire(metric, &normalized))
        else {
            tracing::debug!(question = %normalized, "no rule trigger matched");
            return Err(NoMatch);
        };

        let mut candidates = Candidates::extract(question, &normalized);
        let mut intent = ParsedIntent::new(metric.name.clone());
        for param in &metric.params {
            match candidates.take(param) {
                Some(value) => {
                    intent.raw_params.insert(param.name.clone(), value);
                }
                None => {
                    tracing::debug!(
                        metric = %metric.name,
                        param = %param.name,
                        "rule matched but question lacks a value for the parameter"
                    );
                    return Err(NoMatch);
                }
            }
        }

        tracing::debug!(metric = %intent.metric_name, params = intent.raw_params.len(), "rule matched");
        Ok(intent)
    }
}

fn triggers_fire(metric: &MetricDefinition, normalized: &str) -> bool {
    if metric.triggers.is_empty() {
        return false;
    }
    if metric.exclude.iter().any(|term| normalized.contains(term.as_str())) {
        return false;
    }
    metric.triggers.iter().any(|trigger| trigger.is_match(normalized))
}

/// Raw values found in a question, consumed in the order parameters are declared.
#[derive(Debug, Default)]
struct Candidates {
    anchored: BTreeMap<Reference, Vec<RawValue>>,
    dates: Vec<RawValue>,
    numbers: Vec<RawValue>,
    quoted: Vec<RawValue>,
    normalized: String,
    used_enum_values: Vec<String>,
}

impl Candidates {
    fn extract(question: &str, normalized: &str) -> Self {
        let mut consumed: Vec<Range<usize>> = Vec::new();
        let mut anchored = BTreeMap::new();

        for reference in [Reference::Module, Reference::Assessment, Reference::Student] {
            let mut found: Vec<(Range<usize>, RawValue)> = Vec::new();
            for pattern in anchored_patterns(reference) {
                for caps in pattern.captures_iter(question) {
                    let Some(value) = caps.name("value") else {
                        continue;
                    };
                    if overlaps(&value.range(), &consumed) {
                        continue;
                    }
                    let Some(mut raw) = anchored_value(value.as_str()) else {
                        continue;
                    };
                    let mut range = value.range();
                    // A capitalised anchor belongs to the name; the resolver retries without it.
                    let title_anchor = caps
                        .name("anchor")
                        .filter(|anchor| anchor.as_str().starts_with(char::is_uppercase));
                    if let Some(anchor) = title_anchor {
                        if let Some(whole) = anchored_value(&question[value.start()..anchor.end()]) {
                            raw = whole;
                            range = value.start()..anchor.end();
                        }
                    }
                    consumed.push(range.clone());
                    found.push((range, raw));
                }
            }
            // Values are assigned to parameters in question order.
            found.sort_by_key(|(range, _)| range.start);
            anchored.insert(reference, found.into_iter().map(|(_, value)| value).collect::<Vec<_>>());
        }

        let mut dates = Vec::new();
        for found in ISO_DATE.find_iter(question) {
            consumed.push(found.range());
            dates.push(RawValue::Text(found.as_str().to_string()));
        }

        let numbers = NUMBER
            .find_iter(question)
            .filter(|found| !overlaps(&found.range(), &consumed))
            .map(|found| number_value(found.as_str()))
            .collect();

        let quoted = QUOTED
            .captures_iter(question)
            .filter(|caps| {
                caps.get(0)
                    .map(|whole| !overlaps(&whole.range(), &consumed))
                    .unwrap_or(false)
            })
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
            .map(|inner| RawValue::Text(inner.as_str().trim().to_string()))
            .collect();

        Self {
            anchored,
            dates,
            numbers,
            quoted,
            normalized: format!(" {} ", normalized),
            used_enum_values: Vec::new(),
        }
    }

    fn take(&mut self, param: &ParamSpec) -> Option<RawValue> {
        if let Some(reference) = param.kind.reference() {
            return take_first(self.anchored.get_mut(&reference)?);
        }
        match param.kind {
            ParamType::Date => take_first(&mut self.dates),
            ParamType::Integer | ParamType::Number => take_first(&mut self.numbers),
            ParamType::String => take_first(&mut self.quoted),
            ParamType::Enum => self.take_enum(&param.values),
            ParamType::ModuleId | ParamType::AssessmentId | ParamType::StudentId => None,
        }
    }

    /// Earliest declared value that appears as whole words in the question.
    fn take_enum(&mut self, values: &[String]) -> Option<RawValue> {
        let found = values
            .iter()
            .filter(|value| !self.used_enum_values.contains(value))
            .filter_map(|value| {
                let needle = format!(" {} ", normalize_question(value));
                self.normalized.find(&needle).map(|pos| (pos, value))
            })
            .min_by_key(|(pos, _)| *pos)
            .map(|(_, value)| value.clone())?;
        self.used_enum_values.push(found.clone());
        Some(RawValue::Text(found))
    }
}

fn overlaps(range: &Range<usize>, taken: &[Range<usize>]) -> bool {
    taken
        .iter()
        .any(|other| range.start < other.end && other.start < range.end)
}

fn take_first(values: &mut Vec<RawValue>) -> Option<RawValue> {
    if values.is_empty() {
        None
    } else {
        Some(values.remove(0))
    }
}

/// Capitalised words that start a sentence rather than a name.
const LEADING_NOISE: &[&str] = &["What", "Which", "Who", "How", "When", "Where", "Why", "The", "Is", "Did", "For"];

fn anchored_value(raw: &str) -> Option<RawValue> {
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return Some(number_value(raw));
    }
    let unquoted = raw.trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”'));
    let mut name = unquoted
        .strip_suffix("'s")
        .or_else(|| unquoted.strip_suffix("’s"))
        .unwrap_or(unquoted)
        .trim();
    if unquoted.len() == raw.len() {
        while let Some((first, rest)) = name.split_once(char::is_whitespace) {
            if !LEADING_NOISE.contains(&first) {
                break;
            }
            name = rest.trim_start();
        }
        if LEADING_NOISE.contains(&name) {
            return None;
        }
    }
    (!name.is_empty()).then(|| RawValue::Text(name.to_string()))
}

fn number_value(raw: &str) -> RawValue {
    if let Ok(value) = raw.parse::<i64>() {
        return RawValue::Integer(value);
    }
    match raw.parse::<f64>() {
        Ok(value) => RawValue::Number(value),
        Err(_) => RawValue::Text(raw.to_string()),
    }
}
