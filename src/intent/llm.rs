use crate::adapters::{ChatMessage, ChatRequest, LlmTransport};
use crate::errors::ParseFailure;
use crate::harness::structured_output::{check_intent_reply, resolve_structured_output};
use crate::models::{ParamSpec, ParsedIntent, RawValue};
use crate::registry::{MetricDefinition, MetricRegistry};
use serde_json::{Map, Value};
use std::fmt::Write as _;

const MAX_EXAMPLES: usize = 6;

const INSTRUCTIONS: &str = "\
You map an instructor's question about a course to exactly one metric from a fixed catalog.
Reply with a single JSON object and nothing else:
{\"metric\": \"<metric name>\", \"params\": {\"<param name>\": <value>}}
- Use only metric names from the catalog and include every parameter the chosen metric lists.
- module_id, assessment_id and student_id parameters take a number, or the name exactly as written in the question.
- date parameters use YYYY-MM-DD. enum parameters take one of the listed values.
- If no metric answers the question, reply {\"metric\": \"none\", \"params\": {}}.";

/// Asks the model to classify a question against the registry. The model only
/// ever picks a metric and its arguments; it never sees or writes SQL.
pub struct LlmIntentParser<'a> {
    registry: &'a MetricRegistry,
    transport: &'a dyn LlmTransport,
}

impl<'a> LlmIntentParser<'a> {
    pub fn new(registry: &'a MetricRegistry, transport: &'a dyn LlmTransport) -> Self {
        Self { registry, transport }
    }

    /// Instructions, metric signatures and a few example intents.
    pub fn build_context(&self) -> String {
        let mut context = String::from(INSTRUCTIONS);
        context.push_str("\n\nMetrics:\n");
        context.push_str(&self.registry.summary());

        let examples: Vec<_> = self
            .registry
            .iter()
            .flat_map(|metric| metric.examples.iter().map(move |example| (metric, example)))
            .take(MAX_EXAMPLES)
            .collect();
        if !examples.is_empty() {
            context.push_str("\nExamples:\n");
            for (metric, example) in examples {
                let answer = serde_json::json!({
                    "metric": metric.name,
                    "params": example.params,
                });
                let _ = writeln!(context, "Q: {}\nA: {}", example.question, answer);
            }
        }
        context
    }

    pub fn parse(&self, question: &str) -> Result<ParsedIntent, ParseFailure> {
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(self.build_context()),
                ChatMessage::user(question.trim()),
            ],
            temperature: 0.0,
        };
        let reply = self.transport.complete(&request)?;
        tracing::debug!(transport = self.transport.name(), reply = %reply, "llm intent reply");
        self.decode(&reply)
    }

    /// Gate between model text and the pipeline: schema shape, then registry membership.
    pub fn decode(&self, reply: &str) -> Result<ParsedIntent, ParseFailure> {
        let validation = check_intent_reply(resolve_structured_output(reply));
        if !validation.is_valid() {
            return Err(ParseFailure::MalformedResponse(validation.describe()));
        }
        let value = validation
            .value
            .ok_or_else(|| ParseFailure::MalformedResponse("empty reply".to_string()))?;

        let name = value
            .get("metric")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        let metric = self
            .registry
            .get(name)
            .ok_or_else(|| ParseFailure::UnknownMetric(name.to_string()))?;

        let empty = Map::new();
        let params = value.get("params").and_then(Value::as_object).unwrap_or(&empty);
        let mut intent = ParsedIntent::new(metric.name.clone());
        for spec in &metric.params {
            let raw = candidate(spec, params).ok_or_else(|| missing(metric, spec))?;
            intent.raw_params.insert(spec.name.clone(), raw);
        }
        Ok(intent)
    }
}

/// The declared key, or `<stem>_name` for identifier params. Null counts as absent.
fn candidate(spec: &ParamSpec, params: &Map<String, Value>) -> Option<RawValue> {
    let alias = spec
        .kind
        .reference()
        .and_then(|_| spec.name.strip_suffix("_id"))
        .map(|stem| format!("{}_name", stem));

    params
        .get(&spec.name)
        .or_else(|| alias.as_ref().and_then(|alias| params.get(alias)))
        .and_then(RawValue::from_json)
        .filter(|raw| !raw.is_null())
}

fn missing(metric: &MetricDefinition, spec: &ParamSpec) -> ParseFailure {
    ParseFailure::MissingParam {
        metric: metric.name.clone(),
        param: spec.name.clone(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedTransport;
    use super::LlmIntentParser;
    use crate::errors::{ParseFailure, TransportError};
    use crate::models::RawValue;
    use crate::registry::MetricRegistry;

    fn registry() -> MetricRegistry {
        MetricRegistry::from_json_str(include_str!("../../metrics.json")).expect("registry")
    }

    #[test]
    fn context_lists_signatures_and_examples_but_never_sql() {
        let registry = registry();
        let transport = ScriptedTransport::new(vec![]);
        let context = LlmIntentParser::new(&registry, &transport).build_context();
        assert!(context.contains("students_completed_module(module_id: module_id)"));
        assert!(context.contains("course_ratings_by_band(band: enum[satisfied|neutral|dissatisfied])"));
        assert!(context.contains("Q: How many students are enrolled?"));
        assert!(!context.contains("SELECT"));
        assert!(!context.contains("student_module_completions"));
        assert_eq!(context.matches("\nQ: ").count(), 6);
    }

    #[test]
    fn decodes_fenced_reply_into_intent() {
        let registry = registry();
        let transport = ScriptedTransport::new(vec![Some(
            "```json\n{\"metric\": \"students_completed_module\", \"params\": {\"module_id\": \"Foundations of Education\"}}\n```",
        )]);
        let parser = LlmIntentParser::new(&registry, &transport);
        let intent = parser
            .parse("How many students completed module Foundations of Education?")
            .expect("intent");
        assert_eq!(intent.metric_name, "students_completed_module");
        assert_eq!(
            intent.raw_params.get("module_id"),
            Some(&RawValue::Text("Foundations of Education".to_string()))
        );

        let requests = transport.requests.lock().expect("lock");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].temperature, 0.0);
        assert_eq!(
            requests[0].messages[1].content,
            "How many students completed module Foundations of Education?"
        );
    }

    #[test]
    fn accepts_name_alias_and_drops_extra_keys() {
        let registry = registry();
        let transport = ScriptedTransport::new(vec![]);
        let parser = LlmIntentParser::new(&registry, &transport);
        let intent = parser
            .decode(r#"{"metric": "average_assessment_score", "params": {"assessment_name": "Final Exam", "note": 1}}"#)
            .expect("intent");
        assert_eq!(
            intent.raw_params.get("assessment_id"),
            Some(&RawValue::Text("Final Exam".to_string()))
        );
        assert_eq!(intent.raw_params.len(), 1);
    }

    #[test]
    fn soft_failures_are_typed() {
        let registry = registry();
        let transport = ScriptedTransport::new(vec![]);
        let parser = LlmIntentParser::new(&registry, &transport);

        assert!(matches!(
            parser.decode("I think you want the enrollment count."),
            Err(ParseFailure::MalformedResponse(_))
        ));
        assert!(matches!(
            parser.decode(r#"{"metric": "enrollment_count"}"#),
            Err(ParseFailure::MalformedResponse(_))
        ));
        assert!(matches!(
            parser.decode(r#"{"metric": "nonexistent_metric", "params": {}}"#),
            Err(ParseFailure::UnknownMetric(name)) if name == "nonexistent_metric"
        ));
        assert!(matches!(
            parser.decode(r#"{"metric": "students_completed_module", "params": {}}"#),
            Err(ParseFailure::MissingParam { param, .. }) if param == "module_id"
        ));
        assert!(matches!(
            parser.decode(r#"{"metric": "students_completed_module", "params": {"module_id": null}}"#),
            Err(ParseFailure::MissingParam { .. })
        ));
    }

    #[test]
    fn transport_errors_become_parse_failures() {
        let registry = registry();
        let transport = ScriptedTransport::new(vec![None]);
        let parser = LlmIntentParser::new(&registry, &transport);
        assert!(matches!(
            parser.parse("How many students are enrolled?"),
            Err(ParseFailure::Transport(TransportError::Timeout(_)))
        ));
        assert_eq!(transport.calls(), 1);
    }
}
