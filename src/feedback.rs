use crate::adapters::{ChatMessage, ChatRequest, LlmTransport};
use crate::db::CourseDb;
use crate::errors::AppResult;
use crate::harness::structured_output::resolve_structured_output;
use crate::models::{FeedbackInsights, ModuleFeedback, RatingSummary};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;

const MAX_COMMENTS: usize = 200;
const MAX_CHARS_PER_COMMENT: usize = 500;
const INSIGHTS_TEMPERATURE: f32 = 0.2;

const INSIGHTS_SYSTEM_PROMPT: &str = "You analyze student feedback for a course module and return concise, \
actionable insights as strict JSON with keys: summary (string), themes (array), praise (array), issues (array), \
suggestions (array). Be specific, do not repeat comments verbatim, and give concrete suggestions.";

/// Ratings, comments and (when a transport is given) model-written insights for one module.
pub fn module_feedback(
    db: &CourseDb,
    module_id: i64,
    transport: Option<&dyn LlmTransport>,
) -> AppResult<ModuleFeedback> {
    let quantitative = db.rating_summary(module_id)?;
    let comments = db.module_comments(module_id)?;
    let module_name = db.module_name(module_id)?;

    let insights = transport.and_then(|transport| {
        summarize_comments(transport, &comments, module_name.as_deref(), &quantitative)
    });

    Ok(ModuleFeedback {
        module_id,
        module_name,
        quantitative,
        comments,
        insights,
    })
}

/// Report for every module with at least one completion, keyed by module id.
pub fn course_feedback(
    db: &CourseDb,
    transport: Option<&dyn LlmTransport>,
) -> AppResult<BTreeMap<i64, ModuleFeedback>> {
    let mut reports = BTreeMap::new();
    for module_id in db.active_module_ids()? {
        reports.insert(module_id, module_feedback(db, module_id, transport)?);
    }
    Ok(reports)
}

/// `None` when there is nothing to summarise or the transport fails.
pub fn summarize_comments(
    transport: &dyn LlmTransport,
    comments: &[String],
    module_name: Option<&str>,
    quantitative: &RatingSummary,
) -> Option<FeedbackInsights> {
    if comments.is_empty() {
        return None;
    }

    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(INSIGHTS_SYSTEM_PROMPT),
            ChatMessage::user(insights_prompt(comments, module_name, quantitative)),
        ],
        temperature: INSIGHTS_TEMPERATURE,
    };
    match transport.complete(&request) {
        Ok(reply) => Some(parse_insights(&reply)),
        Err(error) => {
            tracing::warn!(%error, module = module_name.unwrap_or("unknown"), "feedback insights unavailable");
            None
        }
    }
}

fn insights_prompt(comments: &[String], module_name: Option<&str>, quantitative: &RatingSummary) -> String {
    let average = quantitative
        .average
        .map(|average| format!("{:.2}", average))
        .unwrap_or_else(|| "N/A".to_string());

    let mut prompt = String::new();
    let _ = writeln!(prompt, "Module: {}", module_name.unwrap_or("This module"));
    let _ = writeln!(
        prompt,
        "Ratings: count={}, avg={}, distribution={{1:{},2:{},3:{},4:{},5:{}}}",
        quantitative.count,
        average,
        quantitative.r1,
        quantitative.r2,
        quantitative.r3,
        quantitative.r4,
        quantitative.r5
    );
    prompt.push_str("\nHere are student comments (one per line):\n");
    for comment in comments.iter().take(MAX_COMMENTS) {
        let trimmed: String = comment.trim().chars().take(MAX_CHARS_PER_COMMENT).collect();
        let _ = writeln!(prompt, "- {}", trimmed);
    }
    prompt.push_str("\nReturn strict JSON only with keys: summary, themes, praise, issues, suggestions.");
    prompt
}

/// Lenient decoding; a reply that is not a JSON object becomes the summary verbatim.
pub fn parse_insights(reply: &str) -> FeedbackInsights {
    let Some(Value::Object(data)) = resolve_structured_output(reply) else {
        return FeedbackInsights {
            summary: reply.trim().to_string(),
            ..FeedbackInsights::default()
        };
    };

    let summary = match data.get("summary") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    FeedbackInsights {
        summary,
        themes: as_list(data.get("themes")),
        praise: as_list(data.get("praise")),
        issues: as_list(data.get("issues")),
        suggestions: as_list(data.get("suggestions")),
    }
}

fn as_list(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(text)) => text
            .split(['\n', ';'])
            .map(|part| part.trim_matches(|c: char| matches!(c, '-' | '•' | '\t' | ' ')).trim())
            .filter(|part| !part.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(other) => vec![other.to_string()],
    }
}
