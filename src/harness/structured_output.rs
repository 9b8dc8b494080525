use once_cell::sync::Lazy;
use serde_json::Value;

/// Shape every intent reply must have before registry validation.
pub static INTENT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    serde_json::json!({
        "type": "object",
        "properties": {
            "metric": { "type": "string", "minLength": 1 },
            "params": {
                "type": "object",
                "additionalProperties": { "type": ["string", "number", "null"] }
            }
        },
        "required": ["metric", "params"]
    })
});

/// Outcome of checking a decoded reply against [`INTENT_SCHEMA`].
#[derive(Debug, Clone)]
pub struct ReplyCheck {
    pub value: Option<Value>,
    pub error: Option<String>,
    pub errors: Vec<String>,
}

impl ReplyCheck {
    fn rejected(value: Option<Value>, error: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            value,
            error: Some(error.into()),
            errors,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some() && self.error.is_none()
    }

    pub fn describe(&self) -> String {
        match &self.error {
            Some(error) if self.errors.is_empty() => error.clone(),
            Some(error) => format!("{} {}", error, self.errors.join("; ")),
            None => String::new(),
        }
    }
}

/// Decodes a model reply: Markdown fences stripped, then the whole text, then
/// the first balanced `{...}` block.
pub fn resolve_structured_output(raw: &str) -> Option<Value> {
    let cleaned = strip_code_fences(raw);
    if let Some(value) = parse_json_value(cleaned) {
        return Some(value);
    }
    first_json_object(cleaned).and_then(parse_json_value)
}

fn parse_json_value(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        text = rest.trim_end().trim_end_matches('`').trim();
    }
    if text.get(..5).is_some_and(|prefix| prefix.eq_ignore_ascii_case("json\n")) {
        text = text[5..].trim_start();
    }
    text
}

fn first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn check_intent_reply(value: Option<Value>) -> ReplyCheck {
    let Some(value) = value else {
        return ReplyCheck::rejected(None, "Reply is missing or is not a JSON object.", vec![]);
    };

    let compiled = match jsonschema::JSONSchema::compile(&INTENT_SCHEMA) {
        Ok(compiled) => compiled,
        Err(error) => {
            let message = format!("Intent schema failed to compile: {}", error);
            return ReplyCheck::rejected(Some(value), message, vec![]);
        }
    };

    let errors: Vec<String> = match compiled.validate(&value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|error| match error.instance_path.to_string() {
                path if path.is_empty() => error.to_string(),
                path => format!("{}: {}", path, error),
            })
            .collect(),
    };

    if errors.is_empty() {
        ReplyCheck {
            value: Some(value),
            error: None,
            errors,
        }
    } else {
        ReplyCheck::rejected(Some(value), "Reply does not have the intent shape.", errors)
    }
}
