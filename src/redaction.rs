use once_cell::sync::Lazy;
use regex::Regex;

/// Longest slice of a remote error body kept in errors and logs.
pub const MAX_ERROR_BODY_CHARS: usize = 500;

static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r#"(?i)\b(api[_-]?key|token|secret|password)(["']?\s*[:=]\s*["']?)[A-Za-z0-9_\-\.]{6,}"#)
                .expect("valid regex"),
            "${1}${2}[REDACTED]",
        ),
        (
            Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9_\-\.=]{8,}").expect("valid regex"),
            "Bearer [REDACTED]",
        ),
        (Regex::new(r"\bsk-[A-Za-z0-9_\-]{16,}").expect("valid regex"), "[REDACTED]"),
    ]
});

/// Masks credentials a remote endpoint may echo back and caps the length.
pub fn scrub_remote_text(input: &str) -> String {
    let mut text: String = input.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    for (pattern, replacement) in SECRET_PATTERNS.iter() {
        if pattern.is_match(&text) {
            text = pattern.replace_all(&text, *replacement).into_owned();
        }
    }
    text
}
