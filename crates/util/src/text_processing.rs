//! Redaction and trimming of text that ends up in logs.
//!
//! SQL text and warehouse error bodies are logged at debug level. Workflow
//! authors occasionally inline credentials (connection strings, tokens in
//! external table options), so everything passes through [`redact_sensitive`]
//! first.

use once_cell::sync::Lazy;
use regex::Regex;

const REDACTED: &str = "[REDACTED]";

static REDACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s+)([^\s]+(?:\s+[^\s]+)*)",
        r"(?i)((?:^|\b)Bearer\s+)([A-Za-z0-9\-._~+/]+=*)",
        r"(ya29\.[A-Za-z0-9\-_]+)",
        r"(eyJ[A-Za-z0-9\-._~+/]+=*)",
        r"(?i)((?:api[\s_-]?key|access[\s_-]?token|token|secret|password)\s*[:=]\s*'?)([^\s,;']+)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("redaction pattern should compile"))
    .collect()
});

/// Replace values that look like credentials with `[REDACTED]`.
///
/// Key names are preserved so the redacted text still explains itself.
///
/// ```rust
/// use propensity_util::redact_sensitive;
///
/// assert_eq!(redact_sensitive("Authorization: Bearer abc.def"), "Authorization: [REDACTED]");
/// assert_eq!(redact_sensitive("password='hunter2'"), "password='[REDACTED]'");
/// ```
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in REDACT_PATTERNS.iter() {
        redacted = pattern
            .replace_all(&redacted, |captures: &regex::Captures| match (captures.get(1), captures.get(2)) {
                (Some(prefix), Some(_)) => format!("{}{}", prefix.as_str(), REDACTED),
                _ => REDACTED.to_string(),
            })
            .to_string();
    }
    redacted
}

/// Shorten text to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut truncated: String = input.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_oauth_access_tokens() {
        let line = "request failed with token ya29.a0AfH6SMBx-secret";
        assert_eq!(redact_sensitive(line), "request failed with token [REDACTED]");
    }

    #[test]
    fn leaves_ordinary_sql_untouched() {
        let sql = "SELECT country, SUM(predicted_label) FROM ML.PREDICT(MODEL `bqml_tutorial.sample_model`, TABLE x)";
        assert_eq!(redact_sensitive(sql), sql);
    }

    #[test]
    fn truncation_respects_character_boundaries() {
        assert_eq!(truncate_for_log("héllo world", 5), "héllo…");
        assert_eq!(truncate_for_log("short", 10), "short");
    }
}
