use std::borrow::Cow;

use regex::Regex;
use tracing::warn;

pub const REDACTION_TOKEN: &str = "[REDACTED]";

/// Patterns applied regardless of configuration, in order.
const FLOOR_PATTERNS: [(&str, &str); 5] = [
    ("payment_card", r"\b(?:\d{4}[- ]?){3}\d{4}\b"),
    ("resident_id", r"\b\d{6}-\d{7}\b"),
    ("national_id", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    (
        "phone",
        r"(?:\+\d{1,3}[ .-]?)?\(?\b\d{2,4}\)?[ .-]\d{3,4}[ .-]\d{4}\b",
    ),
];

/// Masks sensitive substrings. Replacement output never matches a pattern
/// again, so redacting twice changes nothing.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

/// Whether `regex` can match any part of an already redacted span.
fn touches_token(regex: &Regex) -> bool {
    ["", "a ", "0"].iter().any(|pad| {
        let probe = format!("{pad}{REDACTION_TOKEN}{pad}");
        let token_start = pad.len();
        let token_end = token_start + REDACTION_TOKEN.len();
        regex
            .find_iter(&probe)
            .any(|m| !m.is_empty() && m.start() < token_end && m.end() > token_start)
    })
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl Redactor {
    /// Floor patterns first, then `extra` in the given order. Invalid extra
    /// patterns are skipped.
    pub fn new(extra: &[String]) -> Self {
        let floor = FLOOR_PATTERNS.iter().filter_map(|(name, pattern)| {
            Regex::new(pattern)
                .map_err(|err| warn!(pattern = name, error = %err, "Invalid built-in redaction pattern"))
                .ok()
        });
        let configured = extra.iter().filter_map(|pattern| {
            let regex = Regex::new(pattern)
                .map_err(|err| {
                    warn!(pattern = %pattern, error = %err, "Skipping invalid redaction pattern");
                })
                .ok()?;
            if touches_token(&regex) {
                warn!(pattern = %pattern, "Skipping redaction pattern that matches the redaction token");
                return None;
            }
            Some(regex)
        });

        Self {
            patterns: floor.chain(configured).collect(),
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut current = Cow::Borrowed(text);
        for pattern in &self.patterns {
            if let Cow::Owned(replaced) = pattern.replace_all(&current, REDACTION_TOKEN) {
                current = Cow::Owned(replaced);
            }
        }
        current.into_owned()
    }
}
