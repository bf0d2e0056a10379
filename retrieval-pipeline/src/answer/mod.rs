pub mod redaction;
pub mod vision;

use std::fmt::Write as _;

use crate::reranking::Evidence;

pub use redaction::{Redactor, REDACTION_TOKEN};
pub use vision::{OpenAiVisionAnswerer, VisionAnswerer};

pub const NO_INFORMATION_FOUND: &str =
    "Sorry, I could not find any information related to your question.";

/// Number of evidence items handed to a language model by default.
pub const DEFAULT_CONTEXT_LIMIT: usize = 5;

/// `[src:file doc:abc page:2 t:1700000000]`, with page and timestamp only
/// when known.
pub fn citation_label(evidence: &Evidence) -> String {
    let hit = &evidence.hit;
    let mut label = format!("[src:{} doc:{}", hit.source, hit.doc_id);
    if let Some(page) = hit.page {
        let _ = write!(label, " page:{page}");
    }
    if let Some(timestamp) = hit.timestamp {
        let _ = write!(label, " t:{timestamp}");
    }
    label.push(']');
    label
}

/// The displayable part of an evidence item, already redacted.
pub fn fragment(evidence: &Evidence, redactor: &Redactor) -> String {
    let hit = &evidence.hit;
    if let Some(snippet) = hit.snippet.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return redactor.redact(snippet);
    }
    if let Some(name) = hit.file_name() {
        return format!("File: {}", redactor.redact(name));
    }
    if let Some(url) = hit.url.as_deref() {
        return format!("Web page: {}", redactor.redact(url));
    }
    "Related information".to_string()
}

fn evidence_line(evidence: &Evidence, redactor: &Redactor) -> String {
    format!(
        "{}. {} {}",
        evidence.rank,
        citation_label(evidence),
        fragment(evidence, redactor)
    )
}

/// Render ranked evidence as a cited, redacted answer.
pub fn compose(question: &str, evidence: &[Evidence], redactor: &Redactor) -> String {
    if evidence.is_empty() {
        return NO_INFORMATION_FOUND.to_string();
    }

    let mut answer = format!(
        "Here is what I found for \"{}\":\n",
        redactor.redact(question.trim())
    );
    for item in evidence {
        answer.push('\n');
        answer.push_str(&evidence_line(item, redactor));
    }
    answer
}

/// Numbered, redacted context block for a language model prompt.
pub fn build_context(evidence: &[Evidence], redactor: &Redactor, limit: usize) -> String {
    evidence
        .iter()
        .take(limit)
        .map(|item| evidence_line(item, redactor))
        .collect::<Vec<_>>()
        .join("\n\n")
}
