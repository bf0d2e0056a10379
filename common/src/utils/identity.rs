use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest.
const DOC_ID_LEN: usize = 32;

/// Stable document id for the given identity parts.
///
/// Parts are joined with a unit separator before hashing so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn doc_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let mut digest = format!("{:x}", hasher.finalize());
    digest.truncate(DOC_ID_LEN);
    digest
}

pub fn file_doc_id(absolute_path: &str) -> String {
    doc_id(&["file", absolute_path])
}

pub fn web_doc_id(url: &str, visited_at: i64) -> String {
    doc_id(&["web", url, &visited_at.to_string()])
}

pub fn app_doc_id(name: &str, started_at: i64) -> String {
    doc_id(&["app", name, &started_at.to_string()])
}

pub fn screenshot_doc_id(path: &str, captured_at: i64) -> String {
    doc_id(&["screen", path, &captured_at.to_string()])
}

/// Index point id for the `index`-th chunk or patch of a document.
pub fn point_id(doc_id: &str, index: usize) -> String {
    format!("{doc_id}_{index}")
}
