use std::cmp::Ordering;

/// An item paired with the score it was ranked by.
#[derive(Debug, Clone)]
pub struct Scored<T> {
    pub item: T,
    pub score: f32,
}

impl<T> Scored<T> {
    pub const fn new(item: T, score: f32) -> Self {
        Self { item, score }
    }
}

/// Cosine similarity; zero when either side has no magnitude or the widths differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot = x.mul_add(*y, dot);
        norm_a = x.mul_add(*x, norm_a);
        norm_b = y.mul_add(*y, norm_b);
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f32::EPSILON || !denom.is_finite() {
        0.0
    } else {
        dot / denom
    }
}

/// Late-interaction relevance: for every query vector take its best match
/// among the document vectors, then sum.
pub fn max_sim(query: &[Vec<f32>], document: &[Vec<f32>]) -> f32 {
    if document.is_empty() {
        return 0.0;
    }
    query
        .iter()
        .map(|q| {
            document
                .iter()
                .map(|d| cosine(q, d))
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .filter(|best| best.is_finite())
        .sum()
}

/// Stable sort, highest score first. Equal scores keep their input order.
pub fn sort_by_score_desc<T>(items: &mut [Scored<T>]) {
    items.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}
