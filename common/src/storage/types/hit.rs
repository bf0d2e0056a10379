use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::storage::{
    provenance::ProvenanceRecord,
    types::index_point::{ScoredPoint, SourceKind},
};

/// An index match reconciled with provenance. Display fields are best effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    pub doc_id: String,
    pub point_id: String,
    pub collection: String,
    pub score: f32,
    pub source: SourceKind,
    pub path: Option<String>,
    pub url: Option<String>,
    pub page: Option<u32>,
    pub bbox: Option<[u32; 4]>,
    pub timestamp: Option<i64>,
    pub snippet: Option<String>,
    pub provenance_resolved: bool,
}

impl Hit {
    /// Hit carrying only what the index payload knows.
    pub fn from_point(collection: &str, point: ScoredPoint) -> Self {
        let payload = point.payload;
        Self {
            doc_id: payload.doc_id,
            point_id: point.point_id,
            collection: collection.to_owned(),
            score: point.score,
            source: payload.source,
            path: payload.path,
            url: payload.url,
            page: payload.page,
            bbox: payload.bbox,
            timestamp: payload.timestamp,
            snippet: payload.snippet,
            provenance_resolved: false,
        }
    }

    /// Provenance wins for path, URL and timestamp; the payload snippet wins
    /// over the provenance preview.
    pub fn apply_provenance(&mut self, record: &ProvenanceRecord) {
        if let Some(path) = record.path() {
            self.path = Some(path.to_owned());
        }
        if let Some(url) = record.url() {
            self.url = Some(url.to_owned());
        }
        self.timestamp = Some(record.timestamp());
        if self.snippet.is_none() {
            self.snippet = record.preview();
        }
        self.provenance_resolved = true;
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path
            .as_deref()
            .and_then(|path| std::path::Path::new(path).file_name())
            .and_then(|name| name.to_str())
    }
}

/// Score descending, then `doc_id`, then `point_id`, so equal scores order
/// deterministically.
pub fn compare_hits(a: &Hit, b: &Hit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.doc_id.cmp(&b.doc_id))
        .then_with(|| a.point_id.cmp(&b.point_id))
}

pub fn sort_hits(hits: &mut [Hit]) {
    hits.sort_by(compare_hits);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::{file_record::FileRecord, index_point::PointPayload};

    fn point(doc_id: &str, point_id: &str, score: f32) -> ScoredPoint {
        ScoredPoint {
            point_id: point_id.to_string(),
            score,
            payload: PointPayload::new(doc_id, SourceKind::File),
        }
    }

    #[test]
    fn equal_scores_sort_by_doc_then_point() {
        let mut hits = vec![
            Hit::from_point("text_chunks", point("b", "b_0", 0.5)),
            Hit::from_point("text_chunks", point("a", "a_1", 0.5)),
            Hit::from_point("text_chunks", point("a", "a_0", 0.5)),
            Hit::from_point("text_chunks", point("c", "c_0", 0.9)),
        ];
        sort_hits(&mut hits);
        let order: Vec<&str> = hits.iter().map(|hit| hit.point_id.as_str()).collect();
        assert_eq!(order, vec!["c_0", "a_0", "a_1", "b_0"]);
    }

    #[test]
    fn provenance_overrides_payload_location() {
        let mut scored = point("doc", "doc_0", 0.7);
        scored.payload.path = Some("/old/location.txt".to_string());
        scored.payload.timestamp = Some(1);
        scored.payload.snippet = Some("chunk text".to_string());
        let mut hit = Hit::from_point("text_chunks", scored);

        let mut record = FileRecord::new("/new/location.txt", 10, 1_700_000_000);
        record.preview = Some("preview".to_string());
        hit.apply_provenance(&ProvenanceRecord::File(record));

        assert!(hit.provenance_resolved);
        assert_eq!(hit.path.as_deref(), Some("/new/location.txt"));
        assert_eq!(hit.timestamp, Some(1_700_000_000));
        assert_eq!(hit.snippet.as_deref(), Some("chunk text"));
        assert_eq!(hit.file_name(), Some("location.txt"));
    }
}
