use std::{collections::HashMap, sync::Arc};

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        provenance::{ProvenanceRecord, ProvenanceStore},
        types::{
            hit::{sort_hits, Hit},
            index_point::{IndexPoint, PointPayload, SourceKind},
        },
        vector_index::{
            CollectionSpec, DynIndex, FilterCondition, PayloadField, SearchFilter, UpsertReport,
            IMAGE_PATCHES, SCREEN_PATCHES, TEXT_CHUNKS,
        },
    },
    utils::{
        config::AppConfig,
        embedding::{EmbeddingService, EmbeddingSpace, EmbeddingVector, QueryEmbedding},
        identity::point_id,
    },
};

/// Longest snippet kept in a point payload, in characters.
const MAX_SNIPPET_CHARS: usize = 1_000;

/// Inclusive bounds on the event timestamp of a hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub since: Option<i64>,
    pub until: Option<i64>,
}

impl TimeRange {
    pub fn is_open(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// Whether a timestamp falls inside the range. An undated item only
    /// passes an open range.
    pub fn contains(&self, timestamp: Option<i64>) -> bool {
        if self.is_open() {
            return true;
        }
        timestamp.is_some_and(|ts| {
            self.since.is_none_or(|since| ts >= since) && self.until.is_none_or(|until| ts <= until)
        })
    }
}

/// Display hints shared by every point of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentContext {
    pub timestamp: Option<i64>,
    pub path: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInput {
    pub text: String,
    pub page: Option<u32>,
}

impl ChunkInput {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            page: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentContent {
    Text {
        source: SourceKind,
        chunks: Vec<ChunkInput>,
    },
    Image(Vec<u8>),
    Screen(Vec<u8>),
}

/// Hits plus the collections whose search failed, so an empty result can be
/// told apart from a broken one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultimodalSearch {
    pub hits: Vec<Hit>,
    pub failed_collections: Vec<String>,
}

/// Collections searched for a source.
fn collection_pairs(sources: &[SourceKind]) -> Vec<(&'static str, EmbeddingSpace, SourceKind)> {
    let wanted: &[SourceKind] = if sources.is_empty() {
        &SourceKind::ALL
    } else {
        sources
    };
    let mut pairs = Vec::new();
    for source in SourceKind::ALL {
        if !wanted.contains(&source) {
            continue;
        }
        match source {
            SourceKind::File => {
                pairs.push((TEXT_CHUNKS, EmbeddingSpace::Text, SourceKind::File));
                pairs.push((IMAGE_PATCHES, EmbeddingSpace::Image, SourceKind::File));
            }
            SourceKind::Web => pairs.push((TEXT_CHUNKS, EmbeddingSpace::Text, SourceKind::Web)),
            SourceKind::Screen => {
                pairs.push((SCREEN_PATCHES, EmbeddingSpace::Screen, SourceKind::Screen));
            }
        }
    }
    pairs
}

fn truncate_snippet(text: &str) -> String {
    match text.char_indices().nth(MAX_SNIPPET_CHARS) {
        Some((cut, _)) => text.get(..cut).unwrap_or(text).to_owned(),
        None => text.to_owned(),
    }
}

fn has_signal(vector: &[f32]) -> bool {
    vector.iter().any(|value| *value != 0.0)
}

/// Fuses the modality collections and provenance into one searchable store.
#[derive(Clone)]
pub struct Repository {
    index: DynIndex,
    provenance: ProvenanceStore,
    embedder: Arc<EmbeddingService>,
}

impl Repository {
    /// Check the embedding width against the configuration and make sure the
    /// provenance tables and the three collections exist.
    pub async fn new(
        db: Arc<SurrealDbClient>,
        index: DynIndex,
        embedder: Arc<EmbeddingService>,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        if embedder.dimension() != config.embedding_dimension {
            return Err(AppError::DimensionMismatch {
                context: "embedding service".to_string(),
                expected: config.embedding_dimension,
                actual: embedder.dimension(),
            });
        }

        let provenance = ProvenanceStore::new(db);
        provenance.ensure_schema().await?;
        for spec in CollectionSpec::defaults(config.embedding_dimension) {
            index.ensure_collection(&spec).await?;
        }

        info!(
            dimension = config.embedding_dimension,
            backend = embedder.backend_label(),
            "Repository ready"
        );
        Ok(Self {
            index,
            provenance,
            embedder,
        })
    }

    pub fn provenance(&self) -> &ProvenanceStore {
        &self.provenance
    }

    pub fn embedder(&self) -> &Arc<EmbeddingService> {
        &self.embedder
    }

    pub fn index(&self) -> &DynIndex {
        &self.index
    }

    /// Embed and index the text chunks of one document.
    #[instrument(skip_all, fields(doc_id = %doc_id, source = %source, chunks = chunks.len()))]
    pub async fn index_text_chunks(
        &self,
        doc_id: &str,
        source: SourceKind,
        chunks: &[ChunkInput],
        context: &DocumentContext,
    ) -> Result<UpsertReport, AppError> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let matrix = self
            .embedder
            .encode_text(&texts)
            .await
            .map_err(AppError::embedding)?;

        let mut points = Vec::with_capacity(chunks.len());
        for (i, (chunk, vector)) in chunks.iter().zip(matrix.into_vectors()).enumerate() {
            if !has_signal(vector.values()) {
                debug!(chunk = i, "Skipping chunk without embeddable content");
                continue;
            }
            let mut payload = self.payload(doc_id, source, context);
            payload.page = chunk.page;
            payload.chunk_index = u32::try_from(i).ok();
            payload.snippet = Some(truncate_snippet(&chunk.text));
            points.push(IndexPoint {
                point_id: point_id(doc_id, i),
                vector,
                payload,
            });
        }

        self.index.upsert(TEXT_CHUNKS, points).await
    }

    pub async fn index_image_patches(
        &self,
        doc_id: &str,
        image: &[u8],
        context: &DocumentContext,
    ) -> Result<UpsertReport, AppError> {
        self.index_patches(doc_id, image, EmbeddingSpace::Image, context)
            .await
    }

    pub async fn index_screen_patches(
        &self,
        doc_id: &str,
        image: &[u8],
        context: &DocumentContext,
    ) -> Result<UpsertReport, AppError> {
        self.index_patches(doc_id, image, EmbeddingSpace::Screen, context)
            .await
    }

    #[instrument(skip_all, fields(doc_id = %doc_id, space = %space, bytes = image.len()))]
    async fn index_patches(
        &self,
        doc_id: &str,
        image: &[u8],
        space: EmbeddingSpace,
        context: &DocumentContext,
    ) -> Result<UpsertReport, AppError> {
        let (collection, source) = match space {
            EmbeddingSpace::Screen => (SCREEN_PATCHES, SourceKind::Screen),
            EmbeddingSpace::Image | EmbeddingSpace::Text => (IMAGE_PATCHES, SourceKind::File),
        };
        let (matrix, boxes) = self
            .embedder
            .encode_patches(image, space)
            .await
            .map_err(AppError::embedding)?;

        let points = matrix
            .into_vectors()
            .into_iter()
            .zip(boxes)
            .enumerate()
            .map(|(i, (vector, bbox))| {
                let mut payload = self.payload(doc_id, source, context);
                payload.bbox = Some(bbox);
                IndexPoint {
                    point_id: point_id(doc_id, i),
                    vector,
                    payload,
                }
            })
            .collect();

        self.index.upsert(collection, points).await
    }

    fn payload(&self, doc_id: &str, source: SourceKind, context: &DocumentContext) -> PointPayload {
        let mut payload = PointPayload::new(doc_id, source);
        payload.timestamp = context.timestamp;
        payload.path = context.path.clone();
        payload.url = context.url.clone();
        payload
    }

    /// Drop every point of `doc_id` and index the new content in its place.
    pub async fn replace_document(
        &self,
        doc_id: &str,
        content: &DocumentContent,
        context: &DocumentContext,
    ) -> Result<UpsertReport, AppError> {
        self.delete_points(doc_id).await?;
        match content {
            DocumentContent::Text { source, chunks } => {
                self.index_text_chunks(doc_id, *source, chunks, context)
                    .await
            }
            DocumentContent::Image(bytes) => {
                self.index_image_patches(doc_id, bytes, context).await
            }
            DocumentContent::Screen(bytes) => {
                self.index_screen_patches(doc_id, bytes, context).await
            }
        }
    }

    /// Remove a document from every collection and from provenance.
    pub async fn remove_document(&self, doc_id: &str) -> Result<(), AppError> {
        self.delete_points(doc_id).await?;
        self.provenance.delete_document(doc_id).await?;
        info!(%doc_id, "Removed document");
        Ok(())
    }

    async fn delete_points(&self, doc_id: &str) -> Result<(), AppError> {
        for collection in [TEXT_CHUNKS, IMAGE_PATCHES, SCREEN_PATCHES] {
            self.index.delete_by_doc_id(collection, doc_id).await?;
        }
        Ok(())
    }

    pub async fn search_multimodal(
        &self,
        query: &QueryEmbedding,
        sources: &[SourceKind],
        limit: usize,
        time_range: TimeRange,
        extra_filters: &[FilterCondition],
    ) -> Vec<Hit> {
        self.search_multimodal_report(query, sources, limit, time_range, extra_filters)
            .await
            .hits
    }

    /// Search every (collection, source) pair concurrently and fuse the hits.
    ///
    /// A failing sub-search is logged and contributes no hits.
    #[instrument(skip_all, fields(sources = ?sources, limit = limit))]
    pub async fn search_multimodal_report(
        &self,
        query: &QueryEmbedding,
        sources: &[SourceKind],
        limit: usize,
        time_range: TimeRange,
        extra_filters: &[FilterCondition],
    ) -> MultimodalSearch {
        if limit == 0 || query.is_empty() {
            return MultimodalSearch::default();
        }

        let pairs = collection_pairs(sources);
        let searches = pairs.iter().map(|(collection, space, source)| {
            let filter = SearchFilter::new()
                .eq(PayloadField::Source, source.as_str())
                .range_or_missing(PayloadField::Timestamp, time_range.since, time_range.until)
                .extend(extra_filters.iter().cloned());
            let vector: EmbeddingVector = query.for_space(*space);
            async move {
                let result = self
                    .index
                    .search(collection, &vector, limit, &filter)
                    .await;
                (*collection, *source, result)
            }
        });

        let mut raw = Vec::new();
        let mut failed_collections = Vec::new();
        for (collection, source, result) in join_all(searches).await {
            match result {
                Ok(points) => {
                    debug!(%collection, %source, hits = points.len(), "Sub-search finished");
                    raw.extend(points.into_iter().map(|point| Hit::from_point(collection, point)));
                }
                Err(err) => {
                    warn!(%collection, %source, error = %err, "Sub-search failed; skipping");
                    if !failed_collections.iter().any(|c| c == collection) {
                        failed_collections.push(collection.to_owned());
                    }
                }
            }
        }

        let mut hits = self.join_provenance(raw).await;
        hits.retain(|hit| time_range.contains(hit.timestamp));
        sort_hits(&mut hits);
        hits.truncate(limit);

        MultimodalSearch {
            hits,
            failed_collections,
        }
    }

    async fn join_provenance(&self, mut hits: Vec<Hit>) -> Vec<Hit> {
        let mut cache: HashMap<String, Option<ProvenanceRecord>> = HashMap::new();
        for hit in &mut hits {
            if !cache.contains_key(&hit.doc_id) {
                let record = match self
                    .provenance
                    .get_by_doc_id(&hit.doc_id, Some(hit.source))
                    .await
                {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(doc_id = %hit.doc_id, error = %err, "Provenance lookup failed");
                        None
                    }
                };
                cache.insert(hit.doc_id.clone(), record);
            }
            if let Some(Some(record)) = cache.get(&hit.doc_id) {
                hit.apply_provenance(record);
            }
        }
        hits
    }

    /// Point counts per collection, for status output.
    pub async fn collection_counts(&self) -> Vec<(String, Result<usize, AppError>)> {
        let mut counts = Vec::new();
        for collection in [TEXT_CHUNKS, IMAGE_PATCHES, SCREEN_PATCHES] {
            counts.push((collection.to_owned(), self.index.count(collection).await));
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        storage::{
            types::{file_record::FileRecord, index_point::ScoredPoint, web_visit::WebVisit},
            vector_index::{SurrealVectorIndex, VectorIndex},
        },
        utils::embedding::EmbeddingBackend,
    };
    use async_trait::async_trait;
    use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
    use std::io::Cursor;
    use uuid::Uuid;

    const DIM: usize = 16;

    fn test_config() -> AppConfig {
        AppConfig {
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_dimension: DIM,
            ..AppConfig::default()
        }
    }

    async fn setup_with(wrap: impl FnOnce(DynIndex) -> DynIndex) -> Repository {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let index: DynIndex = Arc::new(SurrealVectorIndex::new(db.clone(), 64));
        let embedder = Arc::new(EmbeddingService::new_hashed(DIM, 32, 2).expect("embedder"));
        Repository::new(db, wrap(index), embedder, &test_config())
            .await
            .expect("repository")
    }

    async fn setup() -> Repository {
        setup_with(|index| index).await
    }

    fn png(seed: u8) -> Vec<u8> {
        let buffer = ImageBuffer::from_fn(24, 24, |x, y| {
            Rgb([seed.wrapping_add(x as u8), seed.wrapping_mul(3), y as u8])
        });
        let mut cursor = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(buffer)
            .write_to(&mut cursor, ImageOutputFormat::Png)
            .expect("encode png");
        cursor.into_inner()
    }

    struct FailingIndex {
        inner: DynIndex,
        broken: &'static str,
    }

    #[async_trait]
    impl VectorIndex for FailingIndex {
        async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<(), AppError> {
            self.inner.ensure_collection(spec).await
        }

        async fn upsert(
            &self,
            collection: &str,
            points: Vec<IndexPoint>,
        ) -> Result<UpsertReport, AppError> {
            self.inner.upsert(collection, points).await
        }

        async fn search(
            &self,
            collection: &str,
            query: &EmbeddingVector,
            limit: usize,
            filter: &SearchFilter,
        ) -> Result<Vec<ScoredPoint>, AppError> {
            if collection == self.broken {
                return Err(AppError::InternalError("connection reset".into()));
            }
            self.inner.search(collection, query, limit, filter).await
        }

        async fn delete(&self, collection: &str, point_ids: &[String]) -> Result<(), AppError> {
            self.inner.delete(collection, point_ids).await
        }

        async fn delete_by_doc_id(&self, collection: &str, doc_id: &str) -> Result<(), AppError> {
            self.inner.delete_by_doc_id(collection, doc_id).await
        }

        async fn count(&self, collection: &str) -> Result<usize, AppError> {
            self.inner.count(collection).await
        }
    }

    #[tokio::test]
    async fn exact_chunk_query_returns_that_chunk() {
        let repo = setup().await;
        let chunks = vec![
            ChunkInput::new("grocery list with apples and pears"),
            ChunkInput::new("flight booking confirmation for lisbon"),
            ChunkInput::new("notes from the quarterly planning meeting"),
        ];
        let report = repo
            .index_text_chunks("doc1", SourceKind::File, &chunks, &DocumentContext::default())
            .await
            .expect("index chunks");
        assert_eq!(report.written(), 3);

        let query = repo
            .embedder()
            .encode_query("flight booking confirmation for lisbon")
            .await
            .expect("query");
        let hits = repo
            .search_multimodal(&query, &[SourceKind::File], 1, TimeRange::default(), &[])
            .await;

        assert_eq!(hits.len(), 1);
        let top = &hits[0];
        assert_eq!(top.point_id, "doc1_1");
        assert!((top.score - 1.0).abs() < 1e-4);
        assert_eq!(
            top.snippet.as_deref(),
            Some("flight booking confirmation for lisbon")
        );
        assert!(!top.provenance_resolved);
    }

    #[tokio::test]
    async fn every_source_filter_reaches_its_collections() {
        let repo = setup().await;
        let context = DocumentContext::default();
        repo.index_text_chunks(
            "file_doc",
            SourceKind::File,
            &[ChunkInput::new("shared topic words")],
            &context,
        )
        .await
        .expect("file chunks");
        repo.index_text_chunks(
            "web_doc",
            SourceKind::Web,
            &[ChunkInput::new("shared topic words online")],
            &context,
        )
        .await
        .expect("web chunks");
        repo.index_image_patches("img_doc", &png(10), &context)
            .await
            .expect("image patches");
        repo.index_screen_patches("screen_doc", &png(99), &context)
            .await
            .expect("screen patches");

        let query = repo
            .embedder()
            .encode_query("shared topic words")
            .await
            .expect("query");

        let all = repo
            .search_multimodal(&query, &[], 100, TimeRange::default(), &[])
            .await;
        let mut docs: Vec<&str> = all.iter().map(|hit| hit.doc_id.as_str()).collect();
        docs.sort_unstable();
        docs.dedup();
        assert_eq!(docs, vec!["file_doc", "img_doc", "screen_doc", "web_doc"]);

        for (source, expected) in [
            (SourceKind::File, vec!["file_doc", "img_doc"]),
            (SourceKind::Web, vec!["web_doc"]),
            (SourceKind::Screen, vec!["screen_doc"]),
        ] {
            let hits = repo
                .search_multimodal(&query, &[source], 100, TimeRange::default(), &[])
                .await;
            let mut docs: Vec<&str> = hits.iter().map(|hit| hit.doc_id.as_str()).collect();
            docs.sort_unstable();
            docs.dedup();
            assert_eq!(docs, expected, "source {source}");
            assert!(hits.iter().all(|hit| hit.source == source));
        }
    }

    #[tokio::test]
    async fn one_failing_collection_degrades_gracefully() {
        let repo = setup_with(|inner| {
            Arc::new(FailingIndex {
                inner,
                broken: IMAGE_PATCHES,
            })
        })
        .await;
        repo.index_text_chunks(
            "doc",
            SourceKind::File,
            &[ChunkInput::new("tax return 2023")],
            &DocumentContext::default(),
        )
        .await
        .expect("index");
        repo.index_image_patches("img", &png(3), &DocumentContext::default())
            .await
            .expect("index image");

        let query = repo.embedder().encode_query("tax return").await.expect("query");
        let result = repo
            .search_multimodal_report(&query, &[], 10, TimeRange::default(), &[])
            .await;

        assert_eq!(result.failed_collections, vec![IMAGE_PATCHES.to_string()]);
        assert!(!result.hits.is_empty());
        assert!(result.hits.iter().all(|hit| hit.collection == TEXT_CHUNKS));
    }

    #[tokio::test]
    async fn provenance_wins_over_stale_payload() {
        let repo = setup().await;
        let record = FileRecord::new("/home/ada/moved/budget.xlsx", 100, 1_700_000_000);
        let doc_id = record.id.clone();
        repo.provenance().upsert_file(record).await.expect("provenance");

        let context = DocumentContext {
            timestamp: Some(1),
            path: Some("/home/ada/old/budget.xlsx".into()),
            url: None,
        };
        repo.index_text_chunks(
            &doc_id,
            SourceKind::File,
            &[ChunkInput::new("budget spreadsheet totals")],
            &context,
        )
        .await
        .expect("index");

        let query = repo
            .embedder()
            .encode_query("budget spreadsheet totals")
            .await
            .expect("query");
        let hits = repo
            .search_multimodal(&query, &[SourceKind::File], 5, TimeRange::default(), &[])
            .await;
        let hit = hits.first().expect("one hit");

        assert!(hit.provenance_resolved);
        assert_eq!(hit.path.as_deref(), Some("/home/ada/moved/budget.xlsx"));
        assert_eq!(hit.timestamp, Some(1_700_000_000));
        assert_eq!(hit.snippet.as_deref(), Some("budget spreadsheet totals"));
    }

    #[tokio::test]
    async fn time_range_limits_hits() {
        let repo = setup().await;
        for (doc, ts) in [("early", 100), ("late", 900)] {
            let visit = WebVisit::new(format!("https://example.com/{doc}"), ts);
            let context = DocumentContext {
                timestamp: Some(ts),
                path: None,
                url: Some(visit.url.clone()),
            };
            repo.provenance()
                .insert_web_visit(visit)
                .await
                .expect("visit");
            repo.index_text_chunks(
                doc,
                SourceKind::Web,
                &[ChunkInput::new("release notes for the editor")],
                &context,
            )
            .await
            .expect("index");
        }

        let query = repo
            .embedder()
            .encode_query("release notes")
            .await
            .expect("query");
        let range = TimeRange {
            since: Some(500),
            until: None,
        };
        let hits = repo
            .search_multimodal(&query, &[SourceKind::Web], 10, range, &[])
            .await;
        let docs: Vec<&str> = hits.iter().map(|hit| hit.doc_id.as_str()).collect();
        assert_eq!(docs, vec!["late"]);
        assert_eq!(hits[0].url.as_deref(), Some("https://example.com/late"));
    }

    #[tokio::test]
    async fn time_range_uses_provenance_timestamp() {
        let repo = setup().await;
        let stale = WebVisit::new("https://example.com/stale", 100);
        let undated = WebVisit::new("https://example.com/undated", 900);
        let cases = [
            (&stale, DocumentContext {
                timestamp: Some(900),
                path: None,
                url: Some(stale.url.clone()),
            }),
            (&undated, DocumentContext {
                timestamp: None,
                path: None,
                url: Some(undated.url.clone()),
            }),
        ];
        for (visit, context) in &cases {
            repo.provenance()
                .insert_web_visit((*visit).clone())
                .await
                .expect("visit");
            repo.index_text_chunks(
                &visit.id,
                SourceKind::Web,
                &[ChunkInput::new("conference schedule for the week")],
                context,
            )
            .await
            .expect("index");
        }

        let query = repo
            .embedder()
            .encode_query("conference schedule")
            .await
            .expect("query");
        let range = TimeRange {
            since: Some(500),
            until: None,
        };
        let hits = repo
            .search_multimodal(&query, &[SourceKind::Web], 10, range, &[])
            .await;

        let docs: Vec<&str> = hits.iter().map(|hit| hit.doc_id.as_str()).collect();
        assert_eq!(docs, vec![undated.id.as_str()]);
        assert_eq!(hits[0].timestamp, Some(900));
        assert!(hits.iter().all(|hit| range.contains(hit.timestamp)));
    }

    #[test]
    fn time_range_bounds_are_inclusive() {
        let range = TimeRange {
            since: Some(10),
            until: Some(20),
        };
        assert!(range.contains(Some(10)));
        assert!(range.contains(Some(20)));
        assert!(!range.contains(Some(21)));
        assert!(!range.contains(None));
        assert!(TimeRange::default().contains(None));
    }

    #[tokio::test]
    async fn undecodable_image_is_an_embedding_error() {
        let repo = setup().await;
        let err = repo
            .index_image_patches("broken", b"not an image", &DocumentContext::default())
            .await
            .expect_err("garbage bytes");
        assert!(matches!(err, AppError::Embedding(_)));
        assert_eq!(repo.index().count(IMAGE_PATCHES).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn replace_and_remove_document() {
        let repo = setup().await;
        let context = DocumentContext::default();
        let content = DocumentContent::Text {
            source: SourceKind::File,
            chunks: vec![ChunkInput::new("one"), ChunkInput::new("two"), ChunkInput::new("three")],
        };
        repo.replace_document("doc", &content, &context)
            .await
            .expect("first index");

        let shorter = DocumentContent::Text {
            source: SourceKind::File,
            chunks: vec![ChunkInput::new("only one now")],
        };
        repo.replace_document("doc", &shorter, &context)
            .await
            .expect("replace");
        assert_eq!(repo.index().count(TEXT_CHUNKS).await.expect("count"), 1);

        repo.remove_document("doc").await.expect("remove");
        assert_eq!(repo.index().count(TEXT_CHUNKS).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn mismatched_embedder_width_is_fatal() {
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("db"),
        );
        let index: DynIndex = Arc::new(SurrealVectorIndex::new(db.clone(), 64));
        let embedder = Arc::new(EmbeddingService::new_hashed(8, 32, 2).expect("embedder"));
        let err = match Repository::new(db, index, embedder, &test_config()).await {
            Err(err) => err,
            Ok(_) => panic!("width mismatch must fail"),
        };
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn empty_index_yields_no_hits() {
        let repo = setup().await;
        let query = repo.embedder().encode_query("anything").await.expect("query");
        let result = repo
            .search_multimodal_report(&query, &[], 10, TimeRange::default(), &[])
            .await;
        assert!(result.hits.is_empty());
        assert!(result.failed_collections.is_empty());
    }
}
