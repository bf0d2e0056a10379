use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::storage::{
    repository::{ChunkInput, DocumentContent, DocumentContext, TimeRange},
    types::{file_record::FileRecord, index_point::SourceKind},
};
use retrieval_pipeline::{
    pipeline::{answer_question, PipelineDeps, RetrievalConfig, RetrievalTuning},
    Answer, RetrievalFilters, Services,
};
use serde::Serialize;
use serde_json::{json, Value};
use text_splitter::TextSplitter;
use tracing::{info, warn};

/// Chunk size bounds in characters.
const CHUNK_CHARS: std::ops::Range<usize> = 500..2000;

pub struct AskOptions {
    pub sources: Vec<SourceKind>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub k_final: Option<usize>,
}

pub async fn ask(services: &Services, question: &str, options: AskOptions) -> Result<Answer> {
    let filters = RetrievalFilters {
        sources: options.sources,
        time_range: TimeRange {
            since: options.since,
            until: options.until,
        },
        ..RetrievalFilters::default()
    };

    let Some(k_final) = options.k_final else {
        return Ok(services.answer_question(question, filters).await?);
    };

    let mut tuning = RetrievalTuning::from(services.config().await?);
    tuning.k_final = k_final;
    let vision = services.vision().await?;
    let deps = PipelineDeps {
        retriever: services.retriever().await?,
        reranker: services.reranker().await?,
        redactor: services.redactor().await?,
        vision: vision.map(|answerer| &**answerer),
    };
    Ok(answer_question(deps, question, RetrievalConfig::new(tuning, filters)).await)
}

#[derive(Debug, Serialize)]
pub struct IngestSummary {
    pub doc_id: String,
    pub path: String,
    pub chunks: usize,
    pub written: usize,
    pub failed_batches: usize,
}

pub fn split_text(text: &str) -> Vec<ChunkInput> {
    TextSplitter::new(CHUNK_CHARS)
        .chunks(text)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(ChunkInput::new)
        .collect()
}

pub async fn ingest_text(services: &Services, path: &Path) -> Result<IngestSummary> {
    let absolute = tokio::fs::canonicalize(path)
        .await
        .with_context(|| format!("resolving {}", path.display()))?;
    let path_str = absolute.to_string_lossy().into_owned();
    let text = tokio::fs::read_to_string(&absolute)
        .await
        .with_context(|| format!("reading {path_str}"))?;
    let metadata = tokio::fs::metadata(&absolute).await?;
    let modified_at = metadata
        .modified()
        .map(|time| DateTime::<Utc>::from(time).timestamp())
        .unwrap_or_else(|_| Utc::now().timestamp());

    let repository = services.repository().await?;
    let mut record = FileRecord::new(path_str.clone(), metadata.len(), modified_at);
    record.content_type = Some("text/plain".to_string());
    record.preview = Some(text.chars().take(200).collect());
    let record = repository.provenance().upsert_file(record).await?;

    let chunks = split_text(&text);
    let chunk_count = chunks.len();
    let context = DocumentContext {
        timestamp: Some(modified_at),
        path: Some(path_str.clone()),
        url: None,
    };
    let content = DocumentContent::Text {
        source: SourceKind::File,
        chunks,
    };
    let report = repository
        .replace_document(&record.id, &content, &context)
        .await?;

    let failed_batches = report.failed_batches().count();
    if failed_batches > 0 {
        warn!(doc_id = %record.id, failed_batches, "Some chunks were not indexed");
    }
    info!(doc_id = %record.id, chunks = chunk_count, written = report.written(), "Ingested text file");

    Ok(IngestSummary {
        doc_id: record.id,
        path: path_str,
        chunks: chunk_count,
        written: report.written(),
        failed_batches,
    })
}

pub async fn status(services: &Services) -> Result<Value> {
    let config = services.config().await?;
    let embedder = services.embedder().await?;
    let repository = services.repository().await?;

    let mut collections = serde_json::Map::new();
    for (name, count) in repository.collection_counts().await {
        let value = match count {
            Ok(count) => json!(count),
            Err(err) => json!({ "error": err.to_string() }),
        };
        collections.insert(name, value);
    }

    Ok(json!({
        "embedding": {
            "backend": embedder.backend_label(),
            "model": embedder.model_code(),
            "dimension": embedder.dimension(),
            "status": format!("{:?}", embedder.status()),
        },
        "database": config.surrealdb_address,
        "collections": collections,
        "vision_rerank_enabled": config.vision_rerank_enabled,
        "vision_answer_enabled": config.vision_answer_enabled,
    }))
}
