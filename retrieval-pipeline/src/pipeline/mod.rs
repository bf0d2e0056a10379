mod config;
mod stages;

pub use config::{RetrievalConfig, RetrievalTuning};

use crate::{
    answer::{Redactor, VisionAnswerer},
    reranking::{Evidence, RerankStrategy, Reranker},
    retriever::Retriever,
};
use async_trait::async_trait;
use common::error::AppError;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

use stages::{
    ClassifyStage, ComposeStage, PipelineContext, RerankStage, RetrieveStage, VisionAnswerStage,
};

// Stage type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Retrieve,
    Classify,
    Rerank,
    VisionAnswer,
    Compose,
}

// Pipeline stage trait
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError>;
}

pub type BoxedStage = Box<dyn PipelineStage>;

#[derive(Debug, Default, Clone)]
pub struct PipelineStageTimings {
    timings: Vec<(StageKind, Duration)>,
}

impl PipelineStageTimings {
    pub fn record(&mut self, kind: StageKind, duration: Duration) {
        self.timings.push((kind, duration));
    }

    pub fn into_vec(self) -> Vec<(StageKind, Duration)> {
        self.timings
    }
}

/// How an answer was produced.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerDiagnostics {
    pub candidates: usize,
    pub image_candidates: usize,
    pub rerank_strategy: RerankStrategy,
    pub fallback_reason: Option<String>,
    pub embedding_degraded: bool,
    pub failed_collections: Vec<String>,
    pub vision_used: bool,
    pub stage_errors: Vec<String>,
    pub stage_timings_ms: Vec<(StageKind, u128)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub question: String,
    pub text: String,
    pub evidence: Vec<Evidence>,
    pub diagnostics: AnswerDiagnostics,
}

/// Collaborators borrowed for one run.
#[derive(Clone, Copy)]
pub struct PipelineDeps<'a> {
    pub retriever: &'a Retriever,
    pub reranker: &'a Reranker,
    pub redactor: &'a Redactor,
    pub vision: Option<&'a dyn VisionAnswerer>,
}

fn answer_stages() -> Vec<BoxedStage> {
    vec![
        Box::new(RetrieveStage),
        Box::new(ClassifyStage),
        Box::new(RerankStage),
        Box::new(VisionAnswerStage),
        Box::new(ComposeStage),
    ]
}

/// Run retrieve → classify → rerank → optional vision answer → compose.
/// Never fails: stage errors are logged and reported in the diagnostics.
#[instrument(skip_all, fields(k_candidates = config.tuning.k_candidates, k_final = config.tuning.k_final))]
pub async fn answer_question(deps: PipelineDeps<'_>, question: &str, config: RetrievalConfig) -> Answer {
    let question_chars = question.chars().count();
    let preview: String = question.chars().take(120).collect();
    let preview_clean = deps.redactor.redact(&preview.replace('\n', " "));
    info!(
        question_chars,
        preview_truncated = question_chars > 120,
        preview = %preview_clean,
        "Starting answer pipeline"
    );

    let mut ctx = PipelineContext::new(
        deps.retriever,
        deps.reranker,
        deps.redactor,
        deps.vision,
        question.to_owned(),
        config,
    );

    let mut stage_errors = Vec::new();
    let mut candidates = 0;
    for stage in answer_stages() {
        let start = Instant::now();
        if let Err(err) = stage.execute(&mut ctx).await {
            warn!(stage = ?stage.kind(), error = %err, "Pipeline stage failed");
            stage_errors.push(format!("{:?}: {err}", stage.kind()));
        }
        ctx.record_stage_duration(stage.kind(), start.elapsed());
        if stage.kind() == StageKind::Retrieve {
            candidates = ctx.candidates.len();
        }
    }

    let stage_timings = ctx.take_stage_timings();
    let diagnostics = AnswerDiagnostics {
        candidates,
        image_candidates: ctx.image_paths.len(),
        rerank_strategy: ctx.strategy,
        fallback_reason: ctx.fallback_reason.take(),
        embedding_degraded: deps.retriever.embedding_degraded(),
        failed_collections: std::mem::take(&mut ctx.failed_collections),
        vision_used: ctx.vision_text.is_some(),
        stage_errors,
        stage_timings_ms: stage_timings
            .into_vec()
            .into_iter()
            .map(|(kind, duration)| (kind, duration.as_millis()))
            .collect(),
    };

    info!(
        evidence = ctx.evidence.len(),
        strategy = %diagnostics.rerank_strategy,
        vision_used = diagnostics.vision_used,
        "Answer pipeline finished"
    );

    Answer {
        question: ctx.question,
        text: ctx.text,
        evidence: ctx.evidence,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        answer::NO_INFORMATION_FOUND,
        reranking::ImageRelevanceModel,
    };
    use common::{
        storage::{
            db::SurrealDbClient,
            repository::{ChunkInput, DocumentContext, Repository},
            types::index_point::SourceKind,
            vector_index::{DynIndex, SurrealVectorIndex},
        },
        utils::{
            config::AppConfig,
            embedding::{EmbeddingBackend, EmbeddingService},
        },
    };
    use image::{ImageBuffer, Rgb};
    use std::{path::PathBuf, sync::Arc};
    use tempfile::TempDir;
    use uuid::Uuid;

    const DIM: usize = 16;

    async fn retriever() -> Retriever {
        let config = AppConfig {
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_dimension: DIM,
            ..AppConfig::default()
        };
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        let index: DynIndex = Arc::new(SurrealVectorIndex::new(db.clone(), 64));
        let embedder = Arc::new(EmbeddingService::new_hashed(DIM, 32, 2).expect("embedder"));
        Retriever::new(Arc::new(
            Repository::new(db, index, embedder, &config)
                .await
                .expect("repository"),
        ))
    }

    async fn index_images(retriever: &Retriever, dir: &TempDir, count: usize) {
        for i in 0..count {
            let path = dir.path().join(format!("photo{i}.png"));
            ImageBuffer::from_fn(8, 8, |x, y| Rgb([(i * 5) as u8, (x * 30) as u8, (y * 30) as u8]))
                .save(&path)
                .expect("write png");
            let bytes = std::fs::read(&path).expect("read png");
            let context = DocumentContext {
                path: Some(path.to_string_lossy().into_owned()),
                ..DocumentContext::default()
            };
            retriever
                .repository()
                .index_image_patches(&format!("photo{i}"), &bytes, &context)
                .await
                .expect("index image");
        }
    }

    struct FailingRelevance;

    #[async_trait]
    impl ImageRelevanceModel for FailingRelevance {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn score_images(&self, _: &str, _: &[PathBuf]) -> Result<Vec<f32>, AppError> {
            Err(AppError::InternalError("relevance model unavailable".into()))
        }
    }

    struct CannedVision(&'static str);

    #[async_trait]
    impl VisionAnswerer for CannedVision {
        async fn answer(&self, _: &str, context: &str, images: &[PathBuf]) -> Option<String> {
            assert!(!images.is_empty());
            assert!(!context.is_empty());
            Some(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn empty_index_answers_with_not_found_text() {
        let retriever = retriever().await;
        let reranker = Reranker::score_only();
        let redactor = Redactor::default();
        let deps = PipelineDeps {
            retriever: &retriever,
            reranker: &reranker,
            redactor: &redactor,
            vision: None,
        };

        let answer = answer_question(deps, "where did I save the lease?", RetrievalConfig::default()).await;

        assert_eq!(answer.text, NO_INFORMATION_FOUND);
        assert!(answer.evidence.is_empty());
        assert_eq!(answer.diagnostics.rerank_strategy, RerankStrategy::Score);
        assert!(answer.diagnostics.stage_errors.is_empty());
        assert_eq!(answer.diagnostics.stage_timings_ms.len(), 5);

        let json = serde_json::to_value(&answer).expect("answer serializes");
        assert_eq!(json["diagnostics"]["rerank_strategy"], "score");
        assert_eq!(json["evidence"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn composed_answer_redacts_email() {
        let retriever = retriever().await;
        retriever
            .repository()
            .index_text_chunks(
                "contact",
                SourceKind::File,
                &[ChunkInput::new("Contact me at a@b.com")],
                &DocumentContext::default(),
            )
            .await
            .expect("index chunk");
        let reranker = Reranker::score_only();
        let redactor = Redactor::default();
        let deps = PipelineDeps {
            retriever: &retriever,
            reranker: &reranker,
            redactor: &redactor,
            vision: None,
        };

        let answer = answer_question(deps, "how can I contact me", RetrievalConfig::default()).await;

        assert_eq!(answer.evidence.len(), 1);
        assert!(answer.text.contains("[REDACTED]"));
        assert!(!answer.text.contains("a@b.com"));
        assert_eq!(answer.diagnostics.candidates, 1);
    }

    #[tokio::test]
    async fn failing_relevance_model_falls_back_for_fifty_images() {
        let dir = TempDir::new().expect("tempdir");
        let retriever = retriever().await;
        index_images(&retriever, &dir, 50).await;

        let reranker = Reranker::new(Some(Arc::new(FailingRelevance)), true);
        let redactor = Redactor::default();
        let deps = PipelineDeps {
            retriever: &retriever,
            reranker: &reranker,
            redactor: &redactor,
            vision: None,
        };
        let tuning = RetrievalTuning {
            k_candidates: 50,
            vision_rerank_enabled: true,
            ..RetrievalTuning::default()
        };

        let answer = answer_question(deps, "holiday photos", RetrievalConfig::with_tuning(tuning)).await;

        assert_eq!(answer.diagnostics.candidates, 50);
        assert!(answer.diagnostics.image_candidates > 0);
        assert_eq!(answer.diagnostics.rerank_strategy, RerankStrategy::Score);
        assert!(answer.diagnostics.fallback_reason.is_some());
        assert_eq!(answer.evidence.len(), 10);
        assert!(answer
            .evidence
            .windows(2)
            .all(|w| w[0].hit.score >= w[1].hit.score));
        assert_ne!(answer.text, NO_INFORMATION_FOUND);
    }

    #[tokio::test]
    async fn vision_answer_replaces_text_and_is_redacted() {
        let dir = TempDir::new().expect("tempdir");
        let retriever = retriever().await;
        index_images(&retriever, &dir, 2).await;

        let reranker = Reranker::score_only();
        let redactor = Redactor::default();
        let vision = CannedVision("The receipt was sent to a@b.com");
        let tuning = RetrievalTuning {
            vision_answer_enabled: true,
            ..RetrievalTuning::default()
        };

        let deps = PipelineDeps {
            retriever: &retriever,
            reranker: &reranker,
            redactor: &redactor,
            vision: Some(&vision),
        };
        let answer = answer_question(deps, "where did the receipt go", RetrievalConfig::with_tuning(tuning.clone())).await;

        assert!(answer.diagnostics.vision_used);
        assert_eq!(answer.text, "The receipt was sent to [REDACTED]");
        assert!(!answer.evidence.is_empty());

        let disabled = RetrievalTuning {
            vision_answer_enabled: false,
            ..tuning
        };
        let answer = answer_question(deps, "where did the receipt go", RetrievalConfig::with_tuning(disabled)).await;
        assert!(!answer.diagnostics.vision_used);
        assert!(answer.text.contains("File: photo"));
    }
}
