use std::{collections::HashSet, path::PathBuf};

use async_trait::async_trait;
use common::{error::AppError, storage::types::hit::Hit};
use tracing::{debug, instrument};

use crate::{
    answer::{build_context, compose, Redactor, VisionAnswerer},
    reranking::{classify_candidates, ClassifiedCandidates, Evidence, RerankStrategy, Reranker},
    retriever::Retriever,
};

use super::{config::RetrievalConfig, PipelineStage, PipelineStageTimings, StageKind};

pub struct PipelineContext<'a> {
    pub retriever: &'a Retriever,
    pub reranker: &'a Reranker,
    pub redactor: &'a Redactor,
    pub vision: Option<&'a dyn VisionAnswerer>,
    pub question: String,
    pub config: RetrievalConfig,
    pub candidates: Vec<Hit>,
    pub failed_collections: Vec<String>,
    pub classified: Option<ClassifiedCandidates>,
    pub image_paths: Vec<PathBuf>,
    pub evidence: Vec<Evidence>,
    pub strategy: RerankStrategy,
    pub fallback_reason: Option<String>,
    pub vision_text: Option<String>,
    pub text: String,
    stage_timings: PipelineStageTimings,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        retriever: &'a Retriever,
        reranker: &'a Reranker,
        redactor: &'a Redactor,
        vision: Option<&'a dyn VisionAnswerer>,
        question: String,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            retriever,
            reranker,
            redactor,
            vision,
            question,
            config,
            candidates: Vec::new(),
            failed_collections: Vec::new(),
            classified: None,
            image_paths: Vec::new(),
            evidence: Vec::new(),
            strategy: RerankStrategy::Score,
            fallback_reason: None,
            vision_text: None,
            text: String::new(),
            stage_timings: PipelineStageTimings::default(),
        }
    }

    pub fn record_stage_duration(&mut self, kind: StageKind, duration: std::time::Duration) {
        self.stage_timings.record(kind, duration);
    }

    pub fn take_stage_timings(&mut self) -> PipelineStageTimings {
        std::mem::take(&mut self.stage_timings)
    }

    /// Image paths in evidence order, falling back to classification order
    /// when none of the images made the final cut.
    fn vision_images(&self) -> Vec<PathBuf> {
        let known: HashSet<&PathBuf> = self.image_paths.iter().collect();
        let mut seen = HashSet::new();
        let ranked: Vec<PathBuf> = self
            .evidence
            .iter()
            .filter_map(|item| item.hit.path.as_ref().map(PathBuf::from))
            .filter(|path| known.contains(path))
            .filter(|path| seen.insert(path.clone()))
            .collect();
        if ranked.is_empty() {
            self.image_paths.clone()
        } else {
            ranked
        }
    }
}

pub struct RetrieveStage;

#[async_trait]
impl PipelineStage for RetrieveStage {
    fn kind(&self) -> StageKind {
        StageKind::Retrieve
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        retrieve(ctx).await
    }
}

pub struct ClassifyStage;

#[async_trait]
impl PipelineStage for ClassifyStage {
    fn kind(&self) -> StageKind {
        StageKind::Classify
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        classify(ctx).await
    }
}

pub struct RerankStage;

#[async_trait]
impl PipelineStage for RerankStage {
    fn kind(&self) -> StageKind {
        StageKind::Rerank
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        rerank(ctx).await
    }
}

pub struct VisionAnswerStage;

#[async_trait]
impl PipelineStage for VisionAnswerStage {
    fn kind(&self) -> StageKind {
        StageKind::VisionAnswer
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        vision_answer(ctx).await
    }
}

pub struct ComposeStage;

#[async_trait]
impl PipelineStage for ComposeStage {
    fn kind(&self) -> StageKind {
        StageKind::Compose
    }

    async fn execute(&self, ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
        compose_answer(ctx);
        Ok(())
    }
}

#[instrument(level = "trace", skip_all)]
async fn retrieve(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let tuning = &ctx.config.tuning;
    let outcome = ctx
        .retriever
        .retrieve_report(
            &ctx.question,
            tuning.k_candidates,
            tuning.k_final,
            &ctx.config.filters,
        )
        .await;
    debug!(
        candidates = outcome.hits.len(),
        failed = outcome.failed_collections.len(),
        "Retrieved candidates"
    );
    ctx.candidates = outcome.hits;
    ctx.failed_collections = outcome.failed_collections;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
async fn classify(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let classified = classify_candidates(std::mem::take(&mut ctx.candidates)).await;
    let mut seen = HashSet::new();
    ctx.image_paths = classified
        .image_paths()
        .into_iter()
        .filter(|path| seen.insert(path.clone()))
        .collect();
    ctx.classified = Some(classified);
    Ok(())
}

#[instrument(level = "trace", skip_all)]
async fn rerank(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let Some(classified) = ctx.classified.take() else {
        return Err(AppError::InternalError(
            "candidates must be classified before reranking".to_string(),
        ));
    };
    let outcome = ctx
        .reranker
        .rerank(&ctx.question, classified, ctx.config.tuning.k_final)
        .await;
    ctx.evidence = outcome.evidence;
    ctx.strategy = outcome.strategy;
    ctx.fallback_reason = outcome.fallback_reason;
    Ok(())
}

#[instrument(level = "trace", skip_all)]
async fn vision_answer(ctx: &mut PipelineContext<'_>) -> Result<(), AppError> {
    let Some(answerer) = ctx.vision else {
        return Ok(());
    };
    if !ctx.config.tuning.vision_answer_enabled || ctx.image_paths.is_empty() {
        debug!("Vision answer skipped");
        return Ok(());
    }

    let context = build_context(&ctx.evidence, ctx.redactor, ctx.config.tuning.context_limit);
    let images = ctx.vision_images();
    ctx.vision_text = answerer.answer(&ctx.question, &context, &images).await;
    Ok(())
}

fn compose_answer(ctx: &mut PipelineContext<'_>) {
    ctx.text = match ctx.vision_text.as_deref() {
        Some(text) => ctx.redactor.redact(text),
        None => compose(&ctx.question, &ctx.evidence, ctx.redactor),
    };
}
