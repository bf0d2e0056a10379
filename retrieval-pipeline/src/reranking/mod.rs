use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::hit::Hit,
    utils::embedding::{EmbeddingService, EmbeddingSpace},
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::scoring::{max_sim, sort_by_score_desc, Scored};

/// File extensions treated as images when deciding on cross-modal reranking.
pub const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "webp", "ico"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RerankStrategy {
    /// Order by retrieval score
    Score,
    /// Order image candidates by question/image relevance, backfill with the rest
    CrossModal,
}

impl fmt::Display for RerankStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Score => "score",
            Self::CrossModal => "cross_modal",
        })
    }
}

/// Scores how well each image answers a question. Higher is better.
#[async_trait]
pub trait ImageRelevanceModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score_images(&self, question: &str, images: &[PathBuf]) -> Result<Vec<f32>, AppError>;
}

/// Late-interaction relevance over the embedding service: the question is
/// split into several query vectors and each is matched against the image's
/// patch vectors.
pub struct MaxSimRelevance {
    embedder: Arc<EmbeddingService>,
}

impl MaxSimRelevance {
    pub fn new(embedder: Arc<EmbeddingService>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl ImageRelevanceModel for MaxSimRelevance {
    fn name(&self) -> &'static str {
        "maxsim"
    }

    async fn score_images(&self, question: &str, images: &[PathBuf]) -> Result<Vec<f32>, AppError> {
        let terms = self
            .embedder
            .encode_query_terms(question, EmbeddingSpace::Image)
            .await
            .map_err(AppError::embedding)?;
        if terms.is_empty() {
            return Err(AppError::Validation(
                "question produced no query vectors".to_string(),
            ));
        }

        let mut scores = Vec::with_capacity(images.len());
        for path in images {
            let bytes = tokio::fs::read(path).await?;
            let patches = self
                .embedder
                .encode_image_patches(&bytes)
                .await
                .map_err(AppError::embedding)?;
            scores.push(max_sim(terms.rows(), patches.rows()));
        }
        Ok(scores)
    }
}

/// A reranked hit with its 1-based position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub rank: usize,
    pub hit: Hit,
    /// Cross-modal relevance, when the image was ranked by it.
    pub relevance: Option<f32>,
}

/// Candidates in retrieval order, each flagged as a usable image or not.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedCandidates {
    pub candidates: Vec<Hit>,
    pub image_flags: Vec<bool>,
}

impl ClassifiedCandidates {
    pub fn image_count(&self) -> usize {
        self.image_flags.iter().filter(|flag| **flag).count()
    }

    pub fn image_paths(&self) -> Vec<PathBuf> {
        self.candidates
            .iter()
            .zip(&self.image_flags)
            .filter(|(_, is_image)| **is_image)
            .filter_map(|(hit, _)| hit.path.as_ref().map(PathBuf::from))
            .collect()
    }

    fn split(self) -> (Vec<Hit>, Vec<Hit>) {
        let mut images = Vec::new();
        let mut others = Vec::new();
        for (hit, is_image) in self.candidates.into_iter().zip(self.image_flags) {
            if is_image {
                images.push(hit);
            } else {
                others.push(hit);
            }
        }
        (images, others)
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
}

async fn decodes_as_image(path: PathBuf) -> bool {
    tokio::task::spawn_blocking(move || image::open(&path).is_ok())
        .await
        .unwrap_or(false)
}

/// A candidate counts as an image when its resolved path has an image
/// extension and the file actually decodes.
#[instrument(skip_all, fields(candidates = candidates.len()))]
pub async fn classify_candidates(candidates: Vec<Hit>) -> ClassifiedCandidates {
    let checks = candidates.iter().map(|hit| {
        let path = hit.path.as_ref().map(PathBuf::from);
        async move {
            match path {
                Some(path) if has_image_extension(&path) => decodes_as_image(path).await,
                _ => false,
            }
        }
    });
    let image_flags = join_all(checks).await;
    debug!(
        images = image_flags.iter().filter(|flag| **flag).count(),
        "Classified candidates"
    );
    ClassifiedCandidates {
        candidates,
        image_flags,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankOutcome {
    pub evidence: Vec<Evidence>,
    pub strategy: RerankStrategy,
    /// Why cross-modal reranking was attempted but abandoned.
    pub fallback_reason: Option<String>,
}

fn into_evidence(ranked: impl IntoIterator<Item = (Hit, Option<f32>)>) -> Vec<Evidence> {
    ranked
        .into_iter()
        .enumerate()
        .map(|(i, (hit, relevance))| Evidence {
            rank: i.saturating_add(1),
            hit,
            relevance,
        })
        .collect()
}

/// Stable sort by retrieval score, keep the best `k_final`.
pub fn rerank_by_score(candidates: Vec<Hit>, k_final: usize) -> Vec<Evidence> {
    let mut scored: Vec<Scored<Hit>> = candidates
        .into_iter()
        .map(|hit| {
            let score = hit.score;
            Scored::new(hit, score)
        })
        .collect();
    sort_by_score_desc(&mut scored);
    into_evidence(
        scored
            .into_iter()
            .take(k_final)
            .map(|scored| (scored.item, None)),
    )
}

/// Keep the best-scoring patch hit of each image document, in score order.
fn best_hit_per_document(images: Vec<Hit>) -> Vec<Hit> {
    let mut scored: Vec<Scored<Hit>> = images
        .into_iter()
        .map(|hit| {
            let score = hit.score;
            Scored::new(hit, score)
        })
        .collect();
    sort_by_score_desc(&mut scored);

    let mut seen = HashSet::new();
    scored
        .into_iter()
        .map(|scored| scored.item)
        .filter(|hit| seen.insert(hit.doc_id.clone()))
        .collect()
}

#[derive(Clone)]
pub struct Reranker {
    relevance: Option<Arc<dyn ImageRelevanceModel>>,
    cross_modal_enabled: bool,
}

impl Reranker {
    pub fn new(relevance: Option<Arc<dyn ImageRelevanceModel>>, cross_modal_enabled: bool) -> Self {
        Self {
            relevance,
            cross_modal_enabled,
        }
    }

    pub fn score_only() -> Self {
        Self::new(None, false)
    }

    pub fn select_strategy(&self, classified: &ClassifiedCandidates) -> RerankStrategy {
        if self.cross_modal_enabled && self.relevance.is_some() && classified.image_count() > 0 {
            RerankStrategy::CrossModal
        } else {
            RerankStrategy::Score
        }
    }

    #[instrument(skip_all, fields(candidates = classified.candidates.len(), k_final = k_final))]
    pub async fn rerank(
        &self,
        question: &str,
        classified: ClassifiedCandidates,
        k_final: usize,
    ) -> RerankOutcome {
        let model = match (self.select_strategy(&classified), &self.relevance) {
            (RerankStrategy::CrossModal, Some(model)) => model.clone(),
            _ => {
                return RerankOutcome {
                    evidence: rerank_by_score(classified.candidates, k_final),
                    strategy: RerankStrategy::Score,
                    fallback_reason: None,
                }
            }
        };

        let fallback_candidates = classified.candidates.clone();
        let (images, others) = classified.split();
        let images = best_hit_per_document(images);
        let paths: Vec<PathBuf> = images
            .iter()
            .map(|hit| PathBuf::from(hit.path.as_deref().unwrap_or_default()))
            .collect();
        let scores = match model.score_images(question, &paths).await {
            Ok(scores) if scores.len() != paths.len() => Err(format!(
                "{} returned {} scores for {} images",
                model.name(),
                scores.len(),
                paths.len()
            )),
            Ok(scores) if scores.iter().any(|score| !score.is_finite()) => {
                Err(format!("{} returned a non-finite score", model.name()))
            }
            Ok(scores) => Ok(scores),
            Err(err) => Err(format!("{} failed: {err}", model.name())),
        };

        let scores = match scores {
            Ok(scores) => scores,
            Err(reason) => {
                warn!(%reason, "Cross-modal rerank failed; ordering by retrieval score");
                return RerankOutcome {
                    evidence: rerank_by_score(fallback_candidates, k_final),
                    strategy: RerankStrategy::Score,
                    fallback_reason: Some(reason),
                };
            }
        };

        let mut ranked_images: Vec<Scored<Hit>> = images
            .into_iter()
            .zip(scores)
            .map(|(hit, score)| Scored::new(hit, score))
            .collect();
        sort_by_score_desc(&mut ranked_images);

        let mut ranked: Vec<(Hit, Option<f32>)> = ranked_images
            .into_iter()
            .take(k_final)
            .map(|scored| (scored.item, Some(scored.score)))
            .collect();
        let remaining = k_final.saturating_sub(ranked.len());
        if remaining > 0 {
            ranked.extend(
                rerank_by_score(others, remaining)
                    .into_iter()
                    .map(|evidence| (evidence.hit, None)),
            );
        }

        info!(
            model = model.name(),
            images = paths.len(),
            evidence = ranked.len(),
            "Cross-modal rerank finished"
        );
        RerankOutcome {
            evidence: into_evidence(ranked),
            strategy: RerankStrategy::CrossModal,
            fallback_reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::index_point::{PointPayload, ScoredPoint, SourceKind};
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    fn hit(doc_id: &str, score: f32, path: Option<String>) -> Hit {
        let mut payload = PointPayload::new(doc_id, SourceKind::File);
        payload.path = path;
        Hit::from_point(
            "image_patches",
            ScoredPoint {
                point_id: format!("{doc_id}_0"),
                score,
                payload,
            },
        )
    }

    fn write_png(dir: &TempDir, name: &str, shade: u8) -> String {
        let path = dir.path().join(name);
        ImageBuffer::from_fn(8, 8, |x, _| Rgb([shade, x as u8 * 10, 40]))
            .save(&path)
            .expect("write png");
        path.to_string_lossy().into_owned()
    }

    struct FailingRelevance;

    #[async_trait]
    impl ImageRelevanceModel for FailingRelevance {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn score_images(&self, _: &str, _: &[PathBuf]) -> Result<Vec<f32>, AppError> {
            Err(AppError::InternalError("model crashed".into()))
        }
    }

    /// Scores images by how dark their file name says they are.
    struct NameRelevance;

    #[async_trait]
    impl ImageRelevanceModel for NameRelevance {
        fn name(&self) -> &'static str {
            "by-name"
        }

        async fn score_images(&self, _: &str, images: &[PathBuf]) -> Result<Vec<f32>, AppError> {
            Ok(images
                .iter()
                .map(|path| {
                    path.file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.trim_start_matches("img").parse::<f32>().ok())
                        .unwrap_or(0.0)
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn classification_requires_extension_and_decodable_file() {
        let dir = TempDir::new().expect("tempdir");
        let real = write_png(&dir, "real.png", 10);
        let fake = dir.path().join("fake.jpg");
        std::fs::write(&fake, b"not an image at all").expect("write fake");
        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"plain text").expect("write text");

        let classified = classify_candidates(vec![
            hit("real", 0.9, Some(real)),
            hit("fake", 0.8, Some(fake.to_string_lossy().into_owned())),
            hit("text", 0.7, Some(text.to_string_lossy().into_owned())),
            hit("missing", 0.6, Some("/nonexistent/photo.PNG".into())),
            hit("web", 0.5, None),
        ])
        .await;

        assert_eq!(classified.image_flags, vec![true, false, false, false, false]);
        assert!(has_image_extension(Path::new("/x/Photo.JPEG")));
        assert!(!has_image_extension(Path::new("/x/archive.tar")));
    }

    #[tokio::test]
    async fn failing_relevance_model_falls_back_to_score_order() {
        let dir = TempDir::new().expect("tempdir");
        let candidates: Vec<Hit> = (0..50)
            .map(|i| {
                let path = write_png(&dir, &format!("img{i}.png"), i as u8);
                // Interleave scores so input order is not already sorted.
                let score = ((i * 37) % 50) as f32 / 50.0;
                hit(&format!("doc{i}"), score, Some(path))
            })
            .collect();

        let classified = classify_candidates(candidates).await;
        assert_eq!(classified.image_count(), 50);

        let reranker = Reranker::new(Some(Arc::new(FailingRelevance)), true);
        assert_eq!(reranker.select_strategy(&classified), RerankStrategy::CrossModal);

        let outcome = reranker.rerank("photos of the beach", classified, 10).await;
        assert_eq!(outcome.strategy, RerankStrategy::Score);
        assert!(outcome
            .fallback_reason
            .as_deref()
            .is_some_and(|reason| reason.contains("model crashed")));
        assert_eq!(outcome.evidence.len(), 10);
        assert!(outcome
            .evidence
            .windows(2)
            .all(|w| w[0].hit.score >= w[1].hit.score));
        let ranks: Vec<usize> = outcome.evidence.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cross_modal_ranks_images_then_backfills() {
        let dir = TempDir::new().expect("tempdir");
        let candidates = vec![
            hit("text_high", 0.95, None),
            hit("img1", 0.90, Some(write_png(&dir, "img1.png", 1))),
            hit("img5", 0.20, Some(write_png(&dir, "img5.png", 5))),
            hit("text_low", 0.10, None),
            hit("text_mid", 0.50, None),
        ];
        let classified = classify_candidates(candidates).await;

        let reranker = Reranker::new(Some(Arc::new(NameRelevance)), true);
        let outcome = reranker.rerank("sunset", classified, 4).await;

        assert_eq!(outcome.strategy, RerankStrategy::CrossModal);
        assert!(outcome.fallback_reason.is_none());
        let docs: Vec<&str> = outcome
            .evidence
            .iter()
            .map(|e| e.hit.doc_id.as_str())
            .collect();
        assert_eq!(docs, vec!["img5", "img1", "text_high", "text_mid"]);
        assert_eq!(outcome.evidence[0].relevance, Some(5.0));
        assert_eq!(outcome.evidence[2].relevance, None);
    }

    #[tokio::test]
    async fn patch_hits_of_one_image_take_a_single_slot() {
        let dir = TempDir::new().expect("tempdir");
        let img3 = write_png(&dir, "img3.png", 3);
        let mut second_patch = hit("img3", 0.80, Some(img3.clone()));
        second_patch.point_id = "img3_4".into();
        let candidates = vec![
            hit("img3", 0.40, Some(img3)),
            hit("img2", 0.60, Some(write_png(&dir, "img2.png", 2))),
            second_patch,
            hit("notes", 0.30, None),
        ];
        let classified = classify_candidates(candidates).await;
        assert_eq!(classified.image_count(), 3);

        let reranker = Reranker::new(Some(Arc::new(NameRelevance)), true);
        let outcome = reranker.rerank("receipt", classified, 5).await;

        assert_eq!(outcome.strategy, RerankStrategy::CrossModal);
        let points: Vec<&str> = outcome
            .evidence
            .iter()
            .map(|e| e.hit.point_id.as_str())
            .collect();
        assert_eq!(points, vec!["img3_4", "img2_0", "notes_0"]);
        assert_eq!(outcome.evidence[0].relevance, Some(3.0));
    }

    #[tokio::test]
    async fn disabled_or_imageless_passes_use_score() {
        let classified = classify_candidates(vec![hit("a", 0.1, None), hit("b", 0.7, None)]).await;

        let enabled = Reranker::new(Some(Arc::new(NameRelevance)), true);
        assert_eq!(enabled.select_strategy(&classified), RerankStrategy::Score);

        let outcome = Reranker::score_only().rerank("q", classified, 10).await;
        assert_eq!(outcome.strategy, RerankStrategy::Score);
        let docs: Vec<&str> = outcome.evidence.iter().map(|e| e.hit.doc_id.as_str()).collect();
        assert_eq!(docs, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn maxsim_relevance_scores_real_images() {
        let dir = TempDir::new().expect("tempdir");
        let paths = vec![
            PathBuf::from(write_png(&dir, "a.png", 10)),
            PathBuf::from(write_png(&dir, "b.png", 200)),
        ];
        let embedder = Arc::new(EmbeddingService::new_hashed(16, 8, 2).expect("embedder"));
        let model = MaxSimRelevance::new(embedder);

        let scores = model
            .score_images("a red square on white paper", &paths)
            .await
            .expect("scores");
        assert_eq!(scores.len(), 2);
        assert!(scores.iter().all(|score| score.is_finite() && *score >= 0.0));

        let err = model.score_images("   ", &paths).await;
        assert!(err.is_err());
    }
}
