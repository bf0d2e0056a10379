use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        repository::Repository,
        vector_index::{DynIndex, SurrealVectorIndex},
    },
    utils::{
        config::{get_config, AppConfig},
        embedding::EmbeddingService,
    },
};
use tokio::sync::OnceCell;
use tracing::info;

use crate::{
    answer::{OpenAiVisionAnswerer, Redactor, VisionAnswerer},
    pipeline::{answer_question, Answer, PipelineDeps, RetrievalConfig, RetrievalTuning},
    reranking::{ImageRelevanceModel, MaxSimRelevance, Reranker},
    retriever::{RetrievalFilters, Retriever},
};

/// Shared state built on first use, in the order
/// config → database → embedder → repository.
#[derive(Default)]
pub struct Services {
    config: OnceCell<AppConfig>,
    db: OnceCell<Arc<SurrealDbClient>>,
    embedder: OnceCell<Arc<EmbeddingService>>,
    repository: OnceCell<Arc<Repository>>,
    retriever: OnceCell<Retriever>,
    reranker: OnceCell<Reranker>,
    redactor: OnceCell<Redactor>,
    vision: OnceCell<Option<Arc<dyn VisionAnswerer>>>,
}

impl Services {
    /// Configuration is read from `config.*` and the environment on first use.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config: OnceCell::from(config),
            ..Self::default()
        }
    }

    pub async fn config(&self) -> Result<&AppConfig, AppError> {
        self.config
            .get_or_try_init(|| async { get_config().map_err(AppError::from) })
            .await
    }

    pub async fn db(&self) -> Result<&Arc<SurrealDbClient>, AppError> {
        let config = self.config().await?;
        self.db
            .get_or_try_init(|| async {
                let db = SurrealDbClient::from_config(config).await?;
                db.ensure_initialized().await?;
                Ok::<_, AppError>(Arc::new(db))
            })
            .await
    }

    pub async fn embedder(&self) -> Result<&Arc<EmbeddingService>, AppError> {
        let config = self.config().await?;
        self.embedder
            .get_or_try_init(|| async {
                let embedder = EmbeddingService::from_config(config).await?;
                info!(
                    backend = embedder.backend_label(),
                    dimension = embedder.dimension(),
                    degraded = embedder.is_degraded(),
                    "Embedding service ready"
                );
                Ok::<_, AppError>(Arc::new(embedder))
            })
            .await
    }

    pub async fn repository(&self) -> Result<&Arc<Repository>, AppError> {
        let config = self.config().await?;
        let db = self.db().await?;
        let embedder = self.embedder().await?;
        self.repository
            .get_or_try_init(|| async {
                let index: DynIndex =
                    Arc::new(SurrealVectorIndex::new(Arc::clone(db), config.index_batch_size));
                let repository =
                    Repository::new(Arc::clone(db), index, Arc::clone(embedder), config).await?;
                Ok::<_, AppError>(Arc::new(repository))
            })
            .await
    }

    pub async fn retriever(&self) -> Result<&Retriever, AppError> {
        let repository = self.repository().await?;
        self.retriever
            .get_or_try_init(|| async { Ok::<_, AppError>(Retriever::new(Arc::clone(repository))) })
            .await
    }

    /// Cross-modal reranking uses late interaction over the embedding service
    /// when enabled.
    pub async fn reranker(&self) -> Result<&Reranker, AppError> {
        let config = self.config().await?;
        let embedder = self.embedder().await?;
        self.reranker
            .get_or_try_init(|| async {
                let relevance: Option<Arc<dyn ImageRelevanceModel>> = config
                    .vision_rerank_enabled
                    .then(|| {
                        Arc::new(MaxSimRelevance::new(Arc::clone(embedder)))
                            as Arc<dyn ImageRelevanceModel>
                    });
                Ok::<_, AppError>(Reranker::new(relevance, config.vision_rerank_enabled))
            })
            .await
    }

    pub async fn redactor(&self) -> Result<&Redactor, AppError> {
        let config = self.config().await?;
        self.redactor
            .get_or_try_init(|| async { Ok::<_, AppError>(Redactor::new(&config.redaction_patterns)) })
            .await
    }

    /// `None` unless vision answers are enabled and an API key is configured.
    pub async fn vision(&self) -> Result<Option<&Arc<dyn VisionAnswerer>>, AppError> {
        let config = self.config().await?;
        let vision = self
            .vision
            .get_or_try_init(|| async {
                let answerer = if config.vision_answer_enabled {
                    OpenAiVisionAnswerer::from_config(config)
                        .map(|answerer| Arc::new(answerer) as Arc<dyn VisionAnswerer>)
                } else {
                    None
                };
                Ok::<_, AppError>(answerer)
            })
            .await?;
        Ok(vision.as_ref())
    }

    /// Answer a question with the configured tuning. Only initialisation can
    /// fail; the pipeline itself always produces an answer.
    pub async fn answer_question(
        &self,
        question: &str,
        filters: RetrievalFilters,
    ) -> Result<Answer, AppError> {
        let tuning = RetrievalTuning::from(self.config().await?);
        let retriever = self.retriever().await?;
        let reranker = self.reranker().await?;
        let redactor = self.redactor().await?;
        let vision = self.vision().await?;

        let deps = PipelineDeps {
            retriever,
            reranker,
            redactor,
            vision: vision.map(|answerer| &**answerer),
        };
        Ok(answer_question(deps, question, RetrievalConfig::new(tuning, filters)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::NO_INFORMATION_FOUND;
    use common::{
        storage::{
            repository::{ChunkInput, DocumentContext},
            types::index_point::SourceKind,
        },
        utils::embedding::EmbeddingBackend,
    };
    use uuid::Uuid;

    fn test_config() -> AppConfig {
        AppConfig {
            surrealdb_address: "mem://".into(),
            surrealdb_database: Uuid::new_v4().to_string(),
            embedding_backend: EmbeddingBackend::Hashed,
            embedding_dimension: 32,
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn components_are_built_once() {
        let services = Services::with_config(test_config());

        let first = Arc::clone(services.repository().await.expect("repository"));
        let second = Arc::clone(services.repository().await.expect("repository"));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            services.embedder().await.expect("embedder"),
            first.embedder()
        ));
        assert_eq!(services.embedder().await.expect("embedder").dimension(), 32);
        assert!(services.vision().await.expect("vision").is_none());
    }

    #[tokio::test]
    async fn answers_end_to_end() {
        let services = Services::with_config(AppConfig {
            redaction_patterns: vec!["(?i)codename \\w+".into()],
            ..test_config()
        });

        let empty = services
            .answer_question("what is the codename?", RetrievalFilters::default())
            .await
            .expect("answer");
        assert_eq!(empty.text, NO_INFORMATION_FOUND);

        services
            .repository()
            .await
            .expect("repository")
            .index_text_chunks(
                "memo",
                SourceKind::File,
                &[ChunkInput::new("The project codename Falcon ships in May")],
                &DocumentContext::default(),
            )
            .await
            .expect("index memo");

        let answer = services
            .answer_question("what is the project codename", RetrievalFilters::default())
            .await
            .expect("answer");
        assert_eq!(answer.evidence.len(), 1);
        assert!(answer.text.contains("The project [REDACTED] ships in May"));
        assert!(!answer.diagnostics.embedding_degraded);
    }
}
