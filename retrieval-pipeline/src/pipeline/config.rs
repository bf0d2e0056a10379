use common::utils::config::AppConfig;
use serde::{Deserialize, Serialize};

use crate::{answer::DEFAULT_CONTEXT_LIMIT, retriever::RetrievalFilters};

/// Tunable parameters that govern each answering stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrievalTuning {
    /// Candidates fetched before reranking.
    pub k_candidates: usize,
    /// Evidence items kept after reranking.
    pub k_final: usize,
    pub vision_rerank_enabled: bool,
    pub vision_answer_enabled: bool,
    /// Evidence items rendered into a language model context.
    pub context_limit: usize,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            k_candidates: 40,
            k_final: 10,
            vision_rerank_enabled: false,
            vision_answer_enabled: false,
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }
}

impl From<&AppConfig> for RetrievalTuning {
    fn from(config: &AppConfig) -> Self {
        Self {
            k_candidates: config.k_candidates,
            k_final: config.k_final,
            vision_rerank_enabled: config.vision_rerank_enabled,
            vision_answer_enabled: config.vision_answer_enabled,
            ..Self::default()
        }
    }
}

/// Per-question settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalConfig {
    pub tuning: RetrievalTuning,
    pub filters: RetrievalFilters,
}

impl RetrievalConfig {
    pub fn new(tuning: RetrievalTuning, filters: RetrievalFilters) -> Self {
        Self { tuning, filters }
    }

    pub fn with_tuning(tuning: RetrievalTuning) -> Self {
        Self {
            tuning,
            filters: RetrievalFilters::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_follows_app_config() {
        let config = AppConfig {
            k_candidates: 25,
            k_final: 3,
            vision_answer_enabled: true,
            ..AppConfig::default()
        };
        let tuning = RetrievalTuning::from(&config);

        assert_eq!(tuning.k_candidates, 25);
        assert_eq!(tuning.k_final, 3);
        assert!(tuning.vision_answer_enabled);
        assert!(!tuning.vision_rerank_enabled);
        assert_eq!(tuning.context_limit, DEFAULT_CONTEXT_LIMIT);
        assert_eq!(RetrievalTuning::from(&AppConfig::default()), RetrievalTuning::default());
    }
}
