use std::{collections::HashSet, sync::Arc};

use common::storage::{
    repository::{Repository, TimeRange},
    types::{
        hit::{sort_hits, Hit},
        index_point::SourceKind,
    },
    vector_index::FilterCondition,
};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

/// Restrictions applied to every sub-search of a retrieval.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetrievalFilters {
    /// Empty means every source.
    pub sources: Vec<SourceKind>,
    pub time_range: TimeRange,
    pub extra: Vec<FilterCondition>,
}

impl RetrievalFilters {
    pub fn sources(sources: impl IntoIterator<Item = SourceKind>) -> Self {
        Self {
            sources: sources.into_iter().collect(),
            ..Self::default()
        }
    }

    fn requested_sources(&self) -> Vec<SourceKind> {
        if self.sources.is_empty() {
            return SourceKind::ALL.to_vec();
        }
        let mut unique = self.sources.clone();
        unique.sort_unstable();
        unique.dedup();
        unique
    }
}

/// Candidates plus the collections that could not be searched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalOutcome {
    pub hits: Vec<Hit>,
    pub failed_collections: Vec<String>,
}

/// Turns a question into a fused, deduplicated candidate list.
#[derive(Clone)]
pub struct Retriever {
    repository: Arc<Repository>,
}

impl Retriever {
    pub fn new(repository: Arc<Repository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn embedding_degraded(&self) -> bool {
        self.repository.embedder().is_degraded()
    }

    pub async fn retrieve(
        &self,
        question: &str,
        k_candidates: usize,
        k_final: usize,
        filters: &RetrievalFilters,
    ) -> Vec<Hit> {
        self.retrieve_report(question, k_candidates, k_final, filters)
            .await
            .hits
    }

    /// Encode the question once and search each requested source concurrently.
    #[instrument(skip_all, fields(k_candidates = k_candidates, k_final = k_final, sources = ?filters.sources))]
    pub async fn retrieve_report(
        &self,
        question: &str,
        k_candidates: usize,
        k_final: usize,
        filters: &RetrievalFilters,
    ) -> RetrievalOutcome {
        let question = question.trim();
        let limit = k_candidates.max(k_final);
        if question.is_empty() || limit == 0 {
            return RetrievalOutcome::default();
        }

        let query = match self.repository.embedder().encode_query(question).await {
            Ok(query) if !query.is_empty() => query,
            Ok(_) => {
                debug!("Query embedding is empty; nothing to search");
                return RetrievalOutcome::default();
            }
            Err(err) => {
                warn!(error = %err, "Failed to embed question");
                return RetrievalOutcome::default();
            }
        };

        let sources = filters.requested_sources();
        let searches = sources.iter().map(|source| {
            self.repository.search_multimodal_report(
                &query,
                std::slice::from_ref(source),
                limit,
                filters.time_range,
                &filters.extra,
            )
        });

        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        let mut failed_collections: Vec<String> = Vec::new();
        for report in join_all(searches).await {
            for collection in report.failed_collections {
                if !failed_collections.contains(&collection) {
                    failed_collections.push(collection);
                }
            }
            for hit in report.hits {
                if seen.insert((hit.collection.clone(), hit.point_id.clone())) {
                    hits.push(hit);
                }
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);

        debug!(
            candidates = hits.len(),
            failed = failed_collections.len(),
            "Retrieval finished"
        );
        RetrievalOutcome {
            hits,
            failed_collections,
        }
    }
}
