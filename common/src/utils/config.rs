use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::utils::embedding::EmbeddingBackend;

/// Runtime configuration. Every key is optional; a missing config file or
/// environment variable falls back to the defaults below.
#[derive(Clone, Deserialize, Debug)]
#[serde(default)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: Option<String>,
    pub surrealdb_password: Option<String>,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub embedding_backend: EmbeddingBackend,
    /// Text tower used for chunks and for queries against every space.
    pub embedding_model: Option<String>,
    /// Vision tower used for image and screen patches.
    pub image_embedding_model: Option<String>,
    pub embedding_dimension: usize,
    pub embedding_batch_size: usize,
    pub patch_grid: u32,
    /// Refuse to start when the embedding model falls back to hashed vectors.
    pub require_model_embeddings: bool,
    pub fastembed_cache_dir: Option<String>,
    pub fastembed_show_download_progress: bool,
    pub index_batch_size: usize,
    pub k_candidates: usize,
    pub k_final: usize,
    pub vision_rerank_enabled: bool,
    pub vision_answer_enabled: bool,
    pub redaction_patterns: Vec<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub vision_model: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: None,
            surrealdb_password: None,
            surrealdb_namespace: "recall".to_string(),
            surrealdb_database: "recall".to_string(),
            embedding_backend: EmbeddingBackend::default(),
            embedding_model: None,
            image_embedding_model: None,
            embedding_dimension: 512,
            embedding_batch_size: 32,
            patch_grid: 2,
            require_model_embeddings: false,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: true,
            index_batch_size: 64,
            k_candidates: 40,
            k_final: 10,
            vision_rerank_enabled: false,
            vision_answer_enabled: false,
            redaction_patterns: Vec::new(),
            openai_api_key: None,
            openai_base_url: default_base_url(),
            vision_model: "gpt-4o-mini".to_string(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::default()
                .try_parsing(true)
                .list_separator(";")
                .with_list_parse_key("redaction_patterns"),
        )
        .build()?;

    config.try_deserialize()
}
