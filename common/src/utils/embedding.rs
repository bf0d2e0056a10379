use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
    io::Cursor,
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use fastembed::{
    EmbeddingModel, ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, TextEmbedding,
    TextInitOptions,
};
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{error::AppError, utils::config::AppConfig};

/// Upper bound on the number of vectors produced for a multi-vector query.
const MAX_QUERY_TERMS: usize = 8;
const QUERY_WINDOW_WORDS: usize = 3;
/// Side length patches are shrunk to before hashing in the hashed backend.
const HASHED_PATCH_SIDE: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSpace {
    Text,
    Image,
    Screen,
}

impl EmbeddingSpace {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Screen => "screen",
        }
    }
}

impl fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single vector tagged with the space it was produced in.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    space: EmbeddingSpace,
    values: Vec<f32>,
}

impl EmbeddingVector {
    pub fn new(space: EmbeddingSpace, values: Vec<f32>) -> Self {
        Self { space, values }
    }

    pub const fn space(&self) -> EmbeddingSpace {
        self.space
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

/// `N x D` rows that all belong to one embedding space.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    space: EmbeddingSpace,
    dimension: usize,
    rows: Vec<Vec<f32>>,
}

impl EmbeddingMatrix {
    pub fn new(space: EmbeddingSpace, dimension: usize, rows: Vec<Vec<f32>>) -> Result<Self> {
        if let Some(bad) = rows.iter().find(|row| row.len() != dimension) {
            return Err(anyhow!(
                "embedding row has width {} but the {space} space expects {dimension}",
                bad.len()
            ));
        }
        Ok(Self {
            space,
            dimension,
            rows,
        })
    }

    pub fn empty(space: EmbeddingSpace, dimension: usize) -> Self {
        Self {
            space,
            dimension,
            rows: Vec::new(),
        }
    }

    pub const fn space(&self) -> EmbeddingSpace {
        self.space
    }

    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<f32>] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<EmbeddingVector> {
        self.rows
            .get(index)
            .map(|row| EmbeddingVector::new(self.space, row.clone()))
    }

    pub fn into_vectors(self) -> Vec<EmbeddingVector> {
        let space = self.space;
        self.rows
            .into_iter()
            .map(|row| EmbeddingVector::new(space, row))
            .collect()
    }
}

/// Query vector produced once by the cross-modal text tower and handed out per space.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEmbedding {
    values: Vec<f32>,
}

impl QueryEmbedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn for_space(&self, space: EmbeddingSpace) -> EmbeddingVector {
        EmbeddingVector::new(space, self.values.clone())
    }
}

/// Pixel rectangle `[x, y, width, height]` of an image patch.
pub type PatchBox = [u32; 4];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingStatus {
    Ready,
    /// The configured model could not be loaded and hashed vectors are served instead.
    Degraded { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EmbeddingBackend {
    #[serde(rename = "fastembed", alias = "fast-embed", alias = "fast")]
    FastEmbed,
    #[serde(rename = "hashed")]
    Hashed,
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::FastEmbed
    }
}

impl std::str::FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hashed" => Ok(Self::Hashed),
            "fastembed" | "fast-embed" | "fast" => Ok(Self::FastEmbed),
            other => Err(anyhow!(
                "unknown embedding backend '{other}'. Expected 'hashed' or 'fastembed'."
            )),
        }
    }
}

/// Loaded FastEmbed towers together with the width they produce.
pub struct FastEmbedModels {
    text: TextEmbedding,
    image: ImageEmbedding,
    text_model: EmbeddingModel,
    image_model: ImageEmbeddingModel,
    text_dimension: usize,
    image_dimension: usize,
}

#[derive(Clone)]
pub struct EmbeddingService {
    inner: EmbeddingInner,
    dimension: usize,
    batch_size: usize,
    patch_grid: u32,
    status: EmbeddingStatus,
}

#[derive(Clone)]
enum EmbeddingInner {
    Hashed,
    FastEmbed {
        text: Arc<Mutex<TextEmbedding>>,
        image: Arc<Mutex<ImageEmbedding>>,
        text_model: EmbeddingModel,
        image_model: ImageEmbeddingModel,
    },
}

impl EmbeddingService {
    /// Build the service selected by `config.embedding_backend`.
    ///
    /// A FastEmbed load failure degrades to hashed vectors unless
    /// `require_model_embeddings` is set, in which case startup is aborted.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        match config.embedding_backend {
            EmbeddingBackend::Hashed => Self::new_hashed(
                config.embedding_dimension,
                config.embedding_batch_size,
                config.patch_grid,
            ),
            EmbeddingBackend::FastEmbed => {
                let attempt = load_fastembed(config).await;
                Self::resolve_fastembed(config, attempt)
            }
        }
    }

    /// Turn the outcome of a FastEmbed load into a service, applying the
    /// degraded-mode and dimension rules.
    pub fn resolve_fastembed(
        config: &AppConfig,
        attempt: Result<FastEmbedModels>,
    ) -> Result<Self, AppError> {
        match attempt {
            Ok(models) => {
                for (tower, width) in [
                    ("text", models.text_dimension),
                    ("image", models.image_dimension),
                ] {
                    if width != config.embedding_dimension {
                        return Err(AppError::DimensionMismatch {
                            context: format!("{tower} embedding model"),
                            expected: config.embedding_dimension,
                            actual: width,
                        });
                    }
                }
                info!(
                    text_model = %models.text_model,
                    image_model = ?models.image_model,
                    dimension = config.embedding_dimension,
                    "FastEmbed models loaded"
                );
                Ok(Self {
                    inner: EmbeddingInner::FastEmbed {
                        text: Arc::new(Mutex::new(models.text)),
                        image: Arc::new(Mutex::new(models.image)),
                        text_model: models.text_model,
                        image_model: models.image_model,
                    },
                    dimension: config.embedding_dimension,
                    batch_size: config.embedding_batch_size.max(1),
                    patch_grid: config.patch_grid.max(1),
                    status: EmbeddingStatus::Ready,
                })
            }
            Err(err) => {
                let reason = format!("{err:#}");
                if config.require_model_embeddings {
                    return Err(AppError::Config(format!(
                        "embedding model unavailable and degraded embeddings are not allowed: {reason}"
                    )));
                }
                warn!(
                    %reason,
                    dimension = config.embedding_dimension,
                    "Embedding model unavailable; serving degraded hashed vectors"
                );
                let mut service = Self::new_hashed(
                    config.embedding_dimension,
                    config.embedding_batch_size,
                    config.patch_grid,
                )?;
                service.status = EmbeddingStatus::Degraded { reason };
                Ok(service)
            }
        }
    }

    pub fn new_hashed(
        dimension: usize,
        batch_size: usize,
        patch_grid: u32,
    ) -> Result<Self, AppError> {
        if dimension == 0 {
            return Err(AppError::Config(
                "embedding_dimension must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            inner: EmbeddingInner::Hashed,
            dimension,
            batch_size: batch_size.max(1),
            patch_grid: patch_grid.max(1),
            status: EmbeddingStatus::Ready,
        })
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed => "hashed",
            EmbeddingInner::FastEmbed { .. } => "fastembed",
        }
    }

    pub fn model_code(&self) -> Option<String> {
        match &self.inner {
            EmbeddingInner::FastEmbed {
                text_model,
                image_model,
                ..
            } => Some(format!("{text_model}+{image_model:?}")),
            EmbeddingInner::Hashed => None,
        }
    }

    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn status(&self) -> &EmbeddingStatus {
        &self.status
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self.status, EmbeddingStatus::Degraded { .. })
    }

    /// Encode texts in the text space, windowed by the batch size.
    pub async fn encode_text(&self, texts: &[String]) -> Result<EmbeddingMatrix> {
        let rows = self.embed_texts(texts).await?;
        EmbeddingMatrix::new(EmbeddingSpace::Text, self.dimension, rows)
    }

    /// Encode the question once through the text tower.
    pub async fn encode_query(&self, question: &str) -> Result<QueryEmbedding> {
        let mut rows = self.embed_texts(&[question.to_owned()]).await?;
        let values = rows
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned no vector for query"))?;
        Ok(QueryEmbedding::new(values))
    }

    /// Multi-vector view of a question: the whole question plus overlapping word
    /// windows, used for late-interaction scoring.
    pub async fn encode_query_terms(
        &self,
        question: &str,
        space: EmbeddingSpace,
    ) -> Result<EmbeddingMatrix> {
        let terms = query_terms(question);
        if terms.is_empty() {
            return Ok(EmbeddingMatrix::empty(space, self.dimension));
        }
        let rows = self.embed_texts(&terms).await?;
        EmbeddingMatrix::new(space, self.dimension, rows)
    }

    pub async fn encode_image_patches(&self, image: &[u8]) -> Result<EmbeddingMatrix> {
        self.encode_patches(image, EmbeddingSpace::Image)
            .await
            .map(|(matrix, _)| matrix)
    }

    pub async fn encode_screen_patches(&self, image: &[u8]) -> Result<EmbeddingMatrix> {
        self.encode_patches(image, EmbeddingSpace::Screen)
            .await
            .map(|(matrix, _)| matrix)
    }

    /// Decode `image`, cut it into the configured grid plus one whole-image
    /// patch, and embed every patch. Boxes are returned in row order.
    pub async fn encode_patches(
        &self,
        image: &[u8],
        space: EmbeddingSpace,
    ) -> Result<(EmbeddingMatrix, Vec<PatchBox>)> {
        let decoded = image::load_from_memory(image).context("decoding image for patching")?;
        let patches = split_patches(&decoded, self.patch_grid);
        let boxes: Vec<PatchBox> = patches.iter().map(|(bbox, _)| *bbox).collect();

        let rows = match &self.inner {
            EmbeddingInner::Hashed => patches
                .iter()
                .map(|(_, patch)| hashed_patch_embedding(patch, self.dimension))
                .collect(),
            EmbeddingInner::FastEmbed { image: model, .. } => {
                let mut encoded = Vec::with_capacity(patches.len());
                for (_, patch) in &patches {
                    let mut buffer = Cursor::new(Vec::new());
                    patch
                        .write_to(&mut buffer, ImageOutputFormat::Png)
                        .context("encoding image patch")?;
                    encoded.push(buffer.into_inner());
                }

                let mut rows = Vec::with_capacity(encoded.len());
                for window in encoded.chunks(self.batch_size) {
                    let slices: Vec<&[u8]> = window.iter().map(Vec::as_slice).collect();
                    let mut guard = model.lock().await;
                    let embeddings = guard
                        .embed_bytes(&slices, Some(self.batch_size))
                        .context("generating fastembed image embeddings")?;
                    rows.extend(embeddings);
                }
                rows
            }
        };

        debug!(
            space = %space,
            patches = boxes.len(),
            backend = self.backend_label(),
            "Encoded image patches"
        );
        Ok((EmbeddingMatrix::new(space, self.dimension, rows)?, boxes))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        match &self.inner {
            EmbeddingInner::Hashed => Ok(texts
                .iter()
                .map(|text| hashed_embedding(text, self.dimension))
                .collect()),
            EmbeddingInner::FastEmbed { text: model, .. } => {
                let mut rows = Vec::with_capacity(texts.len());
                for window in texts.chunks(self.batch_size) {
                    let mut guard = model.lock().await;
                    let embeddings = guard
                        .embed(window.to_vec(), Some(self.batch_size))
                        .context("generating fastembed batch embeddings")?;
                    rows.extend(embeddings);
                }
                Ok(rows)
            }
        }
    }
}

async fn load_fastembed(config: &AppConfig) -> Result<FastEmbedModels> {
    let text_model = if let Some(code) = config.embedding_model.as_deref() {
        EmbeddingModel::from_str(code).map_err(|err| anyhow!(err))?
    } else {
        EmbeddingModel::ClipVitB32
    };
    let image_model = match config.image_embedding_model.as_deref() {
        Some(code) => parse_image_model(code)?,
        None => ImageEmbeddingModel::ClipVitB32,
    };

    let mut text_options = TextInitOptions::new(text_model.clone())
        .with_show_download_progress(config.fastembed_show_download_progress);
    let mut image_options = ImageInitOptions::new(image_model.clone())
        .with_show_download_progress(config.fastembed_show_download_progress);
    if let Some(dir) = config.fastembed_cache_dir.as_deref() {
        text_options = text_options.with_cache_dir(PathBuf::from(dir));
        image_options = image_options.with_cache_dir(PathBuf::from(dir));
    }

    let text_model_for_task = text_model.clone();
    let image_model_for_task = image_model.clone();

    // ONNX runtime loading may panic when the dynamic library is missing; the
    // blocking task turns that into a join error.
    tokio::task::spawn_blocking(move || -> Result<FastEmbedModels> {
        let mut text =
            TextEmbedding::try_new(text_options).context("initialising FastEmbed text model")?;
        let mut image = ImageEmbedding::try_new(image_options)
            .context("initialising FastEmbed image model")?;

        let text_dimension = text
            .embed(vec!["dimension probe"], None)
            .context("probing text model width")?
            .first()
            .map(Vec::len)
            .ok_or_else(|| anyhow!("text model returned no probe embedding"))?;

        let probe = probe_png()?;
        let image_dimension = image
            .embed_bytes(&[probe.as_slice()], None)
            .context("probing image model width")?
            .first()
            .map(Vec::len)
            .ok_or_else(|| anyhow!("image model returned no probe embedding"))?;

        Ok(FastEmbedModels {
            text,
            image,
            text_model: text_model_for_task,
            image_model: image_model_for_task,
            text_dimension,
            image_dimension,
        })
    })
    .await
    .context("joining FastEmbed initialisation task")?
}

fn parse_image_model(code: &str) -> Result<ImageEmbeddingModel> {
    match code.to_ascii_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" | "qdrant/clip-vit-b-32-vision" => {
            Ok(ImageEmbeddingModel::ClipVitB32)
        }
        "resnet50" | "qdrant/resnet50-onnx" => Ok(ImageEmbeddingModel::Resnet50),
        "nomic-embed-vision-v1.5" | "nomic-ai/nomic-embed-vision-v1.5" => {
            Ok(ImageEmbeddingModel::NomicEmbedVisionV15)
        }
        other => Err(anyhow!("unknown image embedding model '{other}'")),
    }
}

fn probe_png() -> Result<Vec<u8>> {
    let probe = DynamicImage::new_rgb8(32, 32);
    let mut buffer = Cursor::new(Vec::new());
    probe
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .context("encoding probe image")?;
    Ok(buffer.into_inner())
}

/// Whole image first, then the `grid x grid` tiles in row-major order.
fn split_patches(image: &DynamicImage, grid: u32) -> Vec<(PatchBox, DynamicImage)> {
    let (width, height) = image.dimensions();
    let mut patches = vec![([0, 0, width, height], image.clone())];

    let grid = grid.max(1);
    if grid == 1 {
        return patches;
    }

    let tile_w = (width / grid).max(1);
    let tile_h = (height / grid).max(1);
    for row in 0..grid {
        for col in 0..grid {
            let x = (col * tile_w).min(width.saturating_sub(1));
            let y = (row * tile_h).min(height.saturating_sub(1));
            // The last row/column absorbs the remainder of an uneven split.
            let w = if col + 1 == grid {
                width.saturating_sub(x).max(1)
            } else {
                tile_w
            };
            let h = if row + 1 == grid {
                height.saturating_sub(y).max(1)
            } else {
                tile_h
            };
            patches.push(([x, y, w, h], image.crop_imm(x, y, w, h)));
        }
    }
    patches
}

/// Overlapping word windows plus the full question, deduplicated and capped.
pub fn query_terms(question: &str) -> Vec<String> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    let mut terms = vec![trimmed.to_owned()];
    if words.len() > QUERY_WINDOW_WORDS {
        let stride = QUERY_WINDOW_WORDS.saturating_sub(1).max(1);
        let mut start = 0;
        while start < words.len() && terms.len() < MAX_QUERY_TERMS {
            let end = (start + QUERY_WINDOW_WORDS).min(words.len());
            let window = words.get(start..end).unwrap_or_default().join(" ");
            if !terms.contains(&window) {
                terms.push(window);
            }
            if end == words.len() {
                break;
            }
            start += stride;
        }
    }
    terms
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    if token_count == 0.0 {
        return vector;
    }

    normalize(&mut vector);
    vector
}

fn hashed_patch_embedding(patch: &DynamicImage, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    let pixels = patch
        .thumbnail_exact(HASHED_PATCH_SIDE, HASHED_PATCH_SIDE)
        .to_rgb8()
        .into_raw();

    for (position, texel) in pixels.chunks(3).enumerate() {
        // Quantize so that near-identical colours land in the same bucket.
        let quantized: Vec<u8> = texel.iter().map(|channel| channel / 32).collect();
        let mut hasher = DefaultHasher::new();
        quantized.hash(&mut hasher);
        (position % 4).hash(&mut hasher);
        let idx = (hasher.finish() as usize) % dim;
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    normalize(&mut vector);
    vector
}

fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}
