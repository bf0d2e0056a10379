use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::index_point::{IndexPoint, PointPayload, ScoredPoint},
    },
    utils::embedding::{EmbeddingSpace, EmbeddingVector},
};

pub const TEXT_CHUNKS: &str = "text_chunks";
pub const IMAGE_PATCHES: &str = "image_patches";
pub const SCREEN_PATCHES: &str = "screen_patches";

const COLLECTION_META_TABLE: &str = "vector_collection";
const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
}

impl DistanceMetric {
    const fn surreal_keyword(self) -> &'static str {
        match self {
            Self::Cosine => "COSINE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub space: EmbeddingSpace,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

impl CollectionSpec {
    pub fn cosine(name: impl Into<String>, space: EmbeddingSpace, dimension: usize) -> Self {
        Self {
            name: name.into(),
            space,
            dimension,
            metric: DistanceMetric::Cosine,
        }
    }

    /// The three modality collections every deployment carries.
    pub fn defaults(dimension: usize) -> [Self; 3] {
        [
            Self::cosine(TEXT_CHUNKS, EmbeddingSpace::Text, dimension),
            Self::cosine(IMAGE_PATCHES, EmbeddingSpace::Image, dimension),
            Self::cosine(SCREEN_PATCHES, EmbeddingSpace::Screen, dimension),
        ]
    }
}

/// Payload fields that may appear in a search filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadField {
    DocId,
    Source,
    Page,
    ChunkIndex,
    Timestamp,
    Path,
    Url,
}

impl PayloadField {
    const fn column(self) -> &'static str {
        match self {
            Self::DocId => "payload.doc_id",
            Self::Source => "payload.source",
            Self::Page => "payload.page",
            Self::ChunkIndex => "payload.chunk_index",
            Self::Timestamp => "payload.timestamp",
            Self::Path => "payload.path",
            Self::Url => "payload.url",
        }
    }

    const fn is_numeric(self) -> bool {
        matches!(self, Self::Page | Self::ChunkIndex | Self::Timestamp)
    }
}

impl FromStr for PayloadField {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "doc_id" => Ok(Self::DocId),
            "source" => Ok(Self::Source),
            "page" => Ok(Self::Page),
            "chunk_index" => Ok(Self::ChunkIndex),
            "timestamp" => Ok(Self::Timestamp),
            "path" => Ok(Self::Path),
            "url" => Ok(Self::Url),
            other => Err(AppError::Validation(format!(
                "'{other}' is not a filterable payload field"
            ))),
        }
    }
}

impl fmt::Display for PayloadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column().trim_start_matches("payload."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Integer(i64),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<i64> for FilterValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCondition {
    Eq {
        field: PayloadField,
        value: FilterValue,
    },
    /// Inclusive range; an open bound is `None`. With `or_missing`, rows
    /// lacking the field also pass.
    Range {
        field: PayloadField,
        gte: Option<i64>,
        lte: Option<i64>,
        or_missing: bool,
    },
}

/// A conjunction of payload predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub conditions: Vec<FilterCondition>,
}

impl SearchFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: PayloadField, value: impl Into<FilterValue>) -> Self {
        self.conditions.push(FilterCondition::Eq {
            field,
            value: value.into(),
        });
        self
    }

    pub fn range(self, field: PayloadField, gte: Option<i64>, lte: Option<i64>) -> Self {
        self.push_range(field, gte, lte, false)
    }

    pub fn range_or_missing(self, field: PayloadField, gte: Option<i64>, lte: Option<i64>) -> Self {
        self.push_range(field, gte, lte, true)
    }

    fn push_range(
        mut self,
        field: PayloadField,
        gte: Option<i64>,
        lte: Option<i64>,
        or_missing: bool,
    ) -> Self {
        if gte.is_some() || lte.is_some() {
            self.conditions.push(FilterCondition::Range {
                field,
                gte,
                lte,
                or_missing,
            });
        }
        self
    }

    pub fn extend(mut self, conditions: impl IntoIterator<Item = FilterCondition>) -> Self {
        self.conditions.extend(conditions);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        for condition in &self.conditions {
            if let FilterCondition::Range { field, gte, lte, .. } = condition {
                if !field.is_numeric() {
                    return Err(AppError::Validation(format!(
                        "range filter on non-numeric field '{field}'"
                    )));
                }
                if let (Some(low), Some(high)) = (gte, lte) {
                    if low > high {
                        return Err(AppError::Validation(format!(
                            "empty range on '{field}': {low} > {high}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// WHERE clause plus the values it references.
    fn to_clause(&self) -> (String, Vec<(String, FilterValue)>) {
        let mut predicates = Vec::new();
        let mut bindings = Vec::new();
        for (i, condition) in self.conditions.iter().enumerate() {
            match condition {
                FilterCondition::Eq { field, value } => {
                    let name = format!("f{i}");
                    predicates.push(format!("{} = ${name}", field.column()));
                    bindings.push((name, value.clone()));
                }
                FilterCondition::Range {
                    field,
                    gte,
                    lte,
                    or_missing,
                } => {
                    let mut bounds = Vec::new();
                    if let Some(low) = gte {
                        let name = format!("f{i}_gte");
                        bounds.push(format!("{} >= ${name}", field.column()));
                        bindings.push((name, FilterValue::Integer(*low)));
                    }
                    if let Some(high) = lte {
                        let name = format!("f{i}_lte");
                        bounds.push(format!("{} <= ${name}", field.column()));
                        bindings.push((name, FilterValue::Integer(*high)));
                    }
                    if *or_missing {
                        predicates.push(format!(
                            "({} = NONE OR ({}))",
                            field.column(),
                            bounds.join(" AND ")
                        ));
                    } else {
                        predicates.extend(bounds);
                    }
                }
            }
        }
        if predicates.is_empty() {
            (String::new(), bindings)
        } else {
            (format!("WHERE {}", predicates.join(" AND ")), bindings)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub index: usize,
    pub points: usize,
    pub error: Option<String>,
}

/// Per-batch result of an upsert. Committed batches stay committed even when
/// a later batch fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub collection: String,
    pub batches: Vec<BatchOutcome>,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.batches
            .iter()
            .filter(|batch| batch.error.is_none())
            .map(|batch| batch.points)
            .sum()
    }

    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchOutcome> {
        self.batches.iter().filter(|batch| batch.error.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.failed_batches().next().is_none()
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<(), AppError>;

    async fn upsert(
        &self,
        collection: &str,
        points: Vec<IndexPoint>,
    ) -> Result<UpsertReport, AppError>;

    async fn search(
        &self,
        collection: &str,
        query: &EmbeddingVector,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>, AppError>;

    async fn delete(&self, collection: &str, point_ids: &[String]) -> Result<(), AppError>;

    async fn delete_by_doc_id(&self, collection: &str, doc_id: &str) -> Result<(), AppError>;

    async fn count(&self, collection: &str) -> Result<usize, AppError>;
}

pub type DynIndex = Arc<dyn VectorIndex>;

#[derive(Clone)]
struct HnswIndexSpec<'a> {
    index_name: String,
    table: &'a str,
    options: &'static str,
}

impl<'a> HnswIndexSpec<'a> {
    fn for_collection(spec: &'a CollectionSpec) -> Self {
        Self {
            index_name: format!("idx_{}_embedding", spec.name),
            table: &spec.name,
            options: spec.metric.surreal_keyword(),
        }
    }

    fn definition_if_not_exists(&self, dimension: usize) -> String {
        format!(
            "DEFINE INDEX IF NOT EXISTS {index} ON TABLE {table} \
             FIELDS embedding HNSW DIMENSION {dimension} DIST {options};",
            index = self.index_name,
            table = self.table,
            dimension = dimension,
            options = self.options,
        )
    }
}

#[derive(Serialize)]
struct PointRow {
    point_id: String,
    embedding: Vec<f32>,
    payload: PointPayload,
}

#[derive(Deserialize)]
struct ScoredRow {
    point_id: String,
    payload: PointPayload,
    score: Option<f64>,
}

#[derive(Deserialize)]
struct CountRow {
    total: i64,
}

/// Vector collections stored as SurrealDB tables with an HNSW definition.
///
/// Scores are exact cosine similarities over the filtered rows, so results
/// do not depend on index build state.
pub struct SurrealVectorIndex {
    db: Arc<SurrealDbClient>,
    batch_size: usize,
    collections: RwLock<HashMap<String, CollectionSpec>>,
}

impl SurrealVectorIndex {
    pub fn new(db: Arc<SurrealDbClient>, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: if batch_size == 0 {
                DEFAULT_BATCH_SIZE
            } else {
                batch_size
            },
            collections: RwLock::new(HashMap::new()),
        }
    }

    async fn stored_spec(&self, name: &str) -> Result<Option<CollectionSpec>, AppError> {
        let mut rows: Vec<CollectionSpec> = self
            .db
            .query("SELECT name, space, dimension, metric FROM type::thing($meta, $name)")
            .bind(("meta", COLLECTION_META_TABLE))
            .bind(("name", name.to_owned()))
            .await?
            .take(0)?;
        Ok(rows.pop())
    }

    async fn spec_for(&self, name: &str) -> Result<CollectionSpec, AppError> {
        if let Some(spec) = self.collections.read().await.get(name) {
            return Ok(spec.clone());
        }
        let spec = self
            .stored_spec(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("vector collection '{name}'")))?;
        self.collections
            .write()
            .await
            .insert(name.to_owned(), spec.clone());
        Ok(spec)
    }

    async fn write_batch(&self, collection: &str, rows: Vec<PointRow>) -> Result<(), AppError> {
        self.db
            .query(
                "BEGIN TRANSACTION;
                 FOR $p IN $points {
                     UPSERT type::thing($tb, $p.point_id) CONTENT {
                         embedding: $p.embedding,
                         payload: $p.payload
                     };
                 };
                 COMMIT TRANSACTION;",
            )
            .bind(("tb", collection.to_owned()))
            .bind(("points", rows))
            .await?
            .check()?;
        Ok(())
    }
}

fn validate_collection_name(name: &str) -> Result<(), AppError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if valid_start && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "invalid collection name '{name}'"
        )))
    }
}

fn check_vector(
    spec: &CollectionSpec,
    vector: &EmbeddingVector,
    what: &str,
) -> Result<(), AppError> {
    if vector.space() != spec.space {
        return Err(AppError::Validation(format!(
            "{what} is in the {} space but collection '{}' holds {} vectors",
            vector.space(),
            spec.name,
            spec.space
        )));
    }
    if vector.dimension() != spec.dimension {
        return Err(AppError::Validation(format!(
            "{what} has dimension {} but collection '{}' expects {}",
            vector.dimension(),
            spec.name,
            spec.dimension
        )));
    }
    Ok(())
}

#[async_trait]
impl VectorIndex for SurrealVectorIndex {
    #[instrument(skip_all, fields(collection = %spec.name, dimension = spec.dimension))]
    async fn ensure_collection(&self, spec: &CollectionSpec) -> Result<(), AppError> {
        validate_collection_name(&spec.name)?;

        if let Some(existing) = self.stored_spec(&spec.name).await? {
            if existing.dimension != spec.dimension {
                return Err(AppError::DimensionMismatch {
                    context: format!("collection {}", spec.name),
                    expected: spec.dimension,
                    actual: existing.dimension,
                });
            }
            if existing.space != spec.space || existing.metric != spec.metric {
                return Err(AppError::Config(format!(
                    "collection '{}' already exists with space {} and a different metric or space",
                    spec.name, existing.space
                )));
            }
            debug!("Collection already present");
            self.collections
                .write()
                .await
                .insert(spec.name.clone(), existing);
            return Ok(());
        }

        let hnsw = HnswIndexSpec::for_collection(spec);
        let statements = format!(
            "DEFINE TABLE IF NOT EXISTS {table} SCHEMALESS;
             {hnsw_definition}
             DEFINE INDEX IF NOT EXISTS idx_{table}_doc ON TABLE {table} FIELDS payload.doc_id;",
            table = spec.name,
            hnsw_definition = hnsw.definition_if_not_exists(spec.dimension),
        );
        self.db.query(statements).await?.check()?;

        self.db
            .query("UPSERT type::thing($meta, $name) CONTENT $spec")
            .bind(("meta", COLLECTION_META_TABLE))
            .bind(("name", spec.name.clone()))
            .bind(("spec", spec.clone()))
            .await?
            .check()?;

        info!(index = %hnsw.index_name, "Created vector collection");
        self.collections
            .write()
            .await
            .insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    #[instrument(skip_all, fields(collection = %collection, points = points.len()))]
    async fn upsert(
        &self,
        collection: &str,
        points: Vec<IndexPoint>,
    ) -> Result<UpsertReport, AppError> {
        let spec = self.spec_for(collection).await?;
        for point in &points {
            check_vector(&spec, &point.vector, &format!("point {}", point.point_id))?;
        }

        let mut report = UpsertReport {
            collection: collection.to_owned(),
            batches: Vec::new(),
        };
        let mut rows = points.into_iter().map(|point| PointRow {
            point_id: point.point_id,
            embedding: point.vector.into_values(),
            payload: point.payload,
        });

        let mut index = 0usize;
        loop {
            let batch: Vec<PointRow> = rows.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let size = batch.len();
            let error = match self.write_batch(collection, batch).await {
                Ok(()) => None,
                Err(err) => {
                    warn!(batch = index, points = size, error = %err, "Vector batch upsert failed");
                    Some(err.to_string())
                }
            };
            report.batches.push(BatchOutcome {
                index,
                points: size,
                error,
            });
            index = index.saturating_add(1);
        }

        debug!(
            written = report.written(),
            batches = report.batches.len(),
            "Vector upsert finished"
        );
        Ok(report)
    }

    #[instrument(skip_all, fields(collection = %collection, limit = limit))]
    async fn search(
        &self,
        collection: &str,
        query: &EmbeddingVector,
        limit: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredPoint>, AppError> {
        let spec = self.spec_for(collection).await?;
        check_vector(&spec, query, "query")?;
        filter.validate()?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (where_clause, bindings) = filter.to_clause();
        let statement = format!(
            "SELECT record::id(id) AS point_id, payload, \
             vector::similarity::cosine(embedding, $query) AS score \
             FROM type::table($tb) {where_clause} \
             ORDER BY score DESC, point_id ASC LIMIT $limit"
        );

        let mut request = self
            .db
            .query(statement)
            .bind(("tb", collection.to_owned()))
            .bind(("query", query.values().to_vec()))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)));
        for binding in bindings {
            request = request.bind(binding);
        }
        let rows: Vec<ScoredRow> = request.await?.take(0)?;

        let mut points: Vec<ScoredPoint> = rows
            .into_iter()
            .map(|row| ScoredPoint {
                point_id: row.point_id,
                score: row.score.filter(|score| score.is_finite()).unwrap_or(0.0) as f32,
                payload: row.payload,
            })
            .collect();
        points.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.point_id.cmp(&b.point_id))
        });
        points.truncate(limit);
        Ok(points)
    }

    async fn delete(&self, collection: &str, point_ids: &[String]) -> Result<(), AppError> {
        self.spec_for(collection).await?;
        if point_ids.is_empty() {
            return Ok(());
        }
        self.db
            .query("DELETE type::table($tb) WHERE record::id(id) IN $ids")
            .bind(("tb", collection.to_owned()))
            .bind(("ids", point_ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_by_doc_id(&self, collection: &str, doc_id: &str) -> Result<(), AppError> {
        self.spec_for(collection).await?;
        self.db
            .query("DELETE type::table($tb) WHERE payload.doc_id = $doc_id")
            .bind(("tb", collection.to_owned()))
            .bind(("doc_id", doc_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<usize, AppError> {
        self.spec_for(collection).await?;
        let rows: Vec<CountRow> = self
            .db
            .query("SELECT count() AS total FROM type::table($tb) GROUP ALL")
            .bind(("tb", collection.to_owned()))
            .await?
            .take(0)?;
        Ok(rows
            .first()
            .map_or(0, |row| usize::try_from(row.total).unwrap_or(0)))
    }
}
