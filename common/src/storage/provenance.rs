use std::{fmt, sync::Arc};

use tracing::{debug, instrument};

use crate::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            app_session::AppSession, file_record::FileRecord, index_point::SourceKind,
            screenshot::Screenshot, web_visit::WebVisit, StoredObject,
        },
    },
};

/// The provenance tables, each with the field its range queries use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvenanceTable {
    Files,
    WebHistory,
    Apps,
    Screenshots,
}

impl ProvenanceTable {
    pub const ALL: [Self; 4] = [Self::Files, Self::WebHistory, Self::Apps, Self::Screenshots];

    pub fn table_name(self) -> &'static str {
        match self {
            Self::Files => FileRecord::table_name(),
            Self::WebHistory => WebVisit::table_name(),
            Self::Apps => AppSession::table_name(),
            Self::Screenshots => Screenshot::table_name(),
        }
    }

    pub const fn timestamp_field(self) -> &'static str {
        match self {
            Self::Files => "modified_at",
            Self::WebHistory => "visited_at",
            Self::Apps => "started_at",
            Self::Screenshots => "captured_at",
        }
    }

    /// Lookup order for a document whose source is (maybe) known.
    fn lookup_order(hint: Option<SourceKind>) -> [Self; 4] {
        match hint {
            Some(SourceKind::Web) => [Self::WebHistory, Self::Files, Self::Screenshots, Self::Apps],
            Some(SourceKind::Screen) => {
                [Self::Screenshots, Self::Files, Self::WebHistory, Self::Apps]
            }
            Some(SourceKind::File) | None => Self::ALL,
        }
    }
}

impl fmt::Display for ProvenanceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvenanceRecord {
    File(FileRecord),
    Web(WebVisit),
    App(AppSession),
    Screenshot(Screenshot),
}

impl ProvenanceRecord {
    pub fn doc_id(&self) -> &str {
        match self {
            Self::File(record) => &record.id,
            Self::Web(record) => &record.id,
            Self::App(record) => &record.id,
            Self::Screenshot(record) => &record.id,
        }
    }

    pub fn table(&self) -> ProvenanceTable {
        match self {
            Self::File(_) => ProvenanceTable::Files,
            Self::Web(_) => ProvenanceTable::WebHistory,
            Self::App(_) => ProvenanceTable::Apps,
            Self::Screenshot(_) => ProvenanceTable::Screenshots,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Self::File(record) => Some(&record.path),
            Self::Screenshot(record) => Some(&record.path),
            Self::Web(_) | Self::App(_) => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Web(record) => Some(&record.url),
            _ => None,
        }
    }

    /// The event time users care about: modified, visited, started or captured.
    pub fn timestamp(&self) -> i64 {
        match self {
            Self::File(record) => record.modified_at,
            Self::Web(record) => record.visited_at,
            Self::App(record) => record.started_at,
            Self::Screenshot(record) => record.captured_at,
        }
    }

    pub fn preview(&self) -> Option<String> {
        match self {
            Self::File(record) => record.preview.clone(),
            Self::Web(record) => record.title.clone().or_else(|| record.tab_title.clone()),
            Self::App(record) => record.window_title.clone(),
            Self::Screenshot(record) => record.preview(),
        }
    }
}

/// Durable metadata about every indexed document.
#[derive(Clone)]
pub struct ProvenanceStore {
    db: Arc<SurrealDbClient>,
}

impl ProvenanceStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        self.db.ensure_initialized().await
    }

    /// Create or refresh the record for a file. Keyed by its path hash.
    pub async fn upsert_file(&self, mut record: FileRecord) -> Result<FileRecord, AppError> {
        if let Some(existing) = self.db.get_item::<FileRecord>(&record.id).await? {
            record.created_at = existing.created_at;
        }
        record.updated_at = chrono::Utc::now();
        self.db
            .upsert_item(record)
            .await?
            .ok_or_else(|| AppError::InternalError("file upsert returned no record".into()))
    }

    /// Record a page visit. Returns `false` when the identical visit was
    /// already stored.
    pub async fn insert_web_visit(&self, visit: WebVisit) -> Result<bool, AppError> {
        self.insert_once(visit).await
    }

    pub async fn insert_app_session(&self, session: AppSession) -> Result<bool, AppError> {
        self.insert_once(session).await
    }

    pub async fn insert_screenshot(&self, shot: Screenshot) -> Result<Screenshot, AppError> {
        self.db
            .upsert_item(shot)
            .await?
            .ok_or_else(|| AppError::InternalError("screenshot upsert returned no record".into()))
    }

    async fn insert_once<T>(&self, item: T) -> Result<bool, AppError>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        if self.db.get_item::<T>(item.get_id()).await?.is_some() {
            debug!(table = T::table_name(), id = item.get_id(), "Provenance record already present");
            return Ok(false);
        }
        self.db.store_item(item).await?;
        Ok(true)
    }

    /// Find the record for `doc_id`, trying the table matching `hint` first.
    #[instrument(skip(self))]
    pub async fn get_by_doc_id(
        &self,
        doc_id: &str,
        hint: Option<SourceKind>,
    ) -> Result<Option<ProvenanceRecord>, AppError> {
        for table in ProvenanceTable::lookup_order(hint) {
            let found = match table {
                ProvenanceTable::Files => self
                    .db
                    .get_item::<FileRecord>(doc_id)
                    .await?
                    .map(ProvenanceRecord::File),
                ProvenanceTable::WebHistory => self
                    .db
                    .get_item::<WebVisit>(doc_id)
                    .await?
                    .map(ProvenanceRecord::Web),
                ProvenanceTable::Apps => self
                    .db
                    .get_item::<AppSession>(doc_id)
                    .await?
                    .map(ProvenanceRecord::App),
                ProvenanceTable::Screenshots => self
                    .db
                    .get_item::<Screenshot>(doc_id)
                    .await?
                    .map(ProvenanceRecord::Screenshot),
            };
            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Newest records first, optionally only those at or after `since_ts`.
    pub async fn recent(
        &self,
        table: ProvenanceTable,
        limit: usize,
        since_ts: Option<i64>,
    ) -> Result<Vec<ProvenanceRecord>, AppError> {
        let records = match table {
            ProvenanceTable::Files => self
                .recent_rows::<FileRecord>(table, limit, since_ts)
                .await?
                .into_iter()
                .map(ProvenanceRecord::File)
                .collect(),
            ProvenanceTable::WebHistory => self
                .recent_rows::<WebVisit>(table, limit, since_ts)
                .await?
                .into_iter()
                .map(ProvenanceRecord::Web)
                .collect(),
            ProvenanceTable::Apps => self
                .recent_rows::<AppSession>(table, limit, since_ts)
                .await?
                .into_iter()
                .map(ProvenanceRecord::App)
                .collect(),
            ProvenanceTable::Screenshots => self
                .recent_rows::<Screenshot>(table, limit, since_ts)
                .await?
                .into_iter()
                .map(ProvenanceRecord::Screenshot)
                .collect(),
        };
        Ok(records)
    }

    async fn recent_rows<T>(
        &self,
        table: ProvenanceTable,
        limit: usize,
        since_ts: Option<i64>,
    ) -> Result<Vec<T>, AppError>
    where
        T: StoredObject,
    {
        let field = table.timestamp_field();
        let query = format!(
            "SELECT * FROM type::table($table) WHERE {field} >= $since \
             ORDER BY {field} DESC LIMIT $limit"
        );
        let rows: Vec<T> = self
            .db
            .query(query)
            .bind(("table", table.table_name()))
            .bind(("since", since_ts.unwrap_or(i64::MIN)))
            .bind(("limit", i64::try_from(limit).unwrap_or(i64::MAX)))
            .await?
            .take(0)?;
        Ok(rows)
    }

    pub async fn find_file_by_path(&self, path: &str) -> Result<Option<FileRecord>, AppError> {
        let mut rows: Vec<FileRecord> = self
            .db
            .query("SELECT * FROM type::table($table) WHERE path = $path LIMIT 1")
            .bind(("table", FileRecord::table_name()))
            .bind(("path", path.to_owned()))
            .await?
            .take(0)?;
        Ok(rows.pop())
    }

    /// Remove the file or screenshot record for a document. Visits and app
    /// sessions are history and are kept.
    pub async fn delete_document(&self, doc_id: &str) -> Result<bool, AppError> {
        let file = self.db.delete_item::<FileRecord>(doc_id).await?;
        let shot = self.db.delete_item::<Screenshot>(doc_id).await?;
        Ok(file.is_some() || shot.is_some())
    }
}
