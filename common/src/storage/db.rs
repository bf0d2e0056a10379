use crate::{error::AppError, utils::config::AppConfig};

use super::types::{
    app_session::AppSession, file_record::FileRecord, screenshot::Screenshot,
    web_visit::WebVisit, StoredObject,
};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};
use tracing::debug;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// Signs in as root only when both credentials are given, so embedded
    /// engines such as `mem://` work without any.
    pub async fn new(
        address: &str,
        username: Option<&str>,
        password: Option<&str>,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        if let (Some(username), Some(password)) = (username, password) {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self, Error> {
        debug!(
            address = %config.surrealdb_address,
            namespace = %config.surrealdb_namespace,
            database = %config.surrealdb_database,
            "Connecting to SurrealDB"
        );
        Self::new(
            &config.surrealdb_address,
            config.surrealdb_username.as_deref(),
            config.surrealdb_password.as_deref(),
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.build_indexes().await?;
        Ok(())
    }

    /// Provenance tables and the timestamp indexes used by range queries.
    pub async fn build_indexes(&self) -> Result<(), Error> {
        let statements = format!(
            "DEFINE TABLE IF NOT EXISTS {files} SCHEMALESS;
             DEFINE TABLE IF NOT EXISTS {web} SCHEMALESS;
             DEFINE TABLE IF NOT EXISTS {apps} SCHEMALESS;
             DEFINE TABLE IF NOT EXISTS {screens} SCHEMALESS;
             DEFINE INDEX IF NOT EXISTS idx_files_modified ON TABLE {files} FIELDS modified_at;
             DEFINE INDEX IF NOT EXISTS idx_files_path ON TABLE {files} FIELDS path;
             DEFINE INDEX IF NOT EXISTS idx_web_visited ON TABLE {web} FIELDS visited_at;
             DEFINE INDEX IF NOT EXISTS idx_apps_started ON TABLE {apps} FIELDS started_at;
             DEFINE INDEX IF NOT EXISTS idx_screens_captured ON TABLE {screens} FIELDS captured_at;",
            files = FileRecord::table_name(),
            web = WebVisit::table_name(),
            apps = AppSession::table_name(),
            screens = Screenshot::table_name(),
        );
        self.client.query(statements).await?.check()?;
        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// Fails when a record with the same id already exists.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Create or replace the record with the item's id.
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        let id = item.get_id().to_owned();
        self.client
            .upsert((T::table_name(), id))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
