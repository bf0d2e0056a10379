use crate::{stored_object, utils::identity::file_doc_id};

stored_object!(FileRecord, "files", {
    path: String,
    content_type: Option<String>,
    size: u64,
    file_created_at: i64,
    modified_at: i64,
    accessed_at: i64,
    category: Option<String>,
    preview: Option<String>
});

impl FileRecord {
    /// New record for an absolute path; the id is derived from the path so
    /// re-ingesting the same file replaces the existing record.
    pub fn new(path: impl Into<String>, size: u64, modified_at: i64) -> Self {
        let path = path.into();
        let now = Utc::now();
        Self {
            id: file_doc_id(&path),
            created_at: now,
            updated_at: now,
            path,
            content_type: None,
            size,
            file_created_at: modified_at,
            modified_at,
            accessed_at: modified_at,
            category: None,
            preview: None,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        std::path::Path::new(&self.path)
            .file_name()
            .and_then(|name| name.to_str())
    }
}
