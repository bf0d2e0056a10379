use crate::{stored_object, utils::identity::app_doc_id};

stored_object!(AppSession, "apps", {
    name: String,
    pid: Option<u32>,
    cpu_percent: Option<f64>,
    memory_mb: Option<f64>,
    started_at: i64,
    window_title: Option<String>,
    category: Option<String>
});

impl AppSession {
    pub fn new(name: impl Into<String>, started_at: i64) -> Self {
        let name = name.into();
        let now = Utc::now();
        Self {
            id: app_doc_id(&name, started_at),
            created_at: now,
            updated_at: now,
            name,
            pid: None,
            cpu_percent: None,
            memory_mb: None,
            started_at,
            window_title: None,
            category: None,
        }
    }
}
