use crate::{stored_object, utils::identity::screenshot_doc_id};

stored_object!(Screenshot, "screenshots", {
    path: String,
    captured_at: i64,
    app_name: Option<String>,
    window_title: Option<String>,
    content_hash: Option<String>,
    ocr_text: Option<String>,
    description: Option<String>,
    category: Option<String>,
    confidence: Option<f64>
});

impl Screenshot {
    pub fn new(path: impl Into<String>, captured_at: i64) -> Self {
        let path = path.into();
        let now = Utc::now();
        Self {
            id: screenshot_doc_id(&path, captured_at),
            created_at: now,
            updated_at: now,
            path,
            captured_at,
            app_name: None,
            window_title: None,
            content_hash: None,
            ocr_text: None,
            description: None,
            category: None,
            confidence: None,
        }
    }

    /// Short text shown when a screen capture is cited.
    pub fn preview(&self) -> Option<String> {
        self.description
            .clone()
            .or_else(|| self.ocr_text.clone())
            .or_else(|| self.window_title.clone())
    }
}
