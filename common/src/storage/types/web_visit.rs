use crate::{stored_object, utils::identity::web_doc_id};

stored_object!(WebVisit, "web_history", {
    url: String,
    title: Option<String>,
    visited_at: i64,
    visit_count: u32,
    transition: Option<String>,
    browser: Option<String>,
    domain: Option<String>,
    duration_sec: Option<f64>,
    tab_title: Option<String>
});

impl WebVisit {
    pub fn new(url: impl Into<String>, visited_at: i64) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            id: web_doc_id(&url, visited_at),
            created_at: now,
            updated_at: now,
            domain: domain_of(&url),
            url,
            title: None,
            visited_at,
            visit_count: 1,
            transition: None,
            browser: None,
            duration_sec: None,
            tab_title: None,
        }
    }
}

fn domain_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.rsplit_once('@').map_or(host, |(_, host)| host);
    let host = host.split(':').next()?;
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}
