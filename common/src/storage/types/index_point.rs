use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{error::AppError, utils::embedding::EmbeddingVector};

/// Where an indexed item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    File,
    Web,
    Screen,
}

impl SourceKind {
    pub const ALL: [Self; 3] = [Self::File, Self::Web, Self::Screen];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Web => "web",
            Self::Screen => "screen",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" | "files" => Ok(Self::File),
            "web" | "browser" => Ok(Self::Web),
            "screen" | "screens" | "screenshot" => Ok(Self::Screen),
            other => Err(AppError::Validation(format!("unknown source '{other}'"))),
        }
    }
}

/// Payload stored next to every vector. `doc_id` links back to provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub doc_id: String,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[u32; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl PointPayload {
    pub fn new(doc_id: impl Into<String>, source: SourceKind) -> Self {
        Self {
            doc_id: doc_id.into(),
            source,
            page: None,
            bbox: None,
            chunk_index: None,
            timestamp: None,
            snippet: None,
            path: None,
            url: None,
        }
    }
}

/// A vector ready to be written into a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexPoint {
    pub point_id: String,
    pub vector: EmbeddingVector,
    pub payload: PointPayload,
}

/// A raw match returned by a collection search.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScoredPoint {
    pub point_id: String,
    pub score: f32,
    pub payload: PointPayload,
}
