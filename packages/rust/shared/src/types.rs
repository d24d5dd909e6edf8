//! Core domain types shared by the pipeline, storage, and collaborators.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PaperPipeError;

// ---------------------------------------------------------------------------
// PaperMetadata
// ---------------------------------------------------------------------------

/// Normalized metadata for one search result. Immutable once returned by search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperMetadata {
    /// Identifier, unique within the search provider's namespace (e.g. `2101.00001v1`).
    pub identifier: String,
    /// Paper title.
    pub title: String,
    /// Author names in publication order.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Abstract / summary text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Publication timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Location of the primary PDF artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    /// Raw provider payload kept for provenance/debugging.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl PaperMetadata {
    /// Minimal metadata with just an identifier and title.
    pub fn new(identifier: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            title: title.into(),
            authors: Vec::new(),
            summary: None,
            published: None,
            pdf_url: None,
            raw: serde_json::Value::Null,
        }
    }

    /// The URL to download the PDF from, falling back to the arXiv PDF endpoint.
    pub fn resolved_pdf_url(&self) -> String {
        self.pdf_url
            .clone()
            .unwrap_or_else(|| arxiv_pdf_url(&self.identifier))
    }
}

/// Canonical arXiv PDF location for an identifier.
pub fn arxiv_pdf_url(identifier: &str) -> String {
    format!("https://arxiv.org/pdf/{identifier}.pdf")
}

// ---------------------------------------------------------------------------
// PaperId
// ---------------------------------------------------------------------------

/// Internal row id of a persisted paper. Stable across upserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaperId(pub i64);

impl fmt::Display for PaperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stage / EventStatus
// ---------------------------------------------------------------------------

/// A named phase of per-paper processing, tracked in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Download,
    Extract,
    Embed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Extract => "extract",
            Self::Embed => "embed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PaperPipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "extract" => Ok(Self::Extract),
            "embed" => Ok(Self::Embed),
            other => Err(PaperPipeError::parse(format!("unknown stage '{other}'"))),
        }
    }
}

/// Status carried by a single processing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Success,
    Error,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = PaperPipeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(PaperPipeError::parse(format!("unknown status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// A paper row as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperRecord {
    pub id: PaperId,
    pub identifier: String,
    pub title: String,
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
    /// Local PDF path, once downloaded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<String>,
    /// Local extracted-text path, once extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_path: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Short projection of a paper returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSummary {
    pub id: PaperId,
    pub identifier: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_path: Option<String>,
}

/// One append-only entry of the processing log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEvent {
    pub id: i64,
    pub paper_id: PaperId,
    pub stage: Stage,
    pub status: EventStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tried_at: DateTime<Utc>,
}

/// A stored embedding vector for a paper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub paper_id: PaperId,
    pub model: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}
