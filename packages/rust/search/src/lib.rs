//! Paper search providers.
//!
//! [`PaperSearch`] is the seam the ingestion pipeline calls exactly once per
//! run. [`ArxivClient`] implements it against the arXiv Atom API.

mod atom;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, instrument};

use paperpipe_shared::{PaperMetadata, PaperPipeError, Result, SearchConfig};

pub use atom::{identifier_from_entry_id, parse_feed};

/// User-Agent string for search requests.
const USER_AGENT: &str = concat!("PaperPipe/", env!("CARGO_PKG_VERSION"));

/// Looks up paper metadata for a free-text query.
#[async_trait]
pub trait PaperSearch: Send + Sync {
    /// Return at most `max_results` papers matching `query`, in provider order.
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PaperMetadata>>;
}

/// arXiv Atom API client.
#[derive(Debug, Clone)]
pub struct ArxivClient {
    client: Client,
    base_url: String,
}

impl ArxivClient {
    /// Create a client for the endpoint in the `[search]` config section.
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PaperPipeError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, &config.base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl PaperSearch for ArxivClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn search(&self, query: &str, max_results: u32) -> Result<Vec<PaperMetadata>> {
        let max = max_results.to_string();

        let body = self
            .client
            .get(&self.base_url)
            .query(&[
                ("search_query", query),
                ("start", "0"),
                ("max_results", max.as_str()),
                ("sortBy", "relevance"),
                ("sortOrder", "descending"),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PaperPipeError::Network(format!("arXiv search failed: {e}")))?
            .text()
            .await
            .map_err(|e| PaperPipeError::Network(format!("reading arXiv response: {e}")))?;

        debug!(bytes = body.len(), "received Atom feed");

        let mut papers = parse_feed(&body)?;
        papers.truncate(max_results as usize);

        info!(results = papers.len(), "search complete");
        Ok(papers)
    }
}
