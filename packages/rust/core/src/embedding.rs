//! Batch embedding of stored papers that have no vector yet.
//!
//! Papers are processed one at a time, optionally in batches with a pause in
//! between to stay under provider rate limits. A failing paper is logged and
//! recorded as an `embed: error` event; the rest of the run continues.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use paperpipe_embed::Embedder;
use paperpipe_extract::clean_text;
use paperpipe_shared::{EmbeddingConfig, EventStatus, PaperId, PaperSummary, Result, Stage};
use paperpipe_storage::Storage;

/// How to split the work into batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchConfig {
    /// Papers per batch. `None` or `Some(0)` processes everything in one pass.
    pub batch_size: Option<usize>,
    /// Pause between consecutive batches (never after the last one).
    pub delay: Option<Duration>,
}

impl From<&EmbeddingConfig> for BatchConfig {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            delay: config.batch_delay_ms.map(Duration::from_millis),
        }
    }
}

/// Options for [`embed_missing`].
#[derive(Debug, Clone, Default)]
pub struct EmbedOptions {
    /// Only embed the first `limit` papers still missing a vector.
    pub limit: Option<u32>,
    pub batch: BatchConfig,
}

/// Result of embedding one paper.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedOutcome {
    pub paper_id: PaperId,
    pub identifier: String,
    pub success: bool,
    /// Row id of the stored vector.
    pub embedding_id: Option<i64>,
    pub dimensions: Option<usize>,
    pub error: Option<String>,
}

/// Embed every stored paper that has no embedding yet.
///
/// Only a failure to list the pending papers is returned as an error.
#[instrument(skip_all, fields(model = %embedder.model()))]
pub async fn embed_missing(
    storage: &Storage,
    embedder: &dyn Embedder,
    options: &EmbedOptions,
) -> Result<Vec<EmbedOutcome>> {
    let papers = storage.papers_without_embeddings(options.limit).await?;
    if papers.is_empty() {
        info!("no papers missing embeddings");
        return Ok(Vec::new());
    }

    let batch_size = match options.batch.batch_size {
        Some(n) if n > 0 => n,
        _ => papers.len(),
    };
    info!(papers = papers.len(), batch_size, "embedding papers");

    let mut outcomes = Vec::with_capacity(papers.len());
    for (index, batch) in papers.chunks(batch_size).enumerate() {
        if index > 0 {
            if let Some(delay) = options.batch.delay.filter(|d| !d.is_zero()) {
                debug!(delay_ms = delay.as_millis() as u64, "pausing between batches");
                tokio::time::sleep(delay).await;
            }
        }
        for paper in batch {
            outcomes.push(embed_one(storage, embedder, paper).await);
        }
    }

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    info!(succeeded, failed = outcomes.len() - succeeded, "embedding complete");
    Ok(outcomes)
}

async fn embed_one(
    storage: &Storage,
    embedder: &dyn Embedder,
    paper: &PaperSummary,
) -> EmbedOutcome {
    let text = load_text(paper).await;

    let result = match embedder.embed(&text).await {
        Ok(vector) => storage
            .save_embedding(paper.id, embedder.model(), &vector)
            .await
            .map(|id| (id, vector.len())),
        Err(e) => Err(e),
    };

    match result {
        Ok((embedding_id, dimensions)) => {
            record(storage, paper, EventStatus::Success, None).await;
            debug!(identifier = %paper.identifier, dimensions, "paper embedded");
            EmbedOutcome {
                paper_id: paper.id,
                identifier: paper.identifier.clone(),
                success: true,
                embedding_id: Some(embedding_id),
                dimensions: Some(dimensions),
                error: None,
            }
        }
        Err(e) => {
            let message = e.to_string();
            warn!(identifier = %paper.identifier, error = %message, "embedding failed");
            record(storage, paper, EventStatus::Error, Some(&message)).await;
            EmbedOutcome {
                paper_id: paper.id,
                identifier: paper.identifier.clone(),
                success: false,
                embedding_id: None,
                dimensions: None,
                error: Some(message),
            }
        }
    }
}

async fn record(
    storage: &Storage,
    paper: &PaperSummary,
    status: EventStatus,
    error: Option<&str>,
) {
    if let Err(e) = storage.record_event(paper.id, Stage::Embed, status, error).await {
        warn!(identifier = %paper.identifier, error = %e, "could not record embed event");
    }
}

/// The paper's extracted text, or its title and summary when the text file is
/// missing, unreadable, or empty.
async fn load_text(paper: &PaperSummary) -> String {
    if let Some(path) = &paper.text_path {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => {
                let text = clean_text(&raw);
                if !text.is_empty() {
                    return text;
                }
            }
            Err(e) => debug!(path = %path, error = %e, "text file unavailable"),
        }
    }

    let fallback = match &paper.summary {
        Some(summary) => format!("{}\n\n{}", paper.title, summary),
        None => paper.title.clone(),
    };
    clean_text(&fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;
    use uuid::Uuid;

    use paperpipe_shared::{PaperMetadata, PaperPipeError};

    /// Records every input; fails for texts containing `fail_on`.
    #[derive(Default)]
    struct RecordingEmbedder {
        inputs: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Embedder for RecordingEmbedder {
        fn model(&self) -> &str {
            "fake-model"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.inputs.lock().unwrap().push(text.to_string());
            if self.fail_on.is_some_and(|needle| text.contains(needle)) {
                return Err(PaperPipeError::Embedding("rate limited".into()));
            }
            Ok(vec![text.len() as f32, 1.0])
        }
    }

    async fn test_storage() -> Storage {
        let path = std::env::temp_dir().join(format!("pp_embed_{}.db", Uuid::now_v7()));
        Storage::open(&path).await.unwrap()
    }

    async fn add_paper(storage: &Storage, id: &str, text: Option<&str>) -> PaperId {
        let mut meta = PaperMetadata::new(id, format!("Title {id}"));
        meta.summary = Some(format!("Summary {id}"));
        let text_path = match text {
            Some(body) => {
                let path: PathBuf =
                    std::env::temp_dir().join(format!("pp_text_{}_{id}.txt", Uuid::now_v7()));
                std::fs::write(&path, body).unwrap();
                Some(path)
            }
            None => None,
        };
        storage
            .upsert_paper(&meta, None, text_path.as_deref())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn batch_size_one_embeds_each_paper_once() {
        let storage = test_storage().await;
        let ids = [
            add_paper(&storage, "a", Some("alpha body")).await,
            add_paper(&storage, "b", Some("beta body")).await,
            add_paper(&storage, "c", Some("gamma body")).await,
        ];
        let embedder = RecordingEmbedder::default();
        let options = EmbedOptions {
            limit: None,
            batch: BatchConfig {
                batch_size: Some(1),
                delay: None,
            },
        };

        let outcomes = embed_missing(&storage, &embedder, &options).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(embedder.inputs.lock().unwrap().len(), 3);
        for id in ids {
            let stored = storage.embeddings_for_paper(id).await.unwrap();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].model, "fake-model");
            assert_eq!(
                storage.latest_status(id, Stage::Embed).await.unwrap(),
                Some(EventStatus::Success)
            );
        }

        // Nothing left to do on a second run.
        let again = embed_missing(&storage, &embedder, &options).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn missing_text_falls_back_to_title_and_summary() {
        let storage = test_storage().await;
        add_paper(&storage, "no-text", None).await;
        let embedder = RecordingEmbedder::default();

        embed_missing(&storage, &embedder, &EmbedOptions::default())
            .await
            .unwrap();

        assert_eq!(
            embedder.inputs.lock().unwrap().as_slice(),
            ["Title no-text\n\nSummary no-text".to_string()]
        );
    }

    #[tokio::test]
    async fn text_is_cleaned_before_embedding() {
        let storage = test_storage().await;
        add_paper(&storage, "messy", Some("  lots   of\r\n\r\n\r\n\r\nspace ")).await;
        let embedder = RecordingEmbedder::default();

        embed_missing(&storage, &embedder, &EmbedOptions::default())
            .await
            .unwrap();

        assert_eq!(
            embedder.inputs.lock().unwrap().as_slice(),
            ["lots of\n\nspace".to_string()]
        );
    }

    #[tokio::test]
    async fn failure_is_recorded_and_siblings_continue() {
        let storage = test_storage().await;
        let good = add_paper(&storage, "good", Some("fine text")).await;
        let bad = add_paper(&storage, "bad", Some("poison text")).await;
        let embedder = RecordingEmbedder {
            fail_on: Some("poison"),
            ..RecordingEmbedder::default()
        };

        let outcomes = embed_missing(&storage, &embedder, &EmbedOptions::default())
            .await
            .unwrap();

        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("rate limited"));
        assert_eq!(storage.embeddings_for_paper(good).await.unwrap().len(), 1);
        assert!(storage.embeddings_for_paper(bad).await.unwrap().is_empty());

        let events = storage.events_for_paper(bad).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stage, Stage::Embed);
        assert_eq!(events[0].status, EventStatus::Error);

        // The failed paper is still pending for the next run.
        let pending = storage.papers_without_embeddings(None).await.unwrap();
        assert_eq!(pending.iter().map(|p| p.id).collect::<Vec<_>>(), vec![bad]);
    }

    #[tokio::test]
    async fn limit_caps_the_run() {
        let storage = test_storage().await;
        for id in ["l1", "l2", "l3"] {
            add_paper(&storage, id, Some("body")).await;
        }
        let embedder = RecordingEmbedder::default();
        let options = EmbedOptions {
            limit: Some(2),
            ..EmbedOptions::default()
        };

        let outcomes = embed_missing(&storage, &embedder, &options).await.unwrap();
        assert_eq!(
            outcomes.iter().map(|o| o.identifier.as_str()).collect::<Vec<_>>(),
            vec!["l1", "l2"]
        );
    }

    #[tokio::test]
    async fn delay_applies_between_batches_only() {
        let storage = test_storage().await;
        for id in ["d1", "d2", "d3"] {
            add_paper(&storage, id, Some("body")).await;
        }
        let embedder = RecordingEmbedder::default();
        let options = EmbedOptions {
            limit: None,
            batch: BatchConfig {
                batch_size: Some(2),
                delay: Some(Duration::from_millis(200)),
            },
        };

        let start = Instant::now();
        let outcomes = embed_missing(&storage, &embedder, &options).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcomes.len(), 3);
        // Two batches: exactly one pause.
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    }

    #[test]
    fn batch_config_from_embedding_config() {
        let config = EmbeddingConfig {
            batch_size: Some(4),
            batch_delay_ms: Some(500),
            ..EmbeddingConfig::default()
        };
        assert_eq!(
            BatchConfig::from(&config),
            BatchConfig {
                batch_size: Some(4),
                delay: Some(Duration::from_millis(500)),
            }
        );
    }
}
