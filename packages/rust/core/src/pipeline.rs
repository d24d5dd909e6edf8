//! End-to-end `ingest` pipeline: query → search → dedup → download → extract → persist.
//!
//! One unit of work runs per unique paper. Units are spawned on a [`JoinSet`]
//! owned by the call and admitted through a [`Semaphore`], so at most
//! `concurrency` papers are in flight at once. A unit never returns an error:
//! whatever goes wrong with one paper ends up in its [`IngestOutcome`] and
//! the other papers carry on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use paperpipe_downloader::PdfFetcher;
use paperpipe_extract::TextExtractor;
use paperpipe_search::PaperSearch;
use paperpipe_shared::{EventStatus, PaperId, PaperMetadata, PaperPipeError, Result, Stage};
use paperpipe_storage::Storage;

/// Subdirectory of the output directory holding extracted text.
pub const TEXT_SUBDIR: &str = "texts";

/// Parameters for one ingest run.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Free-text search query.
    pub query: String,
    /// Upper bound on search results. Must be > 0.
    pub max_results: u32,
    /// Directory for PDFs; text goes to `{output_dir}/texts`.
    pub output_dir: PathBuf,
    /// Maximum papers processed at once. Must be > 0.
    pub concurrency: u32,
    /// Database for durable state. `None` runs without persistence.
    pub db_path: Option<PathBuf>,
}

/// The external capabilities a run depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub search: Arc<dyn PaperSearch>,
    pub fetcher: Arc<dyn PdfFetcher>,
    pub extractor: Arc<dyn TextExtractor>,
}

/// Result of processing one unique paper.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub meta: PaperMetadata,
    /// Deterministic PDF location, whether or not the download happened.
    pub pdf_path: PathBuf,
    /// Deterministic text location, whether or not extraction happened.
    pub text_path: PathBuf,
    pub success: bool,
    pub error: Option<String>,
    /// Bookkeeping problems that did not fail the paper.
    pub warnings: Vec<String>,
}

impl IngestOutcome {
    fn failed(meta: PaperMetadata, output_dir: &Path, error: impl Into<String>) -> Self {
        let (pdf_path, text_path) = paper_paths(output_dir, &meta.identifier);
        Self {
            meta,
            pdf_path,
            text_path,
            success: false,
            error: Some(error.into()),
            warnings: Vec::new(),
        }
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called each time a paper finishes, in completion order.
    fn item_finished(&self, outcome: &IngestOutcome, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, outcomes: &[IngestOutcome]);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn item_finished(&self, _outcome: &IngestOutcome, _current: usize, _total: usize) {}
    fn done(&self, _outcomes: &[IngestOutcome]) {}
}

/// PDF and text locations for `identifier` under `output_dir`.
///
/// The identifier is used verbatim as a file name.
pub fn paper_paths(output_dir: &Path, identifier: &str) -> (PathBuf, PathBuf) {
    (
        output_dir.join(format!("{identifier}.pdf")),
        output_dir
            .join(TEXT_SUBDIR)
            .join(format!("{identifier}.txt")),
    )
}

/// Drop repeated identifiers, keeping the first occurrence and the input order.
pub fn dedup_by_identifier(papers: Vec<PaperMetadata>) -> Vec<PaperMetadata> {
    let mut seen = HashSet::new();
    papers
        .into_iter()
        .filter(|p| seen.insert(p.identifier.clone()))
        .collect()
}

/// Run the full ingest pipeline.
///
/// Fails only for problems that affect the whole run: invalid limits, an
/// unusable output directory or database, or a failed search. Per-paper
/// problems are reported through the returned outcomes, one per unique
/// identifier, in search order.
#[instrument(
    skip_all,
    fields(
        query = %request.query,
        max_results = request.max_results,
        concurrency = request.concurrency
    )
)]
pub async fn ingest(
    request: &IngestRequest,
    collaborators: &Collaborators,
    progress: &dyn ProgressReporter,
) -> Result<Vec<IngestOutcome>> {
    let start = Instant::now();

    if request.max_results == 0 {
        return Err(PaperPipeError::validation("max_results must be greater than 0"));
    }
    if request.concurrency == 0 {
        return Err(PaperPipeError::validation("concurrency must be greater than 0"));
    }

    let text_dir = request.output_dir.join(TEXT_SUBDIR);
    tokio::fs::create_dir_all(&text_dir)
        .await
        .map_err(|e| PaperPipeError::io(&text_dir, e))?;

    // --- Phase 1: Search ---
    progress.phase("Searching");
    let found = collaborators
        .search
        .search(&request.query, request.max_results)
        .await?;
    let found_count = found.len();
    let papers = dedup_by_identifier(found);
    info!(found = found_count, unique = papers.len(), "search results");

    // --- Phase 2: Storage ---
    let storage = match &request.db_path {
        Some(path) => {
            progress.phase("Opening database");
            Some(Arc::new(Storage::open(path).await?))
        }
        None => None,
    };

    // --- Phase 3: Per-paper units ---
    progress.phase("Downloading papers");
    let semaphore = Arc::new(Semaphore::new(request.concurrency as usize));
    let mut tasks = JoinSet::new();

    for (index, meta) in papers.iter().cloned().enumerate() {
        let (pdf_path, text_path) = paper_paths(&request.output_dir, &meta.identifier);
        let unit = IngestUnit {
            meta,
            pdf_path,
            text_path,
            fetcher: collaborators.fetcher.clone(),
            extractor: collaborators.extractor.clone(),
            storage: storage.clone(),
        };
        let semaphore = semaphore.clone();

        tasks.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => unit.run().await,
                Err(e) => unit.abandon(format!("scheduler closed: {e}")),
            };
            (index, outcome)
        });
    }

    let total = papers.len();
    let mut slots: Vec<Option<IngestOutcome>> = (0..total).map(|_| None).collect();
    let mut finished = 0;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                finished += 1;
                progress.item_finished(&outcome, finished, total);
                slots[index] = Some(outcome);
            }
            Err(e) => warn!(error = %e, "ingest task did not complete"),
        }
    }

    // A slot is only empty when its task panicked.
    let mut outcomes = Vec::with_capacity(total);
    for (slot, meta) in slots.into_iter().zip(papers) {
        let outcome = match slot {
            Some(outcome) => outcome,
            None => {
                finished += 1;
                let outcome = IngestOutcome::failed(
                    meta,
                    &request.output_dir,
                    "processing task panicked",
                );
                progress.item_finished(&outcome, finished, total);
                outcome
            }
        };
        outcomes.push(outcome);
    }

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    info!(
        succeeded,
        failed = outcomes.len() - succeeded,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "ingest complete"
    );
    progress.done(&outcomes);

    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// IngestUnit
// ---------------------------------------------------------------------------

/// Everything one spawned task needs to process a single paper.
struct IngestUnit {
    meta: PaperMetadata,
    pdf_path: PathBuf,
    text_path: PathBuf,
    fetcher: Arc<dyn PdfFetcher>,
    extractor: Arc<dyn TextExtractor>,
    storage: Option<Arc<Storage>>,
}

impl IngestUnit {
    async fn run(self) -> IngestOutcome {
        let mut warnings = Vec::new();

        let paper_id = match &self.storage {
            Some(storage) => self.register(storage, &mut warnings).await,
            None => None,
        };

        let (success, error) = match self.fetch_and_extract().await {
            Ok(()) => {
                if let Some(storage) = &self.storage {
                    self.record_success(storage, &mut warnings).await;
                }
                debug!(identifier = %self.meta.identifier, "paper ingested");
                (true, None)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(identifier = %self.meta.identifier, error = %message, "paper failed");
                if let Some(storage) = &self.storage {
                    self.record_failure(storage, paper_id, &message, &mut warnings)
                        .await;
                }
                (false, Some(message))
            }
        };

        IngestOutcome {
            meta: self.meta,
            pdf_path: self.pdf_path,
            text_path: self.text_path,
            success,
            error,
            warnings,
        }
    }

    fn abandon(self, error: String) -> IngestOutcome {
        IngestOutcome {
            meta: self.meta,
            pdf_path: self.pdf_path,
            text_path: self.text_path,
            success: false,
            error: Some(error),
            warnings: Vec::new(),
        }
    }

    async fn fetch_and_extract(&self) -> Result<()> {
        let url = self.meta.resolved_pdf_url();
        self.fetcher.fetch(&url, &self.pdf_path).await?;

        let text = self.extractor.extract(&self.pdf_path).await?;
        tokio::fs::write(&self.text_path, text)
            .await
            .map_err(|e| PaperPipeError::io(&self.text_path, e))?;
        Ok(())
    }

    /// Upsert the metadata and log the pending download before any network work.
    async fn register(&self, storage: &Storage, warnings: &mut Vec<String>) -> Option<PaperId> {
        let paper_id = match storage.upsert_paper(&self.meta, None, None).await {
            Ok(id) => id,
            Err(e) => {
                self.note(warnings, "register paper", &e);
                return None;
            }
        };
        if let Err(e) = storage
            .record_event(paper_id, Stage::Download, EventStatus::Pending, None)
            .await
        {
            self.note(warnings, "record pending download", &e);
        }
        Some(paper_id)
    }

    async fn record_success(&self, storage: &Storage, warnings: &mut Vec<String>) {
        let paper_id = match storage
            .upsert_paper(&self.meta, Some(&self.pdf_path), Some(&self.text_path))
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.note(warnings, "store paths", &e);
                return;
            }
        };
        for stage in [Stage::Download, Stage::Extract] {
            if let Err(e) = storage
                .record_event(paper_id, stage, EventStatus::Success, None)
                .await
            {
                self.note(warnings, &format!("record {stage} success"), &e);
            }
        }
    }

    async fn record_failure(
        &self,
        storage: &Storage,
        paper_id: Option<PaperId>,
        message: &str,
        warnings: &mut Vec<String>,
    ) {
        let paper_id = match paper_id {
            Some(id) => id,
            // Registration failed earlier; try once more so the failure is on record.
            None => match storage.upsert_paper(&self.meta, None, None).await {
                Ok(id) => id,
                Err(e) => {
                    self.note(warnings, "register failed paper", &e);
                    return;
                }
            },
        };
        if let Err(e) = storage
            .record_event(paper_id, Stage::Download, EventStatus::Error, Some(message))
            .await
        {
            self.note(warnings, "record download error", &e);
        }
    }

    fn note(&self, warnings: &mut Vec<String>, action: &str, error: &PaperPipeError) {
        warn!(identifier = %self.meta.identifier, action, error = %error, "bookkeeping failed");
        warnings.push(format!("{action}: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use paperpipe_downloader::Downloader;
    use paperpipe_shared::{DownloadConfig, RetryPolicy};

    // -- fakes ---------------------------------------------------------------

    struct FakeSearch {
        results: Vec<PaperMetadata>,
        calls: AtomicUsize,
    }

    impl FakeSearch {
        fn new(results: Vec<PaperMetadata>) -> Arc<Self> {
            Arc::new(Self {
                results,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PaperSearch for FakeSearch {
        async fn search(&self, _query: &str, max_results: u32) -> Result<Vec<PaperMetadata>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .results
                .iter()
                .take(max_results as usize)
                .cloned()
                .collect())
        }
    }

    struct FailingSearch;

    #[async_trait]
    impl PaperSearch for FailingSearch {
        async fn search(&self, _query: &str, _max_results: u32) -> Result<Vec<PaperMetadata>> {
            Err(PaperPipeError::Network("search backend down".into()))
        }
    }

    /// Writes a fake PDF, or fails for URLs containing one of `fail_on`.
    #[derive(Default)]
    struct FakeFetcher {
        fail_on: Vec<String>,
        delay: Duration,
        urls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl PdfFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf> {
            self.urls.lock().unwrap().push(url.to_string());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_on.iter().any(|id| url.contains(id.as_str())) {
                return Err(PaperPipeError::download(
                    url,
                    3,
                    PaperPipeError::Network("HTTP 500".into()),
                ));
            }
            tokio::fs::write(dest, format!("PDF from {url}")).await.unwrap();
            Ok(dest.to_path_buf())
        }
    }

    /// "Extracts" by echoing the file contents.
    struct EchoExtractor;

    #[async_trait]
    impl TextExtractor for EchoExtractor {
        async fn extract(&self, pdf_path: &Path) -> Result<String> {
            let body = tokio::fs::read_to_string(pdf_path).await.unwrap();
            Ok(format!("text of {body}"))
        }
    }

    /// Counts units between their fetch starting and their extraction ending.
    #[derive(Default)]
    struct UnitGauge {
        open: AtomicUsize,
        peak: AtomicUsize,
    }

    struct GaugedFetcher(Arc<UnitGauge>);

    #[async_trait]
    impl PdfFetcher for GaugedFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf> {
            let now = self.0.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(dest, format!("PDF from {url}")).await.unwrap();
            Ok(dest.to_path_buf())
        }
    }

    struct GaugedExtractor(Arc<UnitGauge>);

    #[async_trait]
    impl TextExtractor for GaugedExtractor {
        async fn extract(&self, pdf_path: &Path) -> Result<String> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let text = EchoExtractor.extract(pdf_path).await;
            self.0.open.fetch_sub(1, Ordering::SeqCst);
            text
        }
    }

    /// Panics for one identifier, echoes otherwise.
    struct PanickyExtractor(&'static str);

    #[async_trait]
    impl TextExtractor for PanickyExtractor {
        async fn extract(&self, pdf_path: &Path) -> Result<String> {
            if pdf_path.to_string_lossy().contains(self.0) {
                panic!("extractor blew up");
            }
            EchoExtractor.extract(pdf_path).await
        }
    }

    // -- helpers -------------------------------------------------------------

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("pp_ingest_{}", Uuid::now_v7()))
    }

    fn paper(id: &str) -> PaperMetadata {
        let mut meta = PaperMetadata::new(id, format!("Paper {id}"));
        meta.pdf_url = Some(format!("https://example.org/pdf/{id}"));
        meta
    }

    fn request(output_dir: PathBuf, concurrency: u32, db_path: Option<PathBuf>) -> IngestRequest {
        IngestRequest {
            query: "test query".into(),
            max_results: 10,
            output_dir,
            concurrency,
            db_path,
        }
    }

    fn collaborators(
        search: Arc<dyn PaperSearch>,
        fetcher: Arc<dyn PdfFetcher>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Collaborators {
        Collaborators {
            search,
            fetcher,
            extractor,
        }
    }

    fn identifiers(outcomes: &[IngestOutcome]) -> Vec<&str> {
        outcomes.iter().map(|o| o.meta.identifier.as_str()).collect()
    }

    // -- tests ---------------------------------------------------------------

    #[test]
    fn paths_are_deterministic() {
        let (pdf, txt) = paper_paths(Path::new("/out"), "2101.00001v1");
        assert_eq!(pdf, PathBuf::from("/out/2101.00001v1.pdf"));
        assert_eq!(txt, PathBuf::from("/out/texts/2101.00001v1.txt"));
    }

    #[test]
    fn dedup_keeps_first_occurrence_in_order() {
        let mut dup = paper("a");
        dup.title = "Duplicate A".into();
        let unique = dedup_by_identifier(vec![paper("a"), paper("b"), dup, paper("c")]);
        assert_eq!(
            unique.iter().map(|p| p.identifier.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        assert_eq!(unique[0].title, "Paper a");
    }

    #[tokio::test]
    async fn duplicate_result_is_processed_once() {
        let out = temp_dir();
        let search = FakeSearch::new(vec![
            paper("2101.00001"),
            paper("2101.00002"),
            paper("2101.00001"),
        ]);
        let fetcher = Arc::new(FakeFetcher::default());
        let collab = collaborators(search.clone(), fetcher.clone(), Arc::new(EchoExtractor));

        let outcomes = ingest(&request(out.clone(), 3, None), &collab, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(identifiers(&outcomes), vec!["2101.00001", "2101.00002"]);
        assert!(outcomes.iter().all(|o| o.success && o.error.is_none()));
        assert_eq!(fetcher.urls.lock().unwrap().len(), 2);
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);

        let text = std::fs::read_to_string(out.join("texts").join("2101.00001.txt")).unwrap();
        assert_eq!(text, "text of PDF from https://example.org/pdf/2101.00001");
    }

    #[tokio::test]
    async fn one_failure_does_not_affect_siblings() {
        let out = temp_dir();
        let search = FakeSearch::new(vec![paper("ok-1"), paper("bad"), paper("ok-2")]);
        let fetcher = Arc::new(FakeFetcher {
            fail_on: vec!["bad".into()],
            ..FakeFetcher::default()
        });
        let collab = collaborators(search, fetcher, Arc::new(EchoExtractor));

        let outcomes = ingest(&request(out.clone(), 2, None), &collab, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(identifiers(&outcomes), vec!["ok-1", "bad", "ok-2"]);
        assert!(outcomes[0].success);
        assert!(outcomes[2].success);

        let bad = &outcomes[1];
        assert!(!bad.success);
        assert!(bad.error.as_deref().unwrap().contains("HTTP 500"));
        assert_eq!(bad.pdf_path, out.join("bad.pdf"));
        assert!(!bad.text_path.exists());
    }

    #[tokio::test]
    async fn in_flight_units_never_exceed_concurrency() {
        let papers: Vec<_> = (0..8).map(|i| paper(&format!("p{i}"))).collect();
        let gauge = Arc::new(UnitGauge::default());
        let collab = collaborators(
            FakeSearch::new(papers),
            Arc::new(GaugedFetcher(gauge.clone())),
            Arc::new(GaugedExtractor(gauge.clone())),
        );

        let outcomes = ingest(&request(temp_dir(), 2, None), &collab, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 8);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrency_one_runs_sequentially() {
        let papers: Vec<_> = (0..4).map(|i| paper(&format!("s{i}"))).collect();
        let fetcher = Arc::new(FakeFetcher {
            delay: Duration::from_millis(10),
            ..FakeFetcher::default()
        });
        let collab = collaborators(
            FakeSearch::new(papers),
            fetcher.clone(),
            Arc::new(EchoExtractor),
        );

        ingest(&request(temp_dir(), 1, None), &collab, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_limits_are_rejected_before_search() {
        let search = FakeSearch::new(vec![paper("x")]);
        let collab = collaborators(
            search.clone(),
            Arc::new(FakeFetcher::default()),
            Arc::new(EchoExtractor),
        );

        let mut req = request(temp_dir(), 0, None);
        let err = ingest(&req, &collab, &SilentProgress).await.unwrap_err();
        assert!(matches!(err, PaperPipeError::Validation { .. }));

        req.concurrency = 1;
        req.max_results = 0;
        let err = ingest(&req, &collab, &SilentProgress).await.unwrap_err();
        assert!(matches!(err, PaperPipeError::Validation { .. }));

        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn search_failure_is_fatal() {
        let fetcher = Arc::new(FakeFetcher::default());
        let collab = collaborators(
            Arc::new(FailingSearch),
            fetcher.clone(),
            Arc::new(EchoExtractor),
        );

        let err = ingest(&request(temp_dir(), 2, None), &collab, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, PaperPipeError::Network(_)));
        assert!(fetcher.urls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_search_yields_no_outcomes() {
        let collab = collaborators(
            FakeSearch::new(Vec::new()),
            Arc::new(FakeFetcher::default()),
            Arc::new(EchoExtractor),
        );
        let outcomes = ingest(&request(temp_dir(), 2, None), &collab, &SilentProgress)
            .await
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn missing_pdf_url_falls_back_to_arxiv() {
        let fetcher = Arc::new(FakeFetcher::default());
        let collab = collaborators(
            FakeSearch::new(vec![PaperMetadata::new("2101.00003", "No link")]),
            fetcher.clone(),
            Arc::new(EchoExtractor),
        );
        ingest(&request(temp_dir(), 1, None), &collab, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(
            fetcher.urls.lock().unwrap().as_slice(),
            ["https://arxiv.org/pdf/2101.00003.pdf".to_string()]
        );
    }

    #[tokio::test]
    async fn panicking_unit_becomes_a_failure_outcome() {
        let collab = collaborators(
            FakeSearch::new(vec![paper("calm"), paper("boom"), paper("quiet")]),
            Arc::new(FakeFetcher::default()),
            Arc::new(PanickyExtractor("boom")),
        );

        let outcomes = ingest(&request(temp_dir(), 3, None), &collab, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(identifiers(&outcomes), vec!["calm", "boom", "quiet"]);
        assert!(outcomes[0].success);
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("panicked"));
        assert!(outcomes[2].success);
    }

    #[tokio::test]
    async fn persistence_records_paths_and_events() {
        let out = temp_dir();
        let db = out.join("papers.db");
        let fetcher = Arc::new(FakeFetcher {
            fail_on: vec!["fails".into()],
            ..FakeFetcher::default()
        });
        let collab = collaborators(
            FakeSearch::new(vec![paper("works"), paper("fails")]),
            fetcher,
            Arc::new(EchoExtractor),
        );

        let req = request(out.clone(), 2, Some(db.clone()));
        let outcomes = ingest(&req, &collab, &SilentProgress).await.unwrap();
        assert!(outcomes.iter().all(|o| o.warnings.is_empty()));

        let storage = Storage::open(&db).await.unwrap();

        let ok = storage.get_by_identifier("works").await.unwrap().unwrap();
        assert_eq!(ok.pdf_path.as_deref(), Some(out.join("works.pdf").to_str().unwrap()));
        assert_eq!(
            ok.text_path.as_deref(),
            Some(out.join("texts").join("works.txt").to_str().unwrap())
        );
        let events: Vec<_> = storage
            .events_for_paper(ok.id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.stage, e.status))
            .collect();
        assert_eq!(
            events,
            vec![
                (Stage::Download, EventStatus::Pending),
                (Stage::Download, EventStatus::Success),
                (Stage::Extract, EventStatus::Success),
            ]
        );

        let bad = storage.get_by_identifier("fails").await.unwrap().unwrap();
        assert!(bad.pdf_path.is_none());
        assert!(bad.text_path.is_none());
        let events = storage.events_for_paper(bad.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].status, EventStatus::Error);
        assert!(events[1].error.as_deref().unwrap().contains("HTTP 500"));
        assert_eq!(
            storage.latest_status(bad.id, Stage::Download).await.unwrap(),
            Some(EventStatus::Error)
        );
    }

    #[tokio::test]
    async fn rerun_keeps_one_record_per_identifier() {
        let out = temp_dir();
        let db = out.join("papers.db");
        let collab = collaborators(
            FakeSearch::new(vec![paper("again")]),
            Arc::new(FakeFetcher::default()),
            Arc::new(EchoExtractor),
        );
        let req = request(out, 1, Some(db.clone()));

        ingest(&req, &collab, &SilentProgress).await.unwrap();
        ingest(&req, &collab, &SilentProgress).await.unwrap();

        let storage = Storage::open(&db).await.unwrap();
        let record = storage.get_by_identifier("again").await.unwrap().unwrap();
        assert_eq!(storage.events_for_paper(record.id).await.unwrap().len(), 6);
        assert_eq!(storage.papers_without_embeddings(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn end_to_end_with_real_downloader() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pdf/2101.00042"))
            .respond_with(ResponseTemplate::new(200).set_body_string("%PDF-1.4 fake"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pdf/2101.00043"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let mut good = PaperMetadata::new("2101.00042", "Served");
        good.pdf_url = Some(format!("{}/pdf/2101.00042", server.uri()));
        let mut bad = PaperMetadata::new("2101.00043", "Broken");
        bad.pdf_url = Some(format!("{}/pdf/2101.00043", server.uri()));

        let downloader = Downloader::with_client(
            paperpipe_downloader::build_client(Duration::from_secs(5)).unwrap(),
            RetryPolicy::immediate(2),
        );
        let collab = collaborators(
            FakeSearch::new(vec![good, bad]),
            Arc::new(downloader),
            Arc::new(EchoExtractor),
        );
        let out = temp_dir();

        let outcomes = ingest(&request(out.clone(), 2, None), &collab, &SilentProgress)
            .await
            .unwrap();

        assert!(outcomes[0].success);
        assert_eq!(std::fs::read_to_string(&outcomes[0].pdf_path).unwrap(), "%PDF-1.4 fake");
        assert!(!outcomes[1].success);
        assert!(outcomes[1].error.as_deref().unwrap().contains("after 2 attempt(s)"));
        assert!(!outcomes[1].pdf_path.exists());
        server.verify().await;

        // The default config still builds a usable downloader.
        assert!(Downloader::new(&DownloadConfig::default()).is_ok());
    }
}
