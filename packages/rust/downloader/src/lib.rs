//! Retrying, atomic PDF downloader.
//!
//! A download streams the response body into `{dest}.part` next to the final
//! file and renames it onto `dest` only once every byte has been written and
//! synced. Readers therefore see either the previous file or the complete new
//! one, never a truncated body. Failed attempts are retried with exponential
//! backoff according to a [`RetryPolicy`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio_retry::Retry;
use tracing::{debug, info, instrument, warn};

use paperpipe_shared::{DownloadConfig, PaperPipeError, Result, RetryPolicy};

/// User-Agent string for download requests.
const USER_AGENT: &str = concat!("PaperPipe/", env!("CARGO_PKG_VERSION"));

/// Maximum redirect hops followed per request.
const MAX_REDIRECTS: usize = 10;

/// Request timeout for clients built on the caller's behalf.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// PdfFetcher
// ---------------------------------------------------------------------------

/// Fetches a remote PDF onto the local filesystem.
#[async_trait]
pub trait PdfFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the final path.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf>;
}

/// Build the HTTP client used for downloads.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(timeout)
        .build()
        .map_err(|e| PaperPipeError::Network(format!("failed to build HTTP client: {e}")))
}

/// [`PdfFetcher`] backed by a shared HTTP client and a retry policy.
///
/// The client is cheap to clone and safe to share across pipeline tasks.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    policy: RetryPolicy,
}

impl Downloader {
    /// Create a downloader from the `[download]` config section.
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            client,
            policy: RetryPolicy::from(config),
        })
    }

    /// Use an existing client (shared connection pool) with the given policy.
    pub fn with_client(client: Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl PdfFetcher for Downloader {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<PathBuf> {
        download(url, dest, Some(&self.client), &self.policy).await
    }
}

// ---------------------------------------------------------------------------
// download
// ---------------------------------------------------------------------------

/// Download `url` into `dest`, retrying failed attempts per `policy`.
///
/// When `client` is `None` a client scoped to this call is built and dropped
/// before returning. An existing file at `dest` is replaced. After the last
/// attempt fails the error is wrapped in [`PaperPipeError::Download`] along with
/// the number of attempts made.
#[instrument(skip(client, policy), fields(dest = %dest.display()))]
pub async fn download(
    url: &str,
    dest: &Path,
    client: Option<&Client>,
    policy: &RetryPolicy,
) -> Result<PathBuf> {
    let owned;
    let client = match client {
        Some(client) => client,
        None => {
            owned = build_client(DEFAULT_TIMEOUT)?;
            &owned
        }
    };

    let mut attempts: u32 = 0;
    let result = Retry::start(backoff_delays(policy), || {
        attempts += 1;
        let attempt = attempts;
        async move {
            let result = attempt_download(client, url, dest).await;
            if let Err(e) = &result {
                warn!(attempt, error = %e, "download attempt failed");
            }
            result
        }
    })
    .await;

    match result {
        Ok(path) => {
            info!(attempts, "download complete");
            Ok(path)
        }
        Err(e) => Err(PaperPipeError::download(url, attempts, e)),
    }
}

/// Delays between attempts: `initial`, `2 * initial`, `4 * initial`, ...
/// each capped at `max_backoff`. One fewer delay than attempts.
fn backoff_delays(policy: &RetryPolicy) -> impl Iterator<Item = Duration> + use<> {
    let initial = policy.initial_backoff;
    let max = policy.max_backoff;
    (0..policy.max_attempts.saturating_sub(1))
        .map(move |n| initial.saturating_mul(1u32 << n.min(31)).min(max))
}

/// `{dest}.part`, in the same directory as `dest`.
fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// One attempt: write the part file, then move it into place.
async fn attempt_download(client: &Client, url: &str, dest: &Path) -> Result<PathBuf> {
    let part = part_path(dest);
    match write_part(client, url, &part).await {
        Ok(bytes) => {
            if let Err(e) = tokio::fs::rename(&part, dest).await {
                remove_part(&part).await;
                return Err(PaperPipeError::io(dest, e));
            }
            debug!(bytes, "part file moved into place");
            Ok(dest.to_path_buf())
        }
        Err(e) => {
            remove_part(&part).await;
            Err(e)
        }
    }
}

/// Stream the response body into `part`, flushed and synced. Returns bytes written.
async fn write_part(client: &Client, url: &str, part: &Path) -> Result<u64> {
    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| PaperPipeError::Network(format!("GET {url}: {e}")))?;

    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PaperPipeError::io(parent, e))?;
    }

    let mut file = tokio::fs::File::create(part)
        .await
        .map_err(|e| PaperPipeError::io(part, e))?;

    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| PaperPipeError::Network(format!("reading body of {url}: {e}")))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| PaperPipeError::io(part, e))?;
        written += chunk.len() as u64;
    }

    file.flush().await.map_err(|e| PaperPipeError::io(part, e))?;
    file.sync_all().await.map_err(|e| PaperPipeError::io(part, e))?;
    Ok(written)
}

/// Best-effort cleanup of a failed attempt's part file.
async fn remove_part(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(part = %part.display(), error = %e, "could not remove part file");
        }
    }
}
