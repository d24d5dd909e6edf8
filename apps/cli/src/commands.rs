//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use paperpipe_core::embedding::{BatchConfig, EmbedOptions, embed_missing};
use paperpipe_core::pipeline::{
    Collaborators, IngestOutcome, IngestRequest, ProgressReporter, ingest,
};
use paperpipe_downloader::{Downloader, PdfFetcher};
use paperpipe_embed::build_embedder;
use paperpipe_extract::PdfTextExtractor;
use paperpipe_search::ArxivClient;
use paperpipe_shared::{
    AppConfig, EmbeddingBackend, Stage, arxiv_pdf_url, init_config, load_config, load_config_from,
};
use paperpipe_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// PaperPipe: fetch academic papers into a local, searchable corpus.
#[derive(Debug, Parser)]
#[command(
    name = "paperpipe",
    version,
    about = "Search arXiv, download and extract papers, and compute embeddings.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Show what would happen without touching the network or disk.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Config file to use instead of ~/.paperpipe/paperpipe.toml.
    #[arg(long, global = true, env = "PAPERPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Embedding backend selectable on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum BackendArg {
    Openai,
    Local,
}

/// Processing stage selectable on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum StageArg {
    Download,
    Extract,
    Embed,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Download => Self::Download,
            StageArg::Extract => Self::Extract,
            StageArg::Embed => Self::Embed,
        }
    }
}

impl From<BackendArg> for EmbeddingBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Openai => Self::OpenAi,
            BackendArg::Local => Self::Local,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Download a single paper's PDF by arXiv identifier.
    Fetch {
        /// arXiv identifier (e.g. 2101.00001).
        id: String,

        /// Output directory (defaults to defaults.output_dir).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Search arXiv and ingest every result.
    Ingest {
        /// Search query.
        query: String,

        /// Maximum number of search results.
        #[arg(short = 'n', long)]
        max_results: Option<u32>,

        /// Output directory for PDFs and extracted text.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Papers processed at once.
        #[arg(short, long)]
        concurrency: Option<u32>,

        /// SQLite database for metadata and processing history.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Compute embeddings for stored papers that have none.
    Embed {
        /// SQLite database written by `ingest --db`.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Embedding backend.
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,

        /// Embedding model (backend default when unset).
        #[arg(long)]
        model: Option<String>,

        /// Embed at most this many papers.
        #[arg(long)]
        limit: Option<u32>,

        /// Papers per batch.
        #[arg(long)]
        batch_size: Option<usize>,

        /// Pause between batches, in milliseconds.
        #[arg(long)]
        batch_delay_ms: Option<u64>,
    },

    /// List papers with a pending event for a processing stage.
    Pending {
        /// Processing stage to inspect.
        #[arg(long, value_enum, default_value = "download")]
        stage: StageArg,

        /// SQLite database to inspect.
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Debug, Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "paperpipe=info",
        1 => "paperpipe=debug",
        _ => "paperpipe=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    let dry_run = cli.dry_run;

    match cli.command {
        Command::Fetch { id, output } => cmd_fetch(&config, &id, output, dry_run).await,
        Command::Ingest {
            query,
            max_results,
            output,
            concurrency,
            db,
        } => {
            let request = IngestRequest {
                query,
                max_results: max_results.unwrap_or(config.defaults.max_results),
                output_dir: output.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir)),
                concurrency: concurrency.unwrap_or(config.defaults.concurrency),
                db_path: db.or_else(|| config.defaults.db_path.as_ref().map(PathBuf::from)),
            };
            cmd_ingest(&config, &request, dry_run).await
        }
        Command::Embed {
            db,
            backend,
            model,
            limit,
            batch_size,
            batch_delay_ms,
        } => {
            let mut embedding = config.embedding.clone();
            if let Some(backend) = backend {
                embedding.backend = backend.into();
            }
            if model.is_some() {
                embedding.model = model;
            }
            if batch_size.is_some() {
                embedding.batch_size = batch_size;
            }
            if batch_delay_ms.is_some() {
                embedding.batch_delay_ms = batch_delay_ms;
            }
            let db_path = require_db(db, &config)?;
            let options = EmbedOptions {
                limit,
                batch: BatchConfig::from(&embedding),
            };
            cmd_embed(&db_path, &embedding, &options, dry_run).await
        }
        Command::Pending { stage, db } => {
            let db_path = require_db(db, &config)?;
            cmd_pending(&db_path, stage.into(), dry_run).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(dry_run).await,
            ConfigAction::Show => cmd_config_show(&config).await,
        },
    }
}

fn require_db(db: Option<PathBuf>, config: &AppConfig) -> Result<PathBuf> {
    db.or_else(|| config.defaults.db_path.as_ref().map(PathBuf::from))
        .ok_or_else(|| eyre!("a database is required: pass --db or set defaults.db_path"))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_fetch(
    config: &AppConfig,
    id: &str,
    output: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let output_dir = output.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
    let url = arxiv_pdf_url(id);
    let dest = output_dir.join(format!("{id}.pdf"));

    if dry_run {
        println!("Dry run: would download {url} -> {}", dest.display());
        return Ok(());
    }

    info!(id, %url, "fetching paper");
    let downloader = Downloader::new(&config.download)?;
    let path = downloader.fetch(&url, &dest).await?;
    println!("Downloaded: {}", path.display());
    Ok(())
}

async fn cmd_ingest(config: &AppConfig, request: &IngestRequest, dry_run: bool) -> Result<()> {
    if dry_run {
        println!(
            "Dry run: would ingest query='{}' max_results={} concurrency={} -> {}",
            request.query,
            request.max_results,
            request.concurrency,
            request.output_dir.display()
        );
        if let Some(db) = &request.db_path {
            println!("         recording to {}", db.display());
        }
        return Ok(());
    }

    let collaborators = Collaborators {
        search: Arc::new(ArxivClient::new(&config.search)?),
        fetcher: Arc::new(Downloader::new(&config.download)?),
        extractor: Arc::new(PdfTextExtractor),
    };

    let reporter = CliProgress::new();
    let outcomes = ingest(request, &collaborators, &reporter).await?;

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    println!();
    println!(
        "  Ingested {succeeded}/{} papers into {}",
        outcomes.len(),
        request.output_dir.display()
    );
    for outcome in &outcomes {
        let mark = if outcome.success { "ok  " } else { "FAIL" };
        println!("  {mark} {}: {}", outcome.meta.identifier, outcome.meta.title);
        if let Some(error) = &outcome.error {
            println!("       {error}");
        }
        for warning in &outcome.warnings {
            println!("       warning: {warning}");
        }
    }
    println!();

    Ok(())
}

async fn cmd_embed(
    db_path: &Path,
    embedding: &paperpipe_shared::EmbeddingConfig,
    options: &EmbedOptions,
    dry_run: bool,
) -> Result<()> {
    if dry_run {
        println!(
            "Dry run: would embed papers missing embeddings in {} with {}",
            db_path.display(),
            embedding.model_name()
        );
        return Ok(());
    }

    // Fail on a missing API key before opening anything.
    let embedder = build_embedder(embedding)?;
    let storage = Storage::open(db_path).await?;

    let spinner = spinner();
    spinner.set_message(format!("Embedding with {}", embedder.model()));
    let outcomes = embed_missing(&storage, embedder.as_ref(), options).await?;
    spinner.finish_and_clear();

    let succeeded = outcomes.iter().filter(|o| o.success).count();
    println!("Embedded {succeeded}/{} papers.", outcomes.len());
    for outcome in outcomes.iter().filter(|o| !o.success) {
        println!(
            "  FAIL {}: {}",
            outcome.identifier,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_pending(db_path: &Path, stage: Stage, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("Dry run: would list {stage} work pending in {}", db_path.display());
        return Ok(());
    }

    let storage = Storage::open(db_path).await?;
    let papers = storage.list_pending(stage).await?;
    if papers.is_empty() {
        println!("No papers with pending {stage} events.");
    }
    for paper in papers {
        let pdf = paper.pdf_path.as_deref().unwrap_or("-");
        println!("{:>6}  {}  {}  [{pdf}]", paper.id, paper.identifier, paper.title);
    }
    Ok(())
}

async fn cmd_config_init(dry_run: bool) -> Result<()> {
    if dry_run {
        println!(
            "Dry run: would write default config to {}",
            paperpipe_shared::config_file_path()?.display()
        );
        return Ok(());
    }
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config: &AppConfig) -> Result<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        Self { spinner: spinner() }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn item_finished(&self, outcome: &IngestOutcome, current: usize, total: usize) {
        let status = if outcome.success { "done" } else { "failed" };
        self.spinner.set_message(format!(
            "[{current}/{total}] {} {status}",
            outcome.meta.identifier
        ));
    }

    fn done(&self, _outcomes: &[IngestOutcome]) {
        self.spinner.finish_and_clear();
    }
}
