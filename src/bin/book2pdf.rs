//! CLI binary for edgequake-book2pdf.
//!
//! A thin shim over the library crate: `pages` lists what a viewer page
//! exposes, `fetch` runs the whole pipeline in-process and writes the PDF,
//! `serve` runs the HTTP API with a background worker.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_book2pdf::collab::fs::FsObjectStore;
use edgequake_book2pdf::collab::http::HttpPageSource;
use edgequake_book2pdf::collab::memory::{self, LogMailer, MemoryBookRepository, MemoryQueue};
use edgequake_book2pdf::collab::{Collaborators, ObjectStore};
use edgequake_book2pdf::pipeline::extract::PageUrlExtractor;
use edgequake_book2pdf::{
    api, BookService, CompletenessPolicy, PipelineConfig, PipelineProgressCallback,
    ProgressCallback, UrlSigner,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar over page downloads. Pages finish out of order, so the
/// bar only counts.
struct CliProgressCallback {
    bar: ProgressBar,
    failed: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Discovering");
        bar.set_message("Reading viewer page…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            failed: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_pages_discovered(&self, book_id: &str, total_pages: usize) {
        self.bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  ETA {eta_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        self.bar.set_length(total_pages as u64);
        self.bar.set_prefix("Downloading");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Book {book_id}: {total_pages} pages found"))
        ));
    }

    fn on_already_assembled(&self, book_id: &str) {
        self.bar
            .println(format!("{} Book {book_id} is already assembled", cyan("◆")));
    }

    fn on_page_stored(&self, _book_id: &str, _key: &str) {
        self.bar.inc(1);
    }

    fn on_page_failed(&self, _book_id: &str, key: &str, error: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar
            .println(format!("  {} {:<16} {}", red("✗"), key, red(&msg)));
        self.bar.inc(1);
    }

    fn on_book_assembled(&self, book_id: &str, pages: usize, missing: usize) {
        self.bar.finish_and_clear();
        if missing == 0 {
            eprintln!(
                "{} Book {book_id}: {} pages assembled",
                green("✔"),
                bold(&pages.to_string())
            );
        } else {
            eprintln!(
                "{} Book {book_id}: {} pages assembled ({} missing, {} failed downloads)",
                cyan("⚠"),
                bold(&pages.to_string()),
                red(&missing.to_string()),
                self.failed.load(Ordering::SeqCst)
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # List the page images a viewer page exposes
  book2pdf pages "https://kazneb.kz/bookView/view?brId=1234&simple=true"

  # Download every page and write the PDF
  book2pdf fetch "https://kazneb.kz/bookView/view?brId=1234&simple=true" -o book.pdf

  # Run the HTTP API, keeping objects under ./data
  book2pdf serve --bind 127.0.0.1:8080 --data-dir ./data

ENVIRONMENT VARIABLES:
  BOOKS_BUCKET_NAME            Bucket name stamped on storage events
  QUEUE_NAME                   Page queue name
  BOOK2PDF_VIEWER_BASE_URL     Scheme and host prefixed to page paths
  BOOK2PDF_PUBLIC_BASE_URL     Base URL of signed download links
  BOOK2PDF_SIGNING_SECRET      Secret used to sign download links (required by serve)
  BOOK2PDF_SENDER_EMAIL        From address of readiness emails
  BOOK2PDF_WORKER_CONCURRENCY  Pages downloaded in parallel
  RUST_LOG                     Log filter (overrides --verbose / --quiet)
"#;

/// Turn a scanned book from an online page viewer into one PDF.
#[derive(Parser, Debug)]
#[command(
    name = "book2pdf",
    version,
    about = "Turn a scanned book from an online page viewer into one PDF",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "BOOK2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "BOOK2PDF_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the page-image URLs found on a viewer page.
    Pages {
        /// Viewer URL carrying the book id in its query.
        url: String,
    },

    /// Run the whole pipeline in-process and write the PDF.
    Fetch {
        /// Viewer URL carrying the book id in its query.
        url: String,

        /// Where to write the PDF. Default: `<bookId>.pdf`.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Pages downloaded in parallel.
        #[arg(short, long, env = "BOOK2PDF_WORKER_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Per-page download timeout in seconds.
        #[arg(long, env = "BOOK2PDF_DOWNLOAD_TIMEOUT", default_value_t = 60)]
        download_timeout: u64,

        /// Disable progress bar.
        #[arg(long, env = "BOOK2PDF_NO_PROGRESS")]
        no_progress: bool,
    },

    /// Serve the Read / Submit API.
    Serve {
        /// Address to listen on.
        #[arg(long, env = "BOOK2PDF_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Directory holding pages and finished books.
        #[arg(long, env = "BOOK2PDF_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,

        /// How often the background worker polls the page queue, in milliseconds.
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar is the feedback for `fetch`; keep library INFO logs
    // out of its way unless asked for.
    let bar_active = matches!(cli.command, Command::Fetch { no_progress: false, .. });
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bar_active {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = PipelineConfig::from_env().context("Invalid configuration")?;

    match cli.command {
        Command::Pages { url } => pages(config, &url).await,
        Command::Fetch {
            url,
            output,
            concurrency,
            download_timeout,
            no_progress,
        } => {
            let mut config = config;
            if let Some(n) = concurrency {
                config.worker_concurrency = n.max(1);
            }
            config.download_timeout_secs = download_timeout.max(1);
            // Every page is stored before the sentinel event is handled here.
            config.completeness = CompletenessPolicy::Snapshot;
            let progress = (!cli.quiet && !no_progress)
                .then(|| CliProgressCallback::new() as ProgressCallback);
            fetch(config, &url, output, progress, cli.quiet).await
        }
        Command::Serve {
            bind,
            data_dir,
            poll_ms,
        } => serve(config, bind, data_dir, Duration::from_millis(poll_ms.max(10))).await,
    }
}

async fn pages(config: PipelineConfig, url: &str) -> Result<()> {
    let source = Arc::new(HttpPageSource::new().context("Failed to build HTTP client")?);
    let extractor = PageUrlExtractor::new(config, source);
    let pages = extractor
        .discover(url)
        .await
        .context("Failed to read viewer page")?;
    for page in &pages {
        println!("{}", page.source_url);
    }
    eprintln!("{} pages", pages.len());
    Ok(())
}

async fn fetch(
    config: PipelineConfig,
    url: &str,
    output: Option<PathBuf>,
    progress: Option<ProgressCallback>,
    quiet: bool,
) -> Result<()> {
    let source = Arc::new(HttpPageSource::new().context("Failed to build HTTP client")?);
    let (collab, mut handles) = memory::in_memory(&config, source, Arc::new(LogMailer));
    let mut service = BookService::new(config.clone(), collab);
    if let Some(cb) = progress {
        service = service.with_progress(cb);
    }

    let submitted = service.submit(url, None).await.context("Submission failed")?;
    let book_id = submitted.record.book_id.clone();
    service
        .run_until_idle(&mut handles.events)
        .await
        .context("Pipeline failed")?;

    let key = config.artifact_key(&book_id);
    let pdf = handles
        .store
        .get(&key)
        .await
        .context("Failed to read assembled book")?
        .with_context(|| format!("Book {book_id} was not assembled"))?;

    let output = output.unwrap_or_else(|| PathBuf::from(format!("{book_id}.pdf")));
    tokio::fs::write(&output, &pdf.bytes)
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !quiet {
        let title = submitted.record.title.as_deref().unwrap_or("untitled");
        eprintln!(
            "{}  {}  {} KiB  →  {}",
            green("✔"),
            title,
            pdf.bytes.len() / 1024,
            bold(&output.display().to_string()),
        );
    }
    service.collaborators().shutdown().await;
    Ok(())
}

async fn serve(
    config: PipelineConfig,
    bind: SocketAddr,
    data_dir: PathBuf,
    poll: Duration,
) -> Result<()> {
    config
        .require_signing_secret()
        .context("Refusing to serve download links that anyone could sign")?;
    let (store, events) = FsObjectStore::open_with_events(&data_dir, &config.bucket_name)
        .await
        .with_context(|| format!("Failed to open data directory {}", data_dir.display()))?;
    let collab = Collaborators {
        store: Arc::new(store),
        queue: Arc::new(MemoryQueue::new(&config.queue_name)),
        repository: Arc::new(MemoryBookRepository::new()),
        mailer: Arc::new(LogMailer),
        source: Arc::new(HttpPageSource::new().context("Failed to build HTTP client")?),
        signer: UrlSigner::from_config(&config),
    };
    let service = Arc::new(BookService::new(config, collab));
    let worker = service.clone().spawn_background(events, poll);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    info!(%bind, data_dir = %data_dir.display(), "Serving book API");

    axum::serve(listener, api::router(service.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("Server failed")?;

    info!("Shutting down");
    service.collaborators().shutdown().await;
    worker.await.context("Background worker panicked")?;
    Ok(())
}
