//! CLI binary for edgequake-papers.
//!
//! `papers serve` runs the HTTP API; `papers parse` runs the remote
//! image-aware pipeline on a local PDF and writes the canonical figures to a
//! directory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use edgequake_papers::ingest::{build_figures, file_stem, write_figure_files};
use edgequake_papers::pipeline::text::check_pdf_magic;
use edgequake_papers::{
    AppState, MemoryStore, NoopProgressCallback, ParsePhase, ParseProgressCallback, ParserConfig,
    ProgressCallback, ProviderRegistry, RemoteParser, ServerConfig, StateCounts,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

/// Terminal spinner that follows the orchestrator through its phases.
struct CliProgressCallback {
    bar: ProgressBar,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style =
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed:.dim}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS);
        bar.set_style(style);
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }
}

impl ParseProgressCallback for CliProgressCallback {
    fn on_phase_start(&self, phase: ParsePhase) {
        let (prefix, msg) = match phase {
            ParsePhase::RequestUploadUrls => ("Requesting", "upload URL"),
            ParsePhase::Upload => ("Uploading", "PDF"),
            ParsePhase::Poll => ("Parsing", "waiting for the remote parser…"),
            ParsePhase::Download => ("Downloading", "result bundle"),
            ParsePhase::Extract => ("Extracting", "figures"),
        };
        self.bar.set_prefix(prefix);
        self.bar.set_message(msg);
    }

    fn on_poll(&self, attempt: u32, max_attempts: u32, counts: &StateCounts) {
        self.bar.set_message(format!(
            "{}/{} done  {}",
            counts.done,
            counts.total(),
            dim(&format!("poll {attempt}/{max_attempts}"))
        ));
    }

    fn on_file_failed(&self, file_name: &str, error: &str) {
        self.bar
            .println(format!("  {} {}  {}", red("✗"), file_name, red(error)));
    }

    fn on_download_retry(&self, attempt: u32, max_attempts: u32, error: &str) {
        self.bar.println(format!(
            "  {} download attempt {}/{} failed: {}",
            red("↻"),
            attempt,
            max_attempts,
            dim(error)
        ));
    }

    fn on_parse_complete(&self, figure_count: usize) {
        self.bar.finish_and_clear();
        eprintln!("{} {} figures extracted", green("✔"), bold(&figure_count.to_string()));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the API on the default address (127.0.0.1:8080)
  papers serve --providers providers.json

  # Bind elsewhere with a custom data directory
  papers serve --bind 0.0.0.0:9000 --data-dir /var/lib/papers

  # Extract figures from a local PDF
  papers parse paper.pdf --out figures/

  # Same, but print the figure list as JSON
  papers parse paper.pdf --out figures/ --json

PROVIDER FILE:
  {
    "defaultProvider": "openai",
    "providers": {
      "openai": {
        "baseUrl": "https://api.openai.com/v1",
        "apiKeyEnv": "OPENAI_API_KEY",
        "model": "gpt-4.1-mini",
        "multimodal": true
      }
    }
  }

ENVIRONMENT VARIABLES:
  MINERU_API_TOKEN     Token for the remote parser (image-aware parse)
  MINERU_BASE_URL      Override the remote parser base URL
  PAPERS_PROVIDERS     Path to the provider file
  PAPERS_DATA_DIR      Root for uploads, figures and the store snapshot
  PDFIUM_LIB_PATH      Path to an existing libpdfium
  RUST_LOG             Log filter, overrides --verbose
"#;

/// Literature-analysis backend: PDF ingestion, figure extraction, streaming analysis.
#[derive(Parser, Debug)]
#[command(
    name = "papers",
    version,
    about = "Literature-analysis backend: PDF ingestion, figure extraction, streaming analysis",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PAPERS_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve {
        /// Socket address to bind.
        #[arg(long, env = "PAPERS_BIND", default_value = "127.0.0.1:8080")]
        bind: SocketAddr,

        /// Root for uploads, figures and the store snapshot.
        #[arg(long, env = "PAPERS_DATA_DIR", default_value = "./data")]
        data_dir: PathBuf,

        /// JSON file describing the LLM providers.
        #[arg(long, env = "PAPERS_PROVIDERS")]
        providers: Option<PathBuf>,

        /// Maximum characters of document text per prompt.
        #[arg(long, env = "PAPERS_MAX_PROMPT_CHARS", default_value_t = 80_000)]
        max_prompt_chars: usize,

        /// Maximum figures attached to a multimodal prompt.
        #[arg(long, env = "PAPERS_MAX_PROMPT_FIGURES", default_value_t = 8)]
        max_prompt_figures: usize,

        /// Maximum upload size in MiB.
        #[arg(long, env = "PAPERS_MAX_UPLOAD_MB", default_value_t = 100)]
        max_upload_mb: usize,
    },

    /// Run the remote image-aware parse on a local PDF.
    Parse {
        /// Local PDF file.
        input: PathBuf,

        /// Directory that receives the figure files.
        #[arg(short, long, default_value = "figures")]
        out: PathBuf,

        /// Print the figure list as JSON.
        #[arg(long)]
        json: bool,

        /// Also write the normalised markdown next to the figures.
        #[arg(long)]
        markdown: bool,

        /// Disable the spinner.
        #[arg(long, env = "PAPERS_NO_PROGRESS")]
        no_progress: bool,
    },
}

/// One line of `papers parse --json` output.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FigureRecord {
    label: String,
    caption: String,
    page_number: u32,
    image_index: u32,
    file_name: String,
    file_size: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let quiet_for_progress = matches!(
        cli.command,
        Command::Parse { no_progress: false, json: false, .. }
    );
    let filter = if cli.verbose {
        "debug"
    } else if quiet_for_progress {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve {
            bind,
            data_dir,
            providers,
            max_prompt_chars,
            max_prompt_figures,
            max_upload_mb,
        } => {
            let config = ServerConfig::builder()
                .bind(bind)
                .data_dir(data_dir)
                .max_prompt_chars(max_prompt_chars)
                .max_prompt_figures(max_prompt_figures)
                .max_upload_bytes(max_upload_mb.saturating_mul(1024 * 1024))
                .build()
                .context("Invalid server configuration")?;
            serve(config, providers).await
        }
        Command::Parse {
            input,
            out,
            json,
            markdown,
            no_progress,
        } => parse(input, out, json, markdown, !no_progress && !json).await,
    }
}

async fn serve(config: ServerConfig, providers: Option<PathBuf>) -> Result<()> {
    let providers = match providers {
        Some(path) => ProviderRegistry::load(&path)
            .with_context(|| format!("Failed to load providers from {}", path.display()))?,
        None => {
            warn!("No provider file given; /analyze will answer 400 until one is configured");
            ProviderRegistry::default()
        }
    };

    let parser_config = ParserConfig::from_env();
    if parser_config.api_token.is_none() {
        warn!("MINERU_API_TOKEN is not set; image-aware parsing is unavailable");
    }
    let parser = RemoteParser::new(parser_config).context("Failed to build remote parser")?;

    let store = MemoryStore::open(config.store_path())
        .await
        .context("Failed to open store")?;

    let state = AppState::new(config, Arc::new(store), parser, providers)
        .context("Failed to build application state")?;
    edgequake_papers::serve(state).await.context("Server error")
}

async fn parse(
    input: PathBuf,
    out: PathBuf,
    json: bool,
    write_markdown: bool,
    show_progress: bool,
) -> Result<()> {
    let head = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    check_pdf_magic(&head).with_context(|| format!("{} is not a PDF", input.display()))?;
    drop(head);

    let config = ParserConfig::from_env();
    if config.api_token.is_none() {
        bail!("MINERU_API_TOKEN is not set");
    }
    let parser = RemoteParser::new(config).context("Failed to build remote parser")?;

    let progress: ProgressCallback = if show_progress {
        CliProgressCallback::new() as ProgressCallback
    } else {
        Arc::new(NoopProgressCallback)
    };

    let parsed = parser
        .parse_document(&input, progress.as_ref())
        .await
        .context("Remote parse failed")?;

    let stem = file_stem(&input.to_string_lossy());
    let extracted = build_figures(&parsed, &stem);
    let sizes = write_figure_files(&extracted.figures, &out)
        .await
        .context("Failed to write figure files")?;
    if write_markdown {
        let md_path = out.join(format!("{stem}.md"));
        tokio::fs::write(&md_path, &extracted.markdown)
            .await
            .with_context(|| format!("Failed to write {}", md_path.display()))?;
    }
    progress.on_parse_complete(extracted.figures.len());

    let records: Vec<FigureRecord> = extracted
        .figures
        .iter()
        .zip(sizes)
        .map(|(f, file_size)| FigureRecord {
            label: f.label.clone(),
            caption: f.caption.clone(),
            page_number: f.page_number,
            image_index: f.image_index,
            file_name: f.file_name.clone(),
            file_size,
        })
        .collect();

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("Failed to serialise figures")?
        );
    } else {
        for r in &records {
            let marker = if r.file_size > 0 { green("✓") } else { red("∅") };
            println!(
                "{} {:<4} {}  {}",
                marker,
                r.label,
                truncate(&r.caption, 60),
                dim(&format!("p.{} {}", r.page_number, r.file_name))
            );
        }
        eprintln!(
            "{} figures written to {}",
            bold(&records.len().to_string()),
            bold(&out.display().to_string())
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}\u{2026}")
}
