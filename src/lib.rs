//! # edgequake-papers
//!
//! Backend for reading research papers with an LLM: upload a PDF, optionally
//! run an image-aware parse that recovers the paper's figures, then stream
//! analyses (summary, methods, figures, critique, free chat) over
//! Server-Sent Events.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF upload
//!  │
//!  ├─ 1. Text     pdfium text extraction (spawn_blocking), parse mode text_only
//!  │
//!  ├─ 2. Parse    remote batch parser: upload URLs → PUT → poll → ZIP bundle
//!  ├─ 3. Figures  markdown + images/ + content list → labelled candidates
//!  ├─ 4. Canon    dedupe, renumber F1..Fn, files <stem>_<page>_<index>.<ext>
//!  ├─ 5. Commit   stage files, swap directory, single store update
//!  │
//!  └─ 6. Analyze  prompt + figures → provider SSE → chunks → stored reply
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_papers::{
//!     AppState, MemoryStore, ParserConfig, ProviderRegistry, RemoteParser, ServerConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::builder().data_dir("./data").build()?;
//!     let store = MemoryStore::open(config.store_path()).await?;
//!     let parser = RemoteParser::new(ParserConfig::from_env())?;
//!     let providers = ProviderRegistry::load(std::path::Path::new("providers.json"))?;
//!     let state = AppState::new(config, Arc::new(store), parser, providers)?;
//!     edgequake_papers::serve(state).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `papers` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod relay;
pub mod server;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ParserConfig, ProviderConfig, ProviderRegistry, ResolvedProvider, ServerConfig,
    ServerConfigBuilder,
};
pub use error::{PapersError, Result};
pub use ingest::{build_figures, parse_images, write_figure_files, IngestReport};
pub use model::{Document, Figure, JobState, Message, ParseJob, ParseMode, Role, Session};
pub use pipeline::remote::RemoteParser;
pub use progress::{
    NoopProgressCallback, ParsePhase, ParseProgressCallback, ProgressCallback, StateCounts,
    TracingProgressCallback,
};
pub use prompts::TaskType;
pub use relay::{stream_completion, ChatMessage, RelayOutcome};
pub use server::{create_router, serve, AppState};
pub use store::{MemoryStore, Store};
