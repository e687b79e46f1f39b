//! # edgequake-book2pdf
//!
//! Turn a scanned book from an online page viewer into one downloadable PDF.
//!
//! A user submits a viewer URL. The crate discovers the ordered page-image
//! URLs, fans them out over a message queue, downloads each page into an
//! object store, assembles the stored pages into a page-ordered PDF once
//! the sentinel "last" page lands, deletes the intermediates and emails the
//! requester a time-limited link.
//!
//! ## Pipeline Overview
//!
//! ```text
//! viewer URL
//!  │
//!  ├─ 1. Extract   page-image paths from the viewer's inline script
//!  ├─ 2. Dispatch  batches of ≤10 messages, sentinel page strictly last
//!  ├─ 3. Worker    download + store each page (idempotent, parallel)
//!  ├─ 4. Assemble  on the sentinel's storage event (spawn_blocking)
//!  ├─ 5. Cleanup   delete page objects, mark the book READY
//!  └─ 6. Notify    email a signed link to the requester
//! ```
//!
//! Stages meet only through the [`collab`] traits (object store, queue,
//! book repository, mailer, page source). In-memory and file-system
//! implementations ship with the crate; [`BookService`] wires them and
//! drives queue and storage events in-process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_book2pdf::collab::{http::HttpPageSource, memory, memory::LogMailer};
//! use edgequake_book2pdf::{BookService, PipelineConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::from_env()?;
//!     let source = Arc::new(HttpPageSource::new()?);
//!     let (collab, mut handles) = memory::in_memory(&config, source, Arc::new(LogMailer));
//!     let service = BookService::new(config, collab);
//!
//!     service
//!         .submit("https://kazneb.kz/bookView/view?brId=1234&simple=true", None)
//!         .await?;
//!     service.run_until_idle(&mut handles.events).await?;
//!     println!("{:?}", handles.store.keys().await);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on      | axum router for the Read / Submit API ([`api`]) |
//! | `cli`    | on      | The `book2pdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Library-only users can skip both:
//! ```toml
//! edgequake-book2pdf = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

#[cfg(feature = "server")]
pub mod api;
pub mod collab;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod triggers;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use collab::{Collaborators, UrlSigner};
pub use config::{CompletenessPolicy, PipelineConfig, PipelineConfigBuilder};
pub use error::{Book2PdfError, ErrorKind, PageError};
pub use model::{
    BookArtifact, BookInfo, BookRecord, BookStatus, DispatchMessage, DownloadLink, Initiator,
    PageRef,
};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use service::{BookService, DrainReport, StorageOutcome, SubmitOutcome};
