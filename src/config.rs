//! Configuration for the page-assembly pipeline.
//!
//! Every knob lives in one immutable [`PipelineConfig`], built once per
//! process through [`PipelineConfigBuilder`] or [`PipelineConfig::from_env`]
//! and then cloned into each component. Nothing is read from the environment
//! after start-up.

use crate::error::Book2PdfError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Largest batch the queue accepts in one send.
pub const MAX_BATCH_SIZE: usize = 10;

/// Placeholder signing secret of [`PipelineConfig::default`]. Rejected by
/// [`PipelineConfig::require_signing_secret`].
pub const DEFAULT_SIGNING_SECRET: &str = "change-me";

/// Configuration shared by every pipeline stage.
///
/// # Example
/// ```rust
/// use edgequake_book2pdf::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .bucket_name("books")
///     .queue_name("pages")
///     .worker_concurrency(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.batch_size, 10);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Scheme and host of the page viewer. Prefixed to every extracted page
    /// path. Default: `https://kazneb.kz`.
    pub viewer_base_url: String,

    /// Path of the catalogue page describing a book; the book id is appended.
    /// Default: `/ru/catalogue/view/`.
    pub catalogue_path: String,

    /// Query parameter of the viewer URL that carries the book id. Default: `brId`.
    pub book_id_param: String,

    /// Object-store bucket holding pages and finished books.
    pub bucket_name: String,

    /// Queue receiving page dispatch messages.
    pub queue_name: String,

    /// Metadata-store table and its per-user index.
    pub table_name: String,
    pub table_index_name: String,

    /// Timeout for fetching viewer/catalogue HTML, in seconds. Default: 30.
    pub fetch_timeout_secs: u64,

    /// Timeout for downloading one page image, in seconds. Default: 60.
    pub download_timeout_secs: u64,

    /// Messages per batched queue send. Range 1–10. Default: 10.
    pub batch_size: usize,

    /// File stem that replaces the last page's filename. Its storage event
    /// triggers assembly. Default: `last`.
    pub sentinel_stem: String,

    /// Object name of the assembled book under `{bookId}/`. Default: `book.pdf`.
    pub artifact_name: String,

    /// Validity of links minted by the download API. Default: 3 days.
    pub download_link_ttl_secs: u64,

    /// Validity of links sent by email. Default: 7 days.
    pub notification_link_ttl_secs: u64,

    /// Number of page workers run in parallel by the in-process driver. Default: 10.
    pub worker_concurrency: usize,

    /// What the assembler does when pages are still missing.
    pub completeness: CompletenessPolicy,

    /// Text printed on the trailer page appended after the last image.
    pub trailer_text: String,

    /// From address of readiness notifications.
    pub sender_email: String,

    /// Base URL under which signed references are served.
    pub public_base_url: String,

    /// Secret used to sign download references.
    pub signing_secret: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            viewer_base_url: "https://kazneb.kz".to_string(),
            catalogue_path: "/ru/catalogue/view/".to_string(),
            book_id_param: "brId".to_string(),
            bucket_name: "books".to_string(),
            queue_name: "book-pages".to_string(),
            table_name: "books".to_string(),
            table_index_name: "books-by-user".to_string(),
            fetch_timeout_secs: 30,
            download_timeout_secs: 60,
            batch_size: MAX_BATCH_SIZE,
            sentinel_stem: "last".to_string(),
            artifact_name: "book.pdf".to_string(),
            download_link_ttl_secs: 3 * 24 * 3600,
            notification_link_ttl_secs: 7 * 24 * 3600,
            worker_concurrency: 10,
            completeness: CompletenessPolicy::default(),
            trailer_text: "Assembled from the scans of the National Electronic Library of Kazakhstan\nhttps://kazneb.kz".to_string(),
            sender_email: "no-reply@book2pdf.local".to_string(),
            public_base_url: "http://127.0.0.1:8080/files".to_string(),
            signing_secret: DEFAULT_SIGNING_SECRET.to_string(),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("viewer_base_url", &self.viewer_base_url)
            .field("bucket_name", &self.bucket_name)
            .field("queue_name", &self.queue_name)
            .field("table_name", &self.table_name)
            .field("batch_size", &self.batch_size)
            .field("sentinel_stem", &self.sentinel_stem)
            .field("artifact_name", &self.artifact_name)
            .field("worker_concurrency", &self.worker_concurrency)
            .field("completeness", &self.completeness)
            .field("public_base_url", &self.public_base_url)
            .field("signing_secret", &"<redacted>")
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Build a configuration from the process environment.
    ///
    /// A `.env` file in the working directory is loaded first when present.
    /// Unset variables keep their defaults.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `BOOKS_BUCKET_NAME` | `bucket_name` |
    /// | `QUEUE_NAME` | `queue_name` |
    /// | `TABLE_NAME` / `TABLE_INDEX_NAME` | `table_name` / `table_index_name` |
    /// | `BOOK2PDF_VIEWER_BASE_URL` | `viewer_base_url` |
    /// | `BOOK2PDF_PUBLIC_BASE_URL` | `public_base_url` |
    /// | `BOOK2PDF_SIGNING_SECRET` | `signing_secret` |
    /// | `BOOK2PDF_SENDER_EMAIL` | `sender_email` |
    /// | `BOOK2PDF_WORKER_CONCURRENCY` | `worker_concurrency` |
    pub fn from_env() -> Result<Self, Book2PdfError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) but with an explicit lookup, so
    /// tests need not touch the real environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Book2PdfError> {
        let mut b = Self::builder();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("BOOKS_BUCKET_NAME") {
            b = b.bucket_name(v);
        }
        if let Some(v) = get("QUEUE_NAME") {
            b = b.queue_name(v);
        }
        if let Some(v) = get("TABLE_NAME") {
            b = b.table_name(v);
        }
        if let Some(v) = get("TABLE_INDEX_NAME") {
            b = b.table_index_name(v);
        }
        if let Some(v) = get("BOOK2PDF_VIEWER_BASE_URL") {
            b = b.viewer_base_url(v);
        }
        if let Some(v) = get("BOOK2PDF_PUBLIC_BASE_URL") {
            b = b.public_base_url(v);
        }
        if let Some(v) = get("BOOK2PDF_SIGNING_SECRET") {
            b = b.signing_secret(v);
        }
        if let Some(v) = get("BOOK2PDF_SENDER_EMAIL") {
            b = b.sender_email(v);
        }
        if let Some(v) = get("BOOK2PDF_WORKER_CONCURRENCY") {
            let n = v.trim().parse::<usize>().map_err(|_| {
                Book2PdfError::InvalidConfig(format!(
                    "BOOK2PDF_WORKER_CONCURRENCY must be a positive integer, got '{v}'"
                ))
            })?;
            b = b.worker_concurrency(n);
        }
        b.build()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// URL of the catalogue page describing `book_id`.
    pub fn catalogue_url(&self, book_id: &str) -> String {
        format!("{}{}{}", self.viewer_base_url, self.catalogue_path, book_id)
    }

    /// `Ok` when a signing secret other than the placeholder is configured.
    /// Anything that serves signed references checks this first.
    pub fn require_signing_secret(&self) -> Result<(), Book2PdfError> {
        let secret = self.signing_secret.trim();
        if secret.is_empty() || secret == DEFAULT_SIGNING_SECRET {
            return Err(Book2PdfError::InvalidConfig(
                "no signing secret configured; set BOOK2PDF_SIGNING_SECRET".into(),
            ));
        }
        Ok(())
    }

    /// Storage key of the finished book.
    pub fn artifact_key(&self, book_id: &str) -> String {
        format!("{}/{}", book_id, self.artifact_name)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn viewer_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.viewer_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn catalogue_path(mut self, path: impl Into<String>) -> Self {
        self.config.catalogue_path = path.into();
        self
    }

    pub fn book_id_param(mut self, param: impl Into<String>) -> Self {
        self.config.book_id_param = param.into();
        self
    }

    pub fn bucket_name(mut self, name: impl Into<String>) -> Self {
        self.config.bucket_name = name.into();
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.config.queue_name = name.into();
        self
    }

    pub fn table_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_name = name.into();
        self
    }

    pub fn table_index_name(mut self, name: impl Into<String>) -> Self {
        self.config.table_index_name = name.into();
        self
    }

    pub fn fetch_timeout_secs(mut self, secs: u64) -> Self {
        self.config.fetch_timeout_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn sentinel_stem(mut self, stem: impl Into<String>) -> Self {
        self.config.sentinel_stem = stem.into();
        self
    }

    pub fn artifact_name(mut self, name: impl Into<String>) -> Self {
        self.config.artifact_name = name.into();
        self
    }

    pub fn download_link_ttl_secs(mut self, secs: u64) -> Self {
        self.config.download_link_ttl_secs = secs;
        self
    }

    pub fn notification_link_ttl_secs(mut self, secs: u64) -> Self {
        self.config.notification_link_ttl_secs = secs;
        self
    }

    pub fn worker_concurrency(mut self, n: usize) -> Self {
        self.config.worker_concurrency = n.max(1);
        self
    }

    pub fn completeness(mut self, policy: CompletenessPolicy) -> Self {
        self.config.completeness = policy;
        self
    }

    pub fn trailer_text(mut self, text: impl Into<String>) -> Self {
        self.config.trailer_text = text.into();
        self
    }

    pub fn sender_email(mut self, email: impl Into<String>) -> Self {
        self.config.sender_email = email.into();
        self
    }

    pub fn public_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.public_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn signing_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.signing_secret = secret.into();
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Book2PdfError> {
        let c = &self.config;
        if c.batch_size == 0 || c.batch_size > MAX_BATCH_SIZE {
            return Err(Book2PdfError::InvalidConfig(format!(
                "batch size must be 1–{MAX_BATCH_SIZE}, got {}",
                c.batch_size
            )));
        }
        if c.sentinel_stem.is_empty() || c.sentinel_stem.contains('/') {
            return Err(Book2PdfError::InvalidConfig(format!(
                "sentinel stem must be a non-empty file stem, got '{}'",
                c.sentinel_stem
            )));
        }
        if !c.artifact_name.ends_with(".pdf") || c.artifact_name.contains('/') {
            return Err(Book2PdfError::InvalidConfig(format!(
                "artifact name must be a '.pdf' file name, got '{}'",
                c.artifact_name
            )));
        }
        if url::Url::parse(&c.viewer_base_url).is_err() {
            return Err(Book2PdfError::InvalidConfig(format!(
                "viewer base URL '{}' is not a URL",
                c.viewer_base_url
            )));
        }
        if c.fetch_timeout_secs == 0 || c.download_timeout_secs == 0 {
            return Err(Book2PdfError::InvalidConfig(
                "timeouts must be at least one second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the assembler treats a book whose sentinel page arrived before every
/// other page was stored.
///
/// Page workers run in parallel, so the sentinel's storage event can fire
/// while other pages are still downloading. The policy makes that race an
/// explicit, tunable choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletenessPolicy {
    /// Assemble from whatever is stored when the sentinel fires.
    Snapshot,
    /// Re-list up to `max_attempts` times, `interval_ms` apart, until the
    /// stored page count reaches the count announced by the dispatcher.
    /// Falls back to the snapshot when attempts run out.
    AwaitExpected { max_attempts: u32, interval_ms: u64 },
}

impl Default for CompletenessPolicy {
    fn default() -> Self {
        CompletenessPolicy::AwaitExpected {
            max_attempts: 5,
            interval_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::builder().build().unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.sentinel_stem, "last");
        assert_eq!(config.artifact_key("77"), "77/book.pdf");
        assert_eq!(config.download_link_ttl_secs, 259_200);
    }

    #[test]
    fn batch_size_over_queue_limit_is_rejected() {
        let err = PipelineConfig::builder().batch_size(11).build().unwrap_err();
        assert!(matches!(err, Book2PdfError::InvalidConfig(_)));
    }

    #[test]
    fn artifact_must_be_pdf() {
        assert!(PipelineConfig::builder()
            .artifact_name("book.zip")
            .build()
            .is_err());
    }

    #[test]
    fn catalogue_url_joins_parts() {
        let config = PipelineConfig::builder()
            .viewer_base_url("https://viewer.example/")
            .build()
            .unwrap();
        assert_eq!(
            config.catalogue_url("12"),
            "https://viewer.example/ru/catalogue/view/12"
        );
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("BOOKS_BUCKET_NAME", "scans"),
            ("QUEUE_NAME", "pages-q"),
            ("BOOK2PDF_WORKER_CONCURRENCY", "3"),
            ("TABLE_NAME", "  "),
        ]
        .into_iter()
        .collect();
        let config =
            PipelineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.bucket_name, "scans");
        assert_eq!(config.queue_name, "pages-q");
        assert_eq!(config.worker_concurrency, 3);
        assert_eq!(config.table_name, "books");
    }

    #[test]
    fn lookup_rejects_bad_numbers() {
        let err = PipelineConfig::from_lookup(|k| {
            (k == "BOOK2PDF_WORKER_CONCURRENCY").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("many"));
    }

    #[test]
    fn debug_redacts_secret() {
        let config = PipelineConfig::builder()
            .signing_secret("s3cr3t")
            .build()
            .unwrap();
        assert!(!format!("{config:?}").contains("s3cr3t"));
    }

    #[test]
    fn placeholder_secret_is_refused() {
        let unset = PipelineConfig::from_lookup(|_| None).unwrap();
        let err = unset.require_signing_secret().unwrap_err();
        assert!(err.to_string().contains("BOOK2PDF_SIGNING_SECRET"), "got: {err}");

        let blank = PipelineConfig::builder().signing_secret("   ").build().unwrap();
        assert!(blank.require_signing_secret().is_err());

        let set = PipelineConfig::from_lookup(|k| {
            (k == "BOOK2PDF_SIGNING_SECRET").then(|| "a-real-secret".to_string())
        })
        .unwrap();
        assert!(set.require_signing_secret().is_ok());
    }
}
