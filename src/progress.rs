//! Progress-callback trait for pipeline events.
//!
//! Attach an [`Arc<dyn PipelineProgressCallback>`] to a
//! [`BookService`](crate::service::BookService) with
//! [`with_progress`](crate::service::BookService::with_progress) to observe a
//! book moving through discovery, dispatch, page download and assembly.
//!
//! # Why callbacks instead of channels?
//!
//! The host decides how events travel: a terminal progress bar, a log line
//! or a broadcast channel. The library only promises to call the trait.
//! Page workers run concurrently, so implementations must be `Send + Sync`.
//!
//! # Example
//!
//! ```rust
//! use edgequake_book2pdf::PipelineProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct StoredPages(AtomicUsize);
//!
//! impl PipelineProgressCallback for StoredPages {
//!     fn on_page_stored(&self, _book_id: &str, key: &str) {
//!         let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("{n}: {key}");
//!     }
//! }
//! ```

use std::sync::Arc;

/// Called by the pipeline stages as a book progresses.
///
/// Every method has a no-op default so callers only override what they
/// care about. `on_page_stored` and `on_page_failed` may be called from
/// several tasks at once.
pub trait PipelineProgressCallback: Send + Sync {
    /// The viewer page was scraped and `total_pages` page URLs were found.
    fn on_pages_discovered(&self, book_id: &str, total_pages: usize) {
        let _ = (book_id, total_pages);
    }

    /// Dispatch finished. `sent` messages reached the queue, `dropped`
    /// pages had unusable URLs.
    fn on_dispatched(&self, book_id: &str, sent: usize, dropped: usize) {
        let _ = (book_id, sent, dropped);
    }

    /// Dispatch was skipped because the book is already assembled.
    fn on_already_assembled(&self, book_id: &str) {
        let _ = book_id;
    }

    /// A page worker stored one page.
    fn on_page_stored(&self, book_id: &str, key: &str) {
        let _ = (book_id, key);
    }

    /// A page worker gave up on one page.
    fn on_page_failed(&self, book_id: &str, key: &str, error: &str) {
        let _ = (book_id, key, error);
    }

    /// The PDF was written with `pages` image pages (trailer excluded).
    fn on_book_assembled(&self, book_id: &str, pages: usize, missing: usize) {
        let _ = (book_id, pages, missing);
    }

    /// Cleanup ran and the book is ready for download.
    fn on_book_ready(&self, book_id: &str) {
        let _ = book_id;
    }
}

/// Callback used when none is configured.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Shared handle stored by the service and passed to stages.
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
