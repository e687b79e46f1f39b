//! Completion detection and PDF assembly.
//!
//! ## Trigger
//!
//! Every object creation under the bucket produces a storage event. The
//! [`CompletionDetector`] sorts keys into pages, sentinels and artifacts
//! and lets only the first sentinel event of a book through: an existing
//! `book.pdf`, or an assembly already running in this process, turns later
//! events into no-ops.
//!
//! ## Ordering
//!
//! Pages are sorted by `(is sentinel, sequence-index metadata, natural file
//! name)`. The sequence index is the position the extractor gave the page;
//! natural order (`2.png` before `10.png`) only matters for objects that
//! carry no index. Arrival order of the storage events never matters.
//!
//! ## The race with slow workers
//!
//! The sentinel is dispatched last but workers run in parallel, so its
//! event can fire while other pages are still downloading. What happens
//! then is the [`CompletenessPolicy`]: assemble the snapshot right away, or
//! re-list a bounded number of times until the page count announced by the
//! dispatcher is reached. Either way a page still missing at the end is
//! left out, and the [`AssemblyReport`] says how many.
//!
//! ## Why `spawn_blocking`?
//!
//! Decoding scans and deflating pixels is CPU-bound and can take seconds for
//! a large book. It runs on the blocking pool so the runtime keeps serving
//! queue and storage I/O meanwhile.

use crate::collab::ObjectStore;
use crate::config::{CompletenessPolicy, PipelineConfig};
use crate::error::{Book2PdfError, PageError};
use crate::model::{file_stem, meta, split_key, BookArtifact, ObjectMetadata, StoredObject};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use futures::stream::{self, StreamExt};
use imagepdf::{ImagePdfWriter, PageImage};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parallel object reads while gathering pages.
const READ_CONCURRENCY: usize = 8;

// ── Key classification ───────────────────────────────────────────────────

/// What a storage key stands for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageKeyKind {
    /// An ordinary page image.
    Page { book_id: String },
    /// The last dispatched page; its arrival starts assembly.
    Sentinel { book_id: String },
    /// The assembled book; its arrival starts cleanup and notification.
    Artifact { book_id: String },
    /// Not a `{bookId}/{file}` key.
    Foreign,
}

pub fn classify_key(config: &PipelineConfig, key: &str) -> StorageKeyKind {
    let Some((book_id, filename)) = split_key(key) else {
        return StorageKeyKind::Foreign;
    };
    let book_id = book_id.to_string();
    if filename == config.artifact_name {
        StorageKeyKind::Artifact { book_id }
    } else if file_stem(filename) == config.sentinel_stem {
        StorageKeyKind::Sentinel { book_id }
    } else {
        StorageKeyKind::Page { book_id }
    }
}

// ── Completion detector ──────────────────────────────────────────────────

/// Admits one assembly per book.
#[derive(Clone)]
pub struct CompletionDetector {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

/// Held while a book is being assembled; releases the book on drop.
#[derive(Debug)]
pub struct AssemblyClaim {
    book_id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl AssemblyClaim {
    pub fn book_id(&self) -> &str {
        &self.book_id
    }
}

impl Drop for AssemblyClaim {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.book_id);
    }
}

impl CompletionDetector {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// A claim when `key` is a sentinel of a book that is neither
    /// assembled nor being assembled; `None` otherwise.
    pub async fn detect(&self, key: &str) -> Result<Option<AssemblyClaim>, Book2PdfError> {
        let StorageKeyKind::Sentinel { book_id } = classify_key(&self.config, key) else {
            return Ok(None);
        };

        if self.store.exists(&self.config.artifact_key(&book_id)).await? {
            info!(book_id, key, "Sentinel seen for an assembled book; ignoring");
            return Ok(None);
        }

        let fresh = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(book_id.clone());
        if !fresh {
            info!(book_id, key, "Assembly already running; ignoring duplicate sentinel");
            return Ok(None);
        }

        Ok(Some(AssemblyClaim {
            book_id,
            in_flight: self.in_flight.clone(),
        }))
    }
}

// ── Ordering ─────────────────────────────────────────────────────────────

/// Compare strings with digit runs compared by numeric value.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.chars().next(), b.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let (da, ra) = split_digits(a);
                let (db, rb) = split_digits(b);
                let (ta, tb) = (da.trim_start_matches('0'), db.trim_start_matches('0'));
                let ord = ta
                    .len()
                    .cmp(&tb.len())
                    .then_with(|| ta.cmp(tb))
                    .then_with(|| da.len().cmp(&db.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = ra;
                b = rb;
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a = &a[x.len_utf8()..];
                b = &b[y.len_utf8()..];
            }
        }
    }
}

fn split_digits(s: &str) -> (&str, &str) {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    s.split_at(end)
}

/// A stored page with what the sort needs.
#[derive(Debug, Clone)]
struct PageEntry {
    object: StoredObject,
    is_sentinel: bool,
    sequence_index: Option<usize>,
}

fn page_order(a: &PageEntry, b: &PageEntry) -> Ordering {
    a.is_sentinel
        .cmp(&b.is_sentinel)
        .then_with(|| a.sequence_index.cmp(&b.sequence_index))
        .then_with(|| natural_cmp(&a.object.key, &b.object.key))
}

// ── Assembler ────────────────────────────────────────────────────────────

/// Outcome of one assembly.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyReport {
    pub artifact: BookArtifact,
    /// Page count announced by the dispatcher, when the sentinel carried it.
    pub expected_pages: Option<usize>,
    /// Page objects listed when assembly started.
    pub present_pages: usize,
    /// `expected - present` when both are known.
    pub missing_pages: usize,
    /// Listed pages that could not be read or decoded.
    pub skipped: Vec<PageError>,
    /// Pages in the written PDF, trailer included.
    pub pdf_pages: usize,
    /// Listings taken before assembly started.
    pub listings: u32,
}

pub struct Assembler {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    progress: ProgressCallback,
}

impl Assembler {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Keys of the page objects currently stored for `book_id`.
    async fn page_keys(&self, book_id: &str) -> Result<Vec<String>, Book2PdfError> {
        let artifact = self.config.artifact_key(book_id);
        Ok(self
            .store
            .list(&format!("{book_id}/"))
            .await?
            .into_iter()
            .map(|o| o.key)
            .filter(|k| *k != artifact && split_key(k).is_some())
            .collect())
    }

    /// List pages, re-listing while the policy allows and pages are missing.
    async fn settle(
        &self,
        book_id: &str,
        expected: Option<usize>,
    ) -> Result<(Vec<String>, u32), Book2PdfError> {
        let mut keys = self.page_keys(book_id).await?;
        let mut listings = 1;

        if let (
            CompletenessPolicy::AwaitExpected {
                max_attempts,
                interval_ms,
            },
            Some(expected),
        ) = (self.config.completeness, expected)
        {
            while keys.len() < expected && listings < max_attempts.max(1) {
                debug!(
                    book_id,
                    present = keys.len(),
                    expected,
                    "Waiting for remaining pages"
                );
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                keys = self.page_keys(book_id).await?;
                listings += 1;
            }
        }
        Ok((keys, listings))
    }

    /// Build `{bookId}/book.pdf` from the pages stored for `book_id`.
    ///
    /// Missing or undecodable pages are left out and reported. Storage
    /// failures while listing or uploading are returned.
    pub async fn assemble(&self, book_id: &str) -> Result<AssemblyReport, Book2PdfError> {
        let sentinel_meta = self.sentinel_metadata(book_id).await?;
        let expected = sentinel_meta.as_ref().and_then(ObjectMetadata::page_count);

        let (keys, listings) = self.settle(book_id, expected).await?;
        let present = keys.len();
        let missing = expected.map_or(0, |e| e.saturating_sub(present));
        if missing > 0 {
            warn!(
                book_id,
                expected = expected.unwrap_or_default(),
                present,
                missing,
                "Assembling with pages missing"
            );
        }

        let (mut entries, mut skipped) = self.read_pages(keys).await;
        entries.sort_by(page_order);

        let trailer = self.config.trailer_text.clone();
        let producer = concat!("book2pdf ", env!("CARGO_PKG_VERSION"));
        let (pdf, image_pages, decode_skipped) =
            tokio::task::spawn_blocking(move || render_pdf(entries, &trailer, producer))
                .await
                .map_err(|e| Book2PdfError::Internal(format!("PDF render task failed: {e}")))?;
        skipped.extend(decode_skipped);
        for e in &skipped {
            warn!(book_id, error = %e, "Page left out of the book");
        }

        let mut metadata = ObjectMetadata::new("application/pdf")
            .with(meta::PAGE_COUNT, image_pages.to_string());
        metadata.set_initiator(sentinel_meta.as_ref().and_then(|m| m.initiator()).as_ref());

        let key = self.config.artifact_key(book_id);
        self.store.put(&key, pdf, metadata.clone()).await?;

        info!(book_id, key, pages = image_pages, missing, "Book assembled");
        self.progress.on_book_assembled(book_id, image_pages, missing);

        Ok(AssemblyReport {
            artifact: BookArtifact {
                book_id: book_id.to_string(),
                key,
                page_count: image_pages,
                metadata,
            },
            expected_pages: expected,
            present_pages: present,
            missing_pages: missing,
            skipped,
            pdf_pages: image_pages + 1,
            listings,
        })
    }

    async fn sentinel_metadata(&self, book_id: &str) -> Result<Option<ObjectMetadata>, Book2PdfError> {
        for key in self.page_keys(book_id).await? {
            if let StorageKeyKind::Sentinel { .. } = classify_key(&self.config, &key) {
                return self.store.head(&key).await;
            }
        }
        warn!(book_id, "No sentinel page stored; assembling without its metadata");
        Ok(None)
    }

    async fn read_pages(&self, keys: Vec<String>) -> (Vec<PageEntry>, Vec<PageError>) {
        let results: Vec<Result<PageEntry, PageError>> = stream::iter(keys)
            .map(|key| async move {
                let unreadable = |detail: String| PageError::Unreadable {
                    key: key.clone(),
                    detail,
                };
                match self.store.get(&key).await {
                    Ok(Some(object)) => {
                        let is_sentinel = matches!(
                            classify_key(&self.config, &key),
                            StorageKeyKind::Sentinel { .. }
                        );
                        Ok(PageEntry {
                            sequence_index: object.metadata.sequence_index(),
                            is_sentinel,
                            object,
                        })
                    }
                    Ok(None) => Err(unreadable("object vanished after listing".into())),
                    Err(e) => Err(unreadable(e.to_string())),
                }
            })
            .buffer_unordered(READ_CONCURRENCY)
            .collect()
            .await;

        let mut entries = Vec::with_capacity(results.len());
        let mut skipped = Vec::new();
        for r in results {
            match r {
                Ok(entry) => entries.push(entry),
                Err(e) => skipped.push(e),
            }
        }
        (entries, skipped)
    }
}

/// Write the PDF: one page per decodable image in `entries` order, then
/// the trailer.
fn render_pdf(
    entries: Vec<PageEntry>,
    trailer: &str,
    producer: &str,
) -> (Vec<u8>, usize, Vec<PageError>) {
    let mut writer = ImagePdfWriter::new();
    writer.set_producer(producer);
    let mut skipped = Vec::new();

    for entry in entries {
        let key = entry.object.key;
        let added = PageImage::from_encoded(&entry.object.bytes)
            .and_then(|image| writer.add_image_page(&image));
        if let Err(e) = added {
            skipped.push(PageError::Unreadable {
                key,
                detail: e.to_string(),
            });
        }
    }

    let image_pages = writer.page_count();
    writer.add_text_page(trailer);
    (writer.finish(), image_pages, skipped)
}
