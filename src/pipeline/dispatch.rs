//! Dispatcher: page references → queue messages.
//!
//! ## Order of sends
//!
//! ```text
//! pages[0..N-1] ──chunk(10)──▶ batch, batch, ...   (natural file names)
//! pages[N-1]    ──────────────▶ batch of one       (stored as `last.<ext>`)
//! ```
//!
//! The sentinel goes out strictly after every other batch has been
//! accepted by the queue. Its storage event is what starts assembly, and
//! its fixed stem makes that event recognisable whatever the page was
//! called. An ordinary page whose own stem is the sentinel stem is stored
//! as `last-<index>.<ext>` instead.
//!
//! Every message also carries the page's sequence index and the number of
//! pages dispatched, so the assembler can order pages and tell whether
//! some are still missing.

use super::chunk::chunk;
use super::download::ExistenceCheck;
use crate::collab::MessageQueue;
use crate::config::PipelineConfig;
use crate::error::{Book2PdfError, PageError};
use crate::model::{
    content_type_for, extension, file_stem, page_key, split_key, DispatchMessage, Initiator,
    MessageAttributes, PageRef,
};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub book_id: String,
    /// The book was already assembled; nothing was sent.
    pub already_assembled: bool,
    /// Size of each batch sent, sentinel batch included, in send order.
    pub batch_sizes: Vec<usize>,
    /// Pages dropped because their URL could not become a message.
    pub dropped: Vec<PageError>,
    /// Storage key the sentinel page will be written to.
    pub sentinel_key: Option<String>,
}

impl DispatchReport {
    pub fn sent(&self) -> usize {
        self.batch_sizes.iter().sum()
    }
}

/// Build the message for one page.
///
/// `stem` replaces the natural file stem; the sentinel uses it.
pub fn build_message(
    book_id: &str,
    page: &PageRef,
    stem: Option<&str>,
    initiator: Option<&Initiator>,
) -> Result<DispatchMessage, PageError> {
    let invalid = |detail: String| PageError::InvalidUrl {
        url: page.source_url.clone(),
        detail,
    };

    let url = url::Url::parse(&page.source_url).map_err(|e| invalid(e.to_string()))?;
    let filename = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| invalid("URL path has no file name".into()))?;
    let ext = extension(filename).ok_or_else(|| invalid("file name has no extension".into()))?;
    let stem = stem.unwrap_or_else(|| file_stem(filename));

    Ok(DispatchMessage {
        id: Uuid::new_v4().to_string(),
        body: url.to_string(),
        attributes: MessageAttributes {
            book_id: book_id.to_string(),
            storage_key: page_key(book_id, stem, ext),
            content_type: content_type_for(filename),
            is_last: false,
            sequence_index: Some(page.sequence_index),
            page_count: None,
            initiator: initiator.cloned(),
        },
    })
}

/// Key for an ordinary page whose `key` would read as the sentinel, or
/// `None` when `key` is already clear of it.
pub fn clear_of_sentinel(key: &str, sentinel_stem: &str, sequence_index: usize) -> Option<String> {
    let (book_id, filename) = split_key(key)?;
    if file_stem(filename) != sentinel_stem {
        return None;
    }
    let ext = extension(filename)?;
    Some(page_key(book_id, &format!("{sentinel_stem}-{sequence_index}"), ext))
}

pub struct Dispatcher {
    config: PipelineConfig,
    queue: Arc<dyn MessageQueue>,
    existence: ExistenceCheck,
    progress: ProgressCallback,
}

impl Dispatcher {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn MessageQueue>,
        existence: ExistenceCheck,
    ) -> Self {
        Self {
            config,
            queue,
            existence,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Send one message per page, sentinel last.
    ///
    /// Returns without sending when the book is already assembled. Pages
    /// with unusable URLs are dropped and reported. A queue failure is
    /// returned as is; batches sent before it stay sent.
    pub async fn dispatch(
        &self,
        book_id: &str,
        pages: &[PageRef],
        initiator: Option<&Initiator>,
    ) -> Result<DispatchReport, Book2PdfError> {
        let mut report = DispatchReport {
            book_id: book_id.to_string(),
            ..Default::default()
        };

        if self.existence.exists(book_id).await? {
            info!(book_id, "Book has already been assembled; nothing to dispatch");
            report.already_assembled = true;
            self.progress.on_already_assembled(book_id);
            return Ok(report);
        }

        let mut ordered: Vec<&PageRef> = pages.iter().collect();
        ordered.sort_by_key(|p| p.sequence_index);
        let Some((last, rest)) = ordered.split_last() else {
            debug!(book_id, "No pages to dispatch");
            return Ok(report);
        };

        // The sentinel must be sendable before anything else goes out,
        // otherwise the book could never be assembled.
        let mut sentinel = build_message(book_id, last, Some(&self.config.sentinel_stem), initiator)
            .map_err(|e| Book2PdfError::InvalidPageUrl {
                url: last.source_url.clone(),
                reason: e.to_string(),
            })?;
        sentinel.attributes.is_last = true;

        let mut messages = Vec::with_capacity(rest.len());
        for page in rest {
            match build_message(book_id, page, None, initiator) {
                Ok(mut m) => {
                    if let Some(key) = clear_of_sentinel(
                        &m.attributes.storage_key,
                        &self.config.sentinel_stem,
                        page.sequence_index,
                    ) {
                        debug!(
                            book_id,
                            from = %m.attributes.storage_key,
                            to = %key,
                            "Renaming page named like the sentinel"
                        );
                        m.attributes.storage_key = key;
                    }
                    messages.push(m);
                }
                Err(e) => {
                    warn!(book_id, url = %page.source_url, error = %e, "Dropping page from dispatch");
                    report.dropped.push(e);
                }
            }
        }

        let page_count = messages.len() + 1;
        for m in messages.iter_mut().chain(std::iter::once(&mut sentinel)) {
            m.attributes.page_count = Some(page_count);
        }

        for batch in chunk(&messages, self.config.batch_size) {
            self.queue.send_batch(&batch).await?;
            report.batch_sizes.push(batch.len());
        }

        self.queue.send_batch(std::slice::from_ref(&sentinel)).await?;
        report.batch_sizes.push(1);
        report.sentinel_key = Some(sentinel.attributes.storage_key.clone());

        info!(
            book_id,
            sent = report.sent(),
            batches = report.batch_sizes.len(),
            dropped = report.dropped.len(),
            "Dispatched pages"
        );
        self.progress
            .on_dispatched(book_id, report.sent(), report.dropped.len());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::{MemoryObjectStore, MemoryQueue};
    use crate::collab::{ObjectStore, UrlSigner};
    use crate::model::{attr, ObjectMetadata};

    fn pages(n: usize) -> Vec<PageRef> {
        (0..n)
            .map(|i| {
                PageRef::new(
                    i,
                    format!("https://kazneb.kz/a/b/c/d/e/f/{:04}.png?time=1&key=k", i + 1),
                )
            })
            .collect()
    }

    fn setup() -> (Dispatcher, Arc<MemoryQueue>, Arc<MemoryObjectStore>) {
        let config = PipelineConfig::default();
        let store = Arc::new(MemoryObjectStore::new("b"));
        let queue = Arc::new(MemoryQueue::new("q"));
        let existence =
            ExistenceCheck::new(config.clone(), store.clone(), UrlSigner::from_config(&config));
        (
            Dispatcher::new(config, queue.clone(), existence),
            queue,
            store,
        )
    }

    #[test]
    fn message_key_and_type_come_from_url() {
        let page = PageRef::new(0, "https://kazneb.kz/a/b/c/d/e/f/0007.jpeg?time=1&key=k");
        let m = build_message("42", &page, None, None).unwrap();
        assert_eq!(m.attributes.storage_key, "42/0007.jpeg");
        assert_eq!(m.attributes.content_type, "image/jpeg");
        assert_eq!(m.body, "https://kazneb.kz/a/b/c/d/e/f/0007.jpeg?time=1&key=k");

        let s = build_message("42", &page, Some("last"), None).unwrap();
        assert_eq!(s.attributes.storage_key, "42/last.jpeg");
    }

    #[test]
    fn unusable_urls_are_page_errors() {
        for url in ["not a url", "https://h/a/b/c/", "https://h/a/b/noext"] {
            let err = build_message("1", &PageRef::new(0, url), None, None).unwrap_err();
            assert!(matches!(err, PageError::InvalidUrl { .. }), "{url}");
        }
    }

    #[tokio::test]
    async fn twenty_three_pages_go_out_as_ten_ten_two_and_sentinel() {
        let (dispatcher, queue, _) = setup();
        let report = dispatcher.dispatch("9", &pages(23), None).await.unwrap();

        assert_eq!(report.batch_sizes, vec![10, 10, 2, 1]);
        assert_eq!(report.sentinel_key.as_deref(), Some("9/last.png"));

        let batches = queue.sent_batches().await;
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 2, 1]);

        let sent = queue.sent_messages().await;
        let sentinels: Vec<_> = sent
            .iter()
            .filter(|e| e.attributes[attr::FILEPATH].ends_with("/last.png"))
            .collect();
        assert_eq!(sentinels.len(), 1);
        assert_eq!(sent.last(), Some(sentinels[0]));
        assert_eq!(sentinels[0].attributes[attr::SEQUENCE_INDEX], "22");
        assert!(sent.iter().all(|e| e.attributes[attr::PAGE_COUNT] == "23"));
        assert_eq!(sent[0].attributes[attr::FILEPATH], "9/0001.png");
    }

    #[tokio::test]
    async fn sentinel_is_the_highest_sequence_index() {
        let (dispatcher, queue, _) = setup();
        let mut shuffled = pages(5);
        shuffled.reverse();
        dispatcher.dispatch("9", &shuffled, None).await.unwrap();
        let sent = queue.sent_messages().await;
        let last = sent.last().unwrap();
        assert_eq!(last.attributes[attr::SEQUENCE_INDEX], "4");
        assert!(last.body.contains("0005.png"));
    }

    #[tokio::test]
    async fn single_page_is_only_the_sentinel() {
        let (dispatcher, queue, _) = setup();
        let report = dispatcher.dispatch("9", &pages(1), None).await.unwrap();
        assert_eq!(report.batch_sizes, vec![1]);
        assert_eq!(queue.sent_messages().await[0].attributes[attr::FILEPATH], "9/last.png");
    }

    #[tokio::test]
    async fn malformed_pages_are_dropped_not_fatal() {
        let (dispatcher, queue, _) = setup();
        let mut refs = pages(4);
        refs[1] = PageRef::new(1, "https://kazneb.kz/a/b/c/d/e/f/broken?time=1");
        let report = dispatcher.dispatch("9", &refs, None).await.unwrap();

        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.sent(), 3);
        let sent = queue.sent_messages().await;
        assert!(sent.iter().all(|e| e.attributes[attr::PAGE_COUNT] == "3"));
    }

    #[tokio::test]
    async fn malformed_last_page_sends_nothing() {
        let (dispatcher, queue, _) = setup();
        let mut refs = pages(3);
        refs[2] = PageRef::new(2, "::::");
        let err = dispatcher.dispatch("9", &refs, None).await.unwrap_err();
        assert!(matches!(err, Book2PdfError::InvalidPageUrl { .. }));
        assert!(queue.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn assembled_book_short_circuits() {
        let (dispatcher, queue, store) = setup();
        store
            .put("9/book.pdf", b"%PDF".to_vec(), ObjectMetadata::new("application/pdf"))
            .await
            .unwrap();
        let report = dispatcher.dispatch("9", &pages(23), None).await.unwrap();
        assert!(report.already_assembled);
        assert_eq!(report.sent(), 0);
        assert!(queue.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn initiator_travels_on_every_message() {
        let (dispatcher, queue, _) = setup();
        let who = Initiator {
            email: "reader@example.org".into(),
            name: Some("Reader".into()),
        };
        dispatcher.dispatch("9", &pages(3), Some(&who)).await.unwrap();
        for e in queue.sent_messages().await {
            assert_eq!(e.attributes[attr::INITIATOR_EMAIL], "reader@example.org");
            assert_eq!(e.attributes[attr::INITIATOR_NAME], "Reader");
        }
    }

    #[tokio::test]
    async fn empty_page_list_sends_nothing() {
        let (dispatcher, queue, _) = setup();
        let report = dispatcher.dispatch("9", &[], None).await.unwrap();
        assert_eq!(report.sent(), 0);
        assert!(queue.sent_batches().await.is_empty());
    }

    #[tokio::test]
    async fn page_named_like_the_sentinel_gets_its_own_key() {
        use crate::pipeline::assemble::{classify_key, StorageKeyKind};

        let (dispatcher, queue, _) = setup();
        let mut refs = pages(4);
        refs[1] = PageRef::new(1, "https://kazneb.kz/a/b/c/d/e/f/last.png?time=1&key=k");
        refs[2] = PageRef::new(2, "https://kazneb.kz/a/b/c/d/e/f/last.jpg?time=1&key=k");
        let report = dispatcher.dispatch("9", &refs, None).await.unwrap();
        assert_eq!(report.sent(), 4);

        let keys: Vec<String> = queue
            .sent_messages()
            .await
            .iter()
            .map(|e| e.attributes[attr::FILEPATH].clone())
            .collect();
        assert_eq!(keys, vec!["9/0001.png", "9/last-1.png", "9/last-2.jpg", "9/last.png"]);

        let config = PipelineConfig::default();
        let sentinels = keys
            .iter()
            .filter(|k| matches!(classify_key(&config, k), StorageKeyKind::Sentinel { .. }))
            .count();
        assert_eq!(sentinels, 1);
    }

    #[test]
    fn keys_clear_of_the_sentinel_are_kept() {
        assert_eq!(clear_of_sentinel("9/0003.png", "last", 2), None);
        assert_eq!(clear_of_sentinel("9/lastly.png", "last", 2), None);
        assert_eq!(
            clear_of_sentinel("9/last.png", "last", 2).as_deref(),
            Some("9/last-2.png")
        );
    }
}
