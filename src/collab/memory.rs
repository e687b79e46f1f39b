//! In-process collaborators.
//!
//! Used by the CLI to run the whole pipeline in one process and by the test
//! suite. They keep the contracts of the traits in [`super`]: overwrite on
//! `put`, key-ordered listing, batch limit on the queue, newest-first
//! history.

use super::{
    BookRepository, Collaborators, Email, Mailer, MessageQueue, ObjectStore, PageSource,
    QueueEnvelope, StorageEvent, UrlSigner,
};
use crate::config::{PipelineConfig, MAX_BATCH_SIZE};
use crate::error::Book2PdfError;
use crate::model::{
    BookRecord, BookRequest, BookStatus, DispatchMessage, ObjectMetadata, ObjectSummary,
    StoredObject,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

// ── Object store ─────────────────────────────────────────────────────────

/// Sorted in-memory bucket. Optionally reports every `put` on a channel,
/// standing in for bucket notifications.
pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    events: Mutex<Option<mpsc::UnboundedSender<StorageEvent>>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            events: Mutex::new(None),
        }
    }

    /// A store whose creations are reported on the returned receiver.
    pub fn with_events(bucket: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<StorageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let store = Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            events: Mutex::new(Some(tx)),
        };
        (store, rx)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), Book2PdfError> {
        let size = bytes.len() as u64;
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                key: key.to_string(),
                bytes,
                metadata,
            },
        );

        if let Some(tx) = self.events.lock().await.as_ref() {
            let event = StorageEvent {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                size,
            };
            if tx.send(event).is_err() {
                debug!(key, "Storage event receiver dropped");
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredObject>, Book2PdfError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, Book2PdfError> {
        Ok(self
            .objects
            .read()
            .await
            .get(key)
            .map(|o| o.metadata.clone()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>, Book2PdfError> {
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectSummary {
                key: k.clone(),
                size: o.bytes.len() as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), Book2PdfError> {
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn close(&self) {
        self.events.lock().await.take();
    }
}

// ── Queue ────────────────────────────────────────────────────────────────

/// FIFO queue that also remembers every batch it accepted.
pub struct MemoryQueue {
    name: String,
    max_batch: usize,
    pending: Mutex<VecDeque<QueueEnvelope>>,
    batches: Mutex<Vec<Vec<QueueEnvelope>>>,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_batch: MAX_BATCH_SIZE,
            pending: Mutex::new(VecDeque::new()),
            batches: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Every accepted batch, in send order.
    pub async fn sent_batches(&self) -> Vec<Vec<QueueEnvelope>> {
        self.batches.lock().await.clone()
    }

    /// Messages accepted so far, in send order.
    pub async fn sent_messages(&self) -> Vec<QueueEnvelope> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }

    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Put an envelope back at the front, as a visibility timeout would.
    pub async fn redeliver(&self, envelope: QueueEnvelope) {
        self.pending.lock().await.push_front(envelope);
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn send_batch(&self, messages: &[DispatchMessage]) -> Result<(), Book2PdfError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Book2PdfError::Queue {
                queue: self.name.clone(),
                reason: "queue is closed".into(),
            });
        }
        if messages.len() > self.max_batch {
            return Err(Book2PdfError::Queue {
                queue: self.name.clone(),
                reason: format!(
                    "batch of {} exceeds the limit of {}",
                    messages.len(),
                    self.max_batch
                ),
            });
        }
        if messages.is_empty() {
            return Ok(());
        }

        let envelopes: Vec<QueueEnvelope> = messages.iter().map(QueueEnvelope::from).collect();
        self.pending.lock().await.extend(envelopes.iter().cloned());
        self.batches.lock().await.push(envelopes);
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueEnvelope>, Book2PdfError> {
        let mut pending = self.pending.lock().await;
        let n = max.min(pending.len());
        Ok(pending.drain(..n).collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ── Metadata store ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBookRepository {
    records: RwLock<HashMap<String, BookRecord>>,
    requests: RwLock<Vec<BookRequest>>,
}

impl MemoryBookRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BookRepository for MemoryBookRepository {
    async fn save(&self, record: &BookRecord) -> Result<(), Book2PdfError> {
        self.records
            .write()
            .await
            .insert(record.book_id.clone(), record.clone());
        Ok(())
    }

    async fn find(&self, book_id: &str) -> Result<Option<BookRecord>, Book2PdfError> {
        Ok(self.records.read().await.get(book_id).cloned())
    }

    async fn set_status(&self, book_id: &str, status: BookStatus) -> Result<(), Book2PdfError> {
        if let Some(record) = self.records.write().await.get_mut(book_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn record_request(&self, request: &BookRequest) -> Result<(), Book2PdfError> {
        self.requests.write().await.push(request.clone());
        Ok(())
    }

    async fn history(&self, email: &str) -> Result<Vec<BookRecord>, Book2PdfError> {
        let mut mine: Vec<BookRequest> = self
            .requests
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.email == email)
            .cloned()
            .collect();
        // Stable: equal timestamps keep newest-inserted first.
        mine.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));

        let records = self.records.read().await;
        let mut seen = HashSet::new();
        Ok(mine
            .into_iter()
            .filter(|r| seen.insert(r.book_id.clone()))
            .filter_map(|r| records.get(&r.book_id).cloned())
            .collect())
    }
}

// ── Mail ─────────────────────────────────────────────────────────────────

/// Writes each email to the log instead of sending it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<(), Book2PdfError> {
        info!(
            from = %email.from,
            to = %email.to,
            subject = %email.subject,
            "Email: {}",
            email.html_body
        );
        Ok(())
    }
}

/// Keeps every email for inspection.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<Email>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Email> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &Email) -> Result<(), Book2PdfError> {
        self.sent.lock().await.push(email.clone());
        Ok(())
    }
}

// ── Viewer site ──────────────────────────────────────────────────────────

/// Serves fixed responses by exact URL. Unknown URLs answer like a 404.
#[derive(Default)]
pub struct StaticPageSource {
    responses: RwLock<HashMap<String, Vec<u8>>>,
    requests: AtomicUsize,
}

impl StaticPageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, url: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.responses.write().await.insert(url.into(), body.into());
    }

    pub async fn remove(&self, url: &str) {
        self.responses.write().await.remove(url);
    }

    /// Number of fetches served or refused so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    async fn lookup(&self, url: &str) -> Result<Vec<u8>, Book2PdfError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.responses
            .read()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| Book2PdfError::FetchFailed {
                url: url.to_string(),
                reason: "HTTP 404 Not Found".into(),
            })
    }
}

#[async_trait]
impl PageSource for StaticPageSource {
    async fn fetch_text(&self, url: &str, _timeout: Duration) -> Result<String, Book2PdfError> {
        let bytes = self.lookup(url).await?;
        String::from_utf8(bytes).map_err(|e| Book2PdfError::FetchFailed {
            url: url.to_string(),
            reason: format!("body is not UTF-8: {e}"),
        })
    }

    async fn fetch_bytes(&self, url: &str, _timeout: Duration) -> Result<Vec<u8>, Book2PdfError> {
        self.lookup(url).await
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Concrete handles of an in-memory registry, for inspection and driving.
pub struct MemoryHandles {
    pub store: Arc<MemoryObjectStore>,
    pub queue: Arc<MemoryQueue>,
    pub repository: Arc<MemoryBookRepository>,
    pub events: mpsc::UnboundedReceiver<StorageEvent>,
}

/// Build a registry of in-memory collaborators around `source` and `mailer`.
pub fn in_memory(
    config: &PipelineConfig,
    source: Arc<dyn PageSource>,
    mailer: Arc<dyn Mailer>,
) -> (Collaborators, MemoryHandles) {
    let (store, events) = MemoryObjectStore::with_events(&config.bucket_name);
    let store = Arc::new(store);
    let queue = Arc::new(MemoryQueue::new(&config.queue_name));
    let repository = Arc::new(MemoryBookRepository::new());

    let collaborators = Collaborators {
        store: store.clone(),
        queue: queue.clone(),
        repository: repository.clone(),
        mailer,
        source,
        signer: UrlSigner::from_config(config),
    };
    let handles = MemoryHandles {
        store,
        queue,
        repository,
        events,
    };
    (collaborators, handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BookInfo, MessageAttributes};
    use chrono::{TimeZone, Utc};

    fn message(key: &str) -> DispatchMessage {
        DispatchMessage {
            id: key.to_string(),
            body: format!("https://viewer.example/{key}"),
            attributes: MessageAttributes {
                book_id: "1".into(),
                storage_key: key.into(),
                content_type: "image/png".into(),
                is_last: false,
                sequence_index: None,
                page_count: None,
                initiator: None,
            },
        }
    }

    #[tokio::test]
    async fn put_overwrites_and_emits_events() {
        let (store, mut events) = MemoryObjectStore::with_events("b");
        store.put("1/a.png", vec![1], ObjectMetadata::new("image/png")).await.unwrap();
        store.put("1/a.png", vec![2, 2], ObjectMetadata::new("image/png")).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("1/a.png").await.unwrap().unwrap().bytes, vec![2, 2]);
        assert_eq!(events.recv().await.unwrap().size, 1);
        assert_eq!(events.recv().await.unwrap().size, 2);
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let store = MemoryObjectStore::new("b");
        for key in ["1/b.png", "1/a.png", "10/a.png", "2/a.png"] {
            store.put(key, vec![0], ObjectMetadata::default()).await.unwrap();
        }
        let keys: Vec<String> = store.list("1/").await.unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["1/a.png", "1/b.png"]);
    }

    #[tokio::test]
    async fn close_stops_events() {
        let (store, mut events) = MemoryObjectStore::with_events("b");
        store.close().await;
        store.put("1/a.png", vec![1], ObjectMetadata::default()).await.unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn queue_enforces_batch_limit() {
        let queue = MemoryQueue::new("q");
        let eleven: Vec<DispatchMessage> = (0..11).map(|i| message(&format!("1/{i}.png"))).collect();
        assert!(queue.send_batch(&eleven).await.is_err());
        queue.send_batch(&eleven[..10]).await.unwrap();
        assert_eq!(queue.pending().await, 10);
        assert_eq!(queue.receive(4).await.unwrap().len(), 4);
        assert_eq!(queue.pending().await, 6);
    }

    #[tokio::test]
    async fn closed_queue_refuses_sends() {
        let queue = MemoryQueue::new("q");
        queue.close().await;
        assert!(queue.send_batch(&[message("1/a.png")]).await.is_err());
    }

    #[tokio::test]
    async fn history_is_newest_first_without_duplicates() {
        let repo = MemoryBookRepository::new();
        for id in ["a", "b"] {
            repo.save(&BookRecord::new(id, BookInfo::default())).await.unwrap();
        }
        let at = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        for (id, h) in [("a", 1), ("b", 2), ("a", 3)] {
            repo.record_request(&BookRequest {
                book_id: id.into(),
                email: "r@x".into(),
                requested_at: at(h),
            })
            .await
            .unwrap();
        }
        let ids: Vec<String> = repo.history("r@x").await.unwrap().into_iter().map(|r| r.book_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(repo.history("nobody@x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_status_updates_record() {
        let repo = MemoryBookRepository::new();
        repo.save(&BookRecord::new("7", BookInfo::default())).await.unwrap();
        repo.set_status("7", BookStatus::Ready).await.unwrap();
        assert_eq!(repo.find("7").await.unwrap().unwrap().status, BookStatus::Ready);
        repo.set_status("missing", BookStatus::Ready).await.unwrap();
    }

    #[tokio::test]
    async fn static_source_answers_404_for_unknown_urls() {
        let source = StaticPageSource::new();
        source.insert("http://h/a", "hello").await;
        assert_eq!(source.fetch_text("http://h/a", Duration::from_secs(1)).await.unwrap(), "hello");
        assert!(source.fetch_bytes("http://h/b", Duration::from_secs(1)).await.is_err());
        assert_eq!(source.requests(), 2);
    }
}
