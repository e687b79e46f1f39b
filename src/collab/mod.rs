//! Collaborators at the edge of the pipeline.
//!
//! The pipeline never talks to a vendor SDK directly. Each outside system is
//! a small object-safe trait:
//!
//! | Trait | Stands for |
//! |-------|------------|
//! | [`ObjectStore`] | bucket holding pages and finished books |
//! | [`MessageQueue`] | queue carrying page dispatch messages |
//! | [`BookRepository`] | metadata store of book records and requests |
//! | [`Mailer`] | outbound email |
//! | [`PageSource`] | HTTP access to the viewer site |
//!
//! A [`Collaborators`] registry is built once at process start and handed to
//! every stage. [`Collaborators::shutdown`] tears it down explicitly.
//!
//! In-process implementations live in [`memory`] and [`fs`]; the real HTTP
//! page source is in [`http`].

pub mod fs;
pub mod http;
pub mod memory;
pub mod signer;

use crate::error::Book2PdfError;
use crate::model::{
    BookRecord, BookRequest, BookStatus, DispatchMessage, ObjectMetadata, ObjectSummary,
    StoredObject,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use signer::UrlSigner;

// ── Object storage ───────────────────────────────────────────────────────

/// Notification emitted when an object is created or overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub bucket: String,
    pub key: String,
    pub size: u64,
}

/// Key/value object storage with per-object metadata.
///
/// `put` is create-or-overwrite; writing the same key twice leaves one
/// object holding the second write.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), Book2PdfError>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<StoredObject>, Book2PdfError>;

    async fn head(&self, key: &str) -> Result<Option<ObjectMetadata>, Book2PdfError>;

    /// Objects whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>, Book2PdfError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), Book2PdfError>;

    async fn exists(&self, key: &str) -> Result<bool, Book2PdfError> {
        Ok(self.head(key).await?.is_some())
    }

    /// Stop emitting storage events.
    async fn close(&self) {}
}

// ── Queue ────────────────────────────────────────────────────────────────

/// A message as it travels on the queue: opaque id, body, string attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEnvelope {
    pub message_id: String,
    pub body: String,
    pub attributes: BTreeMap<String, String>,
}

impl From<&DispatchMessage> for QueueEnvelope {
    fn from(message: &DispatchMessage) -> Self {
        Self {
            message_id: message.id.clone(),
            body: message.body.clone(),
            attributes: message.attributes.to_map(),
        }
    }
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Send up to the queue's batch limit in one call.
    async fn send_batch(&self, messages: &[DispatchMessage]) -> Result<(), Book2PdfError>;

    /// Take up to `max` messages off the queue. Empty when nothing is waiting.
    async fn receive(&self, max: usize) -> Result<Vec<QueueEnvelope>, Book2PdfError>;

    /// Refuse further sends.
    async fn close(&self) {}
}

// ── Metadata store ───────────────────────────────────────────────────────

#[async_trait]
pub trait BookRepository: Send + Sync {
    /// Insert or replace the record for `record.book_id`.
    async fn save(&self, record: &BookRecord) -> Result<(), Book2PdfError>;

    async fn find(&self, book_id: &str) -> Result<Option<BookRecord>, Book2PdfError>;

    /// Single write of the status field. A missing record is not an error.
    async fn set_status(&self, book_id: &str, status: BookStatus) -> Result<(), Book2PdfError>;

    async fn record_request(&self, request: &BookRequest) -> Result<(), Book2PdfError>;

    /// Books requested by `email`, most recent request first, no duplicates.
    async fn history(&self, email: &str) -> Result<Vec<BookRecord>, Book2PdfError>;
}

// ── Mail ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &Email) -> Result<(), Book2PdfError>;
}

// ── Viewer site ──────────────────────────────────────────────────────────

/// HTTP GET against the viewer site, bounded by `timeout`.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, Book2PdfError>;

    async fn fetch_bytes(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, Book2PdfError>;
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Every collaborator a stage may need, built once per process.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub repository: Arc<dyn BookRepository>,
    pub mailer: Arc<dyn Mailer>,
    pub source: Arc<dyn PageSource>,
    pub signer: UrlSigner,
}

impl Collaborators {
    /// Close the queue and stop storage events. Further sends fail.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down collaborators");
        self.queue.close().await;
        self.store.close().await;
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}
