//! Page worker: download one page image and store it.
//!
//! One call per queue message, independent of every other call. Storing is
//! create-or-overwrite on a key derived only from the message, so a
//! redelivered message rewrites the same object with the same bytes.
//!
//! Failures are logged with the message id and returned as a
//! [`PageOutcome::Failed`]; they never propagate. A failed page is simply
//! absent when the book is assembled.

use crate::collab::{ObjectStore, PageSource};
use crate::config::PipelineConfig;
use crate::error::PageError;
use crate::model::{meta, DispatchMessage, ObjectMetadata};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to one dispatched page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Stored { key: String, bytes: usize },
    Failed(PageError),
}

impl PageOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PageOutcome::Stored { .. })
    }
}

#[derive(Clone)]
pub struct PageWorker {
    config: PipelineConfig,
    source: Arc<dyn PageSource>,
    store: Arc<dyn ObjectStore>,
    progress: ProgressCallback,
}

impl PageWorker {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn PageSource>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Metadata written next to the page: content type, initiator, and the
    /// ordering hints the assembler reads back.
    pub fn page_metadata(message: &DispatchMessage) -> ObjectMetadata {
        let attrs = &message.attributes;
        let mut metadata = ObjectMetadata::new(&attrs.content_type);
        metadata.set_initiator(attrs.initiator.as_ref());
        if let Some(i) = attrs.sequence_index {
            metadata = metadata.with(meta::SEQUENCE_INDEX, i.to_string());
        }
        if let Some(n) = attrs.page_count {
            metadata = metadata.with(meta::PAGE_COUNT, n.to_string());
        }
        metadata
    }

    pub async fn process(&self, message: &DispatchMessage) -> PageOutcome {
        let attrs = &message.attributes;
        let key = attrs.storage_key.as_str();
        debug!(message_id = %message.id, key, "Processing page");

        let bytes = match self
            .source
            .fetch_bytes(&message.body, self.config.download_timeout())
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(message_id = %message.id, key, error = %e, "Page download failed");
                return self.failed(
                    attrs.book_id.as_str(),
                    key,
                    PageError::DownloadFailed {
                        url: message.body.clone(),
                        detail: e.to_string(),
                    },
                );
            }
        };

        let size = bytes.len();
        if let Err(e) = self
            .store
            .put(key, bytes, Self::page_metadata(message))
            .await
        {
            warn!(message_id = %message.id, key, error = %e, "Page store failed");
            return self.failed(
                attrs.book_id.as_str(),
                key,
                PageError::StoreFailed {
                    key: key.to_string(),
                    detail: e.to_string(),
                },
            );
        }

        debug!(message_id = %message.id, key, bytes = size, "Page stored");
        self.progress.on_page_stored(&attrs.book_id, key);
        PageOutcome::Stored {
            key: key.to_string(),
            bytes: size,
        }
    }

    fn failed(&self, book_id: &str, key: &str, error: PageError) -> PageOutcome {
        self.progress.on_page_failed(book_id, key, &error.to_string());
        PageOutcome::Failed(error)
    }
}
