//! Cleanup after assembly: delete page objects, mark the book ready.

use crate::collab::{BookRepository, ObjectStore};
use crate::config::PipelineConfig;
use crate::error::Book2PdfError;
use crate::model::BookStatus;
use crate::progress::{NoopProgressCallback, ProgressCallback};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<String>,
    /// Keys whose deletion failed; they stay in storage.
    pub failed: Vec<String>,
}

pub struct Cleanup {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    repository: Arc<dyn BookRepository>,
    progress: ProgressCallback,
}

impl Cleanup {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        repository: Arc<dyn BookRepository>,
    ) -> Self {
        Self {
            config,
            store,
            repository,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    /// Delete every object under `{bookId}/` except the PDF, then set the
    /// record to [`BookStatus::Ready`].
    ///
    /// Deletes are best effort: a failed one is logged and reported. Only
    /// a failure to list or to update the record is returned.
    pub async fn run(&self, book_id: &str) -> Result<CleanupReport, Book2PdfError> {
        let artifact = self.config.artifact_key(book_id);
        let mut report = CleanupReport::default();

        for object in self.store.list(&format!("{book_id}/")).await? {
            if object.key == artifact {
                continue;
            }
            match self.store.delete(&object.key).await {
                Ok(()) => report.deleted.push(object.key),
                Err(e) => {
                    warn!(book_id, key = %object.key, error = %e, "Could not delete page");
                    report.failed.push(object.key);
                }
            }
        }

        self.repository.set_status(book_id, BookStatus::Ready).await?;
        info!(
            book_id,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "Book is ready"
        );
        self.progress.on_book_ready(book_id);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::{MemoryBookRepository, MemoryObjectStore};
    use crate::model::{BookInfo, BookRecord, ObjectMetadata, ObjectSummary, StoredObject};
    use async_trait::async_trait;

    #[tokio::test]
    async fn keeps_only_the_pdf_and_marks_ready() {
        let store = Arc::new(MemoryObjectStore::new("b"));
        for key in ["4/1.png", "4/2.png", "4/last.png", "4/book.pdf", "40/1.png"] {
            store.put(key, vec![0], ObjectMetadata::default()).await.unwrap();
        }
        let repo = Arc::new(MemoryBookRepository::new());
        repo.save(&BookRecord::new("4", BookInfo::default())).await.unwrap();

        let report = Cleanup::new(PipelineConfig::default(), store.clone(), repo.clone())
            .run("4")
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(store.keys().await, vec!["4/book.pdf", "40/1.png"]);
        assert_eq!(repo.find("4").await.unwrap().unwrap().status, BookStatus::Ready);
    }

    /// Refuses to delete one key.
    struct Stubborn {
        inner: MemoryObjectStore,
        keep: &'static str,
    }

    #[async_trait]
    impl ObjectStore for Stubborn {
        async fn put(&self, k: &str, b: Vec<u8>, m: ObjectMetadata) -> Result<(), Book2PdfError> {
            self.inner.put(k, b, m).await
        }
        async fn get(&self, k: &str) -> Result<Option<StoredObject>, Book2PdfError> {
            self.inner.get(k).await
        }
        async fn head(&self, k: &str) -> Result<Option<ObjectMetadata>, Book2PdfError> {
            self.inner.head(k).await
        }
        async fn list(&self, p: &str) -> Result<Vec<ObjectSummary>, Book2PdfError> {
            self.inner.list(p).await
        }
        async fn delete(&self, k: &str) -> Result<(), Book2PdfError> {
            if k == self.keep {
                return Err(Book2PdfError::Storage {
                    op: "delete",
                    key: k.into(),
                    reason: "access denied".into(),
                });
            }
            self.inner.delete(k).await
        }
    }

    #[tokio::test]
    async fn failed_delete_does_not_block_ready() {
        let store = Arc::new(Stubborn {
            inner: MemoryObjectStore::new("b"),
            keep: "4/2.png",
        });
        for key in ["4/1.png", "4/2.png", "4/book.pdf"] {
            store.put(key, vec![0], ObjectMetadata::default()).await.unwrap();
        }
        let repo = Arc::new(MemoryBookRepository::new());
        repo.save(&BookRecord::new("4", BookInfo::default())).await.unwrap();

        let report = Cleanup::new(PipelineConfig::default(), store, repo.clone())
            .run("4")
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["4/1.png"]);
        assert_eq!(report.failed, vec!["4/2.png"]);
        assert_eq!(repo.find("4").await.unwrap().unwrap().status, BookStatus::Ready);
    }
}
