//! Existence check and download links for finished books.
//!
//! Serves two callers: the read API, which turns a book id into a signed
//! link, and the dispatcher, which skips books that are already assembled.

use crate::collab::{ObjectStore, UrlSigner};
use crate::config::PipelineConfig;
use crate::error::Book2PdfError;
use crate::model::DownloadLink;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct ExistenceCheck {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    signer: UrlSigner,
}

impl ExistenceCheck {
    pub fn new(config: PipelineConfig, store: Arc<dyn ObjectStore>, signer: UrlSigner) -> Self {
        Self {
            config,
            store,
            signer,
        }
    }

    /// Whether `{bookId}/book.pdf` exists.
    pub async fn exists(&self, book_id: &str) -> Result<bool, Book2PdfError> {
        self.store.exists(&self.config.artifact_key(book_id)).await
    }

    /// Signed link to the finished book, valid for the download TTL.
    pub async fn download_link(&self, book_id: &str) -> Result<DownloadLink, Book2PdfError> {
        self.download_link_at(book_id, Utc::now()).await
    }

    pub async fn download_link_at(
        &self,
        book_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DownloadLink, Book2PdfError> {
        if !self.exists(book_id).await? {
            debug!(book_id, "No assembled book to link to");
            return Err(Book2PdfError::BookNotFound {
                book_id: book_id.to_string(),
            });
        }
        self.signer.sign(
            &self.config.artifact_key(book_id),
            Duration::from_secs(self.config.download_link_ttl_secs),
            now,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::MemoryObjectStore;
    use crate::model::ObjectMetadata;

    fn check(store: Arc<MemoryObjectStore>) -> ExistenceCheck {
        let config = PipelineConfig::default();
        let signer = UrlSigner::from_config(&config);
        ExistenceCheck::new(config, store, signer)
    }

    #[tokio::test]
    async fn missing_book_is_not_found() {
        let check = check(Arc::new(MemoryObjectStore::new("b")));
        assert!(!check.exists("3").await.unwrap());
        let err = check.download_link("3").await.unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn finished_book_gets_three_day_link() {
        let store = Arc::new(MemoryObjectStore::new("b"));
        store
            .put("3/book.pdf", b"%PDF".to_vec(), ObjectMetadata::new("application/pdf"))
            .await
            .unwrap();
        let check = check(store);
        let now = Utc::now();
        let link = check.download_link_at("3", now).await.unwrap();
        assert!(link.download_link.contains("/3/book.pdf?expires="));
        assert_eq!(link.expires_at, now + chrono::Duration::days(3));
    }

    #[tokio::test]
    async fn pages_alone_do_not_count_as_finished() {
        let store = Arc::new(MemoryObjectStore::new("b"));
        store.put("3/last.png", vec![1], ObjectMetadata::default()).await.unwrap();
        assert!(!check(store).exists("3").await.unwrap());
    }
}
