//! Notifier: email the requester a signed link once the book exists.

use crate::collab::{Email, Mailer, ObjectStore, UrlSigner};
use crate::config::PipelineConfig;
use crate::error::Book2PdfError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const SUBJECT: &str = "Your book is ready to download";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyOutcome {
    Sent { to: String, link: String },
    /// The book carries no initiator; nobody to tell.
    NoInitiator,
}

pub struct Notifier {
    config: PipelineConfig,
    store: Arc<dyn ObjectStore>,
    mailer: Arc<dyn Mailer>,
    signer: UrlSigner,
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// HTML body of the readiness email.
pub fn email_body(link: &str, name: Option<&str>) -> String {
    let greeting = match name {
        Some(n) => format!("<p>Hello, {}!</p> ", escape_attr(n)),
        None => String::new(),
    };
    format!(
        "<html> <head></head> <body> {greeting}<a href=\"{}\">Link to file</a> </body></html>",
        escape_attr(link)
    )
}

impl Notifier {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        mailer: Arc<dyn Mailer>,
        signer: UrlSigner,
    ) -> Self {
        Self {
            config,
            store,
            mailer,
            signer,
        }
    }

    pub async fn notify(&self, book_id: &str) -> Result<NotifyOutcome, Book2PdfError> {
        self.notify_at(book_id, Utc::now()).await
    }

    /// Send the link for `book_id` to the initiator recorded on its PDF.
    pub async fn notify_at(
        &self,
        book_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NotifyOutcome, Book2PdfError> {
        let key = self.config.artifact_key(book_id);
        let metadata = self
            .store
            .head(&key)
            .await?
            .ok_or_else(|| Book2PdfError::BookNotFound {
                book_id: book_id.to_string(),
            })?;

        let Some(initiator) = metadata.initiator() else {
            info!(book_id, "Book has no initiator; skipping notification");
            return Ok(NotifyOutcome::NoInitiator);
        };

        let link = self.signer.sign(
            &key,
            Duration::from_secs(self.config.notification_link_ttl_secs),
            now,
        )?;
        let email = Email {
            from: self.config.sender_email.clone(),
            to: initiator.email.clone(),
            subject: SUBJECT.to_string(),
            html_body: email_body(&link.download_link, initiator.name.as_deref()),
        };
        self.mailer.send(&email).await?;

        info!(book_id, to = %initiator.email, "Readiness notification sent");
        Ok(NotifyOutcome::Sent {
            to: initiator.email,
            link: link.download_link,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::{MemoryObjectStore, RecordingMailer};
    use crate::model::{Initiator, ObjectMetadata};

    async fn notifier(metadata: Option<ObjectMetadata>) -> (Notifier, Arc<RecordingMailer>) {
        let config = PipelineConfig::default();
        let store = Arc::new(MemoryObjectStore::new("b"));
        if let Some(m) = metadata {
            store.put("8/book.pdf", b"%PDF".to_vec(), m).await.unwrap();
        }
        let mailer = Arc::new(RecordingMailer::new());
        let signer = UrlSigner::from_config(&config);
        (Notifier::new(config, store, mailer.clone(), signer), mailer)
    }

    #[tokio::test]
    async fn emails_signed_link_to_initiator() {
        let mut m = ObjectMetadata::new("application/pdf");
        m.set_initiator(Some(&Initiator {
            email: "r@example.org".into(),
            name: Some("Reader".into()),
        }));
        let (notifier, mailer) = notifier(Some(m)).await;

        let outcome = notifier.notify("8").await.unwrap();
        let NotifyOutcome::Sent { to, link } = outcome else {
            panic!("expected a sent notification");
        };
        assert_eq!(to, "r@example.org");
        assert!(link.contains("/8/book.pdf?expires="));

        let sent = mailer.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, SUBJECT);
        assert_eq!(sent[0].to, "r@example.org");
        assert!(sent[0].html_body.contains("Link to file"));
        assert!(sent[0].html_body.contains("&amp;signature="));
    }

    #[tokio::test]
    async fn missing_initiator_is_skipped() {
        let (notifier, mailer) = notifier(Some(ObjectMetadata::new("application/pdf"))).await;
        assert_eq!(notifier.notify("8").await.unwrap(), NotifyOutcome::NoInitiator);
        assert!(mailer.sent().await.is_empty());
    }

    #[tokio::test]
    async fn missing_book_is_an_error() {
        let (notifier, _) = notifier(None).await;
        assert!(matches!(
            notifier.notify("8").await,
            Err(Book2PdfError::BookNotFound { .. })
        ));
    }

    #[test]
    fn body_escapes_link() {
        let body = email_body("https://h/x?a=1&b=2", None);
        assert!(body.contains(r#"href="https://h/x?a=1&amp;b=2""#));
    }
}
