//! `BookService`: the use cases behind the HTTP API and the CLI, plus the
//! in-process drivers that stand in for queue and storage triggers.
//!
//! ## Why a service object?
//!
//! Every stage is built once from the same [`PipelineConfig`] and
//! [`Collaborators`] registry and then shared behind an `Arc`. Handlers stay
//! thin: they adapt their transport and call one method here.
//!
//! ## Drivers
//!
//! In production the queue and the bucket invoke the worker and the
//! assembler. In one process, [`BookService::drain_queue`] plays the queue
//! (bounded parallelism via `buffer_unordered`) and
//! [`BookService::handle_storage_event`] plays the bucket notification.
//! [`BookService::run_until_idle`] alternates both until nothing is left,
//! and [`BookService::spawn_background`] keeps doing so for a server, with
//! the queue drain and every storage event on separate tasks.

use crate::collab::{Collaborators, QueueEnvelope, StorageEvent};
use crate::config::PipelineConfig;
use crate::error::{Book2PdfError, PageError};
use crate::model::{BookRecord, BookRequest, BookStatus, DownloadLink, Initiator};
use crate::pipeline::assemble::{Assembler, AssemblyReport, CompletionDetector};
use crate::pipeline::cleanup::{Cleanup, CleanupReport};
use crate::pipeline::dispatch::{DispatchReport, Dispatcher};
use crate::pipeline::download::ExistenceCheck;
use crate::pipeline::extract::{book_id_from_viewer_url, PageUrlExtractor};
use crate::pipeline::notify::{Notifier, NotifyOutcome};
use crate::pipeline::worker::{PageOutcome, PageWorker};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::triggers::{QueueTrigger, StorageAction, StorageTrigger, TriggerAdapter};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Result of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub record: BookRecord,
    /// `None` when the book was already assembled and discovery was skipped.
    pub dispatch: Option<DispatchReport>,
}

/// Counts from one [`BookService::drain_queue`] run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub stored: usize,
    pub failed: Vec<PageError>,
}

/// What a storage event led to.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOutcome {
    Assembled(AssemblyReport),
    Finished {
        cleanup: CleanupReport,
        notification: Option<NotifyOutcome>,
    },
    Ignored,
}

pub struct BookService {
    config: PipelineConfig,
    collab: Collaborators,
    extractor: PageUrlExtractor,
    existence: ExistenceCheck,
    dispatcher: Dispatcher,
    worker: PageWorker,
    detector: CompletionDetector,
    assembler: Assembler,
    cleanup: Cleanup,
    notifier: Notifier,
    queue_trigger: QueueTrigger,
    storage_trigger: StorageTrigger,
    progress: ProgressCallback,
}

impl BookService {
    pub fn new(config: PipelineConfig, collab: Collaborators) -> Self {
        Self::build(config, collab, Arc::new(NoopProgressCallback))
    }

    /// Rebuild the stages so they report to `progress`.
    pub fn with_progress(self, progress: ProgressCallback) -> Self {
        Self::build(self.config, self.collab, progress)
    }

    fn build(config: PipelineConfig, collab: Collaborators, progress: ProgressCallback) -> Self {
        let existence =
            ExistenceCheck::new(config.clone(), collab.store.clone(), collab.signer.clone());
        Self {
            extractor: PageUrlExtractor::new(config.clone(), collab.source.clone()),
            dispatcher: Dispatcher::new(config.clone(), collab.queue.clone(), existence.clone())
                .with_progress(progress.clone()),
            existence,
            worker: PageWorker::new(config.clone(), collab.source.clone(), collab.store.clone())
                .with_progress(progress.clone()),
            detector: CompletionDetector::new(config.clone(), collab.store.clone()),
            assembler: Assembler::new(config.clone(), collab.store.clone())
                .with_progress(progress.clone()),
            cleanup: Cleanup::new(config.clone(), collab.store.clone(), collab.repository.clone())
                .with_progress(progress.clone()),
            notifier: Notifier::new(
                config.clone(),
                collab.store.clone(),
                collab.mailer.clone(),
                collab.signer.clone(),
            ),
            queue_trigger: QueueTrigger::new(&config),
            storage_trigger: StorageTrigger::new(&config),
            progress,
            config,
            collab,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    // ── Use cases ────────────────────────────────────────────────────────

    /// Discover the pages of `viewer_url` and dispatch them.
    ///
    /// An already assembled book is not scraped again; the request is
    /// still recorded in the initiator's history.
    pub async fn submit(
        &self,
        viewer_url: &str,
        initiator: Option<Initiator>,
    ) -> Result<SubmitOutcome, Book2PdfError> {
        let book_id = book_id_from_viewer_url(viewer_url, &self.config.book_id_param)?;
        info!(book_id, url = viewer_url, "Book submitted");

        if self.existence.exists(&book_id).await? {
            info!(book_id, "Book has already been assembled");
            self.progress.on_already_assembled(&book_id);
            let record = match self.collab.repository.find(&book_id).await? {
                Some(record) => record,
                None => {
                    let mut record =
                        BookRecord::new(&book_id, self.extractor.book_info(&book_id).await);
                    record.status = BookStatus::Ready;
                    self.collab.repository.save(&record).await?;
                    record
                }
            };
            self.record_request(&book_id, initiator.as_ref()).await?;
            return Ok(SubmitOutcome {
                record,
                dispatch: None,
            });
        }

        let pages = self.extractor.discover(viewer_url).await?;
        if pages.is_empty() {
            return Err(Book2PdfError::NoPagesFound {
                url: viewer_url.to_string(),
            });
        }
        self.progress.on_pages_discovered(&book_id, pages.len());

        let mut record = BookRecord::new(&book_id, self.extractor.book_info(&book_id).await);
        self.collab.repository.save(&record).await?;
        self.record_request(&book_id, initiator.as_ref()).await?;

        let report = self
            .dispatcher
            .dispatch(&book_id, &pages, initiator.as_ref())
            .await?;
        if report.sent() > 0 {
            self.collab
                .repository
                .set_status(&book_id, BookStatus::Processing)
                .await?;
            record.status = BookStatus::Processing;
        }

        Ok(SubmitOutcome {
            record,
            dispatch: Some(report),
        })
    }

    async fn record_request(
        &self,
        book_id: &str,
        initiator: Option<&Initiator>,
    ) -> Result<(), Book2PdfError> {
        let Some(who) = initiator else {
            return Ok(());
        };
        self.collab
            .repository
            .record_request(&BookRequest {
                book_id: book_id.to_string(),
                email: who.email.clone(),
                requested_at: Utc::now(),
            })
            .await
    }

    /// Stored record of `book_id`.
    pub async fn info(&self, book_id: &str) -> Result<BookRecord, Book2PdfError> {
        self.collab
            .repository
            .find(book_id)
            .await?
            .ok_or_else(|| Book2PdfError::BookNotFound {
                book_id: book_id.to_string(),
            })
    }

    pub async fn download_link(&self, book_id: &str) -> Result<DownloadLink, Book2PdfError> {
        self.existence.download_link(book_id).await
    }

    pub async fn history(&self, email: &str) -> Result<Vec<BookRecord>, Book2PdfError> {
        self.collab.repository.history(email).await
    }

    // ── Queue driver ─────────────────────────────────────────────────────

    /// Run the page worker on one queue message. Never fails: an
    /// unreadable message is logged and reported like a failed page.
    pub async fn handle_queue_message(&self, envelope: QueueEnvelope) -> PageOutcome {
        let message_id = envelope.message_id.clone();
        let body = envelope.body.clone();
        match self.queue_trigger.adapt(envelope) {
            Ok(message) => self.worker.process(&message).await,
            Err(e) => {
                warn!(message_id, error = %e, "Discarding unreadable queue message");
                PageOutcome::Failed(PageError::InvalidUrl {
                    url: body,
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Process queued messages until the queue is empty.
    pub async fn drain_queue(&self) -> Result<DrainReport, Book2PdfError> {
        let mut report = DrainReport::default();
        loop {
            let batch = self.collab.queue.receive(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            debug!(messages = batch.len(), "Received queue batch");

            let outcomes: Vec<PageOutcome> = stream::iter(batch)
                .map(|envelope| self.handle_queue_message(envelope))
                .buffer_unordered(self.config.worker_concurrency)
                .collect()
                .await;

            for outcome in outcomes {
                match outcome {
                    PageOutcome::Stored { .. } => report.stored += 1,
                    PageOutcome::Failed(e) => report.failed.push(e),
                }
            }
        }
        Ok(report)
    }

    // ── Storage driver ───────────────────────────────────────────────────

    /// React to one object creation.
    ///
    /// A sentinel starts assembly (once per book); the PDF starts cleanup
    /// and then notification. A failed notification is logged, not
    /// returned: the book is ready either way.
    pub async fn handle_storage_event(
        &self,
        event: StorageEvent,
    ) -> Result<StorageOutcome, Book2PdfError> {
        match self.storage_trigger.adapt(event)? {
            StorageAction::Assemble { book_id, key } => {
                let Some(claim) = self.detector.detect(&key).await? else {
                    return Ok(StorageOutcome::Ignored);
                };
                info!(book_id, key, "Sentinel page stored; assembling");
                let report = self.assembler.assemble(claim.book_id()).await;
                drop(claim);
                Ok(StorageOutcome::Assembled(report?))
            }
            StorageAction::Finish { book_id } => {
                let cleanup = self.cleanup.run(&book_id).await?;
                let notification = match self.notifier.notify(&book_id).await {
                    Ok(outcome) => Some(outcome),
                    Err(e) => {
                        warn!(book_id, error = %e, "Readiness notification failed");
                        None
                    }
                };
                Ok(StorageOutcome::Finished {
                    cleanup,
                    notification,
                })
            }
            StorageAction::Ignore => Ok(StorageOutcome::Ignored),
        }
    }

    /// Alternate queue draining and event handling until both are idle.
    ///
    /// Event handling errors are logged and do not stop the loop.
    pub async fn run_until_idle(
        &self,
        events: &mut mpsc::UnboundedReceiver<StorageEvent>,
    ) -> Result<Vec<StorageOutcome>, Book2PdfError> {
        let mut outcomes = Vec::new();
        loop {
            let drained = self.drain_queue().await?;
            let mut handled = 0;
            while let Ok(event) = events.try_recv() {
                handled += 1;
                match self.handle_storage_event(event).await {
                    Ok(StorageOutcome::Ignored) => {}
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => error!(error = %e, "Storage event handling failed"),
                }
            }
            if drained.stored == 0 && drained.failed.is_empty() && handled == 0 {
                return Ok(outcomes);
            }
        }
    }

    /// Keep draining the queue every `poll` and handle storage events as
    /// they arrive, each in its own task so a book waiting for its pages
    /// holds up no other book. Ends when the event channel closes, which
    /// [`Collaborators::shutdown`] causes, after the running event tasks
    /// have finished.
    pub fn spawn_background(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<StorageEvent>,
        poll: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (stop_tx, stop_rx) = oneshot::channel();
            let drainer = tokio::spawn(self.clone().drain_every(poll, stop_rx));
            let mut tasks = JoinSet::new();

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            break;
                        };
                        let service = self.clone();
                        tasks.spawn(async move {
                            if let Err(e) = service.handle_storage_event(event).await {
                                error!(error = %e, "Storage event handling failed");
                            }
                        });
                    }
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "Storage event task failed");
                        }
                    }
                }
            }

            info!(
                running = tasks.len(),
                "Storage events closed; background worker stopping"
            );
            let _ = stop_tx.send(());
            if let Err(e) = drainer.await {
                error!(error = %e, "Queue drain task failed");
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Storage event task failed");
                }
            }
        })
    }

    /// Drain the queue every `poll` until `stop` fires. A drain that has
    /// started runs to completion.
    async fn drain_every(self: Arc<Self>, poll: Duration, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_queue().await {
                        error!(error = %e, "Queue drain failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::{self, RecordingMailer, StaticPageSource};
    use crate::collab::{BookRepository, MessageQueue, ObjectStore};
    use crate::config::CompletenessPolicy;
    use crate::model::ObjectMetadata;

    const VIEWER: &str = "https://kazneb.kz/bookView/view?brId=77&simple=true";

    fn config() -> PipelineConfig {
        PipelineConfig::builder()
            .completeness(CompletenessPolicy::Snapshot)
            .build()
            .unwrap()
    }

    async fn service(viewer_html: Option<&str>) -> (BookService, memory::MemoryHandles) {
        let source = Arc::new(StaticPageSource::new());
        if let Some(html) = viewer_html {
            source.insert(VIEWER, html.to_string()).await;
        }
        let (collab, handles) = memory::in_memory(&config(), source, Arc::new(RecordingMailer::new()));
        (BookService::new(config(), collab), handles)
    }

    #[tokio::test]
    async fn submit_without_pages_is_404() {
        let (svc, handles) = service(Some("<html></html>")).await;
        let err = svc.submit(VIEWER, None).await.unwrap_err();
        assert_eq!(err.status(), 404);
        assert_eq!(err.to_string(), "Pages URLs have not been found on the given URL");
        assert!(handles.repository.find("77").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn submit_without_book_id_is_400() {
        let (svc, _) = service(None).await;
        let err = svc.submit("https://kazneb.kz/view", None).await.unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn submit_marks_record_processing() {
        let html = r#"<script>pages.push("/a/b/c/d/e/f/1.png?time=1&amp;key=k");</script>"#;
        let (svc, handles) = service(Some(html)).await;
        let who = Initiator {
            email: "r@x".into(),
            name: None,
        };
        let outcome = svc.submit(VIEWER, Some(who)).await.unwrap();
        assert_eq!(outcome.record.status, BookStatus::Processing);
        assert_eq!(outcome.dispatch.unwrap().sent(), 1);
        assert_eq!(
            handles.repository.find("77").await.unwrap().unwrap().status,
            BookStatus::Processing
        );
        assert_eq!(svc.history("r@x").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn assembled_book_is_not_scraped_again() {
        let (svc, handles) = service(None).await;
        handles
            .store
            .put("77/book.pdf", b"%PDF".to_vec(), ObjectMetadata::new("application/pdf"))
            .await
            .unwrap();
        let outcome = svc.submit(VIEWER, None).await.unwrap();
        assert!(outcome.dispatch.is_none());
        assert_eq!(outcome.record.status, BookStatus::Ready);
        assert!(handles.queue.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn unreadable_queue_message_is_reported_not_raised() {
        let (svc, _) = service(None).await;
        let outcome = svc
            .handle_queue_message(QueueEnvelope {
                message_id: "x".into(),
                body: "https://h/p.png".into(),
                attributes: Default::default(),
            })
            .await;
        assert!(matches!(outcome, PageOutcome::Failed(PageError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn page_events_are_ignored() {
        let (svc, _) = service(None).await;
        let outcome = svc
            .handle_storage_event(StorageEvent {
                bucket: svc.config().bucket_name.clone(),
                key: "77/0001.png".into(),
                size: 1,
            })
            .await
            .unwrap();
        assert_eq!(outcome, StorageOutcome::Ignored);
    }

    #[tokio::test]
    async fn shutdown_closes_queue() {
        let (svc, handles) = service(None).await;
        svc.collaborators().shutdown().await;
        let err = handles.queue.send_batch(&[]).await;
        assert!(err.is_err());
    }
}
