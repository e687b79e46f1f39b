//! Transport adapters.
//!
//! Each way work can arrive (a queue message, a storage notification, an
//! HTTP request) gets a small adapter that turns the transport's envelope
//! into the plain inputs the pipeline stages take. The stages themselves
//! never see an envelope. The HTTP adapter lives with the router in
//! `api`.

use crate::collab::{QueueEnvelope, StorageEvent};
use crate::config::PipelineConfig;
use crate::error::Book2PdfError;
use crate::model::{DispatchMessage, MessageAttributes};
use crate::pipeline::assemble::{classify_key, StorageKeyKind};

/// Turns one transport envelope into one core input.
pub trait TriggerAdapter {
    type Envelope;
    type Input;

    fn adapt(&self, envelope: Self::Envelope) -> Result<Self::Input, Book2PdfError>;
}

// ── Queue ────────────────────────────────────────────────────────────────

/// Queue message → [`DispatchMessage`] for the page worker.
#[derive(Debug, Clone)]
pub struct QueueTrigger {
    sentinel_stem: String,
}

impl QueueTrigger {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            sentinel_stem: config.sentinel_stem.clone(),
        }
    }
}

impl TriggerAdapter for QueueTrigger {
    type Envelope = QueueEnvelope;
    type Input = DispatchMessage;

    fn adapt(&self, envelope: QueueEnvelope) -> Result<DispatchMessage, Book2PdfError> {
        let body = envelope.body.trim();
        if body.is_empty() {
            return Err(Book2PdfError::InvalidPageUrl {
                url: String::new(),
                reason: format!("message {} has an empty body", envelope.message_id),
            });
        }
        let attributes =
            MessageAttributes::from_map(&envelope.message_id, &envelope.attributes, &self.sentinel_stem)?;
        Ok(DispatchMessage {
            id: envelope.message_id.clone(),
            body: body.to_string(),
            attributes,
        })
    }
}

// ── Storage ──────────────────────────────────────────────────────────────

/// What a storage notification asks the pipeline to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageAction {
    /// The sentinel page landed: assemble the book.
    Assemble { book_id: String, key: String },
    /// The PDF landed: clean up and notify.
    Finish { book_id: String },
    /// An ordinary page or a foreign object.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct StorageTrigger {
    config: PipelineConfig,
}

impl StorageTrigger {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl TriggerAdapter for StorageTrigger {
    type Envelope = StorageEvent;
    type Input = StorageAction;

    fn adapt(&self, event: StorageEvent) -> Result<StorageAction, Book2PdfError> {
        if event.bucket != self.config.bucket_name {
            return Ok(StorageAction::Ignore);
        }
        Ok(match classify_key(&self.config, &event.key) {
            StorageKeyKind::Sentinel { book_id } => StorageAction::Assemble {
                book_id,
                key: event.key,
            },
            StorageKeyKind::Artifact { book_id } => StorageAction::Finish { book_id },
            StorageKeyKind::Page { .. } | StorageKeyKind::Foreign => StorageAction::Ignore,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attr;
    use std::collections::BTreeMap;

    fn envelope(attrs: &[(&str, &str)], body: &str) -> QueueEnvelope {
        QueueEnvelope {
            message_id: "m-9".into(),
            body: body.into(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn queue_envelope_becomes_message() {
        let trigger = QueueTrigger::new(&PipelineConfig::default());
        let m = trigger
            .adapt(envelope(
                &[(attr::FILEPATH, "3/last.png"), (attr::CONTENT_TYPE, "image/png")],
                " https://h/p.png ",
            ))
            .unwrap();
        assert_eq!(m.id, "m-9");
        assert_eq!(m.body, "https://h/p.png");
        assert!(m.attributes.is_last);
        assert_eq!(m.attributes.book_id, "3");
    }

    #[test]
    fn queue_envelope_without_filepath_is_rejected() {
        let trigger = QueueTrigger::new(&PipelineConfig::default());
        let err = trigger.adapt(envelope(&[], "https://h/p.png")).unwrap_err();
        assert!(matches!(err, Book2PdfError::MissingAttribute { .. }));
        let err = trigger
            .adapt(envelope(&[(attr::FILEPATH, "3/1.png")], "  "))
            .unwrap_err();
        assert!(matches!(err, Book2PdfError::InvalidPageUrl { .. }));
    }

    #[test]
    fn storage_events_map_to_actions() {
        let config = PipelineConfig::default();
        let trigger = StorageTrigger::new(&config);
        let event = |key: &str| StorageEvent {
            bucket: config.bucket_name.clone(),
            key: key.into(),
            size: 1,
        };
        assert_eq!(
            trigger.adapt(event("5/last.jpg")).unwrap(),
            StorageAction::Assemble {
                book_id: "5".into(),
                key: "5/last.jpg".into()
            }
        );
        assert_eq!(
            trigger.adapt(event("5/book.pdf")).unwrap(),
            StorageAction::Finish { book_id: "5".into() }
        );
        assert_eq!(trigger.adapt(event("5/0003.jpg")).unwrap(), StorageAction::Ignore);

        let foreign = StorageEvent {
            bucket: "other".into(),
            key: "5/last.jpg".into(),
            size: 1,
        };
        assert_eq!(trigger.adapt(foreign).unwrap(), StorageAction::Ignore);
    }
}
