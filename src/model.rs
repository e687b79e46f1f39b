//! Data model shared by every stage of the pipeline.
//!
//! The wire shapes here (queue attributes, object metadata keys, storage
//! key layout) are the contract between stages that never call each other
//! directly: the dispatcher writes them, the page worker and the assembler
//! read them back from another process.

use crate::error::Book2PdfError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ── Queue attribute and object metadata names ────────────────────────────

pub mod attr {
    //! Names of queue message attributes.
    pub const FILEPATH: &str = "filepath";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const BOOK_ID: &str = "book-id";
    pub const SEQUENCE_INDEX: &str = "sequence-index";
    pub const PAGE_COUNT: &str = "page-count";
    pub const INITIATOR_EMAIL: &str = "initiator.email";
    pub const INITIATOR_NAME: &str = "initiator.name";
}

pub mod meta {
    //! Names of user metadata entries on stored objects.
    pub const INITIATOR_EMAIL: &str = "initiator-email";
    pub const INITIATOR_NAME: &str = "initiator-name";
    pub const SEQUENCE_INDEX: &str = "sequence-index";
    pub const PAGE_COUNT: &str = "page-count";
}

// ── Pages ────────────────────────────────────────────────────────────────

/// One page image discovered on the viewer page.
///
/// `sequence_index` is the position in document order and the sort key at
/// assembly time. `filename` and `content_type` come from the URL path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRef {
    pub source_url: String,
    pub sequence_index: usize,
    pub filename: String,
    pub content_type: String,
}

impl PageRef {
    pub fn new(sequence_index: usize, source_url: impl Into<String>) -> Self {
        let source_url = source_url.into();
        let path = source_url.split(['?', '#']).next().unwrap_or_default();
        let filename = path.rsplit('/').next().unwrap_or_default().to_string();
        let content_type = match extension(&filename) {
            Some(ext) => format!("image/{}", ext.to_ascii_lowercase()),
            None => String::new(),
        };
        Self {
            source_url,
            sequence_index,
            filename,
            content_type,
        }
    }
}

/// Identity of whoever asked for the book; receives the notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Initiator {
    pub email: String,
    pub name: Option<String>,
}

// ── Dispatch messages ────────────────────────────────────────────────────

/// Routing and storage metadata travelling with a page URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageAttributes {
    pub book_id: String,
    pub storage_key: String,
    pub content_type: String,
    pub is_last: bool,
    pub sequence_index: Option<usize>,
    pub page_count: Option<usize>,
    pub initiator: Option<Initiator>,
}

impl MessageAttributes {
    /// Flatten into string attributes as they travel on the queue.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(attr::FILEPATH.to_string(), self.storage_key.clone());
        map.insert(attr::CONTENT_TYPE.to_string(), self.content_type.clone());
        map.insert(attr::BOOK_ID.to_string(), self.book_id.clone());
        if let Some(i) = self.sequence_index {
            map.insert(attr::SEQUENCE_INDEX.to_string(), i.to_string());
        }
        if let Some(n) = self.page_count {
            map.insert(attr::PAGE_COUNT.to_string(), n.to_string());
        }
        if let Some(ref who) = self.initiator {
            map.insert(attr::INITIATOR_EMAIL.to_string(), who.email.clone());
            if let Some(ref name) = who.name {
                map.insert(attr::INITIATOR_NAME.to_string(), name.clone());
            }
        }
        map
    }

    /// Rebuild from queue attributes. The sentinel is recognised by its
    /// storage key stem, so it survives transports that only keep `filepath`.
    pub fn from_map(
        message_id: &str,
        map: &BTreeMap<String, String>,
        sentinel_stem: &str,
    ) -> Result<Self, Book2PdfError> {
        let required = |name: &'static str| {
            map.get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Book2PdfError::MissingAttribute {
                    message_id: message_id.to_string(),
                    attribute: name,
                })
        };

        let storage_key = required(attr::FILEPATH)?;
        let (key_book, filename) = split_key(&storage_key).ok_or_else(|| {
            Book2PdfError::UnexpectedKey {
                key: storage_key.clone(),
            }
        })?;
        let book_id = map
            .get(attr::BOOK_ID)
            .filter(|v| !v.is_empty())
            .cloned()
            .unwrap_or_else(|| key_book.to_string());
        let is_last = file_stem(filename) == sentinel_stem;
        let content_type = map
            .get(attr::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| content_type_for(filename));
        let initiator = map.get(attr::INITIATOR_EMAIL).map(|email| Initiator {
            email: email.clone(),
            name: map.get(attr::INITIATOR_NAME).cloned(),
        });

        Ok(Self {
            book_id,
            storage_key,
            content_type,
            is_last,
            sequence_index: map.get(attr::SEQUENCE_INDEX).and_then(|v| v.parse().ok()),
            page_count: map.get(attr::PAGE_COUNT).and_then(|v| v.parse().ok()),
            initiator,
        })
    }
}

/// A page URL plus its attributes: one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchMessage {
    pub id: String,
    pub body: String,
    pub attributes: MessageAttributes,
}

// ── Stored objects ───────────────────────────────────────────────────────

/// Metadata kept alongside an object in storage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: String,
    #[serde(default)]
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            user: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.user.insert(key.to_string(), value.into());
        self
    }

    pub fn initiator(&self) -> Option<Initiator> {
        self.user.get(meta::INITIATOR_EMAIL).map(|email| Initiator {
            email: email.clone(),
            name: self.user.get(meta::INITIATOR_NAME).cloned(),
        })
    }

    pub fn set_initiator(&mut self, initiator: Option<&Initiator>) {
        if let Some(who) = initiator {
            self.user
                .insert(meta::INITIATOR_EMAIL.to_string(), who.email.clone());
            if let Some(ref name) = who.name {
                self.user.insert(meta::INITIATOR_NAME.to_string(), name.clone());
            }
        }
    }

    pub fn sequence_index(&self) -> Option<usize> {
        self.user.get(meta::SEQUENCE_INDEX).and_then(|v| v.parse().ok())
    }

    pub fn page_count(&self) -> Option<usize> {
        self.user.get(meta::PAGE_COUNT).and_then(|v| v.parse().ok())
    }
}

/// Listing entry of an object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
}

/// Object content with its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub metadata: ObjectMetadata,
}

/// The assembled book as stored under `{bookId}/book.pdf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookArtifact {
    pub book_id: String,
    pub key: String,
    pub page_count: usize,
    pub metadata: ObjectMetadata,
}

// ── Book records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BookStatus {
    Pending,
    Processing,
    Ready,
}

/// Metadata-store entry for a book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRecord {
    pub book_id: String,
    pub status: BookStatus,
    pub title: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
}

impl BookRecord {
    pub fn new(book_id: impl Into<String>, info: BookInfo) -> Self {
        Self {
            book_id: book_id.into(),
            status: BookStatus::Pending,
            title: info.title,
            author: info.author,
            image_url: info.image_url,
        }
    }
}

/// Descriptive fields scraped from the catalogue page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookInfo {
    pub title: Option<String>,
    pub author: Option<String>,
    pub image_url: Option<String>,
}

/// One user's request for one book; feeds the history endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookRequest {
    pub book_id: String,
    pub email: String,
    pub requested_at: DateTime<Utc>,
}

/// A signed, time-limited reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadLink {
    pub download_link: String,
    pub expires_at: DateTime<Utc>,
}

// ── Storage keys ─────────────────────────────────────────────────────────

/// `{bookId}/{stem}.{ext}`
pub fn page_key(book_id: &str, stem: &str, ext: &str) -> String {
    format!("{book_id}/{stem}.{ext}")
}

/// Split `{bookId}/{filename}` into its two parts.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    let (book, file) = key.split_once('/')?;
    if book.is_empty() || file.is_empty() || file.contains('/') {
        return None;
    }
    Some((book, file))
}

/// File name without its final extension.
pub fn file_stem(filename: &str) -> &str {
    match filename.rfind('.') {
        Some(0) | None => filename,
        Some(i) => &filename[..i],
    }
}

/// Final extension of a file name, without the dot.
pub fn extension(filename: &str) -> Option<&str> {
    match filename.rfind('.') {
        Some(0) | None => None,
        Some(i) if i + 1 < filename.len() => Some(&filename[i + 1..]),
        Some(_) => None,
    }
}

/// `image/{ext}` for a page file name.
pub fn content_type_for(filename: &str) -> String {
    match extension(filename) {
        Some(ext) => format!("image/{}", ext.to_ascii_lowercase()),
        None => "application/octet-stream".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ref_derives_name_and_type() {
        let page = PageRef::new(
            4,
            "https://kazneb.kz/a/b/c/d/e/f/0005.png?time=1&key=abc",
        );
        assert_eq!(page.filename, "0005.png");
        assert_eq!(page.content_type, "image/png");
        assert_eq!(page.sequence_index, 4);
    }

    #[test]
    fn key_helpers() {
        assert_eq!(page_key("9", "last", "png"), "9/last.png");
        assert_eq!(split_key("9/last.png"), Some(("9", "last.png")));
        assert_eq!(split_key("9/"), None);
        assert_eq!(split_key("9/a/b.png"), None);
        assert_eq!(file_stem("page.01.jpg"), "page.01");
        assert_eq!(extension("page.01.jpg"), Some("jpg"));
        assert_eq!(extension("noext"), None);
        assert_eq!(extension(".hidden"), None);
    }

    #[test]
    fn attributes_survive_the_queue() {
        let attrs = MessageAttributes {
            book_id: "77".into(),
            storage_key: "77/last.png".into(),
            content_type: "image/png".into(),
            is_last: true,
            sequence_index: Some(22),
            page_count: Some(23),
            initiator: Some(Initiator {
                email: "reader@example.org".into(),
                name: Some("Reader".into()),
            }),
        };
        let back = MessageAttributes::from_map("m-1", &attrs.to_map(), "last").unwrap();
        assert_eq!(back, attrs);
    }

    #[test]
    fn missing_filepath_is_permanent() {
        let err = MessageAttributes::from_map("m-2", &BTreeMap::new(), "last").unwrap_err();
        assert!(matches!(
            err,
            Book2PdfError::MissingAttribute {
                attribute: attr::FILEPATH,
                ..
            }
        ));
    }

    #[test]
    fn book_id_falls_back_to_key_prefix() {
        let mut map = BTreeMap::new();
        map.insert(attr::FILEPATH.to_string(), "55/0001.jpg".to_string());
        let attrs = MessageAttributes::from_map("m-3", &map, "last").unwrap();
        assert_eq!(attrs.book_id, "55");
        assert_eq!(attrs.content_type, "image/jpg");
        assert!(!attrs.is_last);
        assert!(attrs.initiator.is_none());
    }

    #[test]
    fn status_serialises_uppercase() {
        let json = serde_json::to_string(&BookStatus::Ready).unwrap();
        assert_eq!(json, "\"READY\"");
    }

    #[test]
    fn metadata_initiator_round_trip() {
        let who = Initiator {
            email: "a@b.c".into(),
            name: None,
        };
        let mut m = ObjectMetadata::new("image/png");
        m.set_initiator(Some(&who));
        assert_eq!(m.initiator(), Some(who));
    }
}
