//! Error types for the edgequake-book2pdf library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Book2PdfError`]: returned as `Err(..)` from every operation that
//!   touches the network, storage, the queue or the metadata store. Each
//!   variant belongs to one [`ErrorKind`], and the caller decides from the
//!   kind whether to surface, log-and-skip, or propagate.
//!
//! * [`PageError`]: **non-fatal**, a single page could not be dispatched,
//!   downloaded, stored or decoded. Stored inside per-page outcomes and
//!   stage reports so one bad page never aborts its batch or its book.
//!
//! | Kind | Typical cause | Handling |
//! |------|---------------|----------|
//! | `Client` | bad viewer URL, no pages discovered, no artifact yet | 4xx to the caller |
//! | `TransientIo` | network, storage, queue, mail failures | log, end the unit of work; the queue redelivers |
//! | `PermanentData` | unparseable page URL, corrupt image | skip the item, continue the batch |
//! | `Internal` | configuration or runtime bugs | 500 |

use thiserror::Error;

/// Classification of a [`Book2PdfError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    TransientIo,
    PermanentData,
    Internal,
}

/// All errors returned by the edgequake-book2pdf library.
///
/// Page-level failures use [`PageError`] and are stored in stage reports
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum Book2PdfError {
    // ── Client errors ─────────────────────────────────────────────────────
    /// The viewer URL could not be parsed.
    #[error("The URL ({url}) is malformed")]
    MalformedUrl { url: String },

    /// The viewer URL has no usable book id parameter.
    #[error("The URL ({url}) does not contain the query parameter {param}")]
    MissingQueryParam { url: String, param: String },

    /// Discovery found no page images on the viewer page.
    #[error("Pages URLs have not been found on the given URL")]
    NoPagesFound { url: String },

    /// No finished PDF exists for this book (yet).
    #[error("Book with ID {book_id} has not been found")]
    BookNotFound { book_id: String },

    /// The request carried no authenticated identity.
    #[error("The request is not associated with a user")]
    Unauthenticated,

    // ── Transient I/O errors ──────────────────────────────────────────────
    /// HTTP fetch of a viewer page or page image failed.
    #[error("Failed to fetch '{url}': {reason}")]
    FetchFailed { url: String, reason: String },

    /// HTTP fetch exceeded its timeout.
    #[error("Fetching '{url}' timed out after {secs}s")]
    FetchTimeout { url: String, secs: u64 },

    /// An object-store operation failed.
    #[error("Storage {op} failed for '{key}': {reason}")]
    Storage {
        op: &'static str,
        key: String,
        reason: String,
    },

    /// The message queue rejected or failed a send.
    #[error("Queue '{queue}' failed: {reason}")]
    Queue { queue: String, reason: String },

    /// The metadata store failed.
    #[error("Metadata store error: {0}")]
    Repository(String),

    /// Outbound mail could not be delivered.
    #[error("Mail delivery to '{to}' failed: {reason}")]
    Mail { to: String, reason: String },

    // ── Permanent data errors ─────────────────────────────────────────────
    /// A discovered page path does not form a valid image URL.
    #[error("Invalid page URL '{url}': {reason}")]
    InvalidPageUrl { url: String, reason: String },

    /// A stored page could not be decoded as an image.
    #[error("Object '{key}' is not a usable image: {detail}")]
    CorruptImage { key: String, detail: String },

    /// A queue message lacks a required attribute.
    #[error("Message {message_id} is missing attribute '{attribute}'")]
    MissingAttribute {
        message_id: String,
        attribute: &'static str,
    },

    /// A storage key does not follow the `{bookId}/{filename}` layout.
    #[error("Storage key '{key}' is not a book object key")]
    UnexpectedKey { key: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or environment validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Book2PdfError {
    /// Which branch of the error taxonomy this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        use Book2PdfError::*;
        match self {
            MalformedUrl { .. }
            | MissingQueryParam { .. }
            | NoPagesFound { .. }
            | BookNotFound { .. }
            | Unauthenticated => ErrorKind::Client,
            FetchFailed { .. }
            | FetchTimeout { .. }
            | Storage { .. }
            | Queue { .. }
            | Repository(_)
            | Mail { .. } => ErrorKind::TransientIo,
            InvalidPageUrl { .. }
            | CorruptImage { .. }
            | MissingAttribute { .. }
            | UnexpectedKey { .. } => ErrorKind::PermanentData,
            InvalidConfig(_) | Internal(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status a front door should answer with.
    pub fn status(&self) -> u16 {
        use Book2PdfError::*;
        match self {
            MalformedUrl { .. } | MissingQueryParam { .. } => 400,
            Unauthenticated => 401,
            NoPagesFound { .. } | BookNotFound { .. } => 404,
            _ => 500,
        }
    }

    pub fn is_client(&self) -> bool {
        self.kind() == ErrorKind::Client
    }
}

/// A non-fatal error for a single page.
///
/// The page is simply absent from the finished book; the rest of the batch
/// and the rest of the book continue.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page path could not become a message and was dropped at dispatch.
    #[error("Page '{url}' dropped from dispatch: {detail}")]
    InvalidUrl { url: String, detail: String },

    /// Downloading the page image failed.
    #[error("Download of '{url}' failed: {detail}")]
    DownloadFailed { url: String, detail: String },

    /// Writing the page to storage failed.
    #[error("Storing '{key}' failed: {detail}")]
    StoreFailed { key: String, detail: String },

    /// The stored page could not be read back or decoded during assembly.
    #[error("Page '{key}' left out of the PDF: {detail}")]
    Unreadable { key: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pages_message_is_fixed() {
        let e = Book2PdfError::NoPagesFound {
            url: "https://example.org/view?brId=1".into(),
        };
        assert_eq!(e.to_string(), "Pages URLs have not been found on the given URL");
        assert_eq!(e.status(), 404);
        assert_eq!(e.kind(), ErrorKind::Client);
    }

    #[test]
    fn missing_param_is_bad_request() {
        let e = Book2PdfError::MissingQueryParam {
            url: "https://example.org/view".into(),
            param: "brId".into(),
        };
        assert_eq!(e.status(), 400);
        assert!(e.to_string().contains("brId"), "got: {e}");
    }

    #[test]
    fn io_failures_are_transient() {
        let e = Book2PdfError::Storage {
            op: "put",
            key: "42/1.png".into(),
            reason: "disk full".into(),
        };
        assert_eq!(e.kind(), ErrorKind::TransientIo);
        assert_eq!(e.status(), 500);
        assert!(!e.is_client());
    }

    #[test]
    fn bad_page_data_is_permanent() {
        let e = Book2PdfError::CorruptImage {
            key: "42/3.png".into(),
            detail: "truncated".into(),
        };
        assert_eq!(e.kind(), ErrorKind::PermanentData);
    }

    #[test]
    fn page_error_display() {
        let e = PageError::DownloadFailed {
            url: "https://example.org/p/1.png".into(),
            detail: "HTTP 503".into(),
        };
        assert!(e.to_string().contains("HTTP 503"));
    }
}
