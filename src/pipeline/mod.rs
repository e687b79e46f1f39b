//! Pipeline stages for turning a viewer page into a PDF.
//!
//! Each submodule is one component. Stages never call each other across an
//! asynchronous boundary; they meet only through the queue and the object
//! store, so each is testable on its own with in-memory collaborators.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ chunk ──▶ dispatch ══queue══▶ worker × N ══storage event══▶
//!   assemble ══storage event══▶ cleanup ──▶ notify
//! ```
//!
//! 1. [`extract`]: scrape page-image paths from the viewer page
//! 2. [`chunk`]: order-preserving partition into queue-sized batches
//! 3. [`dispatch`]: one message per page, the sentinel strictly last;
//!    skipped when [`download`] finds the book already assembled
//! 4. [`worker`]: download one page and store it under its key
//! 5. [`assemble`]: on the sentinel's event, order stored pages and write
//!    the PDF; CPU work runs in `spawn_blocking`
//! 6. [`cleanup`]: on the PDF's event, delete page objects, mark ready
//! 7. [`notify`]: email a signed link to the requester
//!
//! [`download`] also serves the read API's download links.

pub mod assemble;
pub mod chunk;
pub mod cleanup;
pub mod dispatch;
pub mod download;
pub mod extract;
pub mod notify;
pub mod worker;
