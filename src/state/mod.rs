//! Authoritative state store: document model, lock manager, recovery.

pub mod document;
pub mod recovery;
pub mod store;

pub use document::{StateDocument, Task, TaskStatus};
pub use store::{StateStore, validate_document};
