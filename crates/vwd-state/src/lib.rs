//! # vwd-state
//!
//! The three durable stores of the virtualized working directory, all built
//! on [`vwd_journal`]:
//!
//! - [`PlaceholderRegistry`]: which paths are lazily materialized
//!   placeholders, and whether folder placeholders have been enumerated.
//! - [`ModifiedPathRegistry`]: which paths have been touched and must be
//!   managed eagerly by git.
//! - [`MetadataStore`]: a single-value store for the disk layout version and
//!   sticky repair flags.

pub mod metadata;
pub mod modified_paths;
pub mod placeholders;

pub use metadata::MetadataStore;
pub use modified_paths::{ModifiedPathRegistry, ALWAYS_MODIFIED_PATH};
pub use placeholders::{
    PlaceholderCounts, PlaceholderMarker, PlaceholderRegistry, RebuildCycle,
    EXPANDED_FOLDER_SENTINEL, PARTIAL_FOLDER_SENTINEL, SHA1_HEX_LEN,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error(transparent)]
    Journal(#[from] vwd_journal::JournalError),

    #[error("invalid content hash {0:?}: expected {SHA1_HEX_LEN} hex characters")]
    InvalidSha(String),

    #[error("invalid value for metadata key {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Normalize a path key for store lookups.
///
/// Journal payloads keep the caller's original casing; lookups fold case on
/// platforms whose filesystems are case-insensitive by default.
pub(crate) fn normalize_key(path: &str) -> String {
    #[cfg(windows)]
    {
        path.to_lowercase()
    }
    #[cfg(not(windows))]
    {
        path.to_string()
    }
}
