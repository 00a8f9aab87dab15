//! Error taxonomy for catalogue commands.
//!
//! Every variant renders as the plain-text message a user sees in the
//! channel; nothing here is fatal to the process.

use std::time::Duration;
use thiserror::Error;

use crate::models::SearchMode;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogueError {
    #[error("Please provide {0}")]
    MissingRequiredOption(String),

    #[error("{0}")]
    InvalidOption(String),

    #[error("Invalid result size {0}. must be in (0,{max}]", max = crate::session::MAX_PAGE_SIZE)]
    InvalidPageSize(i64),

    #[error("Error getting embedding: {0}")]
    EmbeddingUnavailable(String),

    #[error("Error converting query: {0}")]
    RewriteUnavailable(String),

    #[error("Document {id} has no {mode} embedding")]
    NoEmbeddingForMode { id: String, mode: SearchMode },

    #[error("No search results available")]
    NoActiveSearch,

    #[error("search \"{0}\" not supported")]
    IncompatibleSearch(String),

    #[error("Invalid result ID {index}: only {len} results available")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Document {0} not found")]
    DocumentNotFound(String),

    #[error("Error searching: {0}")]
    BackendUnavailable(String),

    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Please wait for the previous search to finish")]
    ChannelBusy,

    #[error("Error creating response: {0}")]
    Render(String),
}

pub type Result<T> = std::result::Result<T, CatalogueError>;

impl CatalogueError {
    /// Wraps a search backend failure with operation context.
    pub fn backend(context: &str, err: impl std::fmt::Display) -> Self {
        CatalogueError::BackendUnavailable(format!("{}: {}", context, err))
    }

    /// Wraps an embedding provider failure with operation context.
    pub fn embedding(err: impl std::fmt::Display) -> Self {
        CatalogueError::EmbeddingUnavailable(format!("cannot create embedding: {}", err))
    }

    /// `ChannelBusy` is a refusal to start, not a failed operation.
    pub fn is_refusal(&self) -> bool {
        matches!(self, CatalogueError::ChannelBusy)
    }
}
