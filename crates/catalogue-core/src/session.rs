//! Per-channel search sessions.
//!
//! A [`ChannelSession`] remembers the last query, mode, vector, and the
//! cumulative result buffer of one channel. Sessions are created on first
//! access and live as long as the process. Reads are free; writes go through
//! [`SessionStore::update`], which takes the channel's [`ChannelGuard`].

use dashmap::DashMap;
use std::fmt;

use crate::error::{CatalogueError, Result};
use crate::filter::Filter;
use crate::locks::ChannelGuard;
use crate::models::{Document, SearchMode};

pub const DEFAULT_PAGE_SIZE: usize = 9;
pub const MAX_PAGE_SIZE: usize = 100;

/// Marks `last_query` as a similarity search. Pagination uses this prefix to
/// decide whether to repeat the query text or only the stored vector.
pub const SIMILAR_PREFIX: &str = "similar:";

/// Whether a search uses the offset-capable exact call or the top-k k-NN call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchVariant {
    Exact,
    Knn,
}

/// The command that produced a channel's current result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchCommand {
    Search,
    SearchKnn,
    Similar,
    SimilarKnn,
}

impl SearchCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchCommand::Search => "search",
            SearchCommand::SearchKnn => "searchknn",
            SearchCommand::Similar => "similar",
            SearchCommand::SimilarKnn => "similarknn",
        }
    }

    pub fn variant(&self) -> SearchVariant {
        match self {
            SearchCommand::Search | SearchCommand::Similar => SearchVariant::Exact,
            SearchCommand::SearchKnn | SearchCommand::SimilarKnn => SearchVariant::Knn,
        }
    }

    /// k-NN returns a top-k set without offsets, so only exact searches page.
    pub fn supports_paging(&self) -> bool {
        self.variant() == SearchVariant::Exact
    }
}

impl fmt::Display for SearchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Search state for one channel.
#[derive(Debug, Clone)]
pub struct ChannelSession {
    pub page_size: usize,
    /// Every document returned for the active query, in backend order.
    pub results: Vec<Document>,
    pub last_query: String,
    pub last_mode: SearchMode,
    pub last_vector: Option<Vec<f32>>,
    /// Filter the result set was built with; follow-up pages reuse it.
    pub last_filter: Filter,
    pub last_command: Option<SearchCommand>,
}

impl Default for ChannelSession {
    fn default() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }
}

impl ChannelSession {
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            results: Vec::new(),
            last_query: String::new(),
            last_mode: SearchMode::Simple,
            last_vector: None,
            last_filter: Filter::new(),
            last_command: None,
        }
    }

    pub fn is_similarity(&self) -> bool {
        self.last_query.starts_with(SIMILAR_PREFIX)
    }

    pub fn has_active_search(&self) -> bool {
        !self.results.is_empty() && !self.last_query.is_empty()
    }

    /// Offset of the next page: the number of documents seen so far.
    pub fn next_offset(&self) -> usize {
        self.results.len()
    }

    /// Starts a new result set, replacing everything from the previous one.
    pub fn begin(
        &mut self,
        command: SearchCommand,
        query: String,
        mode: SearchMode,
        vector: Option<Vec<f32>>,
        filter: Filter,
        docs: Vec<Document>,
    ) {
        self.results = docs;
        self.last_query = query;
        self.last_mode = mode;
        self.last_vector = vector;
        self.last_filter = filter;
        self.last_command = Some(command);
    }

    /// Appends a follow-up page to the current result set.
    pub fn extend(&mut self, docs: Vec<Document>) {
        self.results.extend(docs);
    }
}

/// Checks a user-supplied page size against `[1, MAX_PAGE_SIZE]`.
pub fn validate_page_size(size: i64) -> Result<usize> {
    if size < 1 || size > MAX_PAGE_SIZE as i64 {
        return Err(CatalogueError::InvalidPageSize(size));
    }
    Ok(size as usize)
}

/// Get-or-create registry of channel sessions.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, ChannelSession>,
    default_page_size: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl SessionStore {
    pub fn new(default_page_size: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            default_page_size,
        }
    }

    /// Returns a snapshot of the channel's session, creating a default one
    /// on first access.
    pub fn get(&self, channel_id: &str) -> ChannelSession {
        self.sessions
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelSession::with_page_size(self.default_page_size))
            .clone()
    }

    /// Runs `f` against the channel's session in place. A channel that has
    /// never been touched reads as a default session without creating one.
    ///
    /// The closure runs while the map shard is held; it must not block.
    pub fn read<R>(&self, channel_id: &str, f: impl FnOnce(&ChannelSession) -> R) -> R {
        match self.sessions.get(channel_id) {
            Some(session) => f(session.value()),
            None => f(&ChannelSession::with_page_size(self.default_page_size)),
        }
    }

    pub fn page_size(&self, channel_id: &str) -> usize {
        self.sessions
            .get(channel_id)
            .map(|s| s.page_size)
            .unwrap_or(self.default_page_size)
    }

    /// Clones the one buffered document at `index`.
    pub fn result_at(&self, channel_id: &str, index: usize) -> Result<Document> {
        self.read(channel_id, |s| {
            if s.results.is_empty() {
                return Err(CatalogueError::NoActiveSearch);
            }
            s.results
                .get(index)
                .cloned()
                .ok_or(CatalogueError::IndexOutOfRange {
                    index,
                    len: s.results.len(),
                })
        })
    }

    /// Mutates the session of the channel the guard was issued for.
    ///
    /// The closure runs while the map shard is held; it must not block.
    pub fn update<R>(&self, guard: &ChannelGuard, f: impl FnOnce(&mut ChannelSession) -> R) -> R {
        let mut session = self
            .sessions
            .entry(guard.channel_id().to_string())
            .or_insert_with(|| ChannelSession::with_page_size(self.default_page_size));
        f(session.value_mut())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
