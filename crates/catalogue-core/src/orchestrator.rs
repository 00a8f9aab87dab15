//! Search orchestration.
//!
//! The [`Orchestrator`] owns the channel sessions and locks and drives the
//! embedding provider and search backend on behalf of the command handlers.
//! Every operation that touches a session takes the channel's
//! [`ChannelGuard`]; callers acquire it with [`Orchestrator::try_lock`] and
//! refuse the command when the channel is busy.
//!
//! Session state is only written after the backend call succeeds. A failed
//! or timed-out search leaves the previous result set intact.
//!
//! ```text
//! new_search ─▶ [rewrite] ─▶ [embed] ─▶ backend ─▶ session.begin
//! similar    ─────────────────────────▶ backend ─▶ session.begin
//! more       ─────────────────────────▶ backend ─▶ session.extend
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{KnnRequest, SearchBackend, SearchRequest};
use crate::embedding::EmbeddingProvider;
use crate::error::{CatalogueError, Result};
use crate::filter::Filter;
use crate::locks::{ChannelGuard, ChannelLocks};
use crate::models::{Document, SearchMode, SearchPage};
use crate::session::{
    validate_page_size, ChannelSession, SearchCommand, SearchVariant, SessionStore,
    DEFAULT_PAGE_SIZE, SIMILAR_PREFIX,
};
use crate::target::TargetRef;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Parameters of a fresh query.
#[derive(Debug, Clone)]
pub struct NewSearch<'a> {
    pub query: &'a str,
    pub filter: &'a Filter,
    pub mode: SearchMode,
    /// Rewrite the query through the completion model before searching.
    pub rewrite: bool,
    pub command: SearchCommand,
}

/// Result of a search-bearing operation.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub page: SearchPage,
    /// Buffer position of `page.docs[0]`; result labels continue from here.
    pub first_index: usize,
    /// Query text as stored in the session (rewritten or `similar:` prefixed).
    pub query: String,
    pub mode: SearchMode,
    /// Embedding computed for this call, if any.
    pub embedding: Option<Vec<f32>>,
}

impl SearchOutcome {
    pub fn is_similarity(&self) -> bool {
        self.query.starts_with(SIMILAR_PREFIX)
    }
}

/// What `more` needs from the session, copied out without the result buffer.
struct PageCursor {
    command: SearchCommand,
    query: String,
    similarity: bool,
    mode: SearchMode,
    vector: Option<Vec<f32>>,
    filter: Filter,
    offset: usize,
    page_size: usize,
}

impl PageCursor {
    fn from_session(session: &ChannelSession) -> Result<Self> {
        let command = paging_command(session)?;
        Ok(Self {
            command,
            query: session.last_query.clone(),
            similarity: session.is_similarity(),
            mode: session.last_mode,
            vector: session.last_vector.clone(),
            filter: session.last_filter.clone(),
            offset: session.next_offset(),
            page_size: session.page_size,
        })
    }
}

fn paging_command(session: &ChannelSession) -> Result<SearchCommand> {
    if !session.has_active_search() {
        return Err(CatalogueError::NoActiveSearch);
    }
    let command = session.last_command.ok_or(CatalogueError::NoActiveSearch)?;
    if !command.supports_paging() {
        return Err(CatalogueError::IncompatibleSearch(command.to_string()));
    }
    Ok(command)
}

pub struct Orchestrator {
    backend: Arc<dyn SearchBackend>,
    embedder: Arc<dyn EmbeddingProvider>,
    sessions: SessionStore,
    locks: ChannelLocks,
    timeout: Duration,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn SearchBackend>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            backend,
            embedder,
            sessions: SessionStore::new(DEFAULT_PAGE_SIZE),
            locks: ChannelLocks::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bounds every embedding, rewrite, and backend call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Page size for channels that never ran `resultsize`.
    pub fn with_default_page_size(mut self, page_size: usize) -> Self {
        self.sessions = SessionStore::new(page_size);
        self
    }

    pub fn backend(&self) -> &Arc<dyn SearchBackend> {
        &self.backend
    }

    pub fn locks(&self) -> &ChannelLocks {
        &self.locks
    }

    /// Snapshot of a channel's session.
    pub fn session(&self, channel_id: &str) -> ChannelSession {
        self.sessions.get(channel_id)
    }

    /// Whether `more` would find a pageable result set in the channel.
    pub fn check_paging(&self, channel_id: &str) -> Result<()> {
        self.sessions
            .read(channel_id, paging_command)
            .map(|_| ())
    }

    /// Non-blocking acquire of the channel lock.
    pub fn try_lock(&self, channel_id: &str) -> Result<ChannelGuard> {
        self.locks
            .try_lock(channel_id)
            .ok_or(CatalogueError::ChannelBusy)
    }

    /// Runs a fresh query and replaces the channel's result set.
    pub async fn new_search(
        &self,
        guard: &ChannelGuard,
        req: NewSearch<'_>,
    ) -> Result<SearchOutcome> {
        let channel = guard.channel_id();
        let variant = req.command.variant();
        if variant == SearchVariant::Knn && !req.mode.requires_embedding() {
            return Err(CatalogueError::InvalidOption(format!(
                "search type {} not supported for {}",
                req.mode, req.command
            )));
        }

        let query = if req.rewrite {
            let rewritten = self.rewrite(req.query).await?;
            debug!(channel = %channel, original = %req.query, rewritten = %rewritten, "query rewritten");
            rewritten
        } else {
            req.query.to_string()
        };

        let vector = if req.mode.requires_embedding() {
            Some(self.embed(&query).await?)
        } else {
            None
        };

        let page_size = self.sessions.page_size(channel);
        debug!(channel = %channel, command = %req.command, mode = %req.mode, query = %query, "new search");
        let page = self
            .run(variant, &query, req.filter, vector.as_deref(), req.mode, 0, page_size)
            .await?;

        self.sessions.update(guard, |s| {
            s.begin(
                req.command,
                query.clone(),
                req.mode,
                vector.clone(),
                req.filter.clone(),
                page.docs.clone(),
            )
        });

        Ok(SearchOutcome {
            page,
            first_index: 0,
            query,
            mode: req.mode,
            embedding: vector,
        })
    }

    /// Searches for documents close to `source` in the `mode` embedding space.
    ///
    /// `label` is how the user referred to the source (an index or an id).
    pub async fn similar(
        &self,
        guard: &ChannelGuard,
        source: &Document,
        label: &str,
        mode: SearchMode,
        command: SearchCommand,
        filter: &Filter,
    ) -> Result<SearchOutcome> {
        let channel = guard.channel_id();
        let vector = source
            .embedding(mode)
            .ok_or_else(|| CatalogueError::NoEmbeddingForMode {
                id: source.id.clone(),
                mode,
            })?
            .to_vec();

        let query = format!("{}{} - {}", SIMILAR_PREFIX, label, source.title);
        let page_size = self.sessions.page_size(channel);
        debug!(channel = %channel, command = %command, mode = %mode, source = %source.id, "similar search");
        let page = self
            .run(command.variant(), "", filter, Some(&vector), mode, 0, page_size)
            .await?;

        self.sessions.update(guard, |s| {
            s.begin(
                command,
                query.clone(),
                mode,
                Some(vector),
                filter.clone(),
                page.docs.clone(),
            )
        });

        Ok(SearchOutcome {
            page,
            first_index: 0,
            query,
            mode,
            embedding: None,
        })
    }

    /// Fetches the next page of the channel's active search and appends it.
    pub async fn more(&self, guard: &ChannelGuard) -> Result<SearchOutcome> {
        let channel = guard.channel_id();
        let cursor = self.sessions.read(channel, PageCursor::from_session)?;

        let query = if cursor.similarity {
            ""
        } else {
            cursor.query.as_str()
        };
        debug!(channel = %channel, command = %cursor.command, offset = cursor.offset, limit = cursor.page_size, "more");
        let page = self
            .run(
                SearchVariant::Exact,
                query,
                &cursor.filter,
                cursor.vector.as_deref(),
                cursor.mode,
                cursor.offset,
                cursor.page_size,
            )
            .await?;

        self.sessions.update(guard, |s| s.extend(page.docs.clone()));

        Ok(SearchOutcome {
            page,
            first_index: cursor.offset,
            query: cursor.query,
            mode: cursor.mode,
            embedding: None,
        })
    }

    /// Finds the document a `resultid` option refers to.
    pub async fn resolve_target(&self, guard: &ChannelGuard, target: &TargetRef) -> Result<Document> {
        match target {
            TargetRef::Index(index) => self.sessions.result_at(guard.channel_id(), *index),
            TargetRef::External(id) => {
                let ids = [id.clone()];
                let docs = self
                    .timed("document lookup", self.backend.get_documents(&ids))
                    .await?
                    .map_err(|e| CatalogueError::backend("cannot get document", e))?;
                if docs.len() != 1 {
                    return Err(CatalogueError::DocumentNotFound(id.clone()));
                }
                docs.into_iter()
                    .find(|d| &d.id == id)
                    .ok_or_else(|| CatalogueError::DocumentNotFound(id.clone()))
            }
        }
    }

    /// Rewrites a free-text question into a catalogue query. Held under the
    /// channel lock; no session state changes.
    pub async fn rewrite_query(&self, guard: &ChannelGuard, text: &str) -> Result<String> {
        debug!(channel = %guard.channel_id(), "rewrite query");
        self.rewrite(text).await
    }

    /// Validates and stores the channel's page size.
    pub fn set_page_size(&self, guard: &ChannelGuard, size: i64) -> Result<usize> {
        let size = validate_page_size(size)?;
        self.sessions.update(guard, |s| s.page_size = size);
        debug!(channel = %guard.channel_id(), size, "page size set");
        Ok(size)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self
            .timed("embedding", self.embedder.embed(text))
            .await?
            .map_err(CatalogueError::embedding)?;
        if vector.is_empty() {
            return Err(CatalogueError::embedding("empty embedding"));
        }
        Ok(vector)
    }

    async fn rewrite(&self, text: &str) -> Result<String> {
        let rewritten = self
            .timed("query rewrite", self.embedder.rewrite_query(text))
            .await?
            .map_err(|e| {
                CatalogueError::RewriteUnavailable(format!("cannot create embedding query: {}", e))
            })?;
        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return Err(CatalogueError::RewriteUnavailable(
                "empty rewritten query".into(),
            ));
        }
        Ok(rewritten.to_string())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        variant: SearchVariant,
        query: &str,
        filter: &Filter,
        vector: Option<&[f32]>,
        mode: SearchMode,
        offset: usize,
        limit: usize,
    ) -> Result<SearchPage> {
        let result = match variant {
            SearchVariant::Exact => {
                let req = SearchRequest {
                    query,
                    filter,
                    vector,
                    mode,
                    offset,
                    limit,
                };
                self.timed("search", self.backend.search(&req))
                    .await?
                    .map_err(|e| CatalogueError::backend("cannot search", e))
            }
            SearchVariant::Knn => {
                let vector = vector.ok_or_else(|| {
                    CatalogueError::InvalidOption(format!("search type {} has no vector", mode))
                })?;
                let req = KnnRequest {
                    filter,
                    vector,
                    mode,
                    k: limit,
                    num_candidates: limit,
                };
                self.timed("search", self.backend.search_knn(&req))
                    .await?
                    .map_err(|e| CatalogueError::backend("cannot search knn", e))
            }
        };
        if let Err(e) = &result {
            warn!(error = %e, "backend call failed");
        }
        result
    }

    async fn timed<T>(&self, operation: &'static str, fut: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| CatalogueError::Timeout {
                operation,
                after: self.timeout,
            })
    }
}
