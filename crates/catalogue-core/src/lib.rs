//! # Catalogue Core
//!
//! Platform-independent logic for the catalogue bot: data models, the
//! error taxonomy, per-channel sessions and locks, channel filters, the
//! search backend and embedding provider traits, and the orchestrator that
//! ties them together.
//!
//! This crate does no network or filesystem I/O of its own. Concrete
//! backends (Elasticsearch, OpenAI, Discord) live in the `catalogue-bot`
//! application crate; [`backend::memory::InMemoryIndex`] serves tests and
//! offline use.

pub mod backend;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod session;
pub mod target;

pub use error::{CatalogueError, Result};
pub use orchestrator::{NewSearch, Orchestrator, SearchOutcome};
