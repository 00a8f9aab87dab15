//! # Catalogue Bot
//!
//! A Discord bot for searching a library catalogue: exact and vector search
//! against Elasticsearch, query rewriting and embeddings from OpenAI, and a
//! per-channel search session that `more` and `similar` build on.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Discord  │──▶│   server   │──▶│  commands    │──▶│ Orchestrator  │
//! │ webhook  │   │ (verify)   │   │ (Dispatcher) │   │ (core crate)  │
//! └──────────┘   └────────────┘   └──────┬───────┘   └──────┬────────┘
//!                                        │                  │
//!                                 channel messages   ┌──────┴──────┐
//!                                        ▼           ▼             ▼
//!                                  ┌──────────┐ ┌─────────┐ ┌──────────────┐
//!                                  │ discord  │ │ elastic │ │  embedding   │
//!                                  │  (REST)  │ └─────────┘ │ (+ cache)    │
//!                                  └──────────┘             └──────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`commands`] | Command definitions, option parsing, dispatch |
//! | [`discord`] | Discord wire types, signature check, REST client |
//! | [`server`] | Interactions HTTP endpoint |
//! | [`elastic`] | Elasticsearch search backend |
//! | [`embedding`] | OpenAI embeddings and query rewriting |
//! | [`cache`] | SQLite response cache |
//! | [`render`] | Result cards and plain-text template |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod discord;
pub mod elastic;
pub mod embedding;
pub mod migrate;
pub mod render;
pub mod server;
