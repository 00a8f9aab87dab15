//! # Catalogue Bot CLI (`catbot`)
//!
//! ## Usage
//!
//! ```bash
//! catbot --config ./config/catbot.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `catbot init` | Create the response-cache database |
//! | `catbot commands` | Print the slash-command definitions as JSON |
//! | `catbot search "<query>"` | Run one search against the configured index |
//! | `catbot serve` | Register slash commands and serve Discord interactions |
//!
//! ## Examples
//!
//! ```bash
//! # Exact search with a channel-style filter
//! catbot search "goethe faust" --filter library=UBS
//!
//! # Vector search, query rewritten by the completion model first
//! catbot search "books about alpine glaciers" --mode prose --magic
//!
//! # Serve without touching the registered commands
//! catbot serve --no-register
//! ```

use anyhow::{Context, Result};
use catalogue_bot::cache::ResponseCache;
use catalogue_bot::commands::{definitions, Dispatcher, Platform};
use catalogue_bot::config::{self, Config};
use catalogue_bot::discord::{parse_public_key, DiscordClient};
use catalogue_bot::elastic::ElasticBackend;
use catalogue_bot::embedding::{DisabledProvider, OpenAiProvider};
use catalogue_bot::render::TextRenderer;
use catalogue_bot::server;
use catalogue_core::embedding::EmbeddingProvider;
use catalogue_core::filter::{self, Filter};
use catalogue_core::models::SearchMode;
use catalogue_core::session::SearchCommand;
use catalogue_core::{NewSearch, Orchestrator};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Catalogue Bot: library catalogue search from Discord slash commands.
#[derive(Parser)]
#[command(name = "catbot", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/catbot.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the response-cache database. Idempotent.
    Init,

    /// Print the slash-command definitions as JSON.
    Commands,

    /// Run one search and print the results.
    Search {
        query: String,

        /// Search type: `simple`, `marc`, `prose`, or `json`.
        #[arg(long, default_value = "simple")]
        mode: String,

        /// Use approximate nearest neighbours instead of exact scoring.
        #[arg(long)]
        knn: bool,

        /// Rewrite the query with the completion model first.
        #[arg(long)]
        magic: bool,

        /// Filter as `field=value`; repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,

        /// Result page size.
        #[arg(long)]
        size: Option<usize>,
    },

    /// Register the slash commands and serve the interactions endpoint.
    ///
    /// Registered commands are deleted again on Ctrl-C.
    Serve {
        /// Skip command registration and deletion.
        #[arg(long)]
        no_register: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let cache = ResponseCache::open(&cfg.cache.path).await?;
            cache.close().await;
            println!("Cache initialized at {}", cfg.cache.path.display());
        }
        Commands::Commands => {
            let defs = definitions(&cfg.discord.command_prefix);
            println!("{}", serde_json::to_string_pretty(&defs)?);
        }
        Commands::Search {
            query,
            mode,
            knn,
            magic,
            filters,
            size,
        } => {
            let mode: SearchMode = mode.parse()?;
            let filter: Filter = filters.into_iter().collect();
            run_search(&cfg, &query, mode, knn, magic, &filter, size).await?;
        }
        Commands::Serve { no_register } => {
            run_serve(&cfg, no_register).await?;
        }
    }

    Ok(())
}

/// OpenAI when a key is present, otherwise a provider that refuses.
async fn build_embedder(cfg: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let Ok(api_key) = cfg.openai.api_key() else {
        warn!("OPENAI_API_KEY not set: vector search and query rewriting are disabled");
        return Ok(Arc::new(DisabledProvider));
    };
    let cache = ResponseCache::open(&cfg.cache.path)
        .await
        .context("cannot open response cache")?;
    Ok(Arc::new(
        OpenAiProvider::new(&cfg.openai, api_key)?.with_cache(cache),
    ))
}

async fn build_orchestrator(cfg: &Config) -> Result<Orchestrator> {
    let backend = Arc::new(ElasticBackend::from_config(&cfg.elastic)?);
    let embedder = build_embedder(cfg).await?;
    Ok(Orchestrator::new(backend, embedder)
        .with_timeout(Duration::from_secs(cfg.search.timeout_secs))
        .with_default_page_size(cfg.search.default_page_size))
}

async fn run_search(
    cfg: &Config,
    query: &str,
    mode: SearchMode,
    knn: bool,
    magic: bool,
    filter: &Filter,
    size: Option<usize>,
) -> Result<()> {
    let orchestrator = build_orchestrator(cfg).await?;
    let guard = orchestrator.try_lock("cli")?;
    if let Some(size) = size {
        orchestrator.set_page_size(&guard, size as i64)?;
    }

    let outcome = orchestrator
        .new_search(
            &guard,
            NewSearch {
                query,
                filter,
                mode,
                rewrite: magic,
                command: if knn {
                    SearchCommand::SearchKnn
                } else {
                    SearchCommand::Search
                },
            },
        )
        .await?;

    if magic {
        println!("Query: {}", outcome.query);
    }
    if !filter.is_empty() {
        print!("Filter:\n{}", filter::describe(filter));
    }
    println!("Total hits: {}", outcome.page.total);
    for (i, doc) in outcome.page.docs.iter().enumerate() {
        println!(
            "{:>3}  {:.4}  {}  {}",
            outcome.first_index + i,
            doc.score,
            doc.id,
            doc.title
        );
    }
    Ok(())
}

async fn run_serve(cfg: &Config, no_register: bool) -> Result<()> {
    let public_key = parse_public_key(&cfg.discord.public_key)?;
    let discord = Arc::new(DiscordClient::new(
        &cfg.discord.api_base,
        cfg.discord.token()?,
        cfg.discord.application_id.clone(),
        cfg.discord.guild_id.clone(),
    )?);

    let text = match &cfg.render.text_template {
        Some(path) => {
            let source = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read template {}", path.display()))?;
            TextRenderer::new(source)?
        }
        None => TextRenderer::with_default_template()?,
    };

    let orchestrator = Arc::new(build_orchestrator(cfg).await?);
    let platform: Arc<dyn Platform> = discord.clone();
    let dispatcher = Arc::new(Dispatcher::new(
        orchestrator,
        platform,
        Arc::new(text),
        cfg.discord.command_prefix.clone(),
    ));

    let registered = if no_register {
        Vec::new()
    } else {
        discord
            .register_commands(&dispatcher.definitions())
            .await
            .context("cannot register slash commands")?
    };
    info!(commands = registered.len(), "bot ready");

    let app = server::router(dispatcher, public_key);
    server::run_server(&cfg.server.bind, app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for shutdown signal");
        }
        info!("shutting down");
    })
    .await?;

    if !registered.is_empty() {
        discord.delete_commands(&registered).await?;
    }
    Ok(())
}
