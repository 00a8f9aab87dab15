//! TOML configuration.
//!
//! Secrets never live in the file: the Discord bot token, the OpenAI key, and
//! the optional Elasticsearch API key come from the environment.

use anyhow::{Context, Result};
use catalogue_core::session::MAX_PAGE_SIZE;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DISCORD_TOKEN_ENV: &str = "DISCORD_TOKEN";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const ELASTIC_API_KEY_ENV: &str = "ELASTIC_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub elastic: ElasticConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub render: RenderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    pub application_id: String,
    /// Guild to register commands in. Global registration when absent.
    #[serde(default)]
    pub guild_id: Option<String>,
    /// Hex-encoded Ed25519 key used to verify interaction signatures.
    pub public_key: String,
    /// Prepended to every command name, e.g. `"dev"` → `/devsearch`.
    #[serde(default)]
    pub command_prefix: String,
    #[serde(default = "default_discord_api")]
    pub api_base: String,
}

fn default_discord_api() -> String {
    "https://discord.com/api/v10".to_string()
}

impl DiscordConfig {
    pub fn token(&self) -> Result<String> {
        std::env::var(DISCORD_TOKEN_ENV).with_context(|| format!("{} not set", DISCORD_TOKEN_ENV))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ElasticConfig {
    pub url: String,
    pub index: String,
    #[serde(default = "default_elastic_retries")]
    pub retries: u32,
}

fn default_elastic_retries() -> u32 {
    3
}

impl ElasticConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(ELASTIC_API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiConfig {
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_completion_model")]
    pub completion_model: String,
    #[serde(default = "default_openai_base")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// System prompt for the query rewrite. A built-in prompt is used when
    /// absent.
    #[serde(default)]
    pub rewrite_prompt: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            embedding_model: default_embedding_model(),
            completion_model: default_completion_model(),
            base_url: default_openai_base(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            rewrite_prompt: None,
        }
    }
}

impl OpenAiConfig {
    pub fn api_key(&self) -> Result<String> {
        std::env::var(OPENAI_API_KEY_ENV)
            .with_context(|| format!("{} not set", OPENAI_API_KEY_ENV))
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o".to_string()
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            default_page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> usize {
    catalogue_core::session::DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RenderConfig {
    /// minijinja template for the `text` command.
    #[serde(default)]
    pub text_template: Option<PathBuf>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.discord.application_id.trim().is_empty() {
        anyhow::bail!("discord.application_id must not be empty");
    }

    let key = hex::decode(config.discord.public_key.trim())
        .with_context(|| "discord.public_key must be hex")?;
    if key.len() != 32 {
        anyhow::bail!("discord.public_key must be 32 bytes, got {}", key.len());
    }

    if config.elastic.url.trim().is_empty() {
        anyhow::bail!("elastic.url must not be empty");
    }
    if config.elastic.index.trim().is_empty() {
        anyhow::bail!("elastic.index must not be empty");
    }

    if config.search.timeout_secs == 0 {
        anyhow::bail!("search.timeout_secs must be > 0");
    }
    if config.search.default_page_size == 0 || config.search.default_page_size > MAX_PAGE_SIZE {
        anyhow::bail!("search.default_page_size must be in [1, {}]", MAX_PAGE_SIZE);
    }

    if config.openai.timeout_secs == 0 {
        anyhow::bail!("openai.timeout_secs must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[discord]
application_id = "1222592521310437446"
public_key = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a"

[elastic]
url = "http://localhost:9200"
index = "ubcat"

[cache]
path = "./data/cache.sqlite"

[server]
bind = "127.0.0.1:7331"
"#;

    fn parse(src: &str) -> Result<Config> {
        let config: Config = toml::from_str(src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.search.default_page_size, 9);
        assert_eq!(config.search.timeout_secs, 30);
        assert_eq!(config.elastic.retries, 3);
        assert_eq!(config.discord.command_prefix, "");
        assert!(config.discord.guild_id.is_none());
        assert_eq!(config.openai.base_url, "https://api.openai.com/v1");
        assert!(config.render.text_template.is_none());
    }

    #[test]
    fn test_embedding_model_matches_index_vectors() {
        // The catalogue's embedding_* fields hold 1536-dim small-model vectors.
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.openai.embedding_model, "text-embedding-3-small");
        assert_eq!(OpenAiConfig::default().embedding_model, "text-embedding-3-small");
    }

    #[test]
    fn test_rejects_bad_public_key() {
        let src = MINIMAL.replace(
            "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a",
            "abcd",
        );
        let err = parse(&src).unwrap_err().to_string();
        assert!(err.contains("32 bytes"), "{}", err);
    }

    #[test]
    fn test_rejects_page_size_out_of_range() {
        let src = format!("{}\n[search]\ndefault_page_size = 101\n", MINIMAL);
        assert!(parse(&src).is_err());
    }
}
