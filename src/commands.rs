//! Slash commands: definitions, option parsing, and dispatch.
//!
//! Every command goes through the same two phases:
//!
//! 1. **Synchronous**: parse the options into a [`Command`], validate them,
//!    and try to take the channel lock. Any failure, including a busy
//!    channel, becomes the immediate interaction reply and nothing else
//!    happens.
//! 2. **Background**: a tokio task that owns the [`ChannelGuard`] runs the
//!    orchestration and posts results (or the error text) as channel
//!    messages. The lock is released when the task ends, however it ends.
//!
//! The channel lookup behind the filter is the one remote call allowed in
//! phase 1, and only within [`DEFAULT_FILTER_BUDGET`]. If the platform is
//! slower, the ack goes out without the filter and the task resolves it and
//! posts it as its first message.
//!
//! The chat platform is reached only through the [`Platform`] trait, so the
//! dispatcher runs unchanged against Discord or a test double.

use anyhow::Result;
use async_trait::async_trait;
use catalogue_core::filter::{self, Filter};
use catalogue_core::locks::ChannelGuard;
use catalogue_core::models::{Document, SearchMode};
use catalogue_core::session::{validate_page_size, SearchCommand, MAX_PAGE_SIZE};
use catalogue_core::target::TargetRef;
use catalogue_core::{CatalogueError, NewSearch, Orchestrator, SearchOutcome};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::discord::{
    truncate, CommandDefinition, CommandOption, Embed, OptionChoice, OptionDefinition,
    MAX_CONTENT_LEN, OPTION_BOOLEAN, OPTION_INTEGER, OPTION_STRING,
};
use crate::render::{batch_embeds, outcome_embeds, TextRenderer};

// ═══════════════════════════════════════════════════════════════════════
// Platform
// ═══════════════════════════════════════════════════════════════════════

/// What the bot needs to know about a channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelInfo {
    pub name: Option<String>,
    pub topic: Option<String>,
}

impl ChannelInfo {
    pub fn filter(&self) -> Filter {
        filter::for_channel(self.name.as_deref(), self.topic.as_deref())
    }
}

/// A channel message: text, embeds, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutgoingMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(truncate(&content.into(), MAX_CONTENT_LEN)),
            embeds: Vec::new(),
        }
    }

    pub fn embeds(embeds: Vec<Embed>) -> Self {
        Self {
            content: None,
            embeds,
        }
    }
}

/// The chat platform as seen by the dispatcher.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn channel(&self, channel_id: &str) -> Result<ChannelInfo>;

    async fn send_message(&self, channel_id: &str, message: &OutgoingMessage) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════
// Definitions
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Search,
    SearchKnn,
    Similar,
    SimilarKnn,
    More,
    Magic,
    ResultSize,
    Text,
}

impl CommandKind {
    pub const ALL: [CommandKind; 8] = [
        CommandKind::Search,
        CommandKind::SearchKnn,
        CommandKind::Similar,
        CommandKind::SimilarKnn,
        CommandKind::More,
        CommandKind::Magic,
        CommandKind::ResultSize,
        CommandKind::Text,
    ];

    /// Command name without the configured prefix.
    pub fn base_name(&self) -> &'static str {
        match self {
            CommandKind::Search => "search",
            CommandKind::SearchKnn => "searchknn",
            CommandKind::Similar => "similar",
            CommandKind::SimilarKnn => "similarknn",
            CommandKind::More => "more",
            CommandKind::Magic => "magic",
            CommandKind::ResultSize => "resultsize",
            CommandKind::Text => "text",
        }
    }

    pub fn from_base_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.base_name() == name)
    }

    fn description(&self) -> &'static str {
        match self {
            CommandKind::Search => "Search the catalogue",
            CommandKind::SearchKnn => "Search the catalogue with approximate nearest neighbours",
            CommandKind::Similar => "Search objects similar to a result",
            CommandKind::SimilarKnn => {
                "Search objects similar to a result with approximate nearest neighbours"
            }
            CommandKind::More => "Use last search and get next result page",
            CommandKind::Magic => "Let AI turn a question into a catalogue query",
            CommandKind::ResultSize => "Number of items in search result set",
            CommandKind::Text => "Show a result as text",
        }
    }

    fn options(&self) -> Vec<OptionDefinition> {
        match self {
            CommandKind::Search | CommandKind::SearchKnn => vec![
                query_type_option(&[
                    SearchMode::Simple,
                    SearchMode::Marc,
                    SearchMode::Prose,
                    SearchMode::Json,
                ]),
                string_option("query", "Query to ask for"),
                OptionDefinition {
                    kind: OPTION_BOOLEAN,
                    name: "magic".into(),
                    description: "Ask AI for better query before searching".into(),
                    required: false,
                    choices: vec![],
                    min_value: None,
                    max_value: None,
                },
            ],
            CommandKind::Similar | CommandKind::SimilarKnn => vec![
                query_type_option(&SearchMode::VECTOR_MODES),
                string_option("resultid", "Result number or catalogue ID"),
            ],
            CommandKind::More => vec![],
            CommandKind::Magic => vec![string_option("query", "Query to do magic with")],
            CommandKind::ResultSize => vec![OptionDefinition {
                kind: OPTION_INTEGER,
                name: "size".into(),
                description: "Size of search result set".into(),
                required: true,
                choices: vec![],
                min_value: Some(1),
                max_value: Some(MAX_PAGE_SIZE as i64),
            }],
            CommandKind::Text => vec![string_option("resultid", "Result number or catalogue ID")],
        }
    }
}

fn string_option(name: &str, description: &str) -> OptionDefinition {
    OptionDefinition {
        kind: OPTION_STRING,
        name: name.into(),
        description: description.into(),
        required: true,
        choices: vec![],
        min_value: None,
        max_value: None,
    }
}

fn query_type_option(modes: &[SearchMode]) -> OptionDefinition {
    OptionDefinition {
        choices: modes
            .iter()
            .map(|m| OptionChoice {
                name: m.label().into(),
                value: m.as_str().into(),
            })
            .collect(),
        ..string_option("querytype", "Query Type")
    }
}

/// Slash-command definitions with `prefix` prepended to every name.
pub fn definitions(prefix: &str) -> Vec<CommandDefinition> {
    CommandKind::ALL
        .iter()
        .map(|kind| CommandDefinition {
            name: format!("{}{}", prefix, kind.base_name()),
            description: kind.description().into(),
            options: kind.options(),
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════

/// A fully parsed command invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Search {
        command: SearchCommand,
        mode: SearchMode,
        query: String,
        magic: bool,
    },
    Similar {
        command: SearchCommand,
        mode: SearchMode,
        target: TargetRef,
    },
    More,
    Magic {
        query: String,
    },
    ResultSize {
        size: i64,
    },
    Text {
        target: TargetRef,
    },
}

struct Options<'a>(&'a [CommandOption]);

impl<'a> Options<'a> {
    fn get(&self, name: &str) -> Option<&'a Value> {
        self.0
            .iter()
            .find(|o| o.name == name)
            .map(|o| &o.value)
            .filter(|v| !v.is_null())
    }

    fn string(&self, name: &str, what: &str) -> Result<String, CatalogueError> {
        match self.get(name) {
            None => Err(CatalogueError::MissingRequiredOption(what.into())),
            Some(Value::String(s)) if s.trim().is_empty() => {
                Err(CatalogueError::MissingRequiredOption(what.into()))
            }
            Some(Value::String(s)) => Ok(s.trim().to_string()),
            Some(other) => Err(CatalogueError::InvalidOption(format!(
                "{} must be text, got {}",
                name, other
            ))),
        }
    }

    fn flag(&self, name: &str) -> Result<bool, CatalogueError> {
        match self.get(name) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(CatalogueError::InvalidOption(format!(
                "{} must be true or false, got {}",
                name, other
            ))),
        }
    }

    fn integer(&self, name: &str, what: &str) -> Result<i64, CatalogueError> {
        match self.get(name) {
            None => Err(CatalogueError::MissingRequiredOption(what.into())),
            Some(v) => v.as_i64().ok_or_else(|| {
                CatalogueError::InvalidOption(format!("{} must be an integer, got {}", name, v))
            }),
        }
    }

    fn mode(&self) -> Result<SearchMode, CatalogueError> {
        self.string("querytype", "search type")?.parse()
    }
}

impl Command {
    pub fn parse(kind: CommandKind, options: &[CommandOption]) -> Result<Self, CatalogueError> {
        let opts = Options(options);
        let command = match kind {
            CommandKind::Search | CommandKind::SearchKnn => Command::Search {
                command: if kind == CommandKind::Search {
                    SearchCommand::Search
                } else {
                    SearchCommand::SearchKnn
                },
                mode: opts.mode()?,
                query: opts.string("query", "query")?,
                magic: opts.flag("magic")?,
            },
            CommandKind::Similar | CommandKind::SimilarKnn => {
                let mode = opts.mode()?;
                if !mode.requires_embedding() {
                    return Err(CatalogueError::InvalidOption(format!(
                        "search type {} has no embedding to compare",
                        mode
                    )));
                }
                Command::Similar {
                    command: if kind == CommandKind::Similar {
                        SearchCommand::Similar
                    } else {
                        SearchCommand::SimilarKnn
                    },
                    mode,
                    target: opts.string("resultid", "result ID")?.parse()?,
                }
            }
            CommandKind::More => Command::More,
            CommandKind::Magic => Command::Magic {
                query: opts.string("query", "query")?,
            },
            CommandKind::ResultSize => Command::ResultSize {
                size: opts.integer("size", "result size")?,
            },
            CommandKind::Text => Command::Text {
                target: opts.string("resultid", "result ID")?.parse()?,
            },
        };
        Ok(command)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════

/// The immediate reply to an interaction, plus the background task if one
/// was started.
#[derive(Debug)]
pub struct Dispatch {
    pub reply: String,
    pub task: Option<JoinHandle<()>>,
}

impl Dispatch {
    fn reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            task: None,
        }
    }
}

/// Work that runs after the interaction was acknowledged.
enum Job {
    Search {
        command: SearchCommand,
        mode: SearchMode,
        query: String,
        magic: bool,
        filter: Option<Filter>,
    },
    Similar {
        command: SearchCommand,
        mode: SearchMode,
        target: TargetRef,
        source: Option<Document>,
        filter: Option<Filter>,
    },
    More,
    Magic {
        query: String,
    },
    Text {
        target: TargetRef,
    },
}

#[derive(Clone)]
struct Worker {
    orchestrator: Arc<Orchestrator>,
    platform: Arc<dyn Platform>,
    text: Arc<TextRenderer>,
}

/// How long the ack may wait for the channel lookup. Discord drops
/// interactions that are not answered within three seconds.
pub const DEFAULT_FILTER_BUDGET: Duration = Duration::from_millis(800);

pub struct Dispatcher {
    worker: Worker,
    prefix: String,
    filter_budget: Duration,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        platform: Arc<dyn Platform>,
        text: Arc<TextRenderer>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            worker: Worker {
                orchestrator,
                platform,
                text,
            },
            prefix: prefix.into(),
            filter_budget: DEFAULT_FILTER_BUDGET,
        }
    }

    pub fn with_filter_budget(mut self, budget: Duration) -> Self {
        self.filter_budget = budget;
        self
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.worker.orchestrator
    }

    pub fn definitions(&self) -> Vec<CommandDefinition> {
        definitions(&self.prefix)
    }

    /// Handles one command invocation. Never fails: every error becomes
    /// the reply text.
    pub async fn dispatch(&self, channel_id: &str, name: &str, options: &[CommandOption]) -> Dispatch {
        let Some(kind) = name
            .strip_prefix(self.prefix.as_str())
            .and_then(CommandKind::from_base_name)
        else {
            warn!(command = %name, "unknown command");
            return Dispatch::reply(format!("Unknown command {}", name));
        };

        let command = match Command::parse(kind, options) {
            Ok(command) => command,
            Err(e) => {
                debug!(channel = %channel_id, command = %name, error = %e, "invalid options");
                return Dispatch::reply(e.to_string());
            }
        };

        debug!(channel = %channel_id, command = %name, "dispatching");
        match self.start(channel_id, command).await {
            Ok(dispatch) => dispatch,
            Err(e) => {
                if e.is_refusal() {
                    debug!(channel = %channel_id, command = %name, "channel busy");
                } else {
                    warn!(channel = %channel_id, command = %name, error = %e, "command rejected");
                }
                Dispatch::reply(e.to_string())
            }
        }
    }

    async fn start(&self, channel_id: &str, command: Command) -> Result<Dispatch, CatalogueError> {
        let orchestrator = &self.worker.orchestrator;
        if let Command::ResultSize { size } = &command {
            validate_page_size(*size)?;
        }

        let guard = orchestrator.try_lock(channel_id)?;

        let (reply, job) = match command {
            Command::ResultSize { size } => {
                let size = orchestrator.set_page_size(&guard, size)?;
                return Ok(Dispatch::reply(format!("Result size set to {}", size)));
            }
            Command::Search {
                command,
                mode,
                query,
                magic,
            } => {
                let filter = self.quick_filter(channel_id).await?;
                let reply = with_filter(format!("Searching for {}: {}", mode, query), filter.as_ref());
                let job = Job::Search {
                    command,
                    mode,
                    query,
                    magic,
                    filter,
                };
                (reply, job)
            }
            Command::Similar {
                command,
                mode,
                target,
            } => {
                // Buffer lookups are local; only external ids wait for the task.
                let source = match target {
                    TargetRef::Index(_) => Some(orchestrator.resolve_target(&guard, &target).await?),
                    TargetRef::External(_) => None,
                };
                let filter = self.quick_filter(channel_id).await?;
                let subject = source
                    .as_ref()
                    .map(|d| d.title.clone())
                    .unwrap_or_else(|| target.label());
                let reply = with_filter(
                    format!("searching {} similarities for: {}", mode, subject),
                    filter.as_ref(),
                );
                let job = Job::Similar {
                    command,
                    mode,
                    target,
                    source,
                    filter,
                };
                (reply, job)
            }
            Command::More => {
                orchestrator.check_paging(channel_id)?;
                ("Searching for more results".to_string(), Job::More)
            }
            Command::Magic { query } => (format!("Converting query: {}", query), Job::Magic { query }),
            Command::Text { target } => (format!("Fetching result {}", target.label()), Job::Text { target }),
        };

        let task = self.spawn(channel_id.to_string(), guard, job);
        Ok(Dispatch {
            reply,
            task: Some(task),
        })
    }

    /// The channel filter if the platform answers within the budget.
    async fn quick_filter(&self, channel_id: &str) -> Result<Option<Filter>, CatalogueError> {
        match tokio::time::timeout(self.filter_budget, self.worker.channel_filter(channel_id)).await {
            Ok(filter) => filter.map(Some),
            Err(_) => {
                debug!(channel = %channel_id, "channel lookup deferred to the task");
                Ok(None)
            }
        }
    }

    fn spawn(&self, channel_id: String, guard: ChannelGuard, job: Job) -> JoinHandle<()> {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            let messages = match worker.execute(&guard, job).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(channel = %channel_id, error = %e, "command failed");
                    vec![OutgoingMessage::text(e.to_string())]
                }
            };
            for message in &messages {
                if let Err(e) = worker.platform.send_message(&channel_id, message).await {
                    error!(channel = %channel_id, error = %e, "Error sending response");
                }
            }
            drop(guard);
        })
    }
}

impl Worker {
    async fn channel_filter(&self, channel_id: &str) -> Result<Filter, CatalogueError> {
        let info = self
            .platform
            .channel(channel_id)
            .await
            .map_err(|e| CatalogueError::backend("cannot get channel", e))?;
        Ok(info.filter())
    }

    /// Resolves a filter the ack went out without. The filter is announced
    /// before any results.
    async fn late_filter(
        &self,
        guard: &ChannelGuard,
        filter: Option<Filter>,
        messages: &mut Vec<OutgoingMessage>,
    ) -> Result<Filter, CatalogueError> {
        if let Some(filter) = filter {
            return Ok(filter);
        }
        let filter = self.channel_filter(guard.channel_id()).await?;
        messages.push(OutgoingMessage::text(with_filter(String::new(), Some(&filter))));
        Ok(filter)
    }

    async fn execute(&self, guard: &ChannelGuard, job: Job) -> Result<Vec<OutgoingMessage>, CatalogueError> {
        let orchestrator = &self.orchestrator;
        match job {
            Job::Search {
                command,
                mode,
                query,
                magic,
                filter,
            } => {
                let mut messages = Vec::new();
                let filter = self.late_filter(guard, filter, &mut messages).await?;
                let outcome = orchestrator
                    .new_search(
                        guard,
                        NewSearch {
                            query: &query,
                            filter: &filter,
                            mode,
                            rewrite: magic,
                            command,
                        },
                    )
                    .await?;
                messages.extend(result_messages(&outcome));
                Ok(messages)
            }
            Job::Similar {
                command,
                mode,
                target,
                source,
                filter,
            } => {
                let mut messages = Vec::new();
                let filter = self.late_filter(guard, filter, &mut messages).await?;
                let source = match source {
                    Some(doc) => doc,
                    None => orchestrator.resolve_target(guard, &target).await?,
                };
                let outcome = orchestrator
                    .similar(guard, &source, &target.label(), mode, command, &filter)
                    .await?;
                messages.extend(result_messages(&outcome));
                Ok(messages)
            }
            Job::More => {
                let outcome = orchestrator.more(guard).await?;
                if outcome.page.docs.is_empty() {
                    return Ok(vec![OutgoingMessage::text("No more results")]);
                }
                Ok(result_messages(&outcome))
            }
            Job::Magic { query } => {
                let rewritten = orchestrator.rewrite_query(guard, &query).await?;
                Ok(vec![OutgoingMessage::text(rewritten)])
            }
            Job::Text { target } => {
                let doc = orchestrator.resolve_target(guard, &target).await?;
                Ok(vec![OutgoingMessage::text(self.text.render(&doc)?)])
            }
        }
    }
}

/// Appends the filter listing to an ack line. An empty `head` yields the
/// listing alone.
fn with_filter(head: String, filter: Option<&Filter>) -> String {
    let Some(filter) = filter else {
        return head;
    };
    let listing = format!("Filter:\n{}", filter::describe(filter));
    if head.is_empty() {
        listing
    } else {
        format!("{}\n{}", head, listing)
    }
}

fn result_messages(outcome: &SearchOutcome) -> Vec<OutgoingMessage> {
    debug!(docs = outcome.page.docs.len(), total = outcome.page.total, "sending results");
    batch_embeds(outcome_embeds(outcome))
        .into_iter()
        .map(OutgoingMessage::embeds)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opt(name: &str, value: impl Into<Value>) -> CommandOption {
        CommandOption::new(name, value)
    }

    #[test]
    fn test_definitions_carry_prefix_and_choices() {
        let defs = definitions("dev");
        assert_eq!(defs.len(), 8);
        assert!(defs.iter().all(|d| d.name.starts_with("dev")));
        let search = defs.iter().find(|d| d.name == "devsearch").unwrap();
        let choices: Vec<&str> = search.options[0]
            .choices
            .iter()
            .map(|c| c.value.as_str())
            .collect();
        assert_eq!(choices, vec!["simple", "marc", "prose", "json"]);
        assert!(!search.options[2].required);

        let similar = defs.iter().find(|d| d.name == "devsimilar").unwrap();
        assert_eq!(similar.options[0].choices.len(), 3);

        let size = defs.iter().find(|d| d.name == "devresultsize").unwrap();
        assert_eq!(size.options[0].max_value, Some(100));
    }

    #[test]
    fn test_parse_search() {
        let cmd = Command::parse(
            CommandKind::SearchKnn,
            &[opt("querytype", "prose"), opt("query", " goethe "), opt("magic", true)],
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Search {
                command: SearchCommand::SearchKnn,
                mode: SearchMode::Prose,
                query: "goethe".into(),
                magic: true,
            }
        );
    }

    #[test]
    fn test_parse_missing_and_invalid_options() {
        assert_eq!(
            Command::parse(CommandKind::Search, &[opt("querytype", "simple")]).unwrap_err(),
            CatalogueError::MissingRequiredOption("query".into())
        );
        assert!(matches!(
            Command::parse(CommandKind::Search, &[opt("querytype", "fuzzy"), opt("query", "x")]),
            Err(CatalogueError::InvalidOption(_))
        ));
        assert!(matches!(
            Command::parse(CommandKind::Similar, &[opt("querytype", "simple"), opt("resultid", "1")]),
            Err(CatalogueError::InvalidOption(_))
        ));
        assert!(matches!(
            Command::parse(CommandKind::ResultSize, &[opt("size", "ten")]),
            Err(CatalogueError::InvalidOption(_))
        ));
        assert_eq!(
            Command::parse(CommandKind::Text, &[]).unwrap_err(),
            CatalogueError::MissingRequiredOption("result ID".into())
        );
    }

    #[test]
    fn test_parse_similar_target() {
        let cmd = Command::parse(
            CommandKind::SimilarKnn,
            &[opt("querytype", "marc"), opt("resultid", "991170525505504")],
        )
        .unwrap();
        assert_eq!(
            cmd,
            Command::Similar {
                command: SearchCommand::SimilarKnn,
                mode: SearchMode::Marc,
                target: TargetRef::External("991170525505504".into()),
            }
        );
    }

    #[test]
    fn test_channel_info_filter() {
        let info = ChannelInfo {
            name: Some("filter-lang-ger".into()),
            topic: Some("library: UBS".into()),
        };
        let f = info.filter();
        assert_eq!(f["lang"], "ger*");
        assert_eq!(f["library"], "UBS");
    }
}
