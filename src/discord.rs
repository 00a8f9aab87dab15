//! Discord wire types and REST client.
//!
//! Only the slice of the Discord API the bot needs: incoming interaction
//! payloads, interaction responses, embeds, slash-command definitions, and a
//! REST client for channel lookup, channel messages, and guild command
//! registration.
//!
//! Interaction requests are authenticated with Ed25519 over
//! `timestamp || body`; see [`verify_signature`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::commands::{ChannelInfo, OutgoingMessage, Platform};

pub const INTERACTION_PING: u8 = 1;
pub const INTERACTION_APPLICATION_COMMAND: u8 = 2;

pub const RESPONSE_PONG: u8 = 1;
pub const RESPONSE_CHANNEL_MESSAGE: u8 = 4;

pub const OPTION_STRING: u8 = 3;
pub const OPTION_INTEGER: u8 = 4;
pub const OPTION_BOOLEAN: u8 = 5;

/// Discord rejects messages with more embeds than this.
pub const MAX_EMBEDS_PER_MESSAGE: usize = 10;
/// Discord rejects message content longer than this (in characters).
pub const MAX_CONTENT_LEN: usize = 2000;

// ============ Incoming ============

#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub data: Option<CommandData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandOption {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: u8,
    #[serde(default)]
    pub value: Value,
}

impl CommandOption {
    pub fn new(name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        let kind = match &value {
            Value::Bool(_) => OPTION_BOOLEAN,
            Value::Number(_) => OPTION_INTEGER,
            _ => OPTION_STRING,
        };
        Self {
            name: name.to_string(),
            kind,
            value,
        }
    }
}

// ============ Outgoing ============

#[derive(Debug, Clone, Serialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseData {
    pub content: String,
}

impl InteractionResponse {
    pub fn pong() -> Self {
        Self {
            kind: RESPONSE_PONG,
            data: None,
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self {
            kind: RESPONSE_CHANNEL_MESSAGE,
            data: Some(ResponseData {
                content: truncate(&content.into(), MAX_CONTENT_LEN),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbedAuthor {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
}

/// Slash-command definition as sent to the registration endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandDefinition {
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionDefinition {
    #[serde(rename = "type")]
    pub kind: u8,
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<OptionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptionChoice {
    pub name: String,
    pub value: String,
}

/// Truncates to at most `max` characters, marking the cut with `...`.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}

// ============ Signature ============

/// Parses the application's hex-encoded public key.
pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim()).context("public key is not hex")?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("invalid Ed25519 public key")
}

/// Checks `X-Signature-Ed25519` over `timestamp || body`.
pub fn verify_signature(key: &VerifyingKey, signature_hex: &str, timestamp: &str, body: &[u8]) -> bool {
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    let mut message = Vec::with_capacity(timestamp.len() + body.len());
    message.extend_from_slice(timestamp.as_bytes());
    message.extend_from_slice(body);
    key.verify(&message, &signature).is_ok()
}

// ============ REST client ============

pub struct DiscordClient {
    client: reqwest::Client,
    api_base: String,
    token: String,
    application_id: String,
    guild_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelResponse {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegisteredCommand {
    id: String,
    name: String,
}

impl DiscordClient {
    pub fn new(
        api_base: &str,
        token: String,
        application_id: String,
        guild_id: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token,
            application_id,
            guild_id,
        })
    }

    fn commands_url(&self) -> String {
        match &self.guild_id {
            Some(guild) => format!(
                "{}/applications/{}/guilds/{}/commands",
                self.api_base, self.application_id, guild
            ),
            None => format!("{}/applications/{}/commands", self.api_base, self.application_id),
        }
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bot {}", self.token))
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        bail!("discord {} failed {}: {}", what, status, body)
    }

    /// Registers each command and returns the ids Discord assigned.
    pub async fn register_commands(&self, commands: &[CommandDefinition]) -> Result<Vec<String>> {
        let url = self.commands_url();
        let mut ids = Vec::with_capacity(commands.len());
        for command in commands {
            let response = self.auth(self.client.post(&url)).json(command).send().await?;
            let registered: RegisteredCommand = Self::check(response, "command registration")
                .await?
                .json()
                .await?;
            info!(command = %registered.name, id = %registered.id, "registered command");
            ids.push(registered.id);
        }
        Ok(ids)
    }

    pub async fn delete_commands(&self, ids: &[String]) -> Result<()> {
        let base = self.commands_url();
        for id in ids {
            let response = self
                .auth(self.client.delete(format!("{}/{}", base, id)))
                .send()
                .await?;
            match Self::check(response, "command deletion").await {
                Ok(_) => debug!(id = %id, "deleted command"),
                Err(e) => warn!(error = %e, id = %id, "cannot delete command"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Platform for DiscordClient {
    async fn channel(&self, channel_id: &str) -> Result<ChannelInfo> {
        let url = format!("{}/channels/{}", self.api_base, channel_id);
        let response = self.auth(self.client.get(&url)).send().await?;
        let channel: ChannelResponse = Self::check(response, "channel lookup").await?.json().await?;
        Ok(ChannelInfo {
            name: channel.name,
            topic: channel.topic,
        })
    }

    async fn send_message(&self, channel_id: &str, message: &OutgoingMessage) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);
        let response = self.auth(self.client.post(&url)).json(message).send().await?;
        Self::check(response, "message send").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_signature_roundtrip() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let key = signing.verifying_key();
        let body = br#"{"type":1}"#;
        let ts = "1700000000";
        let mut msg = ts.as_bytes().to_vec();
        msg.extend_from_slice(body);
        let sig = hex::encode(signing.sign(&msg).to_bytes());

        assert!(verify_signature(&key, &sig, ts, body));
        assert!(!verify_signature(&key, &sig, "1700000001", body));
        assert!(!verify_signature(&key, &sig, ts, br#"{"type":2}"#));
        assert!(!verify_signature(&key, "zz", ts, body));
    }

    #[test]
    fn test_parse_public_key() {
        let signing = SigningKey::from_bytes(&[7u8; 32]);
        let hex_key = hex::encode(signing.verifying_key().to_bytes());
        assert_eq!(parse_public_key(&hex_key).unwrap(), signing.verifying_key());
        assert!(parse_public_key("abcd").is_err());
    }

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("äöüäöüäöü", 6), "äöü...");
    }

    #[test]
    fn test_interaction_parses_command() {
        let raw = r#"{"type":2,"id":"1","channel_id":"42","data":{"name":"search","options":[{"name":"query","type":3,"value":"faust"}]}}"#;
        let interaction: Interaction = serde_json::from_str(raw).unwrap();
        assert_eq!(interaction.kind, INTERACTION_APPLICATION_COMMAND);
        let data = interaction.data.unwrap();
        assert_eq!(data.options[0], CommandOption::new("query", "faust"));
    }
}
