// config.rs
use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// How a qualifying image is credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoringMode {
    /// The author scores; mentions are ignored.
    #[default]
    #[serde(rename = "self")]
    SelfScore,
    /// The author scores only if the message tags at least one target, and
    /// every tagged user is counted as sniped.
    Mention,
}

/// Where inbound events come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Socket Mode websocket, needs an app-level token.
    #[default]
    Socket,
    /// Events API over HTTP, needs the signing secret.
    Http,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub slack_bot_token: String,
    #[serde(default)]
    pub slack_app_token: Option<String>,
    #[serde(default)]
    pub slack_signing_secret: Option<String>,
    #[serde(default)]
    pub target_channel_id: String,
    #[serde(default)]
    pub slack_transport: Transport,
    #[serde(default)]
    pub scoring_mode: ScoringMode,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_base")]
    pub slack_api_base: String,
    #[serde(default = "default_reaction_name")]
    pub reaction_name: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_api_base() -> String {
    "https://slack.com/api".to_string()
}

fn default_reaction_name() -> String {
    "white_check_mark".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    5_000
}

impl Config {
    /// Reads `snipe-bot.toml` (optional) overlaid by the process environment.
    pub fn load() -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name("snipe-bot").required(false))
            .add_source(::config::Environment::default())
            .build()
            .context("failed to read configuration")?;

        Self::from_settings(settings)
    }

    pub fn from_settings(settings: ::config::Config) -> Result<Self> {
        let mut config: Config = settings
            .try_deserialize()
            .context("invalid configuration")?;

        config.slack_app_token = non_blank(config.slack_app_token.take());
        config.slack_signing_secret = non_blank(config.slack_signing_secret.take());
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.slack_bot_token.trim().is_empty() {
            anyhow::bail!("SLACK_BOT_TOKEN not set");
        }
        if self.target_channel_id.trim().is_empty() {
            anyhow::bail!("TARGET_CHANNEL_ID not set");
        }

        match self.slack_transport {
            Transport::Socket if self.slack_app_token.is_none() => {
                anyhow::bail!("SLACK_APP_TOKEN not set (required for socket transport)")
            }
            Transport::Http if self.slack_signing_secret.is_none() => {
                anyhow::bail!("SLACK_SIGNING_SECRET not set (required for http transport)")
            }
            _ => Ok(()),
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// Tokens stay out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("target_channel_id", &self.target_channel_id)
            .field("slack_transport", &self.slack_transport)
            .field("scoring_mode", &self.scoring_mode)
            .field("data_dir", &self.data_dir)
            .field("bind_address", &self.bind_address)
            .field("slack_api_base", &self.slack_api_base)
            .field("reaction_name", &self.reaction_name)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .finish_non_exhaustive()
    }
}
