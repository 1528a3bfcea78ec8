//! Slack bot that counts image "snipes" posted in one channel and renders
//! per-category leaderboards on demand.

use std::sync::Arc;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

pub mod commands;
pub mod config;
pub mod ingest;
pub mod render;
pub mod slack;
pub mod socket;
pub mod store;
pub mod webhook;

use crate::commands::SlashCommand;
use crate::config::Config;
use crate::ingest::{IngestOutcome, MentionParser, MessageEvent};
use crate::slack::SlackClient;
use crate::store::ScoreStore;

/// User id -> count. Iteration order is insertion order, which is also the
/// order persisted to disk and the tie order on the leaderboard.
pub type ScoreMap = IndexMap<String, u64>;

/// An independent leaderboard partition with its own backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Images posted, credited to the author.
    Snipes,
    /// Times a user was tagged in someone else's snipe.
    Sniped,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Snipes, Category::Sniped];

    pub fn key(self) -> &'static str {
        match self {
            Category::Snipes => "snipes",
            Category::Sniped => "sniped",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Category::Snipes => "🏆 Sniper Leaderboard 🏆",
            Category::Sniped => "🎯 Most Sniped 🎯",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Category::Snipes => "points",
            Category::Sniped => "times sniped",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Category::Snipes => 0,
            Category::Sniped => 1,
        }
    }
}

/// One rendered leaderboard line. Rebuilt on every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub name: String,
    pub count: u64,
}

/// Everything a handler needs, built once at startup and shared by `Arc`.
pub struct AppState {
    pub config: Config,
    pub store: ScoreStore,
    pub slack: SlackClient,
    pub mentions: MentionParser,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data dir {}", config.data_dir.display())
        })?;

        let store = ScoreStore::new(&config.data_dir);
        let slack = SlackClient::new(&config.slack_bot_token, &config.slack_api_base)?;
        let mentions = MentionParser::new()?;

        Ok(Self {
            config,
            store,
            slack,
            mentions,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EventCallback {
    #[serde(rename = "type")]
    callback_type: String,
    #[serde(default)]
    event: Value,
}

/// Routes an Events API `event_callback` body to the ingestor. Anything other
/// than a channel `message` event is ignored.
pub async fn dispatch_event(state: &AppState, payload: Value) -> Result<IngestOutcome> {
    let callback: EventCallback =
        serde_json::from_value(payload).context("failed to decode event callback")?;
    if callback.callback_type != "event_callback" {
        debug!(callback_type = %callback.callback_type, "ignoring non event callback");
        return Ok(IngestOutcome::Ignored);
    }

    let event_type = callback.event["type"].as_str().unwrap_or_default();
    if event_type != "message" {
        debug!(event_type, "ignoring unhandled event type");
        return Ok(IngestOutcome::Ignored);
    }

    let event: MessageEvent =
        serde_json::from_value(callback.event).context("failed to decode message event")?;
    ingest::handle_message(state, &event).await
}

/// Renders the leaderboard a slash command asks for and posts it.
pub async fn dispatch_command(state: &AppState, command: &SlashCommand) -> Result<()> {
    commands::handle_command(state, command).await
}

/// Spawns `dispatch_event` on its own task so the caller can acknowledge
/// the delivery right away.
pub fn spawn_event(state: Arc<AppState>, payload: Value) {
    tokio::spawn(async move {
        if let Err(e) = dispatch_event(&state, payload).await {
            error!("Error processing event: {:#}", e);
        }
    });
}

pub fn spawn_command(state: Arc<AppState>, command: SlashCommand) {
    tokio::spawn(async move {
        if let Err(e) = dispatch_command(&state, &command).await {
            error!(command = %command.command, "Error processing command: {:#}", e);
        }
    });
}
