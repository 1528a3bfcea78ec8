// ingest.rs
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::config::ScoringMode;
use crate::{AppState, Category};

/// The parts of a Slack `message` event the ingestor looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub files: Vec<FileAttachment>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileAttachment {
    #[serde(default)]
    pub mimetype: Option<String>,
}

impl MessageEvent {
    pub fn has_image(&self) -> bool {
        self.files.iter().any(|file| {
            file.mimetype
                .as_deref()
                .is_some_and(|mimetype| mimetype.starts_with("image/"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Wrong channel, no author, or not a message at all.
    Ignored,
    NotAnImage,
    /// Mention mode and nobody was tagged; the author was told how to fix it.
    MissingMention { author: String },
    Scored { author: String, sniped: Vec<String> },
}

/// Pulls `<@U123ABC>` user mentions out of message text.
#[derive(Debug, Clone)]
pub struct MentionParser {
    mention_regex: Regex,
}

impl MentionParser {
    pub fn new() -> Result<Self> {
        let mention_regex =
            Regex::new(r"<@([A-Z0-9]+)>").context("failed to compile mention pattern")?;

        Ok(Self { mention_regex })
    }

    /// Every mention in order of appearance, repeats included.
    pub fn extract(&self, text: &str) -> Vec<String> {
        self.mention_regex
            .captures_iter(text)
            .filter_map(|captures| captures.get(1))
            .map(|id| id.as_str().to_string())
            .collect()
    }
}

/// Decides what an event is worth without touching the store or Slack.
pub fn classify(
    event: &MessageEvent,
    target_channel: &str,
    mode: ScoringMode,
    mentions: &MentionParser,
) -> IngestOutcome {
    if event.channel.as_deref() != Some(target_channel) {
        return IngestOutcome::Ignored;
    }
    let author = match event.user.as_deref() {
        Some(user) if !user.is_empty() => user.to_string(),
        _ => return IngestOutcome::Ignored,
    };

    if !event.has_image() {
        return IngestOutcome::NotAnImage;
    }

    match mode {
        ScoringMode::SelfScore => IngestOutcome::Scored {
            author,
            sniped: Vec::new(),
        },
        ScoringMode::Mention => {
            let sniped = mentions.extract(event.text.as_deref().unwrap_or_default());
            if sniped.is_empty() {
                IngestOutcome::MissingMention { author }
            } else {
                IngestOutcome::Scored { author, sniped }
            }
        }
    }
}

pub fn missing_mention_message(author: &str) -> String {
    format!(
        "<@{}> Nice shot, but nobody was tagged! Post the image again with an @mention of who you sniped so it counts.",
        author
    )
}

/// Scores one message event. Store failures propagate; Slack reply and
/// reaction failures are logged and swallowed.
pub async fn handle_message(state: &AppState, event: &MessageEvent) -> Result<IngestOutcome> {
    let outcome = classify(
        event,
        &state.config.target_channel_id,
        state.config.scoring_mode,
        &state.mentions,
    );

    // classify only gets past Ignored with the target channel set
    let channel = state.config.target_channel_id.as_str();
    match &outcome {
        IngestOutcome::Ignored | IngestOutcome::NotAnImage => {}
        IngestOutcome::MissingMention { author } => {
            info!(user = %author, "image posted without a mention, not scoring");
            if let Err(e) = state
                .slack
                .post_message(channel, &missing_mention_message(author), event.ts.as_deref())
                .await
            {
                error!("Error posting mention warning: {:#}", e);
            }
        }
        IngestOutcome::Scored { author, sniped } => {
            info!(user = %author, sniped = ?sniped, "Image detected in target channel");

            if sniped.is_empty() {
                state
                    .store
                    .increment(Category::Snipes, std::slice::from_ref(author))
                    .await?;
            } else {
                state.store.record_snipe(author, sniped.as_slice()).await?;
            }

            match event.ts.as_deref() {
                Some(ts) => {
                    if let Err(e) = state
                        .slack
                        .add_reaction(channel, ts, &state.config.reaction_name)
                        .await
                    {
                        error!("Error adding reaction: {:#}", e);
                    }
                }
                None => warn!(user = %author, "scored message has no ts, skipping reaction"),
            }
        }
    }

    Ok(outcome)
}
