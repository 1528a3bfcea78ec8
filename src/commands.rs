// commands.rs
use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use crate::render::render_leaderboard;
use crate::{AppState, Category};

/// The fields of a slash command invocation the bot uses. Socket Mode sends
/// these as JSON, the HTTP endpoint as a form body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlashCommand {
    pub command: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub channel_id: String,
}

pub const USAGE: &str =
    "Usage: `/leaderboard` (or `/leaderboard sniped`), `/snipers`, `/sniped`";

/// `/leaderboard` takes an optional category argument; the dedicated
/// commands ignore their text.
pub fn parse_command(command: &str, text: &str) -> Option<Category> {
    match command.trim().to_lowercase().as_str() {
        "/leaderboard" => match text.trim().to_lowercase().as_str() {
            "" | "snipes" | "snipers" => Some(Category::Snipes),
            "sniped" => Some(Category::Sniped),
            _ => None,
        },
        "/snipers" => Some(Category::Snipes),
        "/sniped" => Some(Category::Sniped),
        _ => None,
    }
}

/// Builds the reply for a command. The store is read fresh on every call.
pub async fn respond(state: &AppState, command: &SlashCommand) -> Result<String> {
    let Some(category) = parse_command(&command.command, &command.text) else {
        warn!(command = %command.command, text = %command.text, "Unknown command");
        return Ok(USAGE.to_string());
    };

    info!(
        command = %command.command,
        category = category.key(),
        user = %command.user_id,
        "Processing leaderboard command"
    );
    let scores = state.store.load(category).await?;

    Ok(render_leaderboard(&state.slack, &scores, category.title(), category.unit()).await)
}

/// Runs after the invocation has been acknowledged; posts the reply into the
/// channel the command came from.
pub async fn handle_command(state: &AppState, command: &SlashCommand) -> Result<()> {
    let reply = respond(state, command).await?;
    state
        .slack
        .post_message(&command.channel_id, &reply, None)
        .await
}
