// render.rs
use tracing::warn;

use crate::slack::SlackClient;
use crate::{LeaderboardEntry, ScoreMap};

pub const EMPTY_NOTICE: &str =
    "The leaderboard is empty! Start posting images to get on the board.";

/// Highest count first. The sort is stable, so tied users keep the map's
/// insertion order, i.e. whoever was first recorded ranks higher.
pub fn rank(scores: &ScoreMap) -> Vec<(&str, u64)> {
    let mut ranked: Vec<(&str, u64)> = scores
        .iter()
        .map(|(user_id, count)| (user_id.as_str(), *count))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
}

pub fn fallback_name(user_id: &str) -> String {
    format!("Unknown User ({})", user_id)
}

fn medal(rank: usize) -> Option<&'static str> {
    match rank {
        1 => Some("🥇"),
        2 => Some("🥈"),
        3 => Some("🥉"),
        _ => None,
    }
}

pub fn format_leaderboard(title: &str, unit: &str, entries: &[LeaderboardEntry]) -> String {
    if entries.is_empty() {
        return EMPTY_NOTICE.to_string();
    }

    let mut text = format!("*{}*\n\n", title);
    for entry in entries {
        match medal(entry.rank) {
            Some(medal) => text.push_str(&format!(
                "{} {}. {}: *{} {}*\n",
                medal, entry.rank, entry.name, entry.count, unit
            )),
            None => text.push_str(&format!(
                "   {}. {}: {} {}\n",
                entry.rank, entry.name, entry.count, unit
            )),
        }
    }
    text
}

/// Ranks `scores`, resolves every user to a display name and formats the
/// board. A failed lookup only costs that user their name.
pub async fn render_leaderboard(
    slack: &SlackClient,
    scores: &ScoreMap,
    title: &str,
    unit: &str,
) -> String {
    if scores.is_empty() {
        return EMPTY_NOTICE.to_string();
    }

    let mut entries = Vec::with_capacity(scores.len());
    for (index, (user_id, count)) in rank(scores).into_iter().enumerate() {
        let name = match slack.user_display_name(user_id).await {
            Ok(name) => name,
            Err(e) => {
                warn!(user = user_id, "Could not fetch user info: {:#}", e);
                fallback_name(user_id)
            }
        };
        entries.push(LeaderboardEntry {
            rank: index + 1,
            name,
            count,
        });
    }

    format_leaderboard(title, unit, &entries)
}
