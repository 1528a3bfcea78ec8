// store.rs
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Category, ScoreMap};

/// One flat JSON object per category, `{"U123": 4, ...}`, in `dir`.
///
/// Every mutation is a whole-file load, modify, save. The per-category lock
/// only serializes writers inside this process.
#[derive(Debug)]
pub struct ScoreStore {
    dir: PathBuf,
    locks: [Mutex<()>; 2],
}

impl ScoreStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        ScoreStore {
            dir: dir.as_ref().to_path_buf(),
            locks: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn path(&self, category: Category) -> PathBuf {
        self.dir.join(format!("{}.json", category.key()))
    }

    /// Missing data is an empty board. Unreadable or malformed data is an
    /// error and the file is left alone.
    pub async fn load(&self, category: Category) -> Result<ScoreMap> {
        let path = self.path(category);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ScoreMap::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        serde_json::from_str(&raw)
            .with_context(|| format!("score file {} is corrupted", path.display()))
    }

    /// Replaces the whole file. Written to a temp file first and renamed so a
    /// crash mid-write never leaves a truncated board behind.
    pub async fn save(&self, category: Category, scores: &ScoreMap) -> Result<()> {
        let path = self.path(category);
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", category.key(), uuid::Uuid::new_v4()));

        let body = serde_json::to_string_pretty(scores)?;
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;

        Ok(())
    }

    /// Adds one per occurrence of each id and persists the result.
    pub async fn increment<S: AsRef<str>>(
        &self,
        category: Category,
        user_ids: &[S],
    ) -> Result<ScoreMap> {
        let _guard = self.locks[category.index()].lock().await;

        let mut scores = self.load(category).await?;
        bump(&mut scores, user_ids)?;
        self.save(category, &scores).await?;

        debug!(
            category = category.key(),
            users = user_ids.len(),
            "scores updated"
        );
        Ok(scores)
    }

    /// Credits `author` with a snipe and every id in `sniped` with being
    /// sniped. Both boards are loaded and updated in memory before either is
    /// written, so a corrupted board fails the whole snipe with nothing saved.
    pub async fn record_snipe<S: AsRef<str>>(&self, author: &str, sniped: &[S]) -> Result<()> {
        // Fixed lock order: Snipes, then Sniped.
        let _snipes_guard = self.locks[Category::Snipes.index()].lock().await;
        let _sniped_guard = self.locks[Category::Sniped.index()].lock().await;

        let mut snipes = self.load(Category::Snipes).await?;
        let mut sniped_scores = self.load(Category::Sniped).await?;
        bump(&mut snipes, &[author])?;
        bump(&mut sniped_scores, sniped)?;

        self.save(Category::Snipes, &snipes).await?;
        self.save(Category::Sniped, &sniped_scores).await?;

        debug!(user = author, sniped = sniped.len(), "snipe recorded");
        Ok(())
    }
}

fn bump<S: AsRef<str>>(scores: &mut ScoreMap, user_ids: &[S]) -> Result<()> {
    for user_id in user_ids {
        let count = scores.entry(user_id.as_ref().to_string()).or_insert(0);
        *count = count
            .checked_add(1)
            .with_context(|| format!("score for {} is at its maximum", user_id.as_ref()))?;
    }
    Ok(())
}
