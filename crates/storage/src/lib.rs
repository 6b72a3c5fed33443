use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::{
    domain::{Story, StoryId},
    protocol::{StoryDraft, StoryPatch},
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// All stories in board order: `position`, then creation time.
    pub async fn list_stories(&self) -> Result<Vec<Story>> {
        let rows = sqlx::query(
            "SELECT id, title, text, position, created
             FROM stories
             ORDER BY position ASC, created ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list stories")?;
        rows.iter().map(story_from_row).collect()
    }

    pub async fn get_story(&self, story_id: StoryId) -> Result<Option<Story>> {
        let row = sqlx::query("SELECT id, title, text, position, created FROM stories WHERE id = ?")
            .bind(story_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load story {story_id}"))?;
        row.as_ref().map(story_from_row).transpose()
    }

    pub async fn create_story(&self, draft: &StoryDraft) -> Result<Story> {
        let position = match draft.position {
            Some(position) => position,
            None => self.next_position().await?,
        };
        let story = Story {
            id: StoryId::new_random(),
            title: draft.title.clone(),
            text: draft.text.clone().unwrap_or_default(),
            position,
            created: Utc::now(),
        };
        self.insert_story(&story).await?;
        Ok(story)
    }

    pub async fn insert_story(&self, story: &Story) -> Result<()> {
        sqlx::query(
            "INSERT INTO stories (id, title, text, position, created) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(story.id.to_string())
        .bind(&story.title)
        .bind(&story.text)
        .bind(story.position)
        .bind(story.created)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert story {}", story.id))?;
        Ok(())
    }

    /// Applies the present fields of `patch`. Returns `None` for an unknown id.
    pub async fn update_story(&self, story_id: StoryId, patch: &StoryPatch) -> Result<Option<Story>> {
        let result = sqlx::query(
            "UPDATE stories
             SET title = COALESCE(?, title),
                 text = COALESCE(?, text),
                 position = COALESCE(?, position)
             WHERE id = ?",
        )
        .bind(patch.title.as_deref())
        .bind(patch.text.as_deref())
        .bind(patch.position)
        .bind(story_id.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to update story {story_id}"))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_story(story_id).await
    }

    /// Deletes and returns the removed story, or `None` when it did not exist.
    pub async fn delete_story(&self, story_id: StoryId) -> Result<Option<Story>> {
        let row = sqlx::query(
            "DELETE FROM stories WHERE id = ? RETURNING id, title, text, position, created",
        )
        .bind(story_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to delete story {story_id}"))?;
        row.as_ref().map(story_from_row).transpose()
    }

    async fn next_position(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(position) FROM stories")
            .fetch_one(&self.pool)
            .await
            .context("failed to read max story position")?;
        Ok(max.map_or(0, |position| position + 1))
    }
}

fn story_from_row(row: &SqliteRow) -> Result<Story> {
    let raw_id: String = row.try_get("id")?;
    let id = StoryId::from_str(&raw_id).map_err(|err| anyhow!("corrupt story id '{raw_id}': {err}"))?;
    Ok(Story {
        id,
        title: row.try_get("title")?,
        text: row.try_get("text")?,
        position: row.try_get("position")?,
        created: row.try_get::<DateTime<Utc>, _>("created")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
