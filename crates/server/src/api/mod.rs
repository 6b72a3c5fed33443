use std::str::FromStr;

use shared::{
    domain::{Story, StoryId},
    error::ApiError,
    protocol::{StoryDraft, StoryList, StoryPatch},
};
use storage::Storage;

pub(crate) const MAX_TITLE_CHARS: usize = 200;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub fn parse_story_id(raw: &str) -> Result<StoryId, ApiError> {
    StoryId::from_str(raw).map_err(|_| ApiError::validation(format!("invalid story id '{raw}'")))
}

pub async fn list_stories(ctx: &ApiContext) -> Result<StoryList, ApiError> {
    let stories = ctx.storage.list_stories().await.map_err(internal)?;
    Ok(StoryList { stories })
}

pub async fn get_story(ctx: &ApiContext, story_id: StoryId) -> Result<Story, ApiError> {
    ctx.storage
        .get_story(story_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| story_not_found(story_id))
}

pub async fn create_story(ctx: &ApiContext, mut draft: StoryDraft) -> Result<Story, ApiError> {
    draft.title = validate_title(&draft.title)?;
    ctx.storage.create_story(&draft).await.map_err(internal)
}

pub async fn update_story(
    ctx: &ApiContext,
    story_id: StoryId,
    mut patch: StoryPatch,
) -> Result<Story, ApiError> {
    if let Some(title) = patch.title.as_deref() {
        patch.title = Some(validate_title(title)?);
    }
    ctx.storage
        .update_story(story_id, &patch)
        .await
        .map_err(internal)?
        .ok_or_else(|| story_not_found(story_id))
}

pub async fn delete_story(ctx: &ApiContext, story_id: StoryId) -> Result<Story, ApiError> {
    ctx.storage
        .delete_story(story_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| story_not_found(story_id))
}

fn validate_title(title: &str) -> Result<String, ApiError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ApiError::validation("story title cannot be empty"));
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        return Err(ApiError::validation(format!(
            "story title exceeds {MAX_TITLE_CHARS} characters"
        )));
    }
    Ok(title.to_string())
}

fn story_not_found(story_id: StoryId) -> ApiError {
    ApiError::not_found(format!("story {story_id} not found"))
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "storage failure");
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
