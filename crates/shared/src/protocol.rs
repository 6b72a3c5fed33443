use serde::{Deserialize, Serialize};

use crate::domain::Story;

pub const STORY_OBJECT_TYPE: &str = "story";
pub const STATUS_SUCCESS: &str = "success";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryList {
    pub stories: Vec<Story>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryEnvelope {
    pub story: Story,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryDraft {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Story>,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            data: None,
        }
    }

    pub fn success_with(story: Story) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            data: Some(story),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    Added,
    Updated,
    Deleted,
}

impl PushAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PushAction::Added => "added",
            PushAction::Updated => "updated",
            PushAction::Deleted => "deleted",
        }
    }

    /// Unknown actions map to `None` so newer servers can add verbs freely.
    pub fn from_wire(action: &str) -> Option<Self> {
        match action {
            "added" => Some(PushAction::Added),
            "updated" => Some(PushAction::Updated),
            "deleted" => Some(PushAction::Deleted),
            _ => None,
        }
    }
}

/// One push frame as it travels over the websocket.
///
/// `object` is kept as raw JSON until the action is known; an ignored action
/// never has its payload inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default)]
    pub object: serde_json::Value,
}

impl PushEnvelope {
    pub fn for_story(action: PushAction, story: &Story) -> Result<Self, serde_json::Error> {
        Ok(Self {
            action: action.as_str().to_string(),
            object_type: Some(STORY_OBJECT_TYPE.to_string()),
            object: serde_json::to_value(story)?,
        })
    }
}
