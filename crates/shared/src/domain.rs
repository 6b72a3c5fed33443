use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }
    };
}

id_newtype!(StoryId);

/// A card on the board.
///
/// The derived `PartialEq` compares every field and exists for snapshot
/// assertions. Reconciliation never uses it: two values describe the same
/// story exactly when their `id`s are equal, see [`Story::same_story`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub position: i64,
    pub created: DateTime<Utc>,
}

impl Story {
    pub fn new(title: impl Into<String>, text: impl Into<String>, position: i64) -> Self {
        Self {
            id: StoryId::new_random(),
            title: title.into(),
            text: text.into(),
            position,
            created: Utc::now(),
        }
    }

    pub fn same_story(&self, other: &Story) -> bool {
        self.id == other.id
    }
}

/// Just enough of a story to address it. Delete notifications only need this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryKey {
    pub id: StoryId,
}
