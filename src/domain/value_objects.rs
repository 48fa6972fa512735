//! Domain value objects - Immutable identifiers and small descriptive types

use serde::{Deserialize, Serialize};

/// Macro to implement common traits for string wrapper types
macro_rules! impl_string_wrapper {
    ($type:ident) => {
        impl $type {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $type {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $type {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl std::fmt::Display for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

/// Globally unique identifier of an event in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqId(String);

impl_string_wrapper!(SeqId);

/// Identifier of a story (one event graph)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(String);

impl_string_wrapper!(StoryId);

/// Identifier of a branch version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl_string_wrapper!(VersionId);

impl VersionId {
    /// Content-addressed id of the root version of a story
    pub fn root_of(story_id: &StoryId) -> Self {
        Self(format!("{:x}", md5::compute(format!("root\u{1f}{story_id}"))))
    }

    /// Content-addressed id of the version forked at `fork_seq_id` by `option_id`
    ///
    /// Every viewer choosing the same option from the same parent computes the
    /// same id, which is what makes fork a deduplicating insert.
    pub fn forked(
        story_id: &StoryId,
        parent: &VersionId,
        fork_seq_id: &SeqId,
        option_id: &OptionId,
    ) -> Self {
        let key = format!("fork\u{1f}{story_id}\u{1f}{parent}\u{1f}{fork_seq_id}\u{1f}{option_id}");
        Self(format!("{:x}", md5::compute(key)))
    }
}

/// Identifier of a viewer (supplied by the external account system)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(String);

impl_string_wrapper!(ViewerId);

/// Identifier of one option inside a decision event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionId(String);

impl_string_wrapper!(OptionId);

/// Tag naming the branch an event belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BranchTag(String);

impl_string_wrapper!(BranchTag);

impl BranchTag {
    /// Tag carried by events before the first decision
    pub fn root() -> Self {
        Self("root0000".to_string())
    }
}

impl Default for BranchTag {
    fn default() -> Self {
        Self::root()
    }
}

/// Coarse event category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Narrative content
    Story,
    /// Control and structural markers
    System,
}

/// Type tag of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StoryStart,
    StoryEnd,
    ChapterStart,
    ChapterEnd,
    SceneStart,
    SceneEnd,
    Dialogue,
    Narration,
    PlayAudio,
    PlayVideo,
    Decision,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StoryStart => "story_start",
            EventType::StoryEnd => "story_end",
            EventType::ChapterStart => "chapter_start",
            EventType::ChapterEnd => "chapter_end",
            EventType::SceneStart => "scene_start",
            EventType::SceneEnd => "scene_end",
            EventType::Dialogue => "dialogue",
            EventType::Narration => "narration",
            EventType::PlayAudio => "play_audio",
            EventType::PlayVideo => "play_video",
            EventType::Decision => "decision",
        }
    }

    /// Narrative content the viewer has to consume before playback moves on
    pub fn is_narrative_blocking(&self) -> bool {
        matches!(
            self,
            EventType::Dialogue | EventType::Narration | EventType::Decision
        )
    }

    /// Scene and chapter boundaries
    pub fn is_structural_boundary(&self) -> bool {
        matches!(
            self,
            EventType::ChapterStart
                | EventType::ChapterEnd
                | EventType::SceneStart
                | EventType::SceneEnd
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of external asset a resource reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Image,
    Audio,
    Voice,
    Video,
}

/// Pointer from an event payload to an externally hosted asset
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub url: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }
}
