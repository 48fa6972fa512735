//! Domain entities - Core business objects with identity and lifecycle

use crate::domain::errors::DomainError;
use crate::domain::value_objects::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch, informational only
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One option of a decision event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub option_id: OptionId,
    pub label: String,
    /// Successor of this option; it may not be materialized yet
    pub next_seq_id: SeqId,
    pub branch_tag: BranchTag,
}

impl DecisionOption {
    pub fn new(
        option_id: impl Into<OptionId>,
        label: impl Into<String>,
        next_seq_id: impl Into<SeqId>,
        branch_tag: impl Into<BranchTag>,
    ) -> Self {
        Self {
            option_id: option_id.into(),
            label: label.into(),
            next_seq_id: next_seq_id.into(),
            branch_tag: branch_tag.into(),
        }
    }
}

/// Immutable node of the narrative graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub seq_id: SeqId,
    pub story_id: StoryId,
    pub next_seq_id: Option<SeqId>,
    pub event_category: EventCategory,
    pub event_type: EventType,
    #[serde(default)]
    pub branch_tag: BranchTag,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<DecisionOption>,
    #[serde(default)]
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub timestamp_ms: u64,
}

/// How the walk continues after an event
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventShape<'a> {
    Linear(&'a SeqId),
    Decision(&'a [DecisionOption]),
    Terminal,
}

impl Event {
    fn base(
        story_id: &StoryId,
        seq_id: impl Into<SeqId>,
        event_type: EventType,
        branch_tag: &BranchTag,
    ) -> Self {
        let event_category = match event_type {
            EventType::StoryStart | EventType::StoryEnd => EventCategory::System,
            _ => EventCategory::Story,
        };
        Self {
            seq_id: seq_id.into(),
            story_id: story_id.clone(),
            next_seq_id: None,
            event_category,
            event_type,
            branch_tag: branch_tag.clone(),
            options: Vec::new(),
            content: serde_json::Value::Object(Default::default()),
            chapter_id: None,
            scene_id: None,
            timestamp_ms: now_millis(),
        }
    }

    /// Event with exactly one successor
    pub fn linear(
        story_id: &StoryId,
        seq_id: impl Into<SeqId>,
        event_type: EventType,
        branch_tag: &BranchTag,
        next_seq_id: impl Into<SeqId>,
    ) -> Self {
        let mut event = Self::base(story_id, seq_id, event_type, branch_tag);
        event.next_seq_id = Some(next_seq_id.into());
        event
    }

    /// Decision point; each option carries its own successor
    pub fn decision(
        story_id: &StoryId,
        seq_id: impl Into<SeqId>,
        branch_tag: &BranchTag,
        options: Vec<DecisionOption>,
    ) -> Self {
        let mut event = Self::base(story_id, seq_id, EventType::Decision, branch_tag);
        event.options = options;
        event
    }

    /// End of a path
    pub fn terminal(story_id: &StoryId, seq_id: impl Into<SeqId>, branch_tag: &BranchTag) -> Self {
        Self::base(story_id, seq_id, EventType::StoryEnd, branch_tag)
    }

    pub fn with_content(mut self, content: serde_json::Value) -> Self {
        self.content = content;
        self
    }

    pub fn with_position(mut self, chapter_id: Option<&str>, scene_id: Option<&str>) -> Self {
        self.chapter_id = chapter_id.map(str::to_string);
        self.scene_id = scene_id.map(str::to_string);
        self
    }

    pub fn shape(&self) -> EventShape<'_> {
        if self.event_type == EventType::Decision {
            return EventShape::Decision(&self.options);
        }
        match &self.next_seq_id {
            Some(next) => EventShape::Linear(next),
            None => EventShape::Terminal,
        }
    }

    pub fn is_decision(&self) -> bool {
        self.event_type == EventType::Decision
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.shape(), EventShape::Terminal)
    }

    pub fn option(&self, option_id: &OptionId) -> Option<&DecisionOption> {
        self.options.iter().find(|o| &o.option_id == option_id)
    }

    /// Every successor pointer this event owns
    pub fn successors(&self) -> Vec<&SeqId> {
        match self.shape() {
            EventShape::Linear(next) => vec![next],
            EventShape::Decision(options) => options.iter().map(|o| &o.next_seq_id).collect(),
            EventShape::Terminal => Vec::new(),
        }
    }

    /// Structural checks that do not need the rest of the graph
    pub fn validate_shape(&self) -> Result<(), DomainError> {
        if self.is_decision() {
            if self.next_seq_id.is_some() {
                return Err(DomainError::invalid_event(
                    &self.seq_id,
                    "decision events carry successors on their options only",
                ));
            }
            if self.options.is_empty() {
                return Err(DomainError::invalid_event(
                    &self.seq_id,
                    "decision event without options",
                ));
            }
            let mut ids = HashSet::new();
            let mut tags = HashSet::new();
            for option in &self.options {
                if !ids.insert(&option.option_id) {
                    return Err(DomainError::invalid_event(
                        &self.seq_id,
                        format!("duplicate option id '{}'", option.option_id),
                    ));
                }
                if !tags.insert(&option.branch_tag) {
                    return Err(DomainError::invalid_event(
                        &self.seq_id,
                        format!("duplicate branch tag '{}'", option.branch_tag),
                    ));
                }
            }
        } else if !self.options.is_empty() {
            return Err(DomainError::invalid_event(
                &self.seq_id,
                "only decision events may carry options",
            ));
        }
        if self.successors().iter().any(|s| **s == self.seq_id) {
            return Err(DomainError::invalid_event(&self.seq_id, "event points at itself"));
        }
        Ok(())
    }

    /// Asset references found in the payload
    pub fn resource_refs(&self) -> Vec<ResourceRef> {
        let mut refs = Vec::new();
        let slots: [(&str, ResourceKind); 5] = [
            ("background", ResourceKind::Image),
            ("show", ResourceKind::Image),
            ("voice", ResourceKind::Voice),
            ("audio", ResourceKind::Audio),
            ("video", ResourceKind::Video),
        ];
        for (slot, kind) in slots {
            if let Some(url) = self.content.get(slot).and_then(|v| v.get("url")).and_then(|v| v.as_str()) {
                refs.push(ResourceRef::new(kind, url));
            }
        }
        let top_level = match self.event_type {
            EventType::PlayAudio => Some(ResourceKind::Audio),
            EventType::PlayVideo => Some(ResourceKind::Video),
            _ => None,
        };
        if let Some(kind) = top_level
            && let Some(url) = self.content.get("url").and_then(|v| v.as_str())
        {
            refs.push(ResourceRef::new(kind, url));
        }
        refs
    }

    /// Duration of the attached voice line in seconds, if any
    pub fn voice_duration_secs(&self) -> Option<f64> {
        self.content
            .get("voice")
            .and_then(|v| v.get("duration"))
            .and_then(|d| d.as_f64())
    }

    /// Whether a video cue asks playback to wait for it to finish
    pub fn waits_for_media(&self) -> bool {
        self.event_type == EventType::PlayVideo
            && self
                .content
                .get("wait")
                .and_then(|w| w.as_bool())
                .unwrap_or(false)
    }
}

/// Event as kept by the store, with its derived graph position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: Event,
    /// Hops from the story start
    pub depth: u64,
    pub predecessor: Option<SeqId>,
}

/// Story flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryKind {
    Linear,
    Interactive,
}

/// Lifecycle of a story's generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    Generating,
    /// Interactive story with playable content; more is generated on demand
    Dynamic,
    Completed,
    Error,
}

impl StoryStatus {
    /// Statuses during which the client polls instead of streaming
    pub fn is_pre_stream(&self) -> bool {
        matches!(self, StoryStatus::Pending | StoryStatus::Generating)
    }
}

/// Catalog entry of a story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub title: String,
    pub kind: StoryKind,
    pub status: StoryStatus,
    pub creator: ViewerId,
    pub error_message: Option<String>,
}

impl Story {
    pub fn new(id: StoryId, title: impl Into<String>, kind: StoryKind, creator: ViewerId) -> Self {
        Self {
            id,
            title: title.into(),
            kind,
            status: StoryStatus::Pending,
            creator,
            error_message: None,
        }
    }
}

/// Furthest explored point of a version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontier {
    pub current_seq_id: SeqId,
    pub current_type: EventType,
}

/// One explored path through the decision tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchVersion {
    pub id: VersionId,
    pub story_id: StoryId,
    pub parent_id: Option<VersionId>,
    pub fork_seq_id: Option<SeqId>,
    pub option_id: Option<OptionId>,
    pub branch_tag: BranchTag,
    pub frontier: Frontier,
    pub pioneer: ViewerId,
    pub visit_count: u64,
}

impl BranchVersion {
    /// Uniqueness key `(parent, fork point, option)`; `None` for the root
    pub fn fork_key(&self) -> Option<ForkKey> {
        match (&self.parent_id, &self.fork_seq_id, &self.option_id) {
            (Some(parent), Some(fork), Some(option)) => Some(ForkKey {
                parent_id: parent.clone(),
                fork_seq_id: fork.clone(),
                option_id: option.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Uniqueness triple of a forked version
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForkKey {
    pub parent_id: VersionId,
    pub fork_seq_id: SeqId,
    pub option_id: OptionId,
}

/// One (fork point, chosen option) pair of a resolved path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkStep {
    pub version_id: VersionId,
    pub fork_seq_id: SeqId,
    pub option_id: OptionId,
}

/// Where a viewer is in a story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerProgress {
    pub viewer_id: ViewerId,
    pub story_id: StoryId,
    pub version_id: Option<VersionId>,
    pub current_seq_id: SeqId,
    pub chapter_id: Option<String>,
    pub scene_id: Option<String>,
    pub play_time_secs: u64,
    pub started_at_ms: u64,
    pub last_played_at_ms: u64,
}
