//! Public API types - Wire contracts between the server and playback clients
//!
//! These types form the stable contract and should be changed with care.

use crate::domain::entities::{Event, StoryStatus};
use crate::domain::errors::{DomainError, RecordKind};
use crate::domain::value_objects::{OptionId, SeqId, StoryId, VersionId, ViewerId};
use serde::{Deserialize, Serialize};

/// Control payload of a `system_event` frame
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// Keep-alive while the server is suspended
    Heartbeat { server_time: u64 },
    /// Something went wrong; `retry_after` is 0 when the stream is ending
    Error {
        error_code: String,
        message: String,
        retry_after: u64,
    },
    /// The next decision was already taken on the viewer's version
    ChoiceRecorded { seq_id: SeqId, option_id: OptionId },
}

/// One frame of the push stream
#[derive(Clone, Debug, PartialEq)]
pub enum StreamFrame {
    Story(Event),
    System(SystemEvent),
}

impl StreamFrame {
    pub fn heartbeat(server_time: u64) -> Self {
        Self::System(SystemEvent::Heartbeat { server_time })
    }

    pub fn error(error_code: impl Into<String>, message: impl Into<String>, retry_after: u64) -> Self {
        Self::System(SystemEvent::Error {
            error_code: error_code.into(),
            message: message.into(),
            retry_after,
        })
    }

    pub fn choice_recorded(seq_id: &SeqId, option_id: &OptionId) -> Self {
        Self::System(SystemEvent::ChoiceRecorded {
            seq_id: seq_id.clone(),
            option_id: option_id.clone(),
        })
    }

    /// Error frame for a domain failure
    pub fn from_domain_error(error: &DomainError, retry_after: u64) -> Self {
        Self::error(error_code(error), error.to_string(), retry_after)
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            StreamFrame::Story(event) => Some(event),
            StreamFrame::System(_) => None,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, StreamFrame::System(SystemEvent::Heartbeat { .. }))
    }
}

/// Stable error code carried in error frames
pub fn error_code(error: &DomainError) -> &'static str {
    match error {
        DomainError::NotFound { .. } => "NOT_FOUND",
        DomainError::DuplicateSeqId { .. } => "DUPLICATE_SEQ_ID",
        DomainError::InvalidFork { .. } => "INVALID_FORK",
        DomainError::InvalidEvent { .. } => "INVALID_EVENT",
        DomainError::InvalidChoice { .. } => "INVALID_CHOICE",
        DomainError::GenerationFailure { .. } => "GENERATION_FAILED",
        DomainError::ConnectionLost { .. } => "CONNECTION_LOST",
        DomainError::Storage { .. } => "STORAGE_ERROR",
    }
}

/// Parameters of a push stream connection
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectRequest {
    pub story_id: StoryId,
    pub viewer_id: ViewerId,
    /// Replay from exactly this event instead of the story start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_seq_id: Option<SeqId>,
    /// Branch version the viewer was on when it last disconnected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
}

impl ConnectRequest {
    pub fn new(story_id: StoryId, viewer_id: ViewerId) -> Self {
        Self {
            story_id,
            viewer_id,
            from_seq_id: None,
            version_id: None,
        }
    }

    pub fn resume_from(mut self, seq_id: SeqId, version_id: Option<VersionId>) -> Self {
        self.from_seq_id = Some(seq_id);
        self.version_id = version_id;
        self
    }
}

/// Out-of-band choice for the most recent decision
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChoiceSubmission {
    pub story_id: StoryId,
    pub viewer_id: ViewerId,
    pub option_id: OptionId,
}

/// Acknowledgement of an accepted choice
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChoiceAck {
    pub story_id: StoryId,
    pub option_id: OptionId,
    /// Version the viewer continues on
    pub version_id: VersionId,
}

/// Viewer position reported by the client
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProgressCheckpoint {
    pub story_id: StoryId,
    pub viewer_id: ViewerId,
    pub seq_id: SeqId,
    pub version_id: Option<VersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub play_time_secs: Option<u64>,
}

/// Answer to a status poll
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusReport {
    pub status: StoryStatus,
    /// Rough completion of the pre-stream phase, 0.0 to 1.0
    pub progress: f32,
    pub message: Option<String>,
    /// Suggested poll delay while the story is not streamable yet
    pub retry_after_secs: Option<u64>,
}

impl StatusReport {
    /// Whether the consumer should switch to the push stream
    pub fn is_streamable(&self) -> bool {
        matches!(self.status, StoryStatus::Dynamic | StoryStatus::Completed)
    }
}

/// Error types returned by the public API
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// Unknown story, version, event or progress row
    #[error("not found: {0}")]
    NotFound(String),
    /// Request rejected as malformed or out of place
    #[error("invalid request: {0}")]
    Invalid(String),
    /// The story cannot be streamed yet
    #[error("not ready: {message}")]
    NotReady {
        message: String,
        retry_after_secs: u64,
    },
    /// Transport or session failure, recovered by reconnecting
    #[error("connection error: {0}")]
    Connection(String),
    /// Storage or generation failure on the server
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<DomainError> for ApiError {
    fn from(error: DomainError) -> Self {
        match &error {
            DomainError::NotFound { .. } => ApiError::NotFound(error.to_string()),
            DomainError::DuplicateSeqId { .. }
            | DomainError::InvalidFork { .. }
            | DomainError::InvalidEvent { .. }
            | DomainError::InvalidChoice { .. } => ApiError::Invalid(error.to_string()),
            DomainError::ConnectionLost { .. } => ApiError::Connection(error.to_string()),
            DomainError::GenerationFailure { .. } | DomainError::Storage { .. } => {
                ApiError::Internal(error.to_string())
            }
        }
    }
}

impl ApiError {
    pub fn story_not_found(story_id: &StoryId) -> Self {
        DomainError::not_found(RecordKind::Story, story_id).into()
    }
}
