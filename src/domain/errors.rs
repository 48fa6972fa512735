//! Domain errors - Graph and versioning rule violations

use crate::domain::value_objects::{OptionId, SeqId, StoryId};
use thiserror::Error;

/// What kind of record a lookup missed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Event,
    Version,
    Story,
    Progress,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordKind::Event => "event",
            RecordKind::Version => "version",
            RecordKind::Story => "story",
            RecordKind::Progress => "progress",
        };
        f.write_str(name)
    }
}

/// Domain-specific errors that represent graph rule violations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: RecordKind, id: String },

    #[error("Duplicate seq_id '{seq_id}'")]
    DuplicateSeqId { seq_id: SeqId },

    #[error("Cannot fork at '{fork_seq_id}' with option '{option_id}': {reason}")]
    InvalidFork {
        fork_seq_id: SeqId,
        option_id: OptionId,
        reason: String,
    },

    #[error("Invalid event '{seq_id}': {reason}")]
    InvalidEvent { seq_id: SeqId, reason: String },

    #[error("Invalid choice: {reason}")]
    InvalidChoice { reason: String },

    #[error("Generation failed for story '{story_id}' at '{seq_id}': {message}")]
    GenerationFailure {
        story_id: StoryId,
        seq_id: SeqId,
        message: String,
    },

    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

impl DomainError {
    pub fn not_found(kind: RecordKind, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_event(seq_id: &SeqId, reason: impl Into<String>) -> Self {
        Self::InvalidEvent {
            seq_id: seq_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_fork(fork_seq_id: &SeqId, option_id: &OptionId, reason: impl Into<String>) -> Self {
        Self::InvalidFork {
            fork_seq_id: fork_seq_id.clone(),
            option_id: option_id.clone(),
            reason: reason.into(),
        }
    }

    pub fn invalid_choice(reason: impl Into<String>) -> Self {
        Self::InvalidChoice {
            reason: reason.into(),
        }
    }

    pub fn generation_failure(story_id: &StoryId, seq_id: &SeqId, message: impl Into<String>) -> Self {
        Self::GenerationFailure {
            story_id: story_id.clone(),
            seq_id: seq_id.clone(),
            message: message.into(),
        }
    }

    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    /// Errors that end the current traversal instead of being retried
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DomainError::GenerationFailure { .. } | DomainError::ConnectionLost { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DomainError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_record() {
        let err = DomainError::not_found(RecordKind::Event, "E7");
        assert_eq!(err.to_string(), "event 'E7' not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn retryable_errors_are_not_fatal() {
        let story = StoryId::from("s");
        let seq = SeqId::from("E4");
        assert!(!DomainError::generation_failure(&story, &seq, "timeout").is_fatal());
        assert!(!DomainError::connection_lost("reset").is_fatal());
        assert!(DomainError::DuplicateSeqId { seq_id: seq.clone() }.is_fatal());
        assert!(DomainError::invalid_fork(&seq, &OptionId::from("x"), "not a decision").is_fatal());
    }
}
