//! Domain repository traits - Abstractions for graph, version and progress persistence
//!
//! Logical layout:
//! - events keyed by `seq_id` (unique), plus a pointer index `successor -> owner`
//! - versions keyed by id, unique over `(parent_version, fork_seq_id, option_id)`
//! - progress keyed by `(viewer, story)`

use crate::domain::entities::{BranchVersion, ForkKey, Frontier, Story, StoredEvent, ViewerProgress, StoryStatus};
use crate::domain::errors::DomainError;
use crate::domain::value_objects::{SeqId, StoryId, VersionId, ViewerId};
use async_trait::async_trait;

/// Storage of the event graph
///
/// Every read is a point lookup; nothing here scans or sorts a story.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert an event and register its successor pointers.
    /// Fails with `Conflict` when the `seq_id` is taken.
    async fn insert(&self, stored: StoredEvent) -> Result<(), RepositoryError>;

    async fn get(&self, seq_id: &SeqId) -> Result<Option<StoredEvent>, RepositoryError>;

    /// Event that owns a pointer to `target`, whether or not `target` exists yet
    async fn pointer_owner(&self, target: &SeqId) -> Result<Option<SeqId>, RepositoryError>;

    /// Start event of a story (the one without predecessor)
    async fn start_of(&self, story_id: &StoryId) -> Result<Option<SeqId>, RepositoryError>;

    /// Delete the whole story graph, returning how many events were dropped
    async fn remove_story(&self, story_id: &StoryId) -> Result<usize, RepositoryError>;
}

/// Storage of branch versions
#[async_trait]
pub trait VersionRepository: Send + Sync {
    async fn get(&self, id: &VersionId) -> Result<Option<BranchVersion>, RepositoryError>;

    async fn find_by_key(&self, key: &ForkKey) -> Result<Option<BranchVersion>, RepositoryError>;

    async fn root_of(&self, story_id: &StoryId) -> Result<Option<BranchVersion>, RepositoryError>;

    /// Deduplicating insert: returns the stored version and whether it was created.
    /// When the uniqueness key (fork triple, or story for roots) is taken the
    /// existing version is returned untouched.
    async fn insert_unique(
        &self,
        version: BranchVersion,
    ) -> Result<(BranchVersion, bool), RepositoryError>;

    /// Replace the frontier only if it still points at `expected`
    async fn compare_and_set_frontier(
        &self,
        id: &VersionId,
        expected: &SeqId,
        frontier: Frontier,
    ) -> Result<bool, RepositoryError>;

    async fn increment_visits(&self, id: &VersionId) -> Result<u64, RepositoryError>;

    async fn list_for_story(&self, story_id: &StoryId) -> Result<Vec<BranchVersion>, RepositoryError>;

    async fn remove_story(&self, story_id: &StoryId) -> Result<usize, RepositoryError>;
}

/// Storage of per-viewer progress
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    async fn upsert(&self, progress: &ViewerProgress) -> Result<(), RepositoryError>;

    async fn get(
        &self,
        viewer_id: &ViewerId,
        story_id: &StoryId,
    ) -> Result<Option<ViewerProgress>, RepositoryError>;

    async fn delete(&self, viewer_id: &ViewerId, story_id: &StoryId) -> Result<bool, RepositoryError>;
}

/// Story catalog
#[async_trait]
pub trait StoryRepository: Send + Sync {
    async fn insert(&self, story: Story) -> Result<(), RepositoryError>;

    async fn get(&self, id: &StoryId) -> Result<Option<Story>, RepositoryError>;

    async fn update_status(
        &self,
        id: &StoryId,
        status: StoryStatus,
        error_message: Option<String>,
    ) -> Result<(), RepositoryError>;

    async fn remove(&self, id: &StoryId) -> Result<bool, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Key already exists: {key}")]
    Conflict { key: String },

    #[error("Record missing: {key}")]
    Missing { key: String },

    #[error("IO error: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    #[error("Repository unavailable: {reason}")]
    Unavailable { reason: String },
}

impl RepositoryError {
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::IoError {
            message: message.into(),
            source: Some(source),
        }
    }
}

impl From<RepositoryError> for DomainError {
    fn from(error: RepositoryError) -> Self {
        DomainError::Storage {
            reason: error.to_string(),
        }
    }
}
