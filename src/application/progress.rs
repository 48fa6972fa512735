//! Progress synchronizer - Checkpoint-driven persistence of viewer position
//!
//! Position is tracked for every played event but only written at checkpoint
//! event types, after a choice, and on exit. Anything played since the last
//! checkpoint is replayed on resume.

use crate::application::api::{ApiError, ProgressCheckpoint};
use crate::config::ProgressConfig;
use crate::domain::entities::Event;
use crate::domain::value_objects::{EventType, SeqId, StoryId, VersionId, ViewerId};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Destination of progress checkpoints
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn save_progress(&self, checkpoint: ProgressCheckpoint) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, PartialEq)]
struct Position {
    seq_id: SeqId,
    version_id: Option<VersionId>,
    chapter_id: Option<String>,
    scene_id: Option<String>,
}

pub struct ProgressSynchronizer {
    sink: Arc<dyn ProgressSink>,
    story_id: StoryId,
    viewer_id: ViewerId,
    checkpoint_types: HashSet<EventType>,
    position: Option<Position>,
    last_saved: Option<Position>,
    version_id: Option<VersionId>,
    play_time_base: u64,
    started: Instant,
}

impl ProgressSynchronizer {
    pub fn new(
        sink: Arc<dyn ProgressSink>,
        story_id: StoryId,
        viewer_id: ViewerId,
        config: &ProgressConfig,
    ) -> Self {
        Self {
            sink,
            story_id,
            viewer_id,
            checkpoint_types: config.checkpoint_types.iter().copied().collect(),
            position: None,
            last_saved: None,
            version_id: None,
            play_time_base: 0,
            started: Instant::now(),
        }
    }

    /// Continue counting from a previously saved play time
    pub fn with_play_time(mut self, secs: u64) -> Self {
        self.play_time_base = secs;
        self
    }

    pub fn with_version(mut self, version_id: Option<VersionId>) -> Self {
        self.version_id = version_id;
        self
    }

    pub fn play_time_secs(&self) -> u64 {
        self.play_time_base + self.started.elapsed().as_secs()
    }

    pub fn version_id(&self) -> Option<&VersionId> {
        self.version_id.as_ref()
    }

    pub fn is_checkpoint(&self, event_type: EventType) -> bool {
        self.checkpoint_types.contains(&event_type)
    }

    /// Track a played event; returns whether it is a checkpoint
    pub fn observe(&mut self, event: &Event) -> bool {
        let (chapter_id, scene_id) = match &self.position {
            Some(previous) => (
                event.chapter_id.clone().or_else(|| previous.chapter_id.clone()),
                event.scene_id.clone().or_else(|| previous.scene_id.clone()),
            ),
            None => (event.chapter_id.clone(), event.scene_id.clone()),
        };
        self.position = Some(Position {
            seq_id: event.seq_id.clone(),
            version_id: self.version_id.clone(),
            chapter_id,
            scene_id,
        });
        self.is_checkpoint(event.event_type)
    }

    /// Track a played event and write it if it is a checkpoint
    pub async fn on_played(&mut self, event: &Event) -> Result<bool, ApiError> {
        if self.observe(event) {
            return self.flush().await;
        }
        Ok(false)
    }

    /// A decision was resolved onto `version_id`
    pub async fn on_choice(&mut self, version_id: VersionId) -> Result<bool, ApiError> {
        self.version_id = Some(version_id);
        if let Some(position) = &mut self.position {
            position.version_id = self.version_id.clone();
        }
        self.flush().await
    }

    /// Checkpoint for the current position
    pub fn checkpoint(&self) -> Option<ProgressCheckpoint> {
        let position = self.position.as_ref()?;
        Some(ProgressCheckpoint {
            story_id: self.story_id.clone(),
            viewer_id: self.viewer_id.clone(),
            seq_id: position.seq_id.clone(),
            version_id: position.version_id.clone(),
            chapter_id: position.chapter_id.clone(),
            scene_id: position.scene_id.clone(),
            play_time_secs: Some(self.play_time_secs()),
        })
    }

    /// Write the current position unless it is already saved
    pub async fn flush(&mut self) -> Result<bool, ApiError> {
        if self.position == self.last_saved {
            return Ok(false);
        }
        let Some(checkpoint) = self.checkpoint() else {
            return Ok(false);
        };
        debug!("Saving progress of '{}' at '{}'", self.viewer_id, checkpoint.seq_id);
        self.sink.save_progress(checkpoint).await?;
        self.last_saved = self.position.clone();
        Ok(true)
    }

    /// Best-effort write for disconnects; failures are only logged
    pub fn flush_detached(&mut self) -> Option<JoinHandle<()>> {
        if self.position == self.last_saved {
            return None;
        }
        let checkpoint = self.checkpoint()?;
        self.last_saved = self.position.clone();
        let sink = self.sink.clone();
        Some(tokio::spawn(async move {
            let seq_id = checkpoint.seq_id.clone();
            if let Err(e) = sink.save_progress(checkpoint).await {
                warn!("Dropped progress checkpoint at '{seq_id}': {e}");
            }
        }))
    }
}
