//! Event store - Append and point-lookup access to the narrative graph

use crate::domain::entities::{Event, StoredEvent};
use crate::domain::errors::{DomainError, RecordKind};
use crate::domain::repositories::{EventRepository, RepositoryError};
use crate::domain::value_objects::{SeqId, StoryId};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per story; graph mutation holds it
#[derive(Default)]
pub struct StoryLocks {
    locks: Mutex<HashMap<StoryId, Arc<Mutex<()>>>>,
}

impl StoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, story_id: &StoryId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(story_id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn forget(&self, story_id: &StoryId) {
        self.locks.lock().await.remove(story_id);
    }
}

/// Durable directed graph of narrative events
///
/// Appends are validated against the graph shape: every event is reached by
/// exactly one pointer, except the first event of a story which becomes its
/// start. Reads are point lookups.
pub struct EventStore {
    repository: Arc<dyn EventRepository>,
    locks: Arc<StoryLocks>,
}

impl EventStore {
    pub fn new(repository: Arc<dyn EventRepository>, locks: Arc<StoryLocks>) -> Self {
        Self { repository, locks }
    }

    pub fn locks(&self) -> &Arc<StoryLocks> {
        &self.locks
    }

    pub async fn append(&self, event: Event) -> Result<StoredEvent, DomainError> {
        event.validate_shape()?;
        let _guard = self.locks.acquire(&event.story_id).await;
        self.append_locked(event).await
    }

    /// Append the ordered output of one generation run, stopping at the first failure
    pub async fn append_all(&self, events: Vec<Event>) -> Result<usize, DomainError> {
        let Some(story_id) = events.first().map(|e| e.story_id.clone()) else {
            return Ok(0);
        };
        for event in &events {
            event.validate_shape()?;
        }
        let _guard = self.locks.acquire(&story_id).await;
        let mut appended = 0;
        for event in events {
            self.append_locked(event).await?;
            appended += 1;
        }
        Ok(appended)
    }

    async fn append_locked(&self, event: Event) -> Result<StoredEvent, DomainError> {
        if self.repository.get(&event.seq_id).await?.is_some() {
            return Err(DomainError::DuplicateSeqId {
                seq_id: event.seq_id.clone(),
            });
        }

        let (depth, predecessor) = match self.repository.pointer_owner(&event.seq_id).await? {
            Some(owner) => {
                let parent = self.require(&owner).await?;
                if parent.event.story_id != event.story_id {
                    return Err(DomainError::invalid_event(
                        &event.seq_id,
                        format!("reached from '{}' of another story", owner),
                    ));
                }
                (parent.depth + 1, Some(owner))
            }
            None => {
                if let Some(start) = self.repository.start_of(&event.story_id).await? {
                    return Err(DomainError::invalid_event(
                        &event.seq_id,
                        format!("orphan event: story already starts at '{start}'"),
                    ));
                }
                (0, None)
            }
        };

        for target in event.successors() {
            if let Some(owner) = self.repository.pointer_owner(target).await? {
                return Err(DomainError::invalid_event(
                    &event.seq_id,
                    format!("successor '{target}' is already reached from '{owner}'"),
                ));
            }
            if self.repository.get(target).await?.is_some() {
                return Err(DomainError::invalid_event(
                    &event.seq_id,
                    format!("successor '{target}' already exists"),
                ));
            }
        }

        let stored = StoredEvent {
            event,
            depth,
            predecessor,
        };
        self.repository
            .insert(stored.clone())
            .await
            .map_err(|e| match e {
                RepositoryError::Conflict { .. } => DomainError::DuplicateSeqId {
                    seq_id: stored.event.seq_id.clone(),
                },
                other => other.into(),
            })?;
        debug!(
            "Appended {} '{}' to story '{}' at depth {}",
            stored.event.event_type, stored.event.seq_id, stored.event.story_id, stored.depth
        );
        Ok(stored)
    }

    pub async fn get(&self, seq_id: &SeqId) -> Result<Event, DomainError> {
        Ok(self.require(seq_id).await?.event)
    }

    /// Stored event, or `None` when it has not been materialized
    pub async fn find(&self, seq_id: &SeqId) -> Result<Option<StoredEvent>, DomainError> {
        Ok(self.repository.get(seq_id).await?)
    }

    pub async fn contains(&self, seq_id: &SeqId) -> Result<bool, DomainError> {
        Ok(self.repository.get(seq_id).await?.is_some())
    }

    async fn require(&self, seq_id: &SeqId) -> Result<StoredEvent, DomainError> {
        self.repository
            .get(seq_id)
            .await?
            .ok_or_else(|| DomainError::not_found(RecordKind::Event, seq_id))
    }

    /// The unique event of the story with no predecessor
    pub async fn get_start(&self, story_id: &StoryId) -> Result<Event, DomainError> {
        let start = self
            .repository
            .start_of(story_id)
            .await?
            .ok_or_else(|| DomainError::not_found(RecordKind::Story, story_id))?;
        self.get(&start).await
    }

    pub async fn predecessor(&self, seq_id: &SeqId) -> Result<Option<SeqId>, DomainError> {
        Ok(self.require(seq_id).await?.predecessor)
    }

    /// Event owning the pointer to `target`, materialized or not
    pub async fn pointer_owner(&self, target: &SeqId) -> Result<Option<SeqId>, DomainError> {
        Ok(self.repository.pointer_owner(target).await?)
    }

    /// Whether `candidate` lies strictly after `current` on a path from the start
    pub async fn is_ahead(&self, current: &SeqId, candidate: &SeqId) -> Result<bool, DomainError> {
        let current = self.require(current).await?;
        let mut walker = self.require(candidate).await?;
        if walker.event.story_id != current.event.story_id || walker.depth <= current.depth {
            return Ok(false);
        }
        while walker.depth > current.depth {
            let Some(previous) = walker.predecessor.clone() else {
                return Ok(false);
            };
            walker = self.require(&previous).await?;
        }
        Ok(walker.event.seq_id == current.event.seq_id)
    }

    /// Every materialized event of a story in walk order
    pub async fn export(&self, story_id: &StoryId) -> Result<Vec<Event>, DomainError> {
        let start = self.get_start(story_id).await?;
        let mut events = Vec::new();
        let mut stack = vec![start.seq_id];
        while let Some(seq_id) = stack.pop() {
            let Some(stored) = self.repository.get(&seq_id).await? else {
                continue;
            };
            // Reverse so the first option's branch comes out first.
            for next in stored.event.successors().into_iter().rev() {
                stack.push(next.clone());
            }
            events.push(stored.event);
        }
        Ok(events)
    }

    /// Drop the whole story graph
    pub async fn remove_story(&self, story_id: &StoryId) -> Result<usize, DomainError> {
        let removed = {
            let _guard = self.locks.acquire(story_id).await;
            self.repository.remove_story(story_id).await?
        };
        self.locks.forget(story_id).await;
        debug!("Removed {removed} events of story '{story_id}'");
        Ok(removed)
    }
}
