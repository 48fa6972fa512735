//! Storage module for saving and loading story graphs
//!
//! A graph file holds the story's catalog entry and every materialized event.
//! Loading validates the structure; pointers to events that are not in the
//! file are allowed and become generation requests when played.

use crate::application::api::ApiError;
use crate::application::service::StoryService;
use crate::domain::entities::{Event, Story, StoryKind};
use crate::domain::errors::DomainError;
use crate::domain::services::{GraphReport, GraphValidator};
use crate::domain::value_objects::{StoryId, ViewerId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed story graph: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Invalid story graph: {0}")]
    Invalid(#[from] DomainError),
}

/// On-disk form of a story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryGraph {
    pub story_id: StoryId,
    pub title: String,
    pub kind: StoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<ViewerId>,
    pub events: Vec<Event>,
}

impl StoryGraph {
    /// Catalog entry to register the graph under
    pub fn story(&self) -> Story {
        let creator = self.creator.clone().unwrap_or_else(|| ViewerId::from("author"));
        Story::new(self.story_id.clone(), self.title.clone(), self.kind, creator)
    }

    /// Structural check of the events against the header
    pub fn validate(&self) -> Result<GraphReport, DomainError> {
        let report = GraphValidator::new().validate(&self.events)?;
        if report.story_id != self.story_id {
            return Err(DomainError::invalid_event(
                &report.start,
                format!("graph events belong to '{}', header says '{}'", report.story_id, self.story_id),
            ));
        }
        Ok(report)
    }
}

/// Serialize a graph to JSON bytes
pub fn save(graph: &StoryGraph) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_string_pretty(graph)?;
    Ok(json.into_bytes())
}

/// Deserialize and validate a graph
pub fn load(bytes: &[u8]) -> Result<(StoryGraph, GraphReport), StorageError> {
    let graph: StoryGraph = serde_json::from_slice(bytes)?;
    let report = graph.validate()?;
    Ok((graph, report))
}

pub async fn read_graph(path: impl AsRef<Path>) -> Result<(StoryGraph, GraphReport), StorageError> {
    let path = path.as_ref();
    let bytes = tokio::fs::read(path).await.map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load(&bytes)
}

pub async fn write_graph(path: impl AsRef<Path>, graph: &StoryGraph) -> Result<(), StorageError> {
    let path = path.as_ref();
    let io = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(io)?;
    }
    tokio::fs::write(path, save(graph)?).await.map_err(io)
}

/// Everything the service has materialized for a story so far
pub async fn snapshot(service: &StoryService, story_id: &StoryId) -> Result<StoryGraph, ApiError> {
    let story = service.story(story_id).await?;
    let events = service.export_story(story_id).await?;
    Ok(StoryGraph {
        story_id: story.id,
        title: story.title,
        kind: story.kind,
        creator: Some(story.creator),
        events,
    })
}
