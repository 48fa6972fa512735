//! # storyweave
//!
//! A branching-narrative streaming engine. Stories are append-only graphs of
//! events; viewers walk them over a push stream, decisions fork per-viewer
//! branch versions, and missing branches are generated on demand. The client
//! side schedules playback, filters branches, prefetches assets and keeps
//! progress checkpoints.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use storyweave::application::api::ConnectRequest;
//! use storyweave::application::{ScriptedGenerator, StoryService};
//! use storyweave::config::StreamConfig;
//! use storyweave::domain::{BranchTag, DecisionOption, Event, EventType, Story, StoryId, StoryKind, ViewerId};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = StoryService::in_memory(Arc::new(ScriptedGenerator::new()), StreamConfig::default());
//! let id = StoryId::from("rain");
//! let root = BranchTag::root();
//! service
//!     .import_story(
//!         Story::new(id.clone(), "Rain", StoryKind::Interactive, ViewerId::from("author")),
//!         vec![
//!             Event::linear(&id, "E1", EventType::StoryStart, &root, "E2"),
//!             Event::decision(&id, "E2", &root, vec![DecisionOption::new("stay", "Stay", "E3", "a")]),
//!             Event::terminal(&id, "E3", &BranchTag::from("a")),
//!         ],
//!     )
//!     .await?;
//!
//! let mut stream = service.connect(ConnectRequest::new(id, ViewerId::from("v1"))).await?;
//! while let Some(frame) = stream.next_frame().await {
//!     if let Some(event) = frame.as_event() {
//!         println!("{} {}", event.seq_id, event.event_type);
//!         if event.is_decision() {
//!             let version = stream.choices().submit("stay".into()).await?;
//!             println!("now on version {version}");
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For a full viewer, drive a [`client::PlaybackSession`] with a
//! [`client::Renderer`] of your own.

pub mod application;
pub mod cli;
pub mod client;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod server;
pub mod storage;

pub use application::api::{ApiError, ChoiceAck, ConnectRequest, StatusReport, StreamFrame, SystemEvent};
pub use application::service::StoryService;
pub use config::AppConfig;
pub use domain::errors::DomainError;
pub use storage::{StoryGraph, load, save};
