//! Application layer - Use cases and orchestration
//!
//! This layer drives the story graph: materializing events, tracking branch
//! versions, and pushing events to connected viewers.

pub mod api;
pub mod dispatcher;
pub mod generation;
pub mod graph;
pub mod progress;
pub mod service;
pub mod versions;

pub use dispatcher::{ChoiceHandle, PendingDecision, StreamConnection, StreamDispatcher};
pub use generation::{
    GenerationRequest, MaterializationGate, NarrativeGenerator, ProceduralGenerator, ScriptedGenerator,
};
pub use graph::{EventStore, StoryLocks};
pub use progress::{ProgressSink, ProgressSynchronizer};
pub use service::{Repositories, StoryService};
pub use versions::BranchVersionManager;
