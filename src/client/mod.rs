//! Playback client - Local queue, scheduling, prefetching and the session driver

pub mod buffer;
pub mod prefetch;
pub mod scheduler;
pub mod session;

pub use buffer::{ConnectionCommand, PlaybackBuffer};
pub use prefetch::{AssetFetcher, AssetStatus, FetchError, ResourcePrefetcher};
pub use scheduler::{Completion, Intake, PlaybackScheduler, PlaybackState, Step, Wait};
pub use session::{EventSource, LocalEventSource, PlaybackSession, Renderer, SessionSummary};
