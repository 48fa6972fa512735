//! Domain layer - Event graph, versions and progress
//!
//! This layer contains the graph rules, independent of storage, transport
//! or the playback client.

pub mod entities;
pub mod errors;
pub mod repositories;
pub mod services;
pub mod value_objects;

pub use entities::*;
pub use errors::*;
pub use repositories::*;
pub use services::*;
pub use value_objects::*;
