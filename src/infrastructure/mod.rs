//! Infrastructure layer - External dependencies and adapters
//!
//! This layer contains implementations that deal with external concerns
//! like storage backends, asset sources and the wire format.

pub mod fetchers;
pub mod repositories;
pub mod sse;

pub use fetchers::*;
pub use repositories::*;
pub use sse::*;
