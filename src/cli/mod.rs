//! Console front end

pub mod play;
pub mod serve;
pub mod view_state;
