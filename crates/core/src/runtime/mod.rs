//! Track cursors and the two-level scheduler built on them.

pub mod scheduler;
pub mod track;

pub use scheduler::{Candidate, Scheduler};
pub use track::{GlobalTrack, ModeTrack};
