//! Data models for meetings, participants and votings.
//!
//! Field names serialize in camelCase to match the web client.

mod meeting;
mod voting;

pub use meeting::*;
pub use voting::*;
