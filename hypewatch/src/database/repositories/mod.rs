//! Repository layer for data access.

pub mod hype_event;

pub use hype_event::{HypeEventRepository, SqlxHypeEventRepository};
