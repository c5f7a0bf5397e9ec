//! hypewatch library crate.
//!
//! Live chat velocity metrics and hype detection for Twitch channels, exposed over a
//! REST and WebSocket API.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod services;

pub use error::{Error, Result};
