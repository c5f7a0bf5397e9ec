//! REST and WebSocket API.
//!
//! Provides HTTP endpoints for managing monitored channels, reading live metrics and
//! stored hype events, and WebSocket streams of both.

pub mod error;
pub mod routes;
pub mod server;

pub use server::{ApiServer, ApiServerConfig, AppState};
