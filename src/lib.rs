//! mmWave presence relay library.
//!
//! Bridges one upstream mmWave sensor feed to any number of WebSocket
//! viewers through a shared, continuously overwritten state snapshot.

pub mod config;
pub mod error;
pub mod input;
pub mod relay;
pub mod sensors;
pub mod server;
