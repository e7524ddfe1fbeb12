//! Shared error helpers and small utilities used across all roost crates.

pub mod error;
pub mod time;

pub use {error::FromMessage, time::now_ms};
