//! Watches agent sessions running in tmux, infers what each one is doing
//! from its screen, and raises one notification per real state change.

pub mod analyzer;
pub mod completion;
pub mod config;
pub mod error;
pub mod monitor;
pub mod notify;
pub mod quiet;
pub mod tmux;

#[cfg(test)]
mod testing;

pub use error::{MonitorError, Result};
