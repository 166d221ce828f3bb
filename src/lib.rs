//! cigate - Incremental CI execution
//!
//! Fingerprint caches decide whether guarded work must run at all; process
//! groups run it under stuck detection, per-process and global timeouts,
//! and a failure threshold; resource locks serialize access to shared
//! devices across concurrent builds.

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod fslock;
pub mod jobs;
pub mod lock;
pub mod process;
pub mod ui;

pub use engine::Engine;
pub use error::{CigateError, CigateResult};
