//! `sweep` — a background daemon that discovers, tracks, and continuously
//! monitors large files across one or more filesystem roots, and serves
//! queries about them over a local IPC channel.
//!
//! The binary entrypoint (`src/main.rs`) is a thin CLI wrapper; everything
//! testable lives in this library so integration tests and benchmarks can
//! exercise it directly.

pub mod broadcaster;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod indexer;
pub mod lifecycle;
pub mod model;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod tree;
pub mod utils;
pub mod watcher;
