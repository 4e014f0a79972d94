//! Single-worker job queue for procedural map generation.

pub mod config;
pub mod error;
pub mod generator;
pub mod id;
pub mod logging;
pub mod runner;
pub mod server;
pub mod store;
pub mod task;
