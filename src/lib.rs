//! Fantasy Coach: league poller and lineup coach for Yahoo fantasy football
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod coach;
pub mod config;
pub mod engine;
pub mod source;
pub mod storage;
pub mod sync;
pub mod types;
