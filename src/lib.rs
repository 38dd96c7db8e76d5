//! AI Jobs: background AI job lifecycle with poll and push sync.

pub mod config;
pub mod error;
pub mod jobs;
pub mod llm;
pub mod notifier;
pub mod store;
pub mod sync;
