//! Skiff Core Library
//!
//! Shared types, traits, and utilities for the skiff application deployment
//! pipeline: build context assembly, value overlays, build record storage,
//! and the delegate abstractions the daemon drives.

pub mod archive;
pub mod delegates;
pub mod error;
pub mod observability;
pub mod storage;
pub mod types;
pub mod values;

// Re-export commonly used items
pub use error::{Result, SkiffError};
pub use storage::{InprocessStore, Store};
pub use types::{
    BuildRecord, BuildRequest, RecordState, RegistryConfig, Stage, StageLogs, StatusCode, Summary,
};
pub use values::{parse_set, Value, Values};
