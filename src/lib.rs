//! Background write-back of photo metadata edits.
//!
//! Edits are logged as pending operations, reduced to their minimal effective
//! set after a debounce window, and written into image files with `exiftool`
//! by a polling job scheduler. Hydrated image aggregates are served from a
//! read-through cache that every mutation path evicts.

pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod scanner;
pub mod tasks;

pub use cache::{CacheStats, ImageCache, ImageStore};
pub use config::Config;
pub use db::Database;
pub use metadata::{FieldKind, FieldValue, MetadataService, OperationState, OperationType};
pub use pipeline::Pipeline;
pub use tasks::{Job, JobPriority, JobScheduler, JobSource};
