//! Two-warehouse merge with per-id deduplication.

pub mod config;
pub mod error;
pub mod merger;
pub mod views;

pub use config::MergerConfig;
pub use error::{MergerError, MergerResult};
pub use merger::{MergeCounters, MergeSummary, Merger};
