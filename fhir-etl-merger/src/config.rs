//! Configuration for the merge process.

use std::path::PathBuf;

/// Configuration for one merge run.
#[derive(Debug, Clone)]
pub struct MergerConfig {
    /// First input warehouse root (the older snapshot).
    pub dwh1: PathBuf,

    /// Second input warehouse root; wins ties on equal `lastUpdated`.
    pub dwh2: PathBuf,

    /// Output warehouse root.
    pub merged_dwh: PathBuf,

    /// Maximum rows per Parquet row group in the merged output; `None`
    /// keeps the writer default.
    pub row_group_rows: Option<usize>,

    /// Also merge materialized view directories.
    pub merge_views: bool,

    /// Directory of view definition documents; required with `merge_views`.
    pub view_definitions_dir: Option<PathBuf>,
}

impl MergerConfig {
    /// Creates a configuration for the given roots.
    pub fn new(
        dwh1: impl Into<PathBuf>,
        dwh2: impl Into<PathBuf>,
        merged_dwh: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dwh1: dwh1.into(),
            dwh2: dwh2.into(),
            merged_dwh: merged_dwh.into(),
            row_group_rows: None,
            merge_views: false,
            view_definitions_dir: None,
        }
    }

    /// Sets the output row-group row cap.
    pub fn with_row_group_rows(mut self, rows: Option<usize>) -> Self {
        self.row_group_rows = rows;
        self
    }

    /// Enables view merging with the given definitions directory.
    pub fn with_views(mut self, view_definitions_dir: PathBuf) -> Self {
        self.merge_views = true;
        self.view_definitions_dir = Some(view_definitions_dir);
        self
    }
}
