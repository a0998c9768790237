//! Warehouse directory layout.
//!
//! A warehouse root holds one subdirectory of Parquet part files per resource
//! type, a `_types.txt` side file enumerating the non-empty types, and
//! optionally `VIEWS_<name>` subdirectories for materialized views:
//!
//! ```text
//! <root>/
//!   Patient/part-00000.parquet
//!   Observation/part-00000.parquet
//!   VIEWS_patient_demographics/part-00000.parquet
//!   _types.txt
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::EtlResult;

/// Name of the side file listing non-empty resource types.
pub const TYPES_FILE: &str = "_types.txt";

/// Prefix for materialized-view subdirectories.
pub const VIEW_DIR_PREFIX: &str = "VIEWS_";

/// Handle on one warehouse root directory.
#[derive(Clone, Debug)]
pub struct DwhFiles {
    root: PathBuf,
}

impl DwhFiles {
    /// Opens a warehouse root, creating the directory if needed.
    pub fn for_root(root: impl Into<PathBuf>) -> EtlResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(DwhFiles { root })
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic output directory for a resource type.
    pub fn resource_path(&self, resource_type: &str) -> PathBuf {
        self.root.join(resource_type)
    }

    /// Deterministic output directory for a materialized view.
    pub fn view_path(&self, view_name: &str) -> PathBuf {
        self.root.join(format!("{VIEW_DIR_PREFIX}{view_name}"))
    }

    /// Part file name for a zero-based part index.
    pub fn part_file_name(index: usize) -> String {
        format!("part-{index:05}.parquet")
    }

    /// Lists the Parquet part files under a type or view directory, sorted.
    pub fn list_part_files(&self, dir: &Path) -> EtlResult<Vec<PathBuf>> {
        let mut parts = Vec::new();
        if !dir.is_dir() {
            return Ok(parts);
        }

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "parquet") {
                parts.push(path);
            }
        }
        parts.sort();
        Ok(parts)
    }

    /// Resource types that have at least one part file under this root.
    pub fn find_non_empty_resource_types(&self) -> EtlResult<BTreeSet<String>> {
        self.find_non_empty_dirs(false)
    }

    /// View names (without the directory prefix) that have at least one part
    /// file under this root.
    pub fn find_non_empty_view_types(&self) -> EtlResult<BTreeSet<String>> {
        self.find_non_empty_dirs(true)
    }

    fn find_non_empty_dirs(&self, views: bool) -> EtlResult<BTreeSet<String>> {
        let mut types = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }

            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            let is_view_dir = name.starts_with(VIEW_DIR_PREFIX);
            if is_view_dir != views {
                continue;
            }

            if !self.list_part_files(&path)?.is_empty() {
                let name = if views {
                    name.trim_start_matches(VIEW_DIR_PREFIX)
                } else {
                    name
                };
                types.insert(name.to_string());
            }
        }
        Ok(types)
    }

    /// Writes the `_types.txt` side file, one type per line.
    pub fn write_types_file(&self, types: &BTreeSet<String>) -> EtlResult<()> {
        let mut contents = types.iter().cloned().collect::<Vec<_>>().join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        fs::write(self.root.join(TYPES_FILE), contents)?;
        Ok(())
    }

    /// Reads the `_types.txt` side file; empty when absent.
    pub fn read_types_file(&self) -> EtlResult<BTreeSet<String>> {
        let path = self.root.join(TYPES_FILE);
        if !path.is_file() {
            return Ok(BTreeSet::new());
        }

        let contents = fs::read_to_string(path)?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Copies every part file of a type directory verbatim into `dest`.
    pub fn copy_resources_to(&self, dir_name: &str, dest: &DwhFiles) -> EtlResult<()> {
        let source_dir = self.root.join(dir_name);
        let dest_dir = dest.root.join(dir_name);
        fs::create_dir_all(&dest_dir)?;

        for part in self.list_part_files(&source_dir)? {
            let Some(file_name) = part.file_name() else {
                continue;
            };
            debug!(dir = %dir_name, file = ?file_name, "copying part file");
            fs::copy(&part, dest_dir.join(file_name))?;
        }
        Ok(())
    }
}
