//! Core two-warehouse merge.
//!
//! For every resource type present in both inputs, all part files are read as
//! one logical record stream, grouped by id, and the freshest record per id
//! survives; tombstoned winners are dropped. Types present in only one input
//! are copied verbatim.
//!
//! Recency uses lexicographic comparison of the `last_updated` strings, which
//! is correct only while all timestamps are UTC-normalized ISO-8601 — the
//! warehouse writer guarantees it never reformats what the source sent.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, ListArray, StringArray, StructArray, UInt32Array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};

use fhir_etl::dwh::DwhFiles;
use fhir_etl::fhir::{REMOVE_TAG_CODE, REMOVE_TAG_SYSTEM};
use fhir_etl::schema::{SchemaRegistry, ID_COLUMN, LAST_UPDATED_COLUMN, TAGS_COLUMN};

use crate::config::MergerConfig;
use crate::error::{MergerError, MergerResult};
use crate::views::load_view_dir;

/// Counters maintained across the whole merge.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeCounters {
    /// Groups that held more than one record.
    pub num_duplicates: u64,
    /// Records written to the merged warehouse.
    pub num_output_records: u64,
}

/// Summary of a complete merge run.
#[derive(Clone, Copy, Debug, Default)]
pub struct MergeSummary {
    /// Resource types merged from both inputs.
    pub resource_types_merged: usize,
    /// Resource types copied verbatim from a single input.
    pub resource_types_copied: usize,
    /// Views merged from both inputs.
    pub views_merged: usize,
    /// Views copied verbatim from a single input.
    pub views_copied: usize,
    /// Deduplication counters.
    pub counters: MergeCounters,
}

/// Merges two warehouse snapshots into a third.
pub struct Merger {
    config: MergerConfig,
    registry: Arc<SchemaRegistry>,
    dwh1: DwhFiles,
    dwh2: DwhFiles,
    merged: DwhFiles,
}

impl Merger {
    /// Opens the three warehouse roots.
    pub fn new(config: MergerConfig, registry: Arc<SchemaRegistry>) -> MergerResult<Self> {
        if config.merge_views && config.view_definitions_dir.is_none() {
            return Err(MergerError::Config(
                "view merging requires a view definitions directory".to_string(),
            ));
        }
        for (flag, path) in [("dwh1", &config.dwh1), ("dwh2", &config.dwh2)] {
            if !path.is_dir() {
                return Err(MergerError::Config(format!(
                    "--{flag} '{}' is not a directory",
                    path.display()
                )));
            }
        }

        let dwh1 = DwhFiles::for_root(&config.dwh1)?;
        let dwh2 = DwhFiles::for_root(&config.dwh2)?;
        let merged = DwhFiles::for_root(&config.merged_dwh)?;

        Ok(Merger {
            config,
            registry,
            dwh1,
            dwh2,
            merged,
        })
    }

    /// Runs the full merge.
    pub fn run(&self) -> MergerResult<MergeSummary> {
        let mut summary = MergeSummary::default();

        let types1 = self.dwh1.find_non_empty_resource_types()?;
        let types2 = self.dwh2.find_non_empty_resource_types()?;
        info!(
            dwh1_types = types1.len(),
            dwh2_types = types2.len(),
            "discovered resource types"
        );

        summary.resource_types_copied =
            self.copy_distinct(&types1, &types2, |t| t.to_string())?;

        for resource_type in types1.intersection(&types2) {
            info!(resource_type = %resource_type, "merging resource type");
            let schema = self.registry.schema_for(resource_type)?;
            let counters = self.merge_dir(resource_type, &schema, true)?;
            summary.counters.num_duplicates += counters.num_duplicates;
            summary.counters.num_output_records += counters.num_output_records;
            summary.resource_types_merged += 1;
        }

        if let (true, Some(views_dir)) = (
            self.config.merge_views,
            self.config.view_definitions_dir.as_deref(),
        ) {
            let views = load_view_dir(views_dir)?;

            let views1 = self.dwh1.find_non_empty_view_types()?;
            let views2 = self.dwh2.find_non_empty_view_types()?;

            summary.views_copied = self.copy_distinct(&views1, &views2, |name| {
                format!("{}{name}", fhir_etl::dwh::VIEW_DIR_PREFIX)
            })?;

            for view_name in views1.intersection(&views2) {
                let view = views.get(view_name).ok_or_else(|| {
                    MergerError::ViewDefinition {
                        path: views_dir.display().to_string(),
                        reason: format!("no definition for materialized view '{view_name}'"),
                    }
                })?;

                info!(view = %view_name, "merging materialized view");
                let dir_name = format!("{}{view_name}", fhir_etl::dwh::VIEW_DIR_PREFIX);
                let counters = self.merge_dir(&dir_name, &view.arrow_schema(), false)?;
                summary.counters.num_duplicates += counters.num_duplicates;
                summary.counters.num_output_records += counters.num_output_records;
                summary.views_merged += 1;
            }
        }

        let merged_types = self.merged.find_non_empty_resource_types()?;
        self.merged.write_types_file(&merged_types)?;

        info!(
            merged = summary.resource_types_merged,
            copied = summary.resource_types_copied,
            duplicates = summary.counters.num_duplicates,
            output_records = summary.counters.num_output_records,
            "merge completed"
        );
        Ok(summary)
    }

    /// Copies directories present in exactly one input; returns how many.
    fn copy_distinct(
        &self,
        names1: &BTreeSet<String>,
        names2: &BTreeSet<String>,
        dir_name: impl Fn(&str) -> String,
    ) -> MergerResult<usize> {
        let mut copied = 0;
        for name in names1.difference(names2) {
            debug!(name = %name, "copying from first input only");
            self.dwh1.copy_resources_to(&dir_name(name), &self.merged)?;
            copied += 1;
        }
        for name in names2.difference(names1) {
            debug!(name = %name, "copying from second input only");
            self.dwh2.copy_resources_to(&dir_name(name), &self.merged)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Merges one directory pair into the output, keyed on the id column.
    ///
    /// Rows are scanned first-input-first, and a later row with an equal
    /// timestamp replaces the current winner, so the second snapshot wins
    /// ties. `check_tombstones` is off for views, whose schemas carry no tag
    /// column.
    fn merge_dir(
        &self,
        dir_name: &str,
        schema: &SchemaRef,
        check_tombstones: bool,
    ) -> MergerResult<MergeCounters> {
        let mut batches = Vec::new();
        for dwh in [&self.dwh1, &self.dwh2] {
            let dir = dwh.root().join(dir_name);
            for part in dwh.list_part_files(&dir)? {
                read_part_file(&part, &mut batches)?;
            }
        }

        let combined = concat_batches(schema, &batches)?;
        drop(batches);

        let ids = string_column(&combined, dir_name, ID_COLUMN)?;
        let last_updated = combined
            .column_by_name(LAST_UPDATED_COLUMN)
            .map(|column| {
                column
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .ok_or_else(|| MergerError::MissingColumn {
                        dir: dir_name.to_string(),
                        column: LAST_UPDATED_COLUMN.to_string(),
                    })
            })
            .transpose()?;

        // Group rows by id, keeping the freshest row per group.
        let mut winners: HashMap<&str, (usize, Option<&str>, u64)> =
            HashMap::with_capacity(combined.num_rows());
        for row in 0..combined.num_rows() {
            if ids.is_null(row) {
                return Err(MergerError::NullId {
                    dir: dir_name.to_string(),
                });
            }
            let id = ids.value(row);

            let timestamp = match last_updated {
                Some(column) => {
                    if column.is_null(row) {
                        return Err(MergerError::MissingLastUpdated { id: id.to_string() });
                    }
                    Some(column.value(row))
                }
                None => None,
            };

            match winners.entry(id) {
                Entry::Vacant(entry) => {
                    entry.insert((row, timestamp, 1));
                }
                Entry::Occupied(mut entry) => {
                    let (best_row, best_ts, count) = entry.get_mut();
                    *count += 1;
                    if timestamp >= *best_ts {
                        *best_row = row;
                        *best_ts = timestamp;
                    }
                }
            }
        }

        let tags = if check_tombstones {
            combined
                .column_by_name(TAGS_COLUMN)
                .and_then(|c| c.as_any().downcast_ref::<ListArray>())
        } else {
            None
        };

        let mut counters = MergeCounters::default();
        let mut survivors: Vec<(&str, usize)> = Vec::with_capacity(winners.len());
        for (id, (row, _, count)) in &winners {
            if *count > 1 {
                counters.num_duplicates += 1;
            }
            if *count > 2 {
                warn!(id = %id, dir = %dir_name, "record repeated more than twice");
            }

            if row_is_tombstone(tags, *row) {
                debug!(id = %id, "dropping tombstoned record");
                continue;
            }
            survivors.push((id, *row));
        }
        // Deterministic output order.
        survivors.sort_unstable();
        counters.num_output_records = survivors.len() as u64;

        if survivors.is_empty() {
            debug!(dir = %dir_name, "no surviving records");
            return Ok(counters);
        }

        let indices: UInt32Array = survivors
            .iter()
            .map(|(_, row)| {
                u32::try_from(*row).map_err(|_| {
                    MergerError::Config(format!(
                        "record stream for '{dir_name}' exceeds the supported row count"
                    ))
                })
            })
            .collect::<MergerResult<Vec<u32>>>()?
            .into();

        let columns: Vec<ArrayRef> = combined
            .columns()
            .iter()
            .map(|column| take(column.as_ref(), &indices, None))
            .collect::<Result<_, _>>()?;
        let output = RecordBatch::try_new(schema.clone(), columns)?;

        self.write_merged(dir_name, schema, &output)?;
        Ok(counters)
    }

    fn write_merged(
        &self,
        dir_name: &str,
        schema: &SchemaRef,
        batch: &RecordBatch,
    ) -> MergerResult<()> {
        let dir = self.merged.root().join(dir_name);
        std::fs::create_dir_all(&dir)?;

        let mut properties = WriterProperties::builder().set_compression(Compression::SNAPPY);
        if let Some(rows) = self.config.row_group_rows {
            properties = properties.set_max_row_group_size(rows);
        }

        let path = dir.join(DwhFiles::part_file_name(0));
        let file = File::create(&path)?;
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(properties.build()))?;
        writer.write(batch)?;
        writer.close()?;

        debug!(dir = %dir_name, rows = batch.num_rows(), "wrote merged part file");
        Ok(())
    }
}

fn read_part_file(path: &Path, batches: &mut Vec<RecordBatch>) -> MergerResult<()> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    for batch in reader {
        batches.push(batch?);
    }
    Ok(())
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    dir_name: &str,
    column: &str,
) -> MergerResult<&'a StringArray> {
    batch
        .column_by_name(column)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| MergerError::MissingColumn {
            dir: dir_name.to_string(),
            column: column.to_string(),
        })
}

fn row_is_tombstone(tags: Option<&ListArray>, row: usize) -> bool {
    let Some(tags) = tags else {
        return false;
    };
    if tags.is_null(row) {
        return false;
    }

    let entries = tags.value(row);
    let Some(entries) = entries.as_any().downcast_ref::<StructArray>() else {
        return false;
    };
    let systems = entries
        .column_by_name("system")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let codes = entries
        .column_by_name("code")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let (Some(systems), Some(codes)) = (systems, codes) else {
        return false;
    };

    (0..entries.len()).any(|i| {
        !systems.is_null(i)
            && !codes.is_null(i)
            && systems.value(i) == REMOVE_TAG_SYSTEM
            && codes.value(i) == REMOVE_TAG_CODE
    })
}
