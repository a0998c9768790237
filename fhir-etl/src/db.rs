//! Direct extraction from the record server's relational store.
//!
//! Scales beyond the FHIR search API by reading resource uuids straight from
//! the backing tables: resolve the table for each requested resource type
//! from a JSON mapping, split each table's integer-id space into equal-width
//! ranges, and resolve each range to the uuids the FHIR API is then queried
//! with (`_id=a,b,c`).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use fhir_etl_config::shared::DbConfig;
use serde::Deserialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{ErrorKind, EtlResult};
use crate::segment::{chunk_into_batches, create_id_ranges, IdBatch};
use crate::{bail, etl_error};

/// One entry of the table-to-resource mapping file.
///
/// `linked_tables` names tables that must be extracted whenever this entry's
/// resource type is requested (the encounter table pulls in its visit table).
#[derive(Clone, Debug, Deserialize)]
pub struct TableMapping {
    pub table_name: String,
    pub resource_type: String,
    #[serde(default)]
    pub linked_tables: Vec<String>,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_uuid_column")]
    pub uuid_column: String,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_uuid_column() -> String {
    "uuid".to_string()
}

fn is_sql_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Resolves the tables to extract for the requested resource types.
///
/// Returns mappings keyed by table name, including the transitive closure of
/// linked tables. Fails fast when a requested type has no mapping entry.
pub fn create_reverse_map(
    requested_types: &[String],
    mapping_path: &Path,
) -> EtlResult<BTreeMap<String, TableMapping>> {
    let contents = fs::read_to_string(mapping_path).map_err(|e| {
        etl_error!(
            ErrorKind::ConfigError,
            "unreadable table-to-resource mapping file",
            mapping_path.display().to_string()
        )
        .with_source(e)
    })?;

    let entries: Vec<TableMapping> = serde_json::from_str(&contents).map_err(|e| {
        etl_error!(
            ErrorKind::ConfigError,
            "malformed table-to-resource mapping file",
            mapping_path.display().to_string()
        )
        .with_source(e)
    })?;

    let by_table: BTreeMap<&str, &TableMapping> = entries
        .iter()
        .map(|entry| (entry.table_name.as_str(), entry))
        .collect();

    for entry in &entries {
        for column in [&entry.table_name, &entry.id_column, &entry.uuid_column] {
            if !is_sql_identifier(column) {
                bail!(
                    ErrorKind::ConfigError,
                    "mapping entry contains an invalid sql identifier",
                    column.clone()
                );
            }
        }
    }

    let mut selected: BTreeMap<String, TableMapping> = BTreeMap::new();
    for resource_type in requested_types {
        let direct: Vec<&TableMapping> = entries
            .iter()
            .filter(|entry| &entry.resource_type == resource_type)
            .collect();

        if direct.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "requested resource type is absent from the table mapping",
                resource_type.clone()
            );
        }

        // Walk linked tables to a fixed point.
        let mut pending: Vec<&TableMapping> = direct;
        while let Some(entry) = pending.pop() {
            if selected.contains_key(&entry.table_name) {
                continue;
            }
            selected.insert(entry.table_name.clone(), entry.clone());

            for linked in &entry.linked_tables {
                match by_table.get(linked.as_str()) {
                    Some(linked_entry) => pending.push(linked_entry),
                    None => bail!(
                        ErrorKind::ConfigError,
                        "linked table is absent from the table mapping",
                        linked.clone()
                    ),
                }
            }
        }
    }

    Ok(selected)
}

/// Plans `_id` batches by partitioning each mapped table's id space.
pub struct DbPartitioner {
    pool: PgPool,
    batch_size: i64,
    search_fetch_size: usize,
}

impl DbPartitioner {
    /// Connects the pool. The minimum pool size is held fixed; drivers behind
    /// the warehouse mishandle pool shrink.
    pub async fn connect(
        config: &DbConfig,
        batch_size: usize,
        search_fetch_size: usize,
    ) -> EtlResult<Self> {
        config.validate()?;

        let mut options = PgConnectOptions::from_str(&config.url).map_err(|e| {
            etl_error!(ErrorKind::ConfigError, "invalid database url").with_source(e)
        })?;
        if let Some(user) = &config.user {
            options = options.username(user);
        }
        if let Some(password) = &config.password {
            options = options.password(password);
        }

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.min_connections.max(8))
            .connect_with(options)
            .await?;

        Ok(DbPartitioner {
            pool,
            batch_size: batch_size as i64,
            search_fetch_size,
        })
    }

    /// Produces the full id-batch plan for the mapped tables.
    pub async fn plan_id_batches(
        &self,
        tables: &BTreeMap<String, TableMapping>,
    ) -> EtlResult<Vec<IdBatch>> {
        let mut batches = Vec::new();

        for mapping in tables.values() {
            let max_id = self.max_id(mapping).await?;
            let Some(max_id) = max_id else {
                info!(table = %mapping.table_name, "table is empty, skipping");
                continue;
            };

            let ranges = create_id_ranges(max_id, self.batch_size);
            debug!(
                table = %mapping.table_name,
                max_id,
                ranges = ranges.len(),
                "partitioned table id space"
            );

            for range in &ranges {
                // The final range is closed so MAX(id) itself is captured.
                let inclusive_end = range.to == max_id;
                let uuids = self.range_uuids(mapping, range.from, range.to, inclusive_end).await?;
                batches.extend(chunk_into_batches(
                    &mapping.resource_type,
                    &uuids,
                    self.search_fetch_size,
                ));
            }
        }

        info!(batches = batches.len(), "planned id batches");
        Ok(batches)
    }

    async fn max_id(&self, mapping: &TableMapping) -> EtlResult<Option<i64>> {
        let sql = format!(
            "SELECT MAX({}) FROM {}",
            mapping.id_column, mapping.table_name
        );
        let max: Option<i64> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(max)
    }

    async fn range_uuids(
        &self,
        mapping: &TableMapping,
        from: i64,
        to: i64,
        inclusive_end: bool,
    ) -> EtlResult<Vec<String>> {
        let comparison = if inclusive_end { "<=" } else { "<" };
        let sql = format!(
            "SELECT {} FROM {} WHERE {} >= $1 AND {} {} $2 ORDER BY {}",
            mapping.uuid_column,
            mapping.table_name,
            mapping.id_column,
            mapping.id_column,
            comparison,
            mapping.id_column
        );

        let uuids: Vec<String> = sqlx::query_scalar(&sql)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(uuids)
    }
}
