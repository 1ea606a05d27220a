//! Table key and column metadata fetched from the backend catalog.
//!
//! Primary-key lookups happen for every UPDATE/DELETE routed through the
//! planner, so each connection caches them per table until DDL invalidates the
//! entry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::backend::SchemaCatalog;

/// Backend column types relevant for mutation size estimates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Bool,
    Int64,
    Float64,
    Numeric,
    Date,
    Timestamp,
    String,
    Bytes,
    Json,
    Array(Box<ColumnType>),
}

/// Declared column as reported by the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub column_type: ColumnType,
    /// Declared maximum length for STRING/BYTES/ARRAY columns, `None` for MAX.
    pub declared_length: Option<usize>,
}

impl ColumnMetadata {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            declared_length: None,
        }
    }

    pub fn with_length(mut self, declared_length: usize) -> Self {
        self.declared_length = Some(declared_length);
        self
    }
}

/// Table name plus ordered primary-key columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableKeyMetadata {
    pub table_name: String,
    pub key_columns: Vec<String>,
}

impl TableKeyMetadata {
    /// Returns true when `column` is part of the primary key.
    pub fn is_key_column(&self, column: &str) -> bool {
        self.key_columns
            .iter()
            .any(|key| key.eq_ignore_ascii_case(column))
    }
}

/// Per-connection cache of primary-key metadata keyed by lowercase table name.
#[derive(Debug, Default)]
pub struct KeyMetadataCache {
    tables: HashMap<String, Arc<TableKeyMetadata>>,
}

impl KeyMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns cached metadata for `table`, fetching it once on first use.
    pub fn get_or_load<C>(&mut self, catalog: &C, table: &str) -> Result<Arc<TableKeyMetadata>>
    where
        C: SchemaCatalog + ?Sized,
    {
        let cache_key = table.to_ascii_lowercase();
        if let Some(metadata) = self.tables.get(&cache_key) {
            return Ok(metadata.clone());
        }
        let key_columns = catalog
            .primary_key_columns(table)
            .with_context(|| format!("load primary key for table {table}"))?;
        if key_columns.is_empty() {
            return Err(anyhow!("table {table} has no primary key"));
        }
        debug!(table, key_columns = ?key_columns, "loaded table key metadata");
        let metadata = Arc::new(TableKeyMetadata {
            table_name: table.to_string(),
            key_columns,
        });
        self.tables.insert(cache_key, metadata.clone());
        Ok(metadata)
    }

    /// Drops the cached entry for `table`; returns true when one existed.
    pub fn invalidate(&mut self, table: &str) -> bool {
        self.tables.remove(&table.to_ascii_lowercase()).is_some()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
