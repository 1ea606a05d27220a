//! Rows-per-commit estimation for bulk DML.
//!
//! The estimate gates two decisions: how many rows extended mode writes before
//! committing, and how many estimated affected rows trigger extended mode at
//! all.

use crate::config::SessionConfig;
use crate::metadata::{ColumnMetadata, ColumnType};

/// Fixed storage overhead charged per column and row.
const COLUMN_OVERHEAD_BYTES: usize = 8;

/// Limits the estimator works against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub byte_budget: usize,
    pub max_mutations_per_commit: usize,
    pub min_batch_size: usize,
    pub unbounded_column_length: usize,
}

impl From<&SessionConfig> for BatchLimits {
    fn from(config: &SessionConfig) -> Self {
        Self {
            byte_budget: config.batch_byte_budget,
            max_mutations_per_commit: config.max_mutations_per_commit,
            min_batch_size: config.min_batch_size,
            unbounded_column_length: config.unbounded_column_length,
        }
    }
}

/// Estimated bytes one row of `columns` occupies in a commit.
pub fn estimate_row_bytes(columns: &[ColumnMetadata], unbounded_column_length: usize) -> usize {
    columns
        .iter()
        .map(|column| {
            let length = column.declared_length.unwrap_or(unbounded_column_length);
            type_bytes(&column.column_type, length).saturating_add(COLUMN_OVERHEAD_BYTES)
        })
        .fold(0usize, usize::saturating_add)
}

fn type_bytes(column_type: &ColumnType, length: usize) -> usize {
    match column_type {
        ColumnType::Bool => 1,
        ColumnType::Date => 4,
        ColumnType::Int64 | ColumnType::Float64 | ColumnType::Numeric => 8,
        ColumnType::Timestamp => 12,
        ColumnType::String | ColumnType::Json => length.saturating_mul(2),
        ColumnType::Bytes => length,
        ColumnType::Array(element) => type_bytes(element, length).saturating_mul(length),
    }
}

/// Number of rows that can safely be written per commit.
///
/// `value_columns` is the number of columns each row mutation writes and
/// `index_count` the number of secondary indexes the table maintains. The
/// mutation ceiling is hard: `result * (value_columns + index_count)` never
/// exceeds `max_mutations_per_commit` (unless a single row already does).
/// The configured floor overrides the byte budget, which is only an estimate.
pub fn estimate_batch_size(
    value_columns: usize,
    columns: &[ColumnMetadata],
    index_count: usize,
    limits: BatchLimits,
) -> usize {
    let row_bytes = estimate_row_bytes(columns, limits.unbounded_column_length).max(1);
    let byte_rows = (limits.byte_budget / row_bytes).max(1);

    let mutations_per_row = value_columns.saturating_add(index_count).max(1);
    let mutation_rows = (limits.max_mutations_per_commit / mutations_per_row).max(1);

    let floor = limits.min_batch_size.min(mutation_rows);
    byte_rows.min(mutation_rows).max(floor).max(1)
}
