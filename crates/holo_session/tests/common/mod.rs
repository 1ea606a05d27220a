//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use datafusion::common::ScalarValue;
use holo_session::metadata::{ColumnMetadata, ColumnType};
use holo_session::{Connection, MemoryDatabase, Mutation, ResultSet, SessionConfig, TableDefinition};

/// Table with an Int64 key `pk` and one Int64 value column `v`.
pub const TABLE: &str = "T";

/// Config tuned for fast tests: short polling, default keep-alive.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        wait_poll_interval: Duration::from_millis(5),
        ..SessionConfig::default()
    }
}

/// Memory database with [`TABLE`] defined.
pub fn database() -> MemoryDatabase {
    let db = MemoryDatabase::new();
    db.define_table(TableDefinition::new(TABLE, ["pk"]).with_columns(vec![
        ColumnMetadata::new("pk", ColumnType::Int64),
        ColumnMetadata::new("v", ColumnType::Int64),
    ]));
    db
}

pub fn connect(db: &MemoryDatabase, config: SessionConfig) -> Connection {
    Connection::new(Arc::new(db.clone()), config)
}

pub fn int(value: i64) -> ScalarValue {
    ScalarValue::Int64(Some(value))
}

pub fn insert(pk: i64) -> Mutation {
    Mutation::new_insert_builder(TABLE)
        .set("pk", int(pk))
        .set("v", int(pk * 10))
        .build()
}

/// Rows of `(pk, v)` for keys `1..=count`.
pub fn key_value_rows(count: i64) -> ResultSet {
    ResultSet::new(
        vec!["pk".to_string(), "v".to_string()],
        (1..=count).map(|pk| vec![int(pk), int(pk + 1)]).collect(),
    )
}

/// Single-column result, as returned by COUNT(*) or key-only SELECTs.
pub fn single_column(name: &str, values: &[i64]) -> ResultSet {
    ResultSet::new(
        vec![name.to_string()],
        values.iter().map(|value| vec![int(*value)]).collect(),
    )
}

/// Executed SQL without the keep-alive statements.
pub fn executed_without_keep_alive(db: &MemoryDatabase) -> Vec<String> {
    db.executed_sql()
        .into_iter()
        .filter(|sql| sql != "SELECT 1")
        .collect()
}
