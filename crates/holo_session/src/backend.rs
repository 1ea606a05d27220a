//! Boundary to the native backend client.
//!
//! The backend exposes three transaction primitives: a read/write transaction
//! driven by a callback that the backend runs (and may retry) before committing
//! atomically, a read-only snapshot transaction, and a batch read-only
//! transaction whose queries can be split into independently executable
//! partitions. Implementations report failures as `anyhow::Error`, ideally
//! wrapping a [`crate::BackendError`] so status codes survive.

use anyhow::Result;
use chrono::{DateTime, Utc};
use datafusion::common::ScalarValue;
use serde::{Deserialize, Serialize};

use crate::metadata::ColumnMetadata;
use crate::mutation::Mutation;

/// Commit or read timestamp assigned by the backend.
pub type Timestamp = DateTime<Utc>;

/// SQL text plus positional `$n` parameter values.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryStatement {
    pub sql: String,
    pub params: Vec<ScalarValue>,
}

impl QueryStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: Vec<ScalarValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Fully materialized query result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    columns: Vec<String>,
    rows: Vec<Vec<ScalarValue>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<ScalarValue>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<ScalarValue>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value in the first column of the first row, if any.
    pub fn first_value(&self) -> Option<&ScalarValue> {
        self.rows.first().and_then(|row| row.first())
    }
}

/// Context handed to the read/write callback for the duration of one attempt.
pub trait TransactionContext {
    fn execute_query(&mut self, statement: &QueryStatement) -> Result<ResultSet>;

    /// Buffers mutations that are applied when the callback returns `Ok`.
    fn buffer(&mut self, mutations: Vec<Mutation>);
}

/// Callback executed by [`DatabaseClient::read_write_transaction`].
///
/// Returning `Ok` commits the buffered mutations; returning `Err` rolls the
/// attempt back and the error is handed back to the caller.
pub type TransactionWork<'a> = dyn FnMut(&mut dyn TransactionContext) -> Result<()> + 'a;

/// Read-only snapshot transaction.
pub trait ReadOnlyTransaction: Send {
    fn execute_query(&mut self, statement: &QueryStatement) -> Result<ResultSet>;

    fn read_timestamp(&self) -> Option<Timestamp>;

    fn close(&mut self);
}

/// Options controlling how a query is split into partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub partition_size_bytes: Option<u64>,
    pub max_partitions: Option<u64>,
}

/// Opaque, independently executable slice of a partitioned query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub token: Vec<u8>,
    pub sql: String,
    pub index: u32,
}

impl Partition {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Identity of a batch read-only transaction that can be shared across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTransactionId {
    pub session_id: String,
    pub transaction_id: Vec<u8>,
    pub read_timestamp: Timestamp,
}

impl BatchTransactionId {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Read-only transaction that supports partitioned execution.
pub trait BatchReadOnlyTransaction: ReadOnlyTransaction {
    fn partition_query(
        &mut self,
        options: &PartitionOptions,
        statement: &QueryStatement,
    ) -> Result<Vec<Partition>>;

    fn execute_partition(&mut self, partition: &Partition) -> Result<ResultSet>;

    fn batch_transaction_id(&self) -> BatchTransactionId;
}

/// Catalog queries used for key lookup and batch sizing.
pub trait SchemaCatalog {
    /// Ordered primary-key column names of `table`.
    fn primary_key_columns(&self, table: &str) -> Result<Vec<String>>;

    /// Declared columns of `table` in ordinal order.
    fn column_metadata(&self, table: &str) -> Result<Vec<ColumnMetadata>>;

    /// Number of secondary indexes maintained for `table`.
    fn index_count(&self, table: &str) -> Result<usize>;
}

/// Native backend client.
pub trait DatabaseClient: SchemaCatalog + Send + Sync + 'static {
    /// Runs `work` inside a read/write transaction and commits it.
    ///
    /// The backend may invoke `work` more than once when an attempt aborts.
    fn read_write_transaction(&self, work: &mut TransactionWork<'_>) -> Result<Timestamp>;

    fn read_only_transaction(&self) -> Result<Box<dyn ReadOnlyTransaction>>;

    fn batch_read_only_transaction(&self) -> Result<Box<dyn BatchReadOnlyTransaction>>;

    /// Re-attaches to a batch transaction started elsewhere.
    fn batch_read_only_transaction_from_id(
        &self,
        id: &BatchTransactionId,
    ) -> Result<Box<dyn BatchReadOnlyTransaction>>;

    /// Applies a schema change statement.
    fn execute_ddl(&self, sql: &str) -> Result<()>;
}
