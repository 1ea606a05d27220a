//! In-memory scripted backend.
//!
//! `MemoryDatabase` implements [`DatabaseClient`] without evaluating SQL:
//! query results are scripted up front, executed statements and commits are
//! recorded, and the per-commit mutation ceiling is enforced the way the real
//! backend enforces it. Failures, aborts and slow queries can be injected to
//! exercise retry and interruption paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use datafusion::common::ScalarValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::{
    BatchReadOnlyTransaction, BatchTransactionId, DatabaseClient, Partition, PartitionOptions,
    QueryStatement, ReadOnlyTransaction, ResultSet, SchemaCatalog, Timestamp, TransactionContext,
    TransactionWork,
};
use crate::config::DEFAULT_MAX_MUTATIONS_PER_COMMIT;
use crate::error::{backend_error_code, BackendError, ErrorCode};
use crate::metadata::ColumnMetadata;
use crate::mutation::Mutation;

/// Attempts made before an aborted commit is reported to the caller.
const MAX_COMMIT_ATTEMPTS: u32 = 10;
/// Partitions produced when the caller does not ask for a specific count.
const DEFAULT_PARTITIONS: u64 = 2;
const MEMORY_SESSION_ID: &str = "memory/sessions/0";

/// Catalog entry for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub key_columns: Vec<String>,
    pub columns: Vec<ColumnMetadata>,
    pub index_count: usize,
}

impl TableDefinition {
    pub fn new<I, S>(name: impl Into<String>, key_columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            key_columns: key_columns.into_iter().map(Into::into).collect(),
            columns: Vec::new(),
            index_count: 0,
        }
    }

    pub fn with_columns(mut self, columns: Vec<ColumnMetadata>) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_index_count(mut self, index_count: usize) -> Self {
        self.index_count = index_count;
        self
    }
}

/// Mutations applied by one successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub timestamp: Timestamp,
    pub mutations: Vec<Mutation>,
}

#[derive(Debug, Clone)]
enum QueryMatcher {
    Exact(String),
    Contains(String),
}

impl QueryMatcher {
    fn matches(&self, normalized_sql: &str) -> bool {
        match self {
            Self::Exact(sql) => sql == normalized_sql,
            Self::Contains(fragment) => normalized_sql.contains(fragment.as_str()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartitionToken {
    transaction_id: Vec<u8>,
    count: u64,
}

impl PartitionToken {
    fn decode(raw: &[u8]) -> Result<Self> {
        let token: Self = serde_json::from_slice(raw).context("decode partition token")?;
        if token.count == 0 {
            return Err(BackendError::new(
                ErrorCode::InvalidArgument,
                "partition token declares zero partitions",
            )
            .into());
        }
        Ok(token)
    }
}

struct MemoryState {
    tables: HashMap<String, TableDefinition>,
    scripted: Vec<(QueryMatcher, ResultSet)>,
    query_failures: Vec<(String, BackendError)>,
    query_delay: Option<Duration>,
    executed: Vec<QueryStatement>,
    commits: Vec<CommitRecord>,
    /// Scripted commit outcomes; `None` lets that commit through.
    commit_failures: VecDeque<Option<BackendError>>,
    aborts_remaining: usize,
    ddl: Vec<String>,
    batch_transactions: Vec<Vec<u8>>,
    max_mutations_per_commit: usize,
}

struct MemoryShared {
    state: Mutex<MemoryState>,
    callback_invocations: AtomicU64,
    read_write_transactions: AtomicU64,
    read_only_opened: AtomicU64,
    read_only_closed: AtomicU64,
    batch_opened: AtomicU64,
    next_transaction_id: AtomicU64,
}

impl MemoryShared {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory database lock poisoned"))
    }

    fn run_query(&self, statement: &QueryStatement) -> Result<ResultSet> {
        let normalized = normalize_sql(&statement.sql);
        let delay = {
            let mut state = self.lock()?;
            state.executed.push(statement.clone());
            if let Some((_, err)) = state
                .query_failures
                .iter()
                .find(|(fragment, _)| normalized.contains(fragment.as_str()))
            {
                return Err(err.clone().into());
            }
            state.query_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.scripted_result(&normalized)
    }

    fn scripted_result(&self, normalized: &str) -> Result<ResultSet> {
        let state = self.lock()?;
        // Exact scripts win over fragments; later scripts win over earlier ones.
        let exact = state.scripted.iter().rev().find(|(matcher, _)| {
            matches!(matcher, QueryMatcher::Exact(_)) && matcher.matches(normalized)
        });
        let found = exact.or_else(|| {
            state
                .scripted
                .iter()
                .rev()
                .find(|(matcher, _)| matcher.matches(normalized))
        });
        match found {
            Some((_, result)) => Ok(result.clone()),
            None => Err(BackendError::new(
                ErrorCode::InvalidArgument,
                format!("no scripted result for query: {normalized}"),
            )
            .into()),
        }
    }

    fn commit(&self, mutations: Vec<Mutation>) -> Result<Timestamp> {
        let mut state = self.lock()?;
        if state.aborts_remaining > 0 {
            state.aborts_remaining -= 1;
            return Err(BackendError::new(ErrorCode::Aborted, "transaction was aborted").into());
        }
        if let Some(Some(err)) = state.commit_failures.pop_front() {
            return Err(err.into());
        }
        let count = mutations.iter().map(Mutation::mutation_count).sum::<usize>();
        if count > state.max_mutations_per_commit {
            return Err(BackendError::new(
                ErrorCode::InvalidArgument,
                format!(
                    "the transaction contains too many mutations: {count} exceeds the limit of {}",
                    state.max_mutations_per_commit
                ),
            )
            .into());
        }
        let timestamp = Utc::now();
        state.commits.push(CommitRecord {
            timestamp,
            mutations,
        });
        Ok(timestamp)
    }

    fn table<T>(&self, table: &str, read: impl FnOnce(&TableDefinition) -> T) -> Result<T> {
        let state = self.lock()?;
        state
            .tables
            .get(&table.to_ascii_lowercase())
            .map(read)
            .ok_or_else(|| {
                BackendError::new(ErrorCode::NotFound, format!("table not found: {table}")).into()
            })
    }
}

/// Scripted in-memory implementation of the backend client.
#[derive(Clone)]
pub struct MemoryDatabase {
    shared: Arc<MemoryShared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let keep_alive = ResultSet::new(
            vec!["1".to_string()],
            vec![vec![ScalarValue::Int64(Some(1))]],
        );
        Self {
            shared: Arc::new(MemoryShared {
                state: Mutex::new(MemoryState {
                    tables: HashMap::new(),
                    scripted: vec![(QueryMatcher::Exact("SELECT 1".to_string()), keep_alive)],
                    query_failures: Vec::new(),
                    query_delay: None,
                    executed: Vec::new(),
                    commits: Vec::new(),
                    commit_failures: VecDeque::new(),
                    aborts_remaining: 0,
                    ddl: Vec::new(),
                    batch_transactions: Vec::new(),
                    max_mutations_per_commit: DEFAULT_MAX_MUTATIONS_PER_COMMIT,
                }),
                callback_invocations: AtomicU64::new(0),
                read_write_transactions: AtomicU64::new(0),
                read_only_opened: AtomicU64::new(0),
                read_only_closed: AtomicU64::new(0),
                batch_opened: AtomicU64::new(0),
                next_transaction_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn with_max_mutations_per_commit(self, max_mutations_per_commit: usize) -> Self {
        if let Ok(mut state) = self.shared.state.lock() {
            state.max_mutations_per_commit = max_mutations_per_commit;
        }
        self
    }

    pub fn define_table(&self, table: TableDefinition) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.tables.insert(table.name.to_ascii_lowercase(), table);
        }
    }

    /// Answers queries whose whitespace-normalized text equals `sql`.
    pub fn script_query(&self, sql: &str, result: ResultSet) {
        self.push_script(QueryMatcher::Exact(normalize_sql(sql)), result);
    }

    /// Answers queries whose normalized text contains `fragment`.
    pub fn script_query_containing(&self, fragment: &str, result: ResultSet) {
        self.push_script(QueryMatcher::Contains(normalize_sql(fragment)), result);
    }

    pub fn fail_queries_containing(&self, fragment: &str, error: BackendError) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.query_failures.push((normalize_sql(fragment), error));
        }
    }

    /// Makes every query sleep for `delay` before answering.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.query_delay = delay;
        }
    }

    pub fn fail_next_commit(&self, error: BackendError) {
        self.fail_commit_after(0, error);
    }

    /// Lets `successful` commits through, then fails the following one.
    pub fn fail_commit_after(&self, successful: usize, error: BackendError) {
        if let Ok(mut state) = self.shared.state.lock() {
            state
                .commit_failures
                .extend(std::iter::repeat_with(|| None).take(successful));
            state.commit_failures.push_back(Some(error));
        }
    }

    /// Aborts the next `count` commit attempts so the callback is retried.
    pub fn abort_next_commits(&self, count: usize) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.aborts_remaining = count;
        }
    }

    pub fn executed_queries(&self) -> Vec<QueryStatement> {
        self.shared
            .state
            .lock()
            .map(|state| state.executed.clone())
            .unwrap_or_default()
    }

    /// Normalized SQL of every executed query, keep-alives included.
    pub fn executed_sql(&self) -> Vec<String> {
        self.executed_queries()
            .iter()
            .map(|statement| normalize_sql(&statement.sql))
            .collect()
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.shared
            .state
            .lock()
            .map(|state| state.commits.clone())
            .unwrap_or_default()
    }

    pub fn committed_mutations(&self) -> Vec<Mutation> {
        self.commits()
            .into_iter()
            .flat_map(|commit| commit.mutations)
            .collect()
    }

    pub fn ddl_statements(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .map(|state| state.ddl.clone())
            .unwrap_or_default()
    }

    pub fn callback_invocations(&self) -> u64 {
        self.shared.callback_invocations.load(Ordering::SeqCst)
    }

    pub fn read_write_transactions(&self) -> u64 {
        self.shared.read_write_transactions.load(Ordering::SeqCst)
    }

    pub fn read_only_transactions_opened(&self) -> u64 {
        self.shared.read_only_opened.load(Ordering::SeqCst)
    }

    pub fn read_only_transactions_closed(&self) -> u64 {
        self.shared.read_only_closed.load(Ordering::SeqCst)
    }

    pub fn batch_transactions_opened(&self) -> u64 {
        self.shared.batch_opened.load(Ordering::SeqCst)
    }

    fn push_script(&self, matcher: QueryMatcher, result: ResultSet) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.scripted.push((matcher, result));
        }
    }

    fn open_read_only(&self) -> MemoryReadOnlyTransaction {
        self.shared.read_only_opened.fetch_add(1, Ordering::SeqCst);
        MemoryReadOnlyTransaction {
            shared: self.shared.clone(),
            read_timestamp: Utc::now(),
            closed: false,
        }
    }
}

impl SchemaCatalog for MemoryDatabase {
    fn primary_key_columns(&self, table: &str) -> Result<Vec<String>> {
        self.shared.table(table, |def| def.key_columns.clone())
    }

    fn column_metadata(&self, table: &str) -> Result<Vec<ColumnMetadata>> {
        self.shared.table(table, |def| def.columns.clone())
    }

    fn index_count(&self, table: &str) -> Result<usize> {
        self.shared.table(table, |def| def.index_count)
    }
}

impl DatabaseClient for MemoryDatabase {
    fn read_write_transaction(&self, work: &mut TransactionWork<'_>) -> Result<Timestamp> {
        self.shared
            .read_write_transactions
            .fetch_add(1, Ordering::SeqCst);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.shared
                .callback_invocations
                .fetch_add(1, Ordering::SeqCst);
            let mut context = MemoryTransactionContext {
                shared: &self.shared,
                buffered: Vec::new(),
            };
            work(&mut context)?;
            match self.shared.commit(context.buffered) {
                Ok(timestamp) => return Ok(timestamp),
                Err(err)
                    if backend_error_code(&err) == ErrorCode::Aborted
                        && attempt < MAX_COMMIT_ATTEMPTS =>
                {
                    debug!(attempt, "retrying aborted read/write transaction");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn read_only_transaction(&self) -> Result<Box<dyn ReadOnlyTransaction>> {
        Ok(Box::new(self.open_read_only()))
    }

    fn batch_read_only_transaction(&self) -> Result<Box<dyn BatchReadOnlyTransaction>> {
        let raw_id = self
            .shared
            .next_transaction_id
            .fetch_add(1, Ordering::SeqCst);
        let transaction_id = raw_id.to_be_bytes().to_vec();
        self.shared
            .lock()?
            .batch_transactions
            .push(transaction_id.clone());
        self.shared.batch_opened.fetch_add(1, Ordering::SeqCst);
        let inner = self.open_read_only();
        let id = BatchTransactionId {
            session_id: MEMORY_SESSION_ID.to_string(),
            transaction_id,
            read_timestamp: inner.read_timestamp,
        };
        Ok(Box::new(MemoryBatchTransaction { inner, id }))
    }

    fn batch_read_only_transaction_from_id(
        &self,
        id: &BatchTransactionId,
    ) -> Result<Box<dyn BatchReadOnlyTransaction>> {
        let known = self
            .shared
            .lock()?
            .batch_transactions
            .contains(&id.transaction_id);
        if !known || id.session_id != MEMORY_SESSION_ID {
            return Err(BackendError::new(
                ErrorCode::NotFound,
                format!("batch transaction not found in session {}", id.session_id),
            )
            .into());
        }
        self.shared.batch_opened.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.open_read_only();
        inner.read_timestamp = id.read_timestamp;
        Ok(Box::new(MemoryBatchTransaction {
            inner,
            id: id.clone(),
        }))
    }

    fn execute_ddl(&self, sql: &str) -> Result<()> {
        self.shared.lock()?.ddl.push(normalize_sql(sql));
        Ok(())
    }
}

struct MemoryTransactionContext<'a> {
    shared: &'a MemoryShared,
    buffered: Vec<Mutation>,
}

impl TransactionContext for MemoryTransactionContext<'_> {
    fn execute_query(&mut self, statement: &QueryStatement) -> Result<ResultSet> {
        self.shared.run_query(statement)
    }

    fn buffer(&mut self, mutations: Vec<Mutation>) {
        self.buffered.extend(mutations);
    }
}

struct MemoryReadOnlyTransaction {
    shared: Arc<MemoryShared>,
    read_timestamp: Timestamp,
    closed: bool,
}

impl ReadOnlyTransaction for MemoryReadOnlyTransaction {
    fn execute_query(&mut self, statement: &QueryStatement) -> Result<ResultSet> {
        if self.closed {
            return Err(BackendError::new(
                ErrorCode::FailedPrecondition,
                "read-only transaction is closed",
            )
            .into());
        }
        self.shared.run_query(statement)
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        Some(self.read_timestamp)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.read_only_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct MemoryBatchTransaction {
    inner: MemoryReadOnlyTransaction,
    id: BatchTransactionId,
}

impl ReadOnlyTransaction for MemoryBatchTransaction {
    fn execute_query(&mut self, statement: &QueryStatement) -> Result<ResultSet> {
        self.inner.execute_query(statement)
    }

    fn read_timestamp(&self) -> Option<Timestamp> {
        self.inner.read_timestamp()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

impl BatchReadOnlyTransaction for MemoryBatchTransaction {
    fn partition_query(
        &mut self,
        options: &PartitionOptions,
        statement: &QueryStatement,
    ) -> Result<Vec<Partition>> {
        // Fail early for queries nobody scripted.
        self.inner
            .shared
            .scripted_result(&normalize_sql(&statement.sql))?;
        let count = options.max_partitions.unwrap_or(DEFAULT_PARTITIONS).max(1);
        let token = serde_json::to_vec(&PartitionToken {
            transaction_id: self.id.transaction_id.clone(),
            count,
        })
        .context("encode partition token")?;
        (0..count)
            .map(|index| {
                Ok(Partition {
                    token: token.clone(),
                    sql: statement.sql.clone(),
                    index: u32::try_from(index).context("partition index overflow")?,
                })
            })
            .collect()
    }

    fn execute_partition(&mut self, partition: &Partition) -> Result<ResultSet> {
        let token = PartitionToken::decode(&partition.token)?;
        if token.transaction_id != self.id.transaction_id {
            return Err(BackendError::new(
                ErrorCode::InvalidArgument,
                "partition belongs to a different batch transaction",
            )
            .into());
        }
        let result = self.execute_query(&QueryStatement::new(partition.sql.clone()))?;
        let columns = result.columns().to_vec();
        let index = u64::from(partition.index);
        let rows = result
            .into_rows()
            .into_iter()
            .enumerate()
            .filter(|(row_idx, _)| row_idx % token.count as usize == index as usize)
            .map(|(_, row)| row)
            .collect();
        Ok(ResultSet::new(columns, rows))
    }

    fn batch_transaction_id(&self) -> BatchTransactionId {
        self.id.clone()
    }
}

/// Collapses runs of whitespace so scripts match regardless of formatting.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}
