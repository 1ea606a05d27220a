//! One interactive, cancelable session over the backend's three transaction
//! primitives.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{
    BatchReadOnlyTransaction, BatchTransactionId, DatabaseClient, Partition, PartitionOptions,
    QueryStatement, ReadOnlyTransaction, ResultSet, Timestamp,
};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::mutation::Mutation;
use crate::worker::{InterruptHandle, TransactionWorker};

/// Transaction flavour derived from the connection flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    ReadWrite,
    ReadOnly,
    BatchReadOnly,
}

impl TransactionMode {
    /// Batch read-only wins over read-only, which wins over read/write.
    pub fn from_flags(read_only: bool, batch_read_only: bool) -> Self {
        if batch_read_only {
            Self::BatchReadOnly
        } else if read_only {
            Self::ReadOnly
        } else {
            Self::ReadWrite
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadWrite => "read/write",
            Self::ReadOnly => "read-only",
            Self::BatchReadOnly => "batch read-only",
        }
    }
}

/// The single live primitive of a session.
enum ActiveTransaction {
    ReadWrite(TransactionWorker),
    ReadOnly(Box<dyn ReadOnlyTransaction>),
    BatchReadOnly(Box<dyn BatchReadOnlyTransaction>),
}

impl ActiveTransaction {
    fn mode(&self) -> TransactionMode {
        match self {
            Self::ReadWrite(_) => TransactionMode::ReadWrite,
            Self::ReadOnly(_) => TransactionMode::ReadOnly,
            Self::BatchReadOnly(_) => TransactionMode::BatchReadOnly,
        }
    }
}

pub struct TransactionSession {
    client: Arc<dyn DatabaseClient>,
    config: SessionConfig,
    mode: TransactionMode,
    active: Option<ActiveTransaction>,
    interrupt: InterruptHandle,
    primitives_opened: u64,
}

impl TransactionSession {
    pub fn new(client: Arc<dyn DatabaseClient>, config: SessionConfig) -> Self {
        Self {
            client,
            config,
            mode: TransactionMode::ReadWrite,
            active: None,
            interrupt: InterruptHandle::new(),
            primitives_opened: 0,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Switches the mode used by the next `begin`.
    pub fn set_mode(&mut self, mode: TransactionMode) -> SessionResult<()> {
        if let Some(active) = &self.active {
            if active.mode() != mode {
                return Err(SessionError::TransactionActive {
                    active: active.mode().as_str(),
                });
            }
        }
        self.mode = mode;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Number of backend primitives this session has opened so far.
    pub fn primitives_opened(&self) -> u64 {
        self.primitives_opened
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Attempt id of the live read/write worker.
    pub fn active_attempt_id(&self) -> Option<u64> {
        self.read_write_worker().map(TransactionWorker::attempt_id)
    }

    pub(crate) fn read_write_worker(&self) -> Option<&TransactionWorker> {
        match &self.active {
            Some(ActiveTransaction::ReadWrite(worker)) => Some(worker),
            _ => None,
        }
    }

    /// Opens the primitive for the current mode unless one is already live.
    pub fn begin(&mut self) -> SessionResult<()> {
        if self.active.is_some() {
            return Ok(());
        }
        let active = match self.mode {
            TransactionMode::ReadWrite => ActiveTransaction::ReadWrite(TransactionWorker::start(
                self.client.clone(),
                &self.config,
                self.interrupt.clone(),
            )?),
            TransactionMode::ReadOnly => ActiveTransaction::ReadOnly(
                self.client
                    .read_only_transaction()
                    .map_err(|err| SessionError::backend("begin", err))?,
            ),
            TransactionMode::BatchReadOnly => ActiveTransaction::BatchReadOnly(
                self.client
                    .batch_read_only_transaction()
                    .map_err(|err| SessionError::backend("begin", err))?,
            ),
        };
        self.primitives_opened += 1;
        debug!(mode = self.mode.as_str(), "began transaction");
        self.active = Some(active);
        Ok(())
    }

    /// Re-attaches to a batch read-only transaction created elsewhere.
    pub fn begin_batch_from_id(&mut self, id: &BatchTransactionId) -> SessionResult<()> {
        if self.mode != TransactionMode::BatchReadOnly {
            return Err(SessionError::NotBatchReadOnly {
                operation: "attaching to a batch transaction",
            });
        }
        if let Some(active) = &self.active {
            return Err(SessionError::TransactionActive {
                active: active.mode().as_str(),
            });
        }
        let transaction = self
            .client
            .batch_read_only_transaction_from_id(id)
            .map_err(|err| SessionError::backend("begin", err))?;
        self.primitives_opened += 1;
        self.active = Some(ActiveTransaction::BatchReadOnly(transaction));
        Ok(())
    }

    /// Runs `statement` on the live primitive, beginning one if needed.
    pub fn execute_query(&mut self, statement: &QueryStatement) -> SessionResult<ResultSet> {
        self.begin()?;
        let result = match self.active.as_mut() {
            Some(ActiveTransaction::ReadWrite(worker)) => worker.execute_query(statement),
            Some(ActiveTransaction::ReadOnly(transaction)) => transaction
                .execute_query(statement)
                .map_err(|err| SessionError::backend("query", err)),
            Some(ActiveTransaction::BatchReadOnly(transaction)) => transaction
                .execute_query(statement)
                .map_err(|err| SessionError::backend("query", err)),
            None => Err(SessionError::Worker("no active transaction".to_string())),
        };
        if let Err(err) = &result {
            let read_write = matches!(self.active, Some(ActiveTransaction::ReadWrite(_)));
            if read_write && !matches!(err, SessionError::Interrupted { .. }) {
                self.abandon_read_write("query");
            }
        }
        result
    }

    /// Runs one read outside any live transaction on a throwaway read-only primitive.
    pub fn execute_single_use_query(
        &mut self,
        statement: &QueryStatement,
    ) -> SessionResult<ResultSet> {
        let mut transaction = self
            .client
            .read_only_transaction()
            .map_err(|err| SessionError::backend("begin", err))?;
        let result = transaction.execute_query(statement);
        transaction.close();
        result.map_err(|err| SessionError::backend("query", err))
    }

    pub fn buffer(&mut self, mutation: Mutation) -> SessionResult<()> {
        self.read_write_worker_for_buffer()?.buffer(mutation)
    }

    pub fn buffer_all(&mut self, mutations: Vec<Mutation>) -> SessionResult<()> {
        self.read_write_worker_for_buffer()?.buffer_all(mutations)
    }

    /// Mutations buffered in the live read/write transaction.
    pub fn buffered_mutations(&self) -> SessionResult<Vec<Mutation>> {
        match self.read_write_worker() {
            Some(worker) => worker.buffered_mutations(),
            None => Ok(Vec::new()),
        }
    }

    pub fn mutation_log_len(&self) -> SessionResult<usize> {
        match self.read_write_worker() {
            Some(worker) => worker.mutation_log_len(),
            None => Ok(0),
        }
    }

    /// Closes the live primitive; returns the commit timestamp of a read/write commit.
    pub fn commit(&mut self) -> SessionResult<Option<Timestamp>> {
        match self.active.take() {
            None => Ok(None),
            Some(ActiveTransaction::ReadWrite(mut worker)) => {
                let timestamp = worker.commit()?;
                debug!(attempt_id = worker.attempt_id(), %timestamp, "committed transaction");
                Ok(Some(timestamp))
            }
            Some(ActiveTransaction::ReadOnly(mut transaction)) => {
                transaction.close();
                Ok(None)
            }
            Some(ActiveTransaction::BatchReadOnly(mut transaction)) => {
                transaction.close();
                Ok(None)
            }
        }
    }

    pub fn rollback(&mut self) -> SessionResult<()> {
        match self.active.take() {
            None => Ok(()),
            Some(ActiveTransaction::ReadWrite(mut worker)) => {
                worker.rollback()?;
                debug!(attempt_id = worker.attempt_id(), "rolled back transaction");
                Ok(())
            }
            Some(ActiveTransaction::ReadOnly(mut transaction)) => {
                transaction.close();
                Ok(())
            }
            Some(ActiveTransaction::BatchReadOnly(mut transaction)) => {
                transaction.close();
                Ok(())
            }
        }
    }

    /// Read timestamp of the live read-only primitive.
    pub fn read_timestamp(&self) -> Option<Timestamp> {
        match &self.active {
            Some(ActiveTransaction::ReadOnly(transaction)) => transaction.read_timestamp(),
            Some(ActiveTransaction::BatchReadOnly(transaction)) => transaction.read_timestamp(),
            _ => None,
        }
    }

    pub fn partition_query(
        &mut self,
        options: &PartitionOptions,
        statement: &QueryStatement,
    ) -> SessionResult<Vec<Partition>> {
        self.batch_transaction("partition_query")?
            .partition_query(options, statement)
            .map_err(|err| SessionError::backend("partition_query", err))
    }

    pub fn execute_partition(&mut self, partition: &Partition) -> SessionResult<ResultSet> {
        self.batch_transaction("execute_partition")?
            .execute_partition(partition)
            .map_err(|err| SessionError::backend("execute_partition", err))
    }

    pub fn batch_transaction_id(&mut self) -> SessionResult<BatchTransactionId> {
        Ok(self
            .batch_transaction("batch_transaction_id")?
            .batch_transaction_id())
    }

    fn batch_transaction(
        &mut self,
        operation: &'static str,
    ) -> SessionResult<&mut dyn BatchReadOnlyTransaction> {
        if self.mode != TransactionMode::BatchReadOnly {
            return Err(SessionError::NotBatchReadOnly { operation });
        }
        self.begin()?;
        match self.active.as_mut() {
            Some(ActiveTransaction::BatchReadOnly(transaction)) => Ok(transaction.as_mut()),
            _ => Err(SessionError::NotBatchReadOnly { operation }),
        }
    }

    fn read_write_worker_for_buffer(&mut self) -> SessionResult<&TransactionWorker> {
        if self.mode != TransactionMode::ReadWrite {
            return Err(SessionError::ReadOnlyMutation);
        }
        self.begin()?;
        self.read_write_worker().ok_or(SessionError::ReadOnlyMutation)
    }

    /// Ends a read/write attempt after a backend failure.
    fn abandon_read_write(&mut self, operation: &'static str) {
        if let Some(ActiveTransaction::ReadWrite(mut worker)) = self.active.take() {
            if let Err(err) = worker.rollback() {
                warn!(
                    attempt_id = worker.attempt_id(),
                    operation,
                    error = %err,
                    "rollback after failed statement also failed"
                );
            }
        }
    }
}

impl Drop for TransactionSession {
    fn drop(&mut self) {
        match self.active.take() {
            Some(ActiveTransaction::ReadOnly(mut transaction)) => transaction.close(),
            Some(ActiveTransaction::BatchReadOnly(mut transaction)) => transaction.close(),
            // Dropping the worker asks its thread to roll back.
            Some(ActiveTransaction::ReadWrite(_)) | None => {}
        }
    }
}
