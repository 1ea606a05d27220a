//! Driver-level connection.
//!
//! Owns the mode flags, one [`TransactionSession`], the savepoint ledger and
//! the key metadata cache, and executes SQL statements through the planner.
//! With auto-commit enabled every statement runs as its own transaction;
//! reads in read/write mode then use a single-use read-only primitive.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use datafusion::sql::sqlparser::ast::Statement;
use tracing::{debug, warn};

use crate::backend::{
    BatchTransactionId, DatabaseClient, Partition, PartitionOptions, QueryStatement, ResultSet,
    Timestamp,
};
use crate::config::SessionConfig;
use crate::dml::TablePartWorker;
use crate::error::{SessionError, SessionResult};
use crate::metadata::KeyMetadataCache;
use crate::mutation::Mutation;
use crate::params::ParameterStore;
use crate::savepoint::{Savepoint, SavepointLedger};
use crate::session::{TransactionMode, TransactionSession};
use crate::statement::{parse_statement, plan_statement, PlannedStatement, TransactionControl};
use crate::worker::InterruptHandle;

/// Result of [`Connection::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteResult {
    ResultSet(ResultSet),
    UpdateCount(u64),
    Ok,
}

pub struct Connection {
    client: Arc<dyn DatabaseClient>,
    config: SessionConfig,
    session: TransactionSession,
    ledger: SavepointLedger,
    key_cache: KeyMetadataCache,
    auto_commit: bool,
    read_only: bool,
    batch_read_only: bool,
    allow_extended_mode: bool,
    /// Auto-commit was suspended by an explicit BEGIN.
    explicit_transaction: bool,
    side_connections_opened: AtomicUsize,
    closed: bool,
}

impl Connection {
    pub fn new(client: Arc<dyn DatabaseClient>, config: SessionConfig) -> Self {
        let session = TransactionSession::new(client.clone(), config.clone());
        Self {
            allow_extended_mode: config.allow_extended_mode,
            client,
            config,
            session,
            ledger: SavepointLedger::new(),
            key_cache: KeyMetadataCache::new(),
            auto_commit: true,
            read_only: false,
            batch_read_only: false,
            explicit_transaction: false,
            side_connections_opened: AtomicUsize::new(0),
            closed: false,
        }
    }

    pub fn client(&self) -> &Arc<dyn DatabaseClient> {
        &self.client
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self) -> &TransactionSession {
        &self.session
    }

    pub fn mode(&self) -> TransactionMode {
        self.session.mode()
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    /// Turning auto-commit on commits the live transaction.
    pub fn set_auto_commit(&mut self, auto_commit: bool) -> SessionResult<()> {
        self.ensure_open()?;
        let was_enabled = self.auto_commit;
        self.auto_commit = auto_commit;
        self.explicit_transaction = false;
        if auto_commit && !was_enabled {
            self.commit()?;
        }
        Ok(())
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) -> SessionResult<()> {
        self.ensure_open()?;
        self.session
            .set_mode(TransactionMode::from_flags(read_only, self.batch_read_only))?;
        self.read_only = read_only;
        Ok(())
    }

    pub fn batch_read_only(&self) -> bool {
        self.batch_read_only
    }

    pub fn set_batch_read_only(&mut self, batch_read_only: bool) -> SessionResult<()> {
        self.ensure_open()?;
        self.session
            .set_mode(TransactionMode::from_flags(self.read_only, batch_read_only))?;
        self.batch_read_only = batch_read_only;
        Ok(())
    }

    pub fn allow_extended_mode(&self) -> bool {
        self.allow_extended_mode
    }

    /// Lets the DML compiler trade atomicity for size on large statements.
    pub fn set_allow_extended_mode(&mut self, allow_extended_mode: bool) {
        self.allow_extended_mode = allow_extended_mode;
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.session.interrupt_handle()
    }

    /// Side connections opened by the DML compiler on behalf of this connection.
    pub fn side_connections_opened(&self) -> usize {
        self.side_connections_opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Parses, plans and runs one SQL statement.
    pub fn execute(&mut self, sql: &str, params: &ParameterStore) -> SessionResult<ExecuteResult> {
        self.ensure_open()?;
        let statement = parse_statement(sql)?;
        let planned = plan_statement(
            &statement,
            params,
            self.client.as_ref(),
            &mut self.key_cache,
            self.allow_extended_mode,
        )?;
        match planned {
            PlannedStatement::Query(query) => self.run_query(&query).map(ExecuteResult::ResultSet),
            PlannedStatement::Mutations(mutations) => {
                let count = mutations.len() as u64;
                self.write_mutations(mutations)?;
                Ok(ExecuteResult::UpdateCount(count))
            }
            PlannedStatement::Dml(mut worker) => {
                if self.session.mode() != TransactionMode::ReadWrite {
                    return Err(SessionError::ReadOnlyMutation);
                }
                let result = worker.run(self);
                debug!(
                    table = worker.table(),
                    rows = result.record_count,
                    committed_rows = result.committed_rows,
                    extended_mode = result.extended_mode,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "DML compiler finished"
                );
                result.into_result().map(ExecuteResult::UpdateCount)
            }
            PlannedStatement::Transaction(control) => {
                self.transaction_control(control)?;
                Ok(ExecuteResult::Ok)
            }
            PlannedStatement::Ddl { sql, tables } => {
                self.execute_ddl(&sql, &tables)?;
                Ok(ExecuteResult::Ok)
            }
        }
    }

    pub fn execute_query(
        &mut self,
        sql: &str,
        params: &ParameterStore,
    ) -> SessionResult<ResultSet> {
        match self.execute(sql, params)? {
            ExecuteResult::ResultSet(rows) => Ok(rows),
            _ => Err(SessionError::unsupported(
                "statement did not produce a result set",
            )),
        }
    }

    pub fn execute_update(&mut self, sql: &str, params: &ParameterStore) -> SessionResult<u64> {
        match self.execute(sql, params)? {
            ExecuteResult::UpdateCount(count) => Ok(count),
            ExecuteResult::Ok => Ok(0),
            ExecuteResult::ResultSet(_) => Err(SessionError::unsupported(
                "query passed where an update was expected",
            )),
        }
    }

    /// Buffers native mutations; with auto-commit they are committed at once.
    pub fn write_mutations(&mut self, mutations: Vec<Mutation>) -> SessionResult<()> {
        self.ensure_open()?;
        if self.session.mode() != TransactionMode::ReadWrite {
            return Err(SessionError::ReadOnlyMutation);
        }
        self.session.buffer_all(mutations)?;
        if self.auto_commit {
            self.commit()?;
        }
        Ok(())
    }

    pub fn commit(&mut self) -> SessionResult<Option<Timestamp>> {
        self.ensure_open()?;
        self.ledger.clear();
        self.end_explicit_transaction();
        self.session.commit()
    }

    pub fn rollback(&mut self) -> SessionResult<()> {
        self.ensure_open()?;
        self.ledger.clear();
        self.end_explicit_transaction();
        self.session.rollback()
    }

    pub fn set_savepoint(&mut self, name: Option<&str>) -> SessionResult<Savepoint> {
        self.ensure_open()?;
        if self.auto_commit {
            return Err(SessionError::SavepointNotAllowed {
                reason: "auto-commit is enabled",
            });
        }
        self.ledger.set_savepoint(&mut self.session, name)
    }

    pub fn release_savepoint(&mut self, savepoint: &Savepoint) -> SessionResult<()> {
        self.ensure_open()?;
        self.ledger.release_savepoint(&self.session, savepoint)
    }

    pub fn rollback_to_savepoint(&mut self, savepoint: &Savepoint) -> SessionResult<()> {
        self.ensure_open()?;
        self.ledger.rollback_to_savepoint(&self.session, savepoint)
    }

    pub fn partition_query(
        &mut self,
        options: &PartitionOptions,
        sql: &str,
        params: &ParameterStore,
    ) -> SessionResult<Vec<Partition>> {
        self.ensure_open()?;
        let statement = QueryStatement::with_params(sql, params.to_values()?);
        self.session.partition_query(options, &statement)
    }

    pub fn execute_partition(&mut self, partition: &Partition) -> SessionResult<ResultSet> {
        self.ensure_open()?;
        self.session.execute_partition(partition)
    }

    pub fn batch_transaction_id(&mut self) -> SessionResult<BatchTransactionId> {
        self.ensure_open()?;
        self.session.batch_transaction_id()
    }

    /// Joins a batch read-only transaction started by another connection.
    pub fn open_batch_read_only_from_id(&mut self, id: &BatchTransactionId) -> SessionResult<()> {
        self.ensure_open()?;
        self.session.begin_batch_from_id(id)
    }

    /// Independent connection to the same database, used by extended mode.
    pub fn open_side_connection(&self) -> Connection {
        self.side_connections_opened.fetch_add(1, Ordering::SeqCst);
        let mut side = Connection::new(self.client.clone(), self.config.clone());
        side.auto_commit = false;
        side.allow_extended_mode = false;
        debug!("opened side connection");
        side
    }

    /// Drops cached key metadata for `table`, or for every table.
    pub fn invalidate_table_metadata(&mut self, table: Option<&str>) {
        match table {
            Some(table) => {
                self.key_cache.invalidate(table);
            }
            None => self.key_cache.clear(),
        }
    }

    /// Rolls back any live transaction and rejects further use.
    pub fn close(&mut self) -> SessionResult<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.rollback();
        self.closed = true;
        result
    }

    /// Runs a query the way auto-commit and the live transaction require.
    pub(crate) fn run_query(&mut self, statement: &QueryStatement) -> SessionResult<ResultSet> {
        if self.auto_commit && self.session.mode() != TransactionMode::BatchReadOnly {
            return self.session.execute_single_use_query(statement);
        }
        self.session.execute_query(statement)
    }

    pub(crate) fn query_in_transaction(
        &mut self,
        statement: &QueryStatement,
    ) -> SessionResult<ResultSet> {
        self.session.execute_query(statement)
    }

    pub(crate) fn buffer_in_transaction(&mut self, mutations: Vec<Mutation>) -> SessionResult<()> {
        self.session.buffer_all(mutations)
    }

    /// Re-enables auto-commit after a failure without committing anything.
    pub(crate) fn restore_auto_commit_flag(&mut self) {
        self.auto_commit = true;
    }

    pub(crate) fn compile_dml(
        &mut self,
        statement: &Statement,
        params: &ParameterStore,
        allow_extended_mode: bool,
    ) -> SessionResult<TablePartWorker> {
        TablePartWorker::from_statement(
            statement,
            params,
            self.client.as_ref(),
            &mut self.key_cache,
            allow_extended_mode,
        )
    }

    fn transaction_control(&mut self, control: TransactionControl) -> SessionResult<()> {
        match control {
            TransactionControl::Begin => {
                if self.auto_commit {
                    self.auto_commit = false;
                    self.explicit_transaction = true;
                }
                self.session.begin()
            }
            TransactionControl::Commit => self.commit().map(|_| ()),
            TransactionControl::Rollback => self.rollback(),
            TransactionControl::Savepoint(name) => self.set_savepoint(Some(&name)).map(|_| ()),
            TransactionControl::ReleaseSavepoint(name) => {
                self.release_savepoint(&Savepoint::Named(name))
            }
            TransactionControl::RollbackToSavepoint(name) => {
                self.rollback_to_savepoint(&Savepoint::Named(name))
            }
        }
    }

    fn execute_ddl(&mut self, sql: &str, tables: &[String]) -> SessionResult<()> {
        if self.session.is_active() && !self.auto_commit {
            return Err(SessionError::unsupported(
                "DDL cannot run inside an open transaction",
            ));
        }
        self.client
            .execute_ddl(sql)
            .map_err(|err| SessionError::backend("execute DDL", err))?;
        for table in tables {
            if self.key_cache.invalidate(table) {
                debug!(table = %table, "invalidated key metadata after DDL");
            }
        }
        Ok(())
    }

    fn end_explicit_transaction(&mut self) {
        if self.explicit_transaction {
            self.explicit_transaction = false;
            self.auto_commit = true;
        }
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::unsupported("connection is closed"));
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed || !self.session.is_active() {
            return;
        }
        if let Err(err) = self.session.rollback() {
            warn!(error = %err, "rollback on connection drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDatabase, TableDefinition};
    use datafusion::common::ScalarValue;

    fn connection() -> (MemoryDatabase, Connection) {
        let db = MemoryDatabase::new();
        db.define_table(TableDefinition::new("Singers", ["SingerId"]));
        let conn = Connection::new(Arc::new(db.clone()), SessionConfig::default());
        (db, conn)
    }

    #[test]
    fn mode_follows_the_flags() -> SessionResult<()> {
        let (_db, mut conn) = connection();
        assert_eq!(conn.mode(), TransactionMode::ReadWrite);
        conn.set_read_only(true)?;
        assert_eq!(conn.mode(), TransactionMode::ReadOnly);
        conn.set_batch_read_only(true)?;
        assert_eq!(conn.mode(), TransactionMode::BatchReadOnly);
        conn.set_batch_read_only(false)?;
        assert_eq!(conn.mode(), TransactionMode::ReadOnly);
        Ok(())
    }

    #[test]
    fn savepoints_need_a_manual_transaction() {
        let (_db, mut conn) = connection();
        let err = conn.set_savepoint(None).unwrap_err();
        assert!(matches!(err, SessionError::SavepointNotAllowed { .. }));
    }

    #[test]
    fn explicit_begin_suspends_auto_commit_until_commit() -> SessionResult<()> {
        let (db, mut conn) = connection();
        let params = ParameterStore::new();
        conn.execute("BEGIN", &params)?;
        assert!(!conn.auto_commit());
        conn.execute("INSERT INTO Singers (SingerId) VALUES (1)", &params)?;
        assert!(db.commits().is_empty());
        conn.execute("COMMIT", &params)?;
        assert!(conn.auto_commit());
        assert_eq!(db.commits().len(), 1);
        Ok(())
    }

    #[test]
    fn read_only_connections_reject_writes() -> SessionResult<()> {
        let (_db, mut conn) = connection();
        conn.set_read_only(true)?;
        let err = conn
            .execute_update(
                "DELETE FROM Singers WHERE SingerId = $1",
                &ParameterStore::from_values([ScalarValue::Int64(Some(1))]),
            )
            .unwrap_err();
        assert!(matches!(err, SessionError::ReadOnlyMutation));
        Ok(())
    }

    #[test]
    fn ddl_invalidates_cached_keys() -> SessionResult<()> {
        let (db, mut conn) = connection();
        let params = ParameterStore::new();
        conn.execute_update("DELETE FROM Singers WHERE SingerId = 1", &params)?;
        db.define_table(TableDefinition::new("Singers", ["SingerId", "Region"]));
        conn.execute("ALTER TABLE Singers ADD COLUMN Region STRING", &params)?;
        assert_eq!(db.ddl_statements().len(), 1);

        // The old single-column key would have produced a point delete.
        db.script_query(
            "SELECT SingerId, Region FROM Singers WHERE SingerId = 1",
            ResultSet::empty(vec!["SingerId".to_string(), "Region".to_string()]),
        );
        assert_eq!(
            conn.execute_update("DELETE FROM Singers WHERE SingerId = 1", &params)?,
            0
        );
        Ok(())
    }

    #[test]
    fn explicit_invalidation_reloads_keys() -> SessionResult<()> {
        let (db, mut conn) = connection();
        let params = ParameterStore::new();
        conn.execute_update("DELETE FROM Singers WHERE SingerId = 1", &params)?;
        db.define_table(TableDefinition::new("Singers", ["SingerId", "Region"]));

        // Cached single-column key still routes to a point delete.
        conn.execute_update("DELETE FROM Singers WHERE SingerId = 2", &params)?;
        assert!(db.executed_queries().is_empty());

        conn.invalidate_table_metadata(Some("Singers"));
        db.script_query(
            "SELECT SingerId, Region FROM Singers WHERE SingerId = 3",
            ResultSet::empty(vec!["SingerId".to_string(), "Region".to_string()]),
        );
        assert_eq!(
            conn.execute_update("DELETE FROM Singers WHERE SingerId = 3", &params)?,
            0
        );
        assert_eq!(db.executed_queries().len(), 1);
        Ok(())
    }

    #[test]
    fn closed_connections_reject_statements() -> SessionResult<()> {
        let (_db, mut conn) = connection();
        conn.close()?;
        assert!(conn.execute("SELECT 1", &ParameterStore::new()).is_err());
        Ok(())
    }
}
