//! DML compiler.
//!
//! Statements that cannot be expressed as point mutations are rewritten into a
//! SELECT that produces one row per affected record; every row is then replayed
//! as a native mutation. Normal mode replays inside the caller's transaction.
//! Extended mode, when the caller allows it and the statement is large, replays
//! on a side connection and commits every `batch_size` rows, so a failure can
//! leave earlier batches committed.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use datafusion::common::ScalarValue;
use datafusion::sql::sqlparser::ast::{Expr as SqlExpr, Insert, SetExpr, Statement, TableFactor};
use tracing::{debug, info, warn};

use crate::backend::{QueryStatement, SchemaCatalog};
use crate::batch_size::{estimate_batch_size, BatchLimits};
use crate::connection::Connection;
use crate::error::{SessionError, SessionResult};
use crate::metadata::KeyMetadataCache;
use crate::mutation::{Key, Mutation};
use crate::params::{scalar_to_u64, ParameterStore};
use crate::session::TransactionMode;
use crate::statement::{
    assignment_column, delete_table, insert_columns, insert_table_name, load_key_metadata,
    mutation_target, parse_statement, InsertMode,
};

/// Per-statement behaviour of the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TablePartKind {
    InsertSelect {
        mode: InsertMode,
        columns: Vec<String>,
    },
    Update {
        key_columns: Vec<String>,
        update_columns: Vec<String>,
    },
    Delete {
        key_columns: Vec<String>,
    },
}

impl TablePartKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InsertSelect { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// Columns each replayed mutation writes, as counted against the commit ceiling.
    fn value_columns(&self) -> usize {
        match self {
            Self::InsertSelect { columns, .. } => columns.len(),
            Self::Update {
                key_columns,
                update_columns,
            } => key_columns.len() + update_columns.len(),
            Self::Delete { .. } => 1,
        }
    }

    fn row_width(&self) -> usize {
        match self {
            Self::InsertSelect { columns, .. } => columns.len(),
            Self::Update {
                key_columns,
                update_columns,
            } => key_columns.len() + update_columns.len(),
            Self::Delete { key_columns } => key_columns.len(),
        }
    }

    /// Binds one SELECT row positionally into a native mutation.
    fn mutation_for_row(&self, table: &str, row: Vec<ScalarValue>) -> SessionResult<Mutation> {
        if row.len() != self.row_width() {
            return Err(SessionError::unsupported(format!(
                "{} on {table} selected {} columns per row, expected {}",
                self.as_str(),
                row.len(),
                self.row_width()
            )));
        }
        let mutation = match self {
            Self::InsertSelect { mode, columns } => columns
                .iter()
                .zip(row)
                .fold(mode.builder(table), |builder, (column, value)| {
                    builder.set(column.clone(), value)
                })
                .build(),
            Self::Update {
                key_columns,
                update_columns,
            } => key_columns
                .iter()
                .chain(update_columns)
                .zip(row)
                .fold(Mutation::new_update_builder(table), |builder, (column, value)| {
                    builder.set(column.clone(), value)
                })
                .build(),
            Self::Delete { .. } => Mutation::delete(table, Key(row)),
        };
        Ok(mutation)
    }
}

/// Outcome of one compiled statement. Failures are carried, never thrown.
#[derive(Debug)]
pub struct ConversionResult {
    /// Rows produced by the rewritten SELECT.
    pub record_count: u64,
    /// Rows whose mutations are known to be committed.
    pub committed_rows: u64,
    pub elapsed: Duration,
    pub extended_mode: bool,
    pub error: Option<SessionError>,
}

impl ConversionResult {
    fn failed(error: SessionError) -> Self {
        Self {
            record_count: 0,
            committed_rows: 0,
            elapsed: Duration::ZERO,
            extended_mode: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Affected row count, or the error; failures after commits become
    /// [`SessionError::PartialCommit`].
    pub fn into_result(self) -> SessionResult<u64> {
        match self.error {
            None => Ok(self.record_count),
            Some(error) if self.committed_rows > 0 => Err(SessionError::PartialCommit {
                committed_rows: self.committed_rows,
                source: Box::new(error),
            }),
            Some(error) => Err(error),
        }
    }
}

/// One compiled INSERT ... SELECT, UPDATE or DELETE.
#[derive(Debug, Clone)]
pub struct TablePartWorker {
    table: String,
    kind: TablePartKind,
    select_sql: String,
    params: Vec<ScalarValue>,
    allow_extended_mode: bool,
    estimated_record_count: Option<u64>,
}

impl TablePartWorker {
    /// Validates `statement` and rewrites it into its row-producing SELECT.
    pub fn from_statement<C>(
        statement: &Statement,
        params: &ParameterStore,
        catalog: &C,
        keys: &mut KeyMetadataCache,
        allow_extended_mode: bool,
    ) -> SessionResult<Self>
    where
        C: SchemaCatalog + ?Sized,
    {
        let (table, kind, select_sql) = match statement {
            Statement::Insert(insert) => insert_select(insert, catalog, keys)?,
            Statement::Update {
                table,
                assignments,
                from,
                selection,
                returning,
                ..
            } => {
                if from.is_some() {
                    return Err(SessionError::unsupported("UPDATE ... FROM is not supported"));
                }
                if returning.is_some() {
                    return Err(SessionError::unsupported("RETURNING is not supported"));
                }
                let target = mutation_target(table, "UPDATE")?;
                let metadata = load_key_metadata(keys, catalog, &target.name)?;
                let update_columns = assignments
                    .iter()
                    .map(|assignment| assignment_column(&assignment.target))
                    .collect::<SessionResult<Vec<_>>>()?;
                let key_updates = update_columns
                    .iter()
                    .filter(|column| metadata.is_key_column(column))
                    .cloned()
                    .collect::<Vec<_>>();
                if !key_updates.is_empty() {
                    return Err(SessionError::PrimaryKeyUpdate {
                        columns: key_updates,
                    });
                }

                let alias = relation_alias(target.relation);
                let mut projection = qualified_columns(alias.as_deref(), &metadata.key_columns);
                projection.extend(
                    assignments
                        .iter()
                        .map(|assignment| assignment.value.to_string()),
                );
                let select_sql = select_sql(&projection, target.relation, selection.as_ref());
                let kind = TablePartKind::Update {
                    key_columns: metadata.key_columns.clone(),
                    update_columns,
                };
                (target.name, kind, select_sql)
            }
            Statement::Delete(delete) => {
                if delete.returning.is_some() {
                    return Err(SessionError::unsupported("RETURNING is not supported"));
                }
                let target = mutation_target(delete_table(&delete.from)?, "DELETE")?;
                let metadata = load_key_metadata(keys, catalog, &target.name)?;
                let alias = relation_alias(target.relation);
                let projection = qualified_columns(alias.as_deref(), &metadata.key_columns);
                let select_sql =
                    select_sql(&projection, target.relation, delete.selection.as_ref());
                let kind = TablePartKind::Delete {
                    key_columns: metadata.key_columns.clone(),
                };
                (target.name, kind, select_sql)
            }
            _ => {
                return Err(SessionError::unsupported(
                    "only INSERT ... SELECT, UPDATE and DELETE can be compiled to mutations",
                ))
            }
        };

        debug!(
            table = %table,
            kind = kind.as_str(),
            select = %select_sql,
            "compiled DML statement"
        );
        Ok(Self {
            table,
            kind,
            select_sql,
            params: params.to_values()?,
            allow_extended_mode,
            estimated_record_count: None,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn kind(&self) -> &TablePartKind {
        &self.kind
    }

    /// The rewritten row-producing SELECT.
    pub fn select_sql(&self) -> &str {
        &self.select_sql
    }

    pub fn allow_extended_mode(&self) -> bool {
        self.allow_extended_mode
    }

    /// Counts the rows the statement touches; the count query runs once.
    pub fn estimated_record_count(&mut self, conn: &mut Connection) -> SessionResult<u64> {
        if let Some(count) = self.estimated_record_count {
            return Ok(count);
        }
        let statement = QueryStatement::with_params(
            format!("SELECT COUNT(*) FROM ({}) Q", self.select_sql),
            self.params.clone(),
        );
        let rows = conn.run_query(&statement)?;
        let count = rows.first_value().and_then(scalar_to_u64).ok_or_else(|| {
            SessionError::backend(
                "estimate record count",
                anyhow!("COUNT(*) for {} returned no row count", self.table),
            )
        })?;
        self.estimated_record_count = Some(count);
        Ok(count)
    }

    /// Rows per commit for this statement's table.
    pub fn batch_size(&self, conn: &Connection) -> SessionResult<usize> {
        let catalog = conn.client();
        let columns = catalog
            .column_metadata(&self.table)
            .map_err(|err| SessionError::backend("load column metadata", err))?;
        let index_count = catalog
            .index_count(&self.table)
            .map_err(|err| SessionError::backend("load index count", err))?;
        Ok(estimate_batch_size(
            self.kind.value_columns(),
            &columns,
            index_count,
            BatchLimits::from(conn.config()),
        ))
    }

    /// Executes the statement; the outcome, including any error, is in the result.
    pub fn run(&mut self, conn: &mut Connection) -> ConversionResult {
        if conn.mode() != TransactionMode::ReadWrite {
            return ConversionResult::failed(SessionError::ReadOnlyMutation);
        }
        let started = Instant::now();
        let mut result = ConversionResult {
            record_count: 0,
            committed_rows: 0,
            elapsed: Duration::ZERO,
            extended_mode: false,
            error: None,
        };
        match self.extended_batch_size(conn) {
            Ok(Some(batch_size)) => {
                result.extended_mode = true;
                self.run_extended(conn, batch_size, &mut result);
            }
            Ok(None) => self.run_normal(conn, &mut result),
            Err(err) => result.error = Some(err),
        }
        result.elapsed = started.elapsed();
        result
    }

    /// Batch size when extended mode applies, `None` for normal mode.
    fn extended_batch_size(&mut self, conn: &mut Connection) -> SessionResult<Option<usize>> {
        if !self.allow_extended_mode {
            return Ok(None);
        }
        let batch_size = self.batch_size(conn)?;
        let estimate = self.estimated_record_count(conn)?;
        if estimate < batch_size as u64 {
            debug!(table = %self.table, estimate, batch_size, "staying in normal mode");
            return Ok(None);
        }
        info!(
            table = %self.table,
            estimate,
            batch_size,
            "switching to extended mode; batches commit independently"
        );
        Ok(Some(batch_size))
    }

    fn select_statement(&self) -> QueryStatement {
        QueryStatement::with_params(self.select_sql.clone(), self.params.clone())
    }

    fn run_normal(&self, conn: &mut Connection, result: &mut ConversionResult) {
        let restore_auto_commit = conn.auto_commit();
        if restore_auto_commit {
            if let Err(err) = conn.set_auto_commit(false) {
                result.error = Some(err);
                return;
            }
        }

        match self.replay_in_transaction(conn) {
            Ok(rows) => {
                result.record_count = rows;
                if restore_auto_commit {
                    match conn.set_auto_commit(true) {
                        Ok(()) => result.committed_rows = rows,
                        Err(err) => result.error = Some(err),
                    }
                }
            }
            Err(err) => {
                if let Err(rollback_err) = conn.rollback() {
                    warn!(
                        table = %self.table,
                        error = %rollback_err,
                        "rollback after failed DML also failed"
                    );
                }
                if restore_auto_commit {
                    conn.restore_auto_commit_flag();
                }
                result.error = Some(err);
            }
        }
    }

    fn replay_in_transaction(&self, conn: &mut Connection) -> SessionResult<u64> {
        let rows = conn.query_in_transaction(&self.select_statement())?;
        let mutations = rows
            .into_rows()
            .into_iter()
            .map(|row| self.kind.mutation_for_row(&self.table, row))
            .collect::<SessionResult<Vec<_>>>()?;
        let count = mutations.len() as u64;
        conn.buffer_in_transaction(mutations)?;
        debug!(
            table = %self.table,
            rows = count,
            kind = self.kind.as_str(),
            "replayed rows in enclosing transaction"
        );
        Ok(count)
    }

    fn run_extended(&self, conn: &Connection, batch_size: usize, result: &mut ConversionResult) {
        // Dropping the side connection rolls back whatever it has not committed.
        let mut side = conn.open_side_connection();
        let rows = match side.query_in_transaction(&self.select_statement()) {
            Ok(rows) => rows,
            Err(err) => {
                result.error = Some(err);
                return;
            }
        };
        result.record_count = rows.len() as u64;

        let batch_size = batch_size.max(1) as u64;
        let mut pending = 0u64;
        for row in rows.into_rows() {
            let buffered = self
                .kind
                .mutation_for_row(&self.table, row)
                .and_then(|mutation| side.buffer_in_transaction(vec![mutation]));
            if let Err(err) = buffered {
                result.error = Some(err);
                return;
            }
            pending += 1;
            if pending == batch_size {
                if let Err(err) = side.commit() {
                    result.error = Some(err);
                    return;
                }
                result.committed_rows += pending;
                pending = 0;
                info!(
                    table = %self.table,
                    rows = result.committed_rows,
                    batch_size,
                    "committed extended-mode batch"
                );
            }
        }
        match side.commit() {
            Ok(_) => result.committed_rows += pending,
            Err(err) => result.error = Some(err),
        }
    }
}

/// Compiles and runs one statement through the DML compiler.
pub fn run_dml(
    conn: &mut Connection,
    sql: &str,
    params: &ParameterStore,
    allow_extended_mode: bool,
) -> ConversionResult {
    let worker = parse_statement(sql)
        .and_then(|statement| conn.compile_dml(&statement, params, allow_extended_mode));
    match worker {
        Ok(mut worker) => worker.run(conn),
        Err(err) => ConversionResult::failed(err),
    }
}

fn insert_select<C>(
    insert: &Insert,
    catalog: &C,
    keys: &mut KeyMetadataCache,
) -> SessionResult<(String, TablePartKind, String)>
where
    C: SchemaCatalog + ?Sized,
{
    if insert.returning.is_some() {
        return Err(SessionError::unsupported("RETURNING is not supported"));
    }
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SessionError::unsupported("INSERT source is required"))?;
    if matches!(source.body.as_ref(), SetExpr::Values(_)) {
        return Err(SessionError::unsupported(
            "INSERT ... VALUES is executed as point mutations",
        ));
    }
    let table = insert_table_name(&insert.table)?;
    let columns = insert_columns(insert, catalog, &table)?;
    let mode = InsertMode::of(insert, &columns, || load_key_metadata(keys, catalog, &table))?;
    let kind = TablePartKind::InsertSelect { mode, columns };
    Ok((table, kind, source.to_string()))
}

fn relation_alias(relation: &TableFactor) -> Option<String> {
    match relation {
        TableFactor::Table { alias, .. } => alias.as_ref().map(|alias| alias.name.to_string()),
        _ => None,
    }
}

fn qualified_columns(alias: Option<&str>, columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|column| match alias {
            Some(alias) => format!("{alias}.{column}"),
            None => column.clone(),
        })
        .collect()
}

fn select_sql(
    projection: &[String],
    relation: &TableFactor,
    selection: Option<&SqlExpr>,
) -> String {
    let mut sql = format!("SELECT {} FROM {relation}", projection.join(", "));
    if let Some(selection) = selection {
        let _ = write!(sql, " WHERE {selection}");
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::memory::{MemoryDatabase, TableDefinition};
    use crate::metadata::{ColumnMetadata, ColumnType};

    fn catalog() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        db.define_table(TableDefinition::new("T", ["pk"]).with_columns(vec![
            ColumnMetadata::new("pk", ColumnType::Int64),
            ColumnMetadata::new("a", ColumnType::Int64),
        ]));
        db.define_table(TableDefinition::new("Orders", ["Region", "OrderId"]));
        db
    }

    fn compile(sql: &str) -> SessionResult<TablePartWorker> {
        let db = catalog();
        let mut keys = KeyMetadataCache::new();
        TablePartWorker::from_statement(
            &parse_statement(sql)?,
            &ParameterStore::from_values([ScalarValue::Int64(Some(10))]),
            &db,
            &mut keys,
            false,
        )
    }

    #[test]
    fn delete_selects_bare_key_columns() -> SessionResult<()> {
        let worker = compile("DELETE FROM T WHERE pk IN (1,2)")?;
        assert_eq!(worker.select_sql(), "SELECT pk FROM T WHERE pk IN (1, 2)");
        assert_eq!(worker.kind().as_str(), "delete");
        Ok(())
    }

    #[test]
    fn update_selects_keys_then_new_values_with_alias() -> SessionResult<()> {
        let worker = compile("UPDATE Orders AS o SET Total = o.Total * 2 WHERE o.Total > $1")?;
        assert_eq!(
            worker.select_sql(),
            "SELECT o.Region, o.OrderId, o.Total * 2 FROM Orders AS o WHERE o.Total > $1"
        );
        assert_eq!(
            worker.kind(),
            &TablePartKind::Update {
                key_columns: vec!["Region".to_string(), "OrderId".to_string()],
                update_columns: vec!["Total".to_string()],
            }
        );
        Ok(())
    }

    #[test]
    fn insert_select_uses_the_source_query() -> SessionResult<()> {
        let worker = compile("INSERT INTO T (pk, a) SELECT pk + 100, a FROM T WHERE a > 0")?;
        assert_eq!(worker.select_sql(), "SELECT pk + 100, a FROM T WHERE a > 0");
        assert_eq!(worker.table(), "T");
        Ok(())
    }

    #[test]
    fn key_column_updates_list_every_offender() {
        let err = compile("UPDATE Orders SET region = 'eu', OrderId = 1, Total = 0 WHERE Total > 5")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "primary key columns may not be updated: region, OrderId"
        );
    }

    #[test]
    fn rows_bind_positionally_and_reject_width_mismatches() -> SessionResult<()> {
        let kind = TablePartKind::Update {
            key_columns: vec!["pk".to_string()],
            update_columns: vec!["a".to_string()],
        };
        let mutation = kind.mutation_for_row(
            "T",
            vec![ScalarValue::Int64(Some(1)), ScalarValue::Int64(Some(9))],
        )?;
        assert_eq!(mutation.value("a"), Some(&ScalarValue::Int64(Some(9))));
        assert!(kind
            .mutation_for_row("T", vec![ScalarValue::Int64(Some(1))])
            .is_err());
        Ok(())
    }

    #[test]
    fn secondary_indexes_shrink_the_batch() -> SessionResult<()> {
        let db = catalog();
        let columns = vec![
            ColumnMetadata::new("pk", ColumnType::Int64),
            ColumnMetadata::new("v", ColumnType::Int64),
        ];
        db.define_table(TableDefinition::new("Plain", ["pk"]).with_columns(columns.clone()));
        db.define_table(
            TableDefinition::new("Indexed", ["pk"])
                .with_columns(columns)
                .with_index_count(3),
        );
        let config = SessionConfig {
            max_mutations_per_commit: 100,
            min_batch_size: 1,
            ..SessionConfig::default()
        };
        let conn = Connection::new(std::sync::Arc::new(db.clone()), config);

        let mut keys = KeyMetadataCache::new();
        let mut batch_size = |sql: &str| -> SessionResult<usize> {
            TablePartWorker::from_statement(
                &parse_statement(sql)?,
                &ParameterStore::new(),
                &db,
                &mut keys,
                true,
            )?
            .batch_size(&conn)
        };
        assert_eq!(batch_size("UPDATE Plain SET v = v + 1 WHERE v > 0")?, 50);
        assert_eq!(batch_size("UPDATE Indexed SET v = v + 1 WHERE v > 0")?, 20);
        Ok(())
    }

    #[test]
    fn failures_after_commits_become_partial_commits() {
        let result = ConversionResult {
            record_count: 500,
            committed_rows: 200,
            elapsed: Duration::ZERO,
            extended_mode: true,
            error: Some(SessionError::unsupported("boom")),
        };
        let err = result.into_result().unwrap_err();
        assert!(err.is_partial_commit());
        assert!(ConversionResult::failed(SessionError::unsupported("early"))
            .into_result()
            .is_err_and(|err| !err.is_partial_commit()));
    }
}
