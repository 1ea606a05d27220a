//! Statement planning.
//!
//! Every statement is parsed once and routed to exactly one execution path:
//! a passthrough query, a list of point mutations, the DML compiler, a
//! transaction-control action, or a schema change.

use std::sync::Arc;

use datafusion::sql::sqlparser::ast::{
    Assignment, AssignmentTarget, Expr as SqlExpr, FromTable, FunctionArg, FunctionArgExpr,
    FunctionArguments, Insert, ObjectName, OnInsert, SetExpr, Statement, TableFactor, TableObject,
    TableWithJoins,
};
use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::parser::Parser;
use tracing::debug;

use crate::backend::{QueryStatement, SchemaCatalog};
use crate::dml::TablePartWorker;
use crate::error::{SessionError, SessionResult};
use crate::metadata::{KeyMetadataCache, TableKeyMetadata};
use crate::mutation::{Key, Mutation, MutationBuilder};
use crate::params::{normalize_placeholders, resolve_literal, ParameterStore};
use crate::predicates::extract_key_predicate;

/// Write flavour of an INSERT statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Insert,
    InsertOrUpdate,
    Replace,
}

impl InsertMode {
    /// Maps the INSERT flavour onto a mutation op.
    ///
    /// `ON DUPLICATE KEY UPDATE` is accepted only when it overwrites every
    /// inserted non-key column with its inserted value (`c = VALUES(c)`); the
    /// key metadata is loaded only for that case.
    pub(crate) fn of<F>(insert: &Insert, columns: &[String], key_metadata: F) -> SessionResult<Self>
    where
        F: FnOnce() -> SessionResult<Arc<TableKeyMetadata>>,
    {
        if insert.replace_into {
            return Ok(Self::Replace);
        }
        match &insert.on {
            None => Ok(Self::Insert),
            Some(OnInsert::DuplicateKeyUpdate(assignments)) => {
                let assigned = assignments
                    .iter()
                    .map(overwritten_column)
                    .collect::<SessionResult<Vec<_>>>()?;
                if let Some(column) = assigned
                    .iter()
                    .find(|column| !columns.iter().any(|c| c.eq_ignore_ascii_case(column)))
                {
                    return Err(SessionError::unsupported(format!(
                        "ON DUPLICATE KEY UPDATE assigns {column}, which the INSERT does not write"
                    )));
                }
                let metadata = key_metadata()?;
                let missing = columns
                    .iter()
                    .filter(|column| !metadata.is_key_column(column))
                    .filter(|column| !assigned.iter().any(|a| a.eq_ignore_ascii_case(column)))
                    .cloned()
                    .collect::<Vec<_>>();
                if !missing.is_empty() {
                    return Err(SessionError::unsupported(format!(
                        "ON DUPLICATE KEY UPDATE must overwrite every inserted column, missing {}",
                        missing.join(", ")
                    )));
                }
                Ok(Self::InsertOrUpdate)
            }
            Some(OnInsert::OnConflict(_)) => Err(SessionError::unsupported(
                "INSERT ... ON CONFLICT is not supported",
            )),
            Some(other) => Err(SessionError::unsupported(format!(
                "unsupported INSERT clause: {other}"
            ))),
        }
    }

    pub fn builder(self, table: &str) -> MutationBuilder {
        match self {
            Self::Insert => Mutation::new_insert_builder(table),
            Self::InsertOrUpdate => Mutation::new_insert_or_update_builder(table),
            Self::Replace => Mutation::new_replace_builder(table),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionControl {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    ReleaseSavepoint(String),
    RollbackToSavepoint(String),
}

/// Execution path chosen for one statement.
pub enum PlannedStatement {
    Query(QueryStatement),
    Mutations(Vec<Mutation>),
    Dml(Box<TablePartWorker>),
    Transaction(TransactionControl),
    Ddl { sql: String, tables: Vec<String> },
}

/// Target table of an UPDATE or DELETE.
pub(crate) struct MutationTarget<'a> {
    pub name: String,
    pub relation: &'a TableFactor,
}

/// Parses exactly one statement, normalizing `?` placeholders to `$n` first.
pub fn parse_statement(sql: &str) -> SessionResult<Statement> {
    let dialect = GenericDialect {};
    let normalized = normalize_placeholders(&dialect, sql)?;
    let mut statements = Parser::parse_sql(&dialect, &normalized)
        .map_err(|err| SessionError::Parse(err.to_string()))?;
    match statements.len() {
        0 => Err(SessionError::Parse("empty statement".to_string())),
        1 => Ok(statements.remove(0)),
        count => Err(SessionError::unsupported(format!(
            "expected a single statement, found {count}"
        ))),
    }
}

/// Routes `statement` to its execution path.
pub fn plan_statement<C>(
    statement: &Statement,
    params: &ParameterStore,
    catalog: &C,
    keys: &mut KeyMetadataCache,
    allow_extended_mode: bool,
) -> SessionResult<PlannedStatement>
where
    C: SchemaCatalog + ?Sized,
{
    let planned = match statement {
        Statement::Query(query) => PlannedStatement::Query(QueryStatement::with_params(
            query.to_string(),
            params.to_values()?,
        )),
        Statement::Insert(insert) => {
            plan_insert(statement, insert, params, catalog, keys, allow_extended_mode)?
        }
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
            let columns = assignments
                .iter()
                .map(|assignment| assignment_column(&assignment.target))
                .collect::<SessionResult<Vec<_>>>()?;
            let values = assignments
                .iter()
                .map(|assignment| &assignment.value)
                .collect::<Vec<_>>();
            let point = point_update(
                &target.name,
                &metadata,
                &columns,
                &values,
                selection.as_ref(),
                params,
            )?;
            match point {
                Some(mutation) => PlannedStatement::Mutations(vec![mutation]),
                None => compile(statement, params, catalog, keys, allow_extended_mode)?,
            }
        }
        Statement::Delete(delete) => {
            if delete.returning.is_some() {
                return Err(SessionError::unsupported("RETURNING is not supported"));
            }
            if delete.using.is_some() {
                return Err(SessionError::unsupported("DELETE ... USING is not supported"));
            }
            let target = mutation_target(delete_table(&delete.from)?, "DELETE")?;
            let metadata = load_key_metadata(keys, catalog, &target.name)?;
            match point_delete(&target.name, &metadata, delete.selection.as_ref(), params)? {
                Some(mutation) => PlannedStatement::Mutations(vec![mutation]),
                None => compile(statement, params, catalog, keys, allow_extended_mode)?,
            }
        }
        Statement::StartTransaction { .. } => {
            PlannedStatement::Transaction(TransactionControl::Begin)
        }
        Statement::Commit { .. } => PlannedStatement::Transaction(TransactionControl::Commit),
        Statement::Rollback {
            savepoint: Some(name),
            ..
        } => PlannedStatement::Transaction(TransactionControl::RollbackToSavepoint(
            name.value.clone(),
        )),
        Statement::Rollback { .. } => PlannedStatement::Transaction(TransactionControl::Rollback),
        Statement::Savepoint { name } => {
            PlannedStatement::Transaction(TransactionControl::Savepoint(name.value.clone()))
        }
        Statement::ReleaseSavepoint { name } => PlannedStatement::Transaction(
            TransactionControl::ReleaseSavepoint(name.value.clone()),
        ),
        Statement::CreateTable(create) => PlannedStatement::Ddl {
            sql: statement.to_string(),
            tables: vec![object_name_leaf(&create.name)?],
        },
        Statement::CreateIndex(index) => PlannedStatement::Ddl {
            sql: statement.to_string(),
            tables: vec![object_name_leaf(&index.table_name)?],
        },
        Statement::AlterTable { name, .. } => PlannedStatement::Ddl {
            sql: statement.to_string(),
            tables: vec![object_name_leaf(name)?],
        },
        Statement::Drop { names, .. } => PlannedStatement::Ddl {
            sql: statement.to_string(),
            tables: names
                .iter()
                .map(object_name_leaf)
                .collect::<SessionResult<Vec<_>>>()?,
        },
        other => {
            return Err(SessionError::unsupported(format!(
                "unsupported statement: {}",
                statement_kind(other)
            )))
        }
    };
    debug!(
        kind = statement_kind(statement),
        route = planned.route(),
        "planned statement"
    );
    Ok(planned)
}

impl PlannedStatement {
    fn route(&self) -> &'static str {
        match self {
            Self::Query(_) => "query",
            Self::Mutations(_) => "point_mutations",
            Self::Dml(_) => "dml_compiler",
            Self::Transaction(_) => "transaction_control",
            Self::Ddl { .. } => "ddl",
        }
    }
}

fn compile<C>(
    statement: &Statement,
    params: &ParameterStore,
    catalog: &C,
    keys: &mut KeyMetadataCache,
    allow_extended_mode: bool,
) -> SessionResult<PlannedStatement>
where
    C: SchemaCatalog + ?Sized,
{
    let worker =
        TablePartWorker::from_statement(statement, params, catalog, keys, allow_extended_mode)?;
    Ok(PlannedStatement::Dml(Box::new(worker)))
}

fn plan_insert<C>(
    statement: &Statement,
    insert: &Insert,
    params: &ParameterStore,
    catalog: &C,
    keys: &mut KeyMetadataCache,
    allow_extended_mode: bool,
) -> SessionResult<PlannedStatement>
where
    C: SchemaCatalog + ?Sized,
{
    if insert.returning.is_some() {
        return Err(SessionError::unsupported("RETURNING is not supported"));
    }
    if !insert.assignments.is_empty() {
        return Err(SessionError::unsupported("INSERT ... SET syntax is not supported"));
    }
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SessionError::unsupported("INSERT source is required"))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return compile(statement, params, catalog, keys, allow_extended_mode);
    };

    let table = insert_table_name(&insert.table)?;
    let columns = insert_columns(insert, catalog, &table)?;
    let mode = InsertMode::of(insert, &columns, || load_key_metadata(keys, catalog, &table))?;
    let mut mutations = Vec::with_capacity(values.rows.len());
    for row in &values.rows {
        if row.len() != columns.len() {
            return Err(SessionError::InvalidParameter(format!(
                "INSERT row has {} values for {} columns",
                row.len(),
                columns.len()
            )));
        }
        let mut builder = mode.builder(&table);
        for (column, expr) in columns.iter().zip(row) {
            let value = resolve_literal(expr, params)?.ok_or_else(|| {
                SessionError::unsupported(format!(
                    "INSERT ... VALUES accepts only literals and parameters, found {expr}"
                ))
            })?;
            builder = builder.set(column.clone(), value);
        }
        mutations.push(builder.build());
    }
    Ok(PlannedStatement::Mutations(mutations))
}

/// Single update mutation when the WHERE clause names exactly one full key.
fn point_update(
    table: &str,
    metadata: &TableKeyMetadata,
    columns: &[String],
    values: &[&SqlExpr],
    selection: Option<&SqlExpr>,
    params: &ParameterStore,
) -> SessionResult<Option<Mutation>> {
    // Key updates are rejected by the compiler with the full column list.
    if columns.iter().any(|column| metadata.is_key_column(column)) {
        return Ok(None);
    }
    let Some(key) = point_key(metadata, selection, params)? else {
        return Ok(None);
    };
    let mut builder = Mutation::new_update_builder(table);
    for (column, value) in metadata.key_columns.iter().zip(key.0) {
        builder = builder.set(column.clone(), value);
    }
    for (column, expr) in columns.iter().zip(values) {
        let Some(value) = resolve_literal(expr, params)? else {
            return Ok(None);
        };
        builder = builder.set(column.clone(), value);
    }
    Ok(Some(builder.build()))
}

fn point_delete(
    table: &str,
    metadata: &TableKeyMetadata,
    selection: Option<&SqlExpr>,
    params: &ParameterStore,
) -> SessionResult<Option<Mutation>> {
    Ok(point_key(metadata, selection, params)?.map(|key| Mutation::delete(table, key)))
}

fn point_key(
    metadata: &TableKeyMetadata,
    selection: Option<&SqlExpr>,
    params: &ParameterStore,
) -> SessionResult<Option<Key>> {
    let Some(selection) = selection else {
        return Ok(None);
    };
    let predicate = extract_key_predicate(selection, params)?;
    Ok(predicate.key_values(&metadata.key_columns).map(Key))
}

pub(crate) fn load_key_metadata<C>(
    keys: &mut KeyMetadataCache,
    catalog: &C,
    table: &str,
) -> SessionResult<Arc<TableKeyMetadata>>
where
    C: SchemaCatalog + ?Sized,
{
    keys.get_or_load(catalog, table)
        .map_err(|err| SessionError::backend("load table key metadata", err))
}

/// Columns written by an INSERT, falling back to the catalog's column order.
pub(crate) fn insert_columns<C>(
    insert: &Insert,
    catalog: &C,
    table: &str,
) -> SessionResult<Vec<String>>
where
    C: SchemaCatalog + ?Sized,
{
    if !insert.columns.is_empty() {
        return Ok(insert
            .columns
            .iter()
            .map(|ident| ident.value.clone())
            .collect());
    }
    let columns = catalog
        .column_metadata(table)
        .map_err(|err| SessionError::backend("load column metadata", err))?;
    if columns.is_empty() {
        return Err(SessionError::unsupported(format!(
            "INSERT into {table} needs an explicit column list"
        )));
    }
    Ok(columns.into_iter().map(|column| column.name).collect())
}

pub(crate) fn delete_table(from: &FromTable) -> SessionResult<&TableWithJoins> {
    let tables = match from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    if tables.len() != 1 {
        return Err(SessionError::unsupported(
            "DELETE supports exactly one target table",
        ));
    }
    Ok(&tables[0])
}

pub(crate) fn mutation_target<'a>(
    table: &'a TableWithJoins,
    statement_kind: &str,
) -> SessionResult<MutationTarget<'a>> {
    if !table.joins.is_empty() {
        return Err(SessionError::unsupported(format!(
            "joins are not supported in {statement_kind}"
        )));
    }
    let TableFactor::Table { name, .. } = &table.relation else {
        return Err(SessionError::unsupported(format!(
            "only base tables are supported in {statement_kind}"
        )));
    };
    Ok(MutationTarget {
        name: object_name_leaf(name)?,
        relation: &table.relation,
    })
}

pub(crate) fn assignment_column(target: &AssignmentTarget) -> SessionResult<String> {
    let AssignmentTarget::ColumnName(column) = target else {
        return Err(SessionError::unsupported(
            "tuple assignments are not supported in UPDATE",
        ));
    };
    object_name_leaf(column)
}

/// Column of an upsert assignment of the form `c = VALUES(c)`.
fn overwritten_column(assignment: &Assignment) -> SessionResult<String> {
    let column = assignment_column(&assignment.target)?;
    let overwrites = match &assignment.value {
        SqlExpr::Function(function) => {
            let is_values = object_name_leaf(&function.name)
                .is_ok_and(|name| name.eq_ignore_ascii_case("VALUES"));
            let FunctionArguments::List(list) = &function.args else {
                return Err(upsert_assignment_unsupported(assignment));
            };
            is_values
                && matches!(
                    list.args.as_slice(),
                    [FunctionArg::Unnamed(FunctionArgExpr::Expr(SqlExpr::Identifier(ident)))]
                        if ident.value.eq_ignore_ascii_case(&column)
                )
        }
        _ => false,
    };
    if !overwrites {
        return Err(upsert_assignment_unsupported(assignment));
    }
    Ok(column)
}

fn upsert_assignment_unsupported(assignment: &Assignment) -> SessionError {
    SessionError::unsupported(format!(
        "ON DUPLICATE KEY UPDATE only supports `column = VALUES(column)`, found {assignment}"
    ))
}

pub(crate) fn object_name_leaf(name: &ObjectName) -> SessionResult<String> {
    name.0
        .last()
        .and_then(|part| part.as_ident())
        .map(|ident| ident.value.clone())
        .ok_or_else(|| SessionError::Parse(format!("invalid object name: {name}")))
}

pub(crate) fn insert_table_name(table: &TableObject) -> SessionResult<String> {
    match table {
        TableObject::TableName(name) => object_name_leaf(name),
        TableObject::TableFunction(_) => Err(SessionError::unsupported(
            "table functions are not supported as INSERT targets",
        )),
    }
}

pub(crate) fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::StartTransaction { .. } => "BEGIN",
        Statement::Commit { .. } => "COMMIT",
        Statement::Rollback { .. } => "ROLLBACK",
        Statement::Savepoint { .. } => "SAVEPOINT",
        Statement::ReleaseSavepoint { .. } => "RELEASE_SAVEPOINT",
        Statement::CreateTable(_) => "CREATE_TABLE",
        Statement::CreateIndex(_) => "CREATE_INDEX",
        Statement::AlterTable { .. } => "ALTER_TABLE",
        Statement::Drop { .. } => "DROP",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        Statement::Insert(_) => "INSERT",
        Statement::Explain { .. } => "EXPLAIN",
        Statement::Query(_) => "QUERY",
        _ => "OTHER",
    }
}
