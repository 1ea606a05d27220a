//! Backend-native row mutations.

use std::fmt;

use datafusion::common::ScalarValue;

/// Kind of row-level change carried by a [`Mutation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOp {
    Insert,
    Update,
    InsertOrUpdate,
    Replace,
    Delete,
}

impl MutationOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::InsertOrUpdate => "insert_or_update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        }
    }
}

/// Ordered primary-key values identifying one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(pub Vec<ScalarValue>);

impl Key {
    pub fn values(&self) -> &[ScalarValue] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, value) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str("]")
    }
}

/// Immutable row-level change addressed by table name.
///
/// Write operations carry a column/value set; deletes carry a primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    table: String,
    op: MutationOp,
    columns: Vec<String>,
    values: Vec<ScalarValue>,
    key: Option<Key>,
}

impl Mutation {
    pub fn new_insert_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(table, MutationOp::Insert)
    }

    pub fn new_update_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(table, MutationOp::Update)
    }

    pub fn new_insert_or_update_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(table, MutationOp::InsertOrUpdate)
    }

    pub fn new_replace_builder(table: impl Into<String>) -> MutationBuilder {
        MutationBuilder::new(table, MutationOp::Replace)
    }

    pub fn delete(table: impl Into<String>, key: Key) -> Self {
        Self {
            table: table.into(),
            op: MutationOp::Delete,
            columns: Vec::new(),
            values: Vec::new(),
            key: Some(key),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn op(&self) -> MutationOp {
        self.op
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[ScalarValue] {
        &self.values
    }

    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Value written to `column`, matched case-insensitively.
    pub fn value(&self, column: &str) -> Option<&ScalarValue> {
        self.columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(column))
            .map(|idx| &self.values[idx])
    }

    /// Number of backend mutations this change counts against the commit ceiling.
    pub fn mutation_count(&self) -> usize {
        match self.op {
            MutationOp::Delete => 1,
            _ => self.columns.len().max(1),
        }
    }
}

/// Builder for write mutations.
#[derive(Debug, Clone)]
pub struct MutationBuilder {
    table: String,
    op: MutationOp,
    columns: Vec<String>,
    values: Vec<ScalarValue>,
}

impl MutationBuilder {
    fn new(table: impl Into<String>, op: MutationOp) -> Self {
        Self {
            table: table.into(),
            op,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Sets `column`, replacing an earlier value for the same column.
    pub fn set(mut self, column: impl Into<String>, value: ScalarValue) -> Self {
        let column = column.into();
        if let Some(idx) = self
            .columns
            .iter()
            .position(|name| name.eq_ignore_ascii_case(&column))
        {
            self.values[idx] = value;
        } else {
            self.columns.push(column);
            self.values.push(value);
        }
        self
    }

    pub fn build(self) -> Mutation {
        Mutation {
            table: self.table,
            op: self.op,
            columns: self.columns,
            values: self.values,
            key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overwrites_repeated_columns() {
        let mutation = Mutation::new_update_builder("Singers")
            .set("SingerId", ScalarValue::Int64(Some(1)))
            .set("Name", ScalarValue::Utf8(Some("a".to_string())))
            .set("name", ScalarValue::Utf8(Some("b".to_string())))
            .build();
        assert_eq!(mutation.columns().len(), 2);
        assert_eq!(
            mutation.value("NAME"),
            Some(&ScalarValue::Utf8(Some("b".to_string())))
        );
        assert_eq!(mutation.op(), MutationOp::Update);
    }

    #[test]
    fn delete_counts_as_single_mutation() {
        let mutation = Mutation::delete("Singers", Key(vec![ScalarValue::Int64(Some(7))]));
        assert_eq!(mutation.mutation_count(), 1);
        assert_eq!(mutation.key().map(ToString::to_string).as_deref(), Some("[7]"));
    }
}
