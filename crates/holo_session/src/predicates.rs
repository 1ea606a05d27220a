//! Key-predicate classification for WHERE clauses.
//!
//! A WHERE clause can be turned into a native key only when it is a single
//! equality or a chain of equalities joined by `AND`, each comparing a bare
//! column to a literal or placeholder. Anything else routes the statement to
//! the DML compiler instead.

use std::collections::BTreeMap;

use datafusion::common::ScalarValue;
use datafusion::sql::sqlparser::ast::{BinaryOperator, Expr as SqlExpr, Ident};

use crate::error::SessionResult;
use crate::params::{resolve_literal, ParameterStore};

/// Outcome of classifying a WHERE clause.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPredicate {
    /// Pure conjunction of equalities, keyed by normalized column name.
    Valid(BTreeMap<String, ScalarValue>),
    /// Not expressible as a simple key lookup.
    Invalid,
}

impl KeyPredicate {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    /// Column values when the predicate covers exactly `key_columns`.
    ///
    /// Returns the values in key order, or `None` when a key column is missing
    /// or the predicate constrains a non-key column.
    pub fn key_values(&self, key_columns: &[String]) -> Option<Vec<ScalarValue>> {
        let Self::Valid(columns) = self else {
            return None;
        };
        if key_columns.is_empty() || columns.len() != key_columns.len() {
            return None;
        }
        key_columns
            .iter()
            .map(|key| columns.get(&key.to_ascii_lowercase()).cloned())
            .collect()
    }
}

/// Walks `expr` and collects `column = value` terms until a poisoning node.
struct KeyExtractor<'a> {
    params: &'a ParameterStore,
    columns: BTreeMap<String, ScalarValue>,
    poisoned: bool,
}

impl<'a> KeyExtractor<'a> {
    fn visit(&mut self, expr: &SqlExpr) -> SessionResult<()> {
        // Poison is sticky: nothing after it can make the predicate valid again.
        if self.poisoned {
            return Ok(());
        }
        match expr {
            SqlExpr::BinaryOp { left, op, right } if *op == BinaryOperator::And => {
                self.visit(left)?;
                self.visit(right)
            }
            SqlExpr::BinaryOp { left, op, right } if *op == BinaryOperator::Eq => {
                let Some(column) = bare_column_name(left) else {
                    self.poisoned = true;
                    return Ok(());
                };
                let Some(value) = resolve_literal(right, self.params)? else {
                    self.poisoned = true;
                    return Ok(());
                };
                // A column compared twice cannot be a single key.
                if self.columns.insert(column, value).is_some() {
                    self.poisoned = true;
                }
                Ok(())
            }
            SqlExpr::Nested(inner) => self.visit(inner),
            _ => {
                self.poisoned = true;
                Ok(())
            }
        }
    }
}

/// Classifies `expr` as a key predicate, resolving placeholders from `params`.
pub fn extract_key_predicate(
    expr: &SqlExpr,
    params: &ParameterStore,
) -> SessionResult<KeyPredicate> {
    let mut extractor = KeyExtractor {
        params,
        columns: BTreeMap::new(),
        poisoned: false,
    };
    extractor.visit(expr)?;
    if extractor.poisoned || extractor.columns.is_empty() {
        return Ok(KeyPredicate::Invalid);
    }
    Ok(KeyPredicate::Valid(extractor.columns))
}

/// Column name for a bare or qualified identifier, normalized for lookup.
pub fn bare_column_name(expr: &SqlExpr) -> Option<String> {
    match expr {
        SqlExpr::Identifier(ident) => Some(normalize_ident(ident)),
        SqlExpr::CompoundIdentifier(idents) => idents.last().map(normalize_ident),
        SqlExpr::Nested(inner) => bare_column_name(inner),
        _ => None,
    }
}

/// Normalizes an identifier for case-insensitive catalog lookups.
pub fn normalize_ident(ident: &Ident) -> String {
    ident.value.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::sql::sqlparser::dialect::GenericDialect;
    use datafusion::sql::sqlparser::parser::Parser;

    fn where_clause(predicate: &str) -> SqlExpr {
        Parser::new(&GenericDialect {})
            .try_with_sql(predicate)
            .expect("tokenize predicate")
            .parse_expr()
            .expect("parse predicate")
    }

    fn classify(predicate: &str, params: &ParameterStore) -> KeyPredicate {
        extract_key_predicate(&where_clause(predicate), params).expect("classify")
    }

    #[test]
    fn conjunction_of_equalities_is_valid() {
        let params = ParameterStore::from_values([ScalarValue::Utf8(Some("eu".to_string()))]);
        let KeyPredicate::Valid(columns) = classify("id = 5 AND (Region = $1)", &params) else {
            panic!("expected valid predicate");
        };
        assert_eq!(columns.len(), 2);
        assert_eq!(columns["id"], ScalarValue::Int64(Some(5)));
        assert_eq!(columns["region"], ScalarValue::Utf8(Some("eu".to_string())));
    }

    #[test]
    fn qualified_columns_and_negative_literals_are_accepted() {
        let predicate = classify("t.id = -3", &ParameterStore::new());
        assert_eq!(
            predicate.key_values(&["ID".to_string()]),
            Some(vec![ScalarValue::Int64(Some(-3))])
        );
    }

    #[test]
    fn any_non_equality_node_poisons_the_predicate() {
        let params = ParameterStore::new();
        for predicate in [
            "id = 1 OR id = 2",
            "id > 1",
            "id = 1 AND name LIKE 'a%'",
            "id IN (1, 2)",
            "id = 1 AND (b = 2 AND c <> 3)",
            "id BETWEEN 1 AND 2",
            "id IS NULL",
            "id = 1 AND lower(name) = 'x'",
            "id = (SELECT max(id) FROM t)",
            "id = other_id",
            "id = 1 + 1",
            "NOT id = 1",
            "id = CASE WHEN true THEN 1 ELSE 2 END",
        ] {
            assert_eq!(
                classify(predicate, &params),
                KeyPredicate::Invalid,
                "{predicate} should be invalid"
            );
        }
    }

    #[test]
    fn poison_sticks_even_when_later_terms_look_valid() {
        let predicate = classify("(a = 1 OR a = 2) AND b = 3 AND c = 4", &ParameterStore::new());
        assert_eq!(predicate, KeyPredicate::Invalid);
    }

    #[test]
    fn repeated_column_is_invalid() {
        let predicate = classify("id = 1 AND id = 2", &ParameterStore::new());
        assert!(!predicate.is_valid());
        assert!(classify("id = 1", &ParameterStore::new()).is_valid());
    }

    #[test]
    fn unset_placeholder_is_an_error() {
        let err = extract_key_predicate(&where_clause("id = $1"), &ParameterStore::new())
            .unwrap_err();
        assert!(err.to_string().contains("$1"));
    }

    #[test]
    fn key_values_require_exact_key_coverage() {
        let predicate = classify("a = 1 AND b = 2", &ParameterStore::new());
        assert!(predicate.key_values(&["a".to_string()]).is_none());
        assert!(predicate
            .key_values(&["a".to_string(), "c".to_string()])
            .is_none());
        assert_eq!(
            predicate.key_values(&["b".to_string(), "a".to_string()]),
            Some(vec![ScalarValue::Int64(Some(2)), ScalarValue::Int64(Some(1))])
        );
    }
}
