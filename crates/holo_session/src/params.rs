//! Positional statement parameters and the shared literal/parameter resolver.
//!
//! Callers bind values by 1-based position and may write either `?` or `$n`
//! placeholders. Statements are normalized to `$n` before parsing so every
//! later stage (key extraction, rewritten SELECTs, point mutations) refers to
//! parameters the same way.

use datafusion::common::ScalarValue;
use datafusion::sql::sqlparser::ast::{Expr as SqlExpr, UnaryOperator, Value};
use datafusion::sql::sqlparser::dialect::Dialect;
use datafusion::sql::sqlparser::tokenizer::{Token, Tokenizer};

use crate::error::{SessionError, SessionResult};

/// Positional parameter values bound to one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterStore {
    values: Vec<Option<ScalarValue>>,
}

impl ParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store with `values` bound to positions `1..=values.len()`.
    pub fn from_values(values: impl IntoIterator<Item = ScalarValue>) -> Self {
        Self {
            values: values.into_iter().map(Some).collect(),
        }
    }

    /// Binds `value` at 1-based `index`.
    pub fn set(&mut self, index: usize, value: ScalarValue) -> SessionResult<()> {
        if index == 0 {
            return Err(SessionError::InvalidParameter(
                "parameter indexes start at 1".to_string(),
            ));
        }
        if self.values.len() < index {
            self.values.resize(index, None);
        }
        self.values[index - 1] = Some(value);
        Ok(())
    }

    /// Value bound at 1-based `index`.
    pub fn get(&self, index: usize) -> Option<&ScalarValue> {
        index
            .checked_sub(1)
            .and_then(|idx| self.values.get(idx))
            .and_then(Option::as_ref)
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All bound values in order; fails if a position in between is unset.
    pub fn to_values(&self) -> SessionResult<Vec<ScalarValue>> {
        self.values
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                value.clone().ok_or_else(|| {
                    SessionError::InvalidParameter(format!("parameter ${} is not set", idx + 1))
                })
            })
            .collect()
    }

    /// Resolves a `$n` placeholder id.
    pub fn resolve_placeholder(&self, id: &str) -> SessionResult<ScalarValue> {
        let index = id
            .strip_prefix('$')
            .and_then(|raw| raw.parse::<usize>().ok())
            .ok_or_else(|| {
                SessionError::InvalidParameter(format!("unsupported placeholder {id}"))
            })?;
        self.get(index)
            .cloned()
            .ok_or_else(|| SessionError::InvalidParameter(format!("parameter {id} is not set")))
    }
}

/// Rewrites `?` placeholders to `$1`, `$2`, ... in textual order.
///
/// Only placeholder tokens are touched; string literals and comments that
/// contain `?` are left as written.
pub fn normalize_placeholders(dialect: &dyn Dialect, sql: &str) -> SessionResult<String> {
    let tokens = Tokenizer::new(dialect, sql)
        .tokenize_with_location()
        .map_err(|err| SessionError::Parse(err.to_string()))?;
    let positions = tokens
        .iter()
        .filter(|token| matches!(&token.token, Token::Placeholder(id) if id == "?"))
        .map(|token| (token.span.start.line, token.span.start.column))
        .collect::<Vec<_>>();
    if positions.is_empty() {
        return Ok(sql.to_string());
    }

    let mut out = String::with_capacity(sql.len() + positions.len() * 2);
    let mut next = positions.iter().peekable();
    let mut ordinal = 0usize;
    let (mut line, mut column) = (1u64, 1u64);
    for ch in sql.chars() {
        if next.peek() == Some(&&(line, column)) && ch == '?' {
            next.next();
            ordinal += 1;
            out.push('$');
            out.push_str(&ordinal.to_string());
        } else {
            out.push(ch);
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    Ok(out)
}

/// Resolves an expression that is a literal or a placeholder.
///
/// Returns `Ok(None)` for anything else (column references, arithmetic,
/// function calls, ...). Unary `+`/`-` on numeric literals is folded.
pub fn resolve_literal(
    expr: &SqlExpr,
    params: &ParameterStore,
) -> SessionResult<Option<ScalarValue>> {
    match expr {
        SqlExpr::Value(value) => resolve_sql_value(&value.value, params).map(Some),
        SqlExpr::Nested(inner) => resolve_literal(inner, params),
        SqlExpr::UnaryOp { op, expr } => {
            if !matches!(expr.as_ref(), SqlExpr::Value(_)) {
                return Ok(None);
            }
            let Some(value) = resolve_literal(expr, params)? else {
                return Ok(None);
            };
            match op {
                UnaryOperator::Plus => Ok(Some(value)),
                UnaryOperator::Minus => negate_scalar(value).map(Some),
                _ => Ok(None),
            }
        }
        _ => Ok(None),
    }
}

/// Converts a SQL literal into a scalar, dereferencing placeholders.
pub fn resolve_sql_value(value: &Value, params: &ParameterStore) -> SessionResult<ScalarValue> {
    match value {
        Value::Placeholder(id) => params.resolve_placeholder(id),
        Value::Null => Ok(ScalarValue::Null),
        Value::Boolean(v) => Ok(ScalarValue::Boolean(Some(*v))),
        Value::Number(raw, _) => {
            if let Ok(v) = raw.parse::<i64>() {
                Ok(ScalarValue::Int64(Some(v)))
            } else if let Ok(v) = raw.parse::<f64>() {
                Ok(ScalarValue::Float64(Some(v)))
            } else {
                Err(SessionError::InvalidParameter(format!(
                    "invalid numeric literal: {raw}"
                )))
            }
        }
        Value::SingleQuotedString(s)
        | Value::DoubleQuotedString(s)
        | Value::TripleSingleQuotedString(s)
        | Value::TripleDoubleQuotedString(s)
        | Value::EscapedStringLiteral(s)
        | Value::UnicodeStringLiteral(s)
        | Value::NationalStringLiteral(s) => Ok(ScalarValue::Utf8(Some(s.clone()))),
        Value::SingleQuotedByteStringLiteral(s) | Value::DoubleQuotedByteStringLiteral(s) => {
            Ok(ScalarValue::Binary(Some(s.clone().into_bytes())))
        }
        other => Err(SessionError::unsupported(format!(
            "unsupported literal value: {other}"
        ))),
    }
}

fn negate_scalar(value: ScalarValue) -> SessionResult<ScalarValue> {
    match value {
        ScalarValue::Int64(Some(v)) => v
            .checked_neg()
            .map(|v| ScalarValue::Int64(Some(v)))
            .ok_or_else(|| SessionError::InvalidParameter(format!("cannot negate {v}"))),
        ScalarValue::Float64(Some(v)) => Ok(ScalarValue::Float64(Some(-v))),
        other => Err(SessionError::InvalidParameter(format!(
            "cannot negate non-numeric value {other}"
        ))),
    }
}

/// Best-effort conversion of a scalar to an unsigned row count.
pub fn scalar_to_u64(value: &ScalarValue) -> Option<u64> {
    match value {
        ScalarValue::Int64(Some(v)) => u64::try_from(*v).ok(),
        ScalarValue::Int32(Some(v)) => u64::try_from(*v).ok(),
        ScalarValue::UInt64(Some(v)) => Some(*v),
        ScalarValue::UInt32(Some(v)) => Some(u64::from(*v)),
        ScalarValue::Utf8(Some(v)) => v.parse::<u64>().ok(),
        _ => None,
    }
}
