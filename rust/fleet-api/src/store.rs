//! The seam between query planning and the relational store.
//!
//! Everything that reaches a [`DataStore`] is a [`Statement`]: SQL text assembled only
//! from allowlisted identifiers, plus the caller-supplied values as typed binds.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum BindParam {
    Int(i64),
    OptionalInt(Option<i64>),
    Float(f64),
    Bool(bool),
    Text(String),
    OptionalText(Option<String>),
}

impl BindParam {
    /// Equality against a JSON row value, used by in-process stores.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            BindParam::Int(expected) => value.as_i64() == Some(*expected),
            BindParam::OptionalInt(Some(expected)) => value.as_i64() == Some(*expected),
            BindParam::Float(expected) => value.as_f64() == Some(*expected),
            BindParam::Bool(expected) => value.as_bool() == Some(*expected),
            BindParam::Text(expected) | BindParam::OptionalText(Some(expected)) => {
                value.as_str() == Some(expected.as_str())
            }
            BindParam::OptionalInt(None) | BindParam::OptionalText(None) => value.is_null(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BindParam::Int(value) | BindParam::OptionalInt(Some(value)) => Some(*value),
            _ => None,
        }
    }
}

/// Parameterized SQL with `$n` placeholders and its binds, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<BindParam>,
}

impl Statement {
    /// Builds a statement from SQL written with `?` placeholders.
    pub fn new(sql: &str, params: Vec<BindParam>) -> Self {
        Self {
            sql: rewrite_placeholders(sql),
            params,
        }
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    /// Runs a statement that yields a single `total` column.
    async fn count(&self, statement: &Statement) -> Result<i64>;

    /// Runs a statement that yields one JSON `payload` column per row.
    async fn rows(&self, statement: &Statement) -> Result<Vec<Value>>;

    /// Runs a write and returns the number of affected rows.
    async fn execute(&self, statement: &Statement) -> Result<u64>;
}

pub(crate) fn rewrite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut index = 1;
    for ch in sql.chars() {
        if ch == '?' {
            result.push('$');
            result.push_str(&index.to_string());
            index += 1;
        } else {
            result.push(ch);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholders_are_numbered_in_order() {
        let statement = Statement::new(
            "SELECT 1 FROM cars c WHERE c.id = ? LIMIT ? OFFSET ?",
            vec![BindParam::Int(1), BindParam::Int(10), BindParam::Int(0)],
        );
        assert_eq!(
            statement.sql,
            "SELECT 1 FROM cars c WHERE c.id = $1 LIMIT $2 OFFSET $3"
        );
    }

    #[test]
    fn binds_compare_against_json_values() {
        assert!(BindParam::Int(42).matches(&json!(42)));
        assert!(!BindParam::Int(42).matches(&json!("42")));
        assert!(BindParam::Text("active".into()).matches(&json!("active")));
        assert!(BindParam::OptionalInt(None).matches(&Value::Null));
        assert!(BindParam::Bool(false).matches(&json!(false)));
        assert!(BindParam::Float(4.5).matches(&json!(4.5)));
        assert!(!BindParam::OptionalText(None).matches(&json!("")));
    }
}
