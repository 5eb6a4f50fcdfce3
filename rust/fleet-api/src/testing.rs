//! An in-process [`DataStore`] for tests and local experiments.
//!
//! It does not parse SQL. It relies on the shape of the statements this crate emits:
//!
//! - `SELECT COUNT(*) ...` binds are matched positionally against the filter fields.
//! - Page statements end in `LIMIT ? OFFSET ?`; the binds before those are filters.
//! - `INSERT ...` appends a row holding only a fresh `id` and returns it.
//! - `UPDATE`/`DELETE` target the row whose `id` equals the final bind.
//!
//! Rows are returned in insertion order, so tests seed them already sorted.

use crate::{
    error::{Result, ServiceError},
    store::{BindParam, DataStore, Statement},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::time::Duration;

pub struct MemoryStore {
    rows: Mutex<Vec<Value>>,
    filter_fields: Vec<String>,
    statements: Mutex<Vec<Statement>>,
    failure: Option<String>,
    delay: Option<Duration>,
}

impl MemoryStore {
    pub fn new(rows: Vec<Value>) -> Self {
        Self {
            rows: Mutex::new(rows),
            filter_fields: vec!["id".to_string()],
            statements: Mutex::new(Vec::new()),
            failure: None,
            delay: None,
        }
    }

    pub fn with_filter_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Every statement fails with `message` after being recorded.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Every statement waits `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.statements.lock().clone()
    }

    pub fn rows_snapshot(&self) -> Vec<Value> {
        self.rows.lock().clone()
    }

    async fn record(&self, statement: &Statement) -> Result<()> {
        self.statements.lock().push(statement.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(message) => Err(ServiceError::StoreUnavailable(anyhow::anyhow!(
                message.clone()
            ))),
            None => Ok(()),
        }
    }

    fn matching(&self, binds: &[BindParam]) -> Vec<Value> {
        self.rows
            .lock()
            .iter()
            .filter(|row| {
                self.filter_fields
                    .iter()
                    .zip(binds)
                    .all(|(field, bind)| bind.matches(&row[field.as_str()]))
            })
            .cloned()
            .collect()
    }
}

fn window(statement: &Statement) -> Option<(&[BindParam], i64, i64)> {
    if !statement.sql.contains(" LIMIT ") {
        return None;
    }
    match statement.params.as_slice() {
        [filters @ .., limit, offset] => Some((filters, limit.as_int()?, offset.as_int()?)),
        _ => None,
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn count(&self, statement: &Statement) -> Result<i64> {
        self.record(statement).await?;
        Ok(self.matching(&statement.params).len() as i64)
    }

    async fn rows(&self, statement: &Statement) -> Result<Vec<Value>> {
        self.record(statement).await?;

        if statement.sql.starts_with("INSERT") {
            let mut rows = self.rows.lock();
            let next = rows
                .iter()
                .filter_map(|row| row["id"].as_i64())
                .max()
                .unwrap_or(0)
                + 1;
            rows.push(json!({ "id": next }));
            return Ok(vec![json!({ "id": next })]);
        }

        match window(statement) {
            Some((filters, limit, offset)) => Ok(self
                .matching(filters)
                .into_iter()
                .skip(offset.max(0) as usize)
                .take(limit.max(0) as usize)
                .collect()),
            None => Ok(self.matching(&statement.params)),
        }
    }

    async fn execute(&self, statement: &Statement) -> Result<u64> {
        self.record(statement).await?;

        let Some(id) = statement.params.last() else {
            return Ok(0);
        };
        let mut rows = self.rows.lock();
        let before = rows.len();
        let affected = rows.iter().filter(|row| id.matches(&row["id"])).count();
        if statement.sql.starts_with("DELETE") {
            rows.retain(|row| !id.matches(&row["id"]));
            return Ok((before - rows.len()) as u64);
        }
        Ok(affected as u64)
    }
}
