//! Scripted in-memory driver for unit tests.
//!
//! Every call is recorded in a shared [`CallLog`]; result rows, affected counts and
//! failures are matched against SQL by substring.

use crate::config::ConnectionConfig;
use crate::driver::{Driver, DriverConnection, DriverResult, DriverStatement};
use crate::error::DriverError;
use crate::row::Row;
use crate::value::Value;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default, Clone)]
pub(crate) struct CallLog {
    pub connects: usize,
    pub prepared: Vec<String>,
    pub executed: Vec<(String, Vec<Value>)>,
    pub raw: Vec<String>,
    pub tx: Vec<&'static str>,
    pub resets: usize,
}

impl CallLog {
    pub fn executed_sql(&self) -> Vec<&str> {
        self.executed.iter().map(|(sql, _)| sql.as_str()).collect()
    }
}

#[derive(Debug)]
struct Failure {
    pattern: String,
    remaining: u32,
}

#[derive(Debug, Default)]
struct ScriptState {
    driver_name: String,
    log: CallLog,
    rows: Vec<(String, Vec<Row>)>,
    affected: Vec<(String, u64)>,
    execute_failures: Vec<Failure>,
    prepare_failures: Vec<String>,
    raw_failures: Vec<String>,
    last_insert_id: Value,
    fail_connect: bool,
}

/// Shared, cloneable handle to the script and call log.
#[derive(Debug, Clone)]
pub(crate) struct Script(Arc<Mutex<ScriptState>>);

impl Script {
    pub fn new(driver_name: &str) -> Self {
        Script(Arc::new(Mutex::new(ScriptState {
            driver_name: driver_name.to_string(),
            last_insert_id: Value::Null,
            ..ScriptState::default()
        })))
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.0.lock().unwrap()
    }

    /// Rows returned by statements whose SQL contains `pattern`.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) -> &Self {
        self.state().rows.push((pattern.to_string(), rows));
        self
    }

    /// Affected-row count reported by statements whose SQL contains `pattern`.
    pub fn affect(&self, pattern: &str, n: u64) -> &Self {
        self.state().affected.push((pattern.to_string(), n));
        self
    }

    /// Fail the next `times` executions whose SQL contains `pattern`.
    pub fn fail_execute(&self, pattern: &str, times: u32) -> &Self {
        self.state().execute_failures.push(Failure {
            pattern: pattern.to_string(),
            remaining: times,
        });
        self
    }

    pub fn fail_prepare(&self, pattern: &str) -> &Self {
        self.state().prepare_failures.push(pattern.to_string());
        self
    }

    /// Fail raw `exec` calls whose SQL contains `pattern`.
    pub fn fail_raw(&self, pattern: &str) -> &Self {
        self.state().raw_failures.push(pattern.to_string());
        self
    }

    pub fn fail_connect(&self) -> &Self {
        self.state().fail_connect = true;
        self
    }

    pub fn set_last_insert_id(&self, id: impl Into<Value>) -> &Self {
        self.state().last_insert_id = id.into();
        self
    }

    pub fn log(&self) -> CallLog {
        self.state().log.clone()
    }
}

pub(crate) struct ScriptedDriver {
    script: Script,
}

impl ScriptedDriver {
    pub fn new(driver_name: &str) -> Self {
        Self {
            script: Script::new(driver_name),
        }
    }

    pub fn script(&self) -> Script {
        self.script.clone()
    }
}

impl Driver for ScriptedDriver {
    fn connect(&self, _config: &ConnectionConfig) -> DriverResult<Box<dyn DriverConnection>> {
        let mut state = self.script.state();
        if state.fail_connect {
            return Err(DriverError::new("connection refused").with_code("08001"));
        }
        state.log.connects += 1;
        Ok(Box::new(ScriptedConnection {
            script: self.script.clone(),
            driver_name: state.driver_name.clone(),
        }))
    }
}

pub(crate) struct ScriptedConnection {
    script: Script,
    driver_name: String,
}

impl ScriptedConnection {
    pub fn new(driver_name: &str) -> Self {
        Self {
            script: Script::new(driver_name),
            driver_name: driver_name.to_string(),
        }
    }

    pub fn fail_prepare(&self, pattern: &str) {
        self.script.fail_prepare(pattern);
    }

    pub fn log(&self) -> CallLog {
        self.script.log()
    }
}

impl DriverConnection for ScriptedConnection {
    fn driver_name(&self) -> &str {
        &self.driver_name
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>> {
        let mut state = self.script.state();
        if state.prepare_failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(DriverError::new(format!("cannot prepare: {sql}")).with_code("42601"));
        }
        state.log.prepared.push(sql.to_string());
        Ok(Box::new(ScriptedStatement {
            script: self.script.clone(),
            sql: sql.to_string(),
            rows: Vec::new(),
            affected: 0,
        }))
    }

    fn exec(&mut self, sql: &str) -> DriverResult<u64> {
        let mut state = self.script.state();
        state.log.raw.push(sql.to_string());
        if state.raw_failures.iter().any(|p| sql.contains(p.as_str())) {
            return Err(DriverError::new(format!("exec failed: {sql}")));
        }
        Ok(0)
    }

    fn begin_transaction(&mut self) -> DriverResult<()> {
        self.script.state().log.tx.push("begin");
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.script.state().log.tx.push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.script.state().log.tx.push("rollback");
        Ok(())
    }

    fn last_insert_id(&mut self) -> DriverResult<Value> {
        Ok(self.script.state().last_insert_id.clone())
    }
}

struct ScriptedStatement {
    script: Script,
    sql: String,
    rows: Vec<Row>,
    affected: u64,
}

impl DriverStatement for ScriptedStatement {
    fn reset(&mut self) {
        self.rows.clear();
        self.affected = 0;
        self.script.state().log.resets += 1;
    }

    fn execute(&mut self, params: &[Value]) -> DriverResult<()> {
        let mut state = self.script.state();
        state
            .log
            .executed
            .push((self.sql.clone(), params.to_vec()));

        let sql = self.sql.as_str();
        if let Some(failure) = state
            .execute_failures
            .iter_mut()
            .find(|f| f.remaining > 0 && sql.contains(f.pattern.as_str()))
        {
            failure.remaining -= 1;
            return Err(DriverError::new("scripted failure").with_code("HY000"));
        }

        self.rows = state
            .rows
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default();
        self.affected = state
            .affected
            .iter()
            .find(|(p, _)| sql.contains(p.as_str()))
            .map_or(self.rows.len() as u64, |(_, n)| *n);
        Ok(())
    }

    fn fetch_all(&mut self) -> DriverResult<Vec<Row>> {
        Ok(std::mem::take(&mut self.rows))
    }

    fn row_count(&self) -> u64 {
        self.affected
    }
}

/// A one-column `cnt` row, as returned by count queries.
pub(crate) fn count_row(n: i64) -> Vec<Row> {
    vec![Row::from_pairs([("cnt", n)])]
}
