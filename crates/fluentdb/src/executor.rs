//! Execution pipeline.
//!
//! Every compiled statement runs through [`Executor::run`]: hooks, timing, `tracing`
//! events, the in-memory debug log, retries and the error-mode policy live here.

use crate::compile::CompiledQuery;
use crate::connection::{lock, ConnectionManager, Executed, ManagedConnection};
use crate::error::{serialize_millis, DbError, DbResult, DriverError, ErrorContext};
use crate::hooks::{AfterQueryContext, BeforeQueryContext, ErrorHookContext, Hooks, RetryContext};
use crate::value::{sanitize_params, Value};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default bound of the debug query log.
pub const DEFAULT_MAX_LOG_SIZE: usize = 200;

/// SQL longer than this is cut in `tracing` events.
const LOG_SQL_MAX_BYTES: usize = 200;

fn truncate_sql_bytes(sql: &str, max_bytes: usize) -> &str {
    if sql.len() <= max_bytes {
        return sql;
    }
    let mut end = max_bytes;
    while end > 0 && !sql.is_char_boundary(end) {
        end -= 1;
    }
    &sql[..end]
}

pub(crate) fn log_sql(sql: &str) -> String {
    if sql.len() > LOG_SQL_MAX_BYTES {
        format!("{}...", truncate_sql_bytes(sql, LOG_SQL_MAX_BYTES))
    } else {
        sql.to_string()
    }
}

/// What happens when a statement fails after retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    /// Return [`DbError::Execution`].
    #[default]
    Exception,
    /// Return an empty result (or `0`) and keep the failure in `last_error()`.
    Safe,
}

impl FromStr for ErrorMode {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exception" => Ok(ErrorMode::Exception),
            "safe" => Ok(ErrorMode::Safe),
            other => Err(DbError::argument(format!(
                "unknown error mode '{other}': expected 'exception' or 'safe'"
            ))),
        }
    }
}

impl fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorMode::Exception => "exception",
            ErrorMode::Safe => "safe",
        })
    }
}

/// One entry of the debug query log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryLogEntry {
    pub connection: String,
    pub sql: String,
    /// Sanitized parameters.
    pub params: Vec<Value>,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub row_count: u64,
    /// Failure message, for failed attempts.
    pub error: Option<String>,
    /// `0` for the first attempt, then the retry number.
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

struct Failure {
    source: DriverError,
    context: ErrorContext,
}

/// Per-builder execution settings and diagnostics.
#[derive(Debug, Clone)]
pub(crate) struct Executor {
    pub error_mode: ErrorMode,
    debug: bool,
    max_log_size: usize,
    log: VecDeque<QueryLogEntry>,
    last_error: Option<ErrorContext>,
    last_query: Option<CompiledQuery>,
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            error_mode: ErrorMode::default(),
            debug: false,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            log: VecDeque::new(),
            last_error: None,
            last_query: None,
        }
    }
}

impl Executor {
    /// Same modes, empty diagnostics.
    pub fn fresh_copy(&self) -> Self {
        Self {
            error_mode: self.error_mode,
            debug: self.debug,
            max_log_size: self.max_log_size,
            ..Self::default()
        }
    }

    pub fn set_debug(&mut self, enabled: bool, max_log_size: usize) {
        self.debug = enabled;
        self.max_log_size = max_log_size;
        self.trim_log();
    }

    pub fn log(&self) -> &VecDeque<QueryLogEntry> {
        &self.log
    }

    pub fn clear_log(&mut self) {
        self.log.clear();
    }

    pub fn last_error(&self) -> Option<&ErrorContext> {
        self.last_error.as_ref()
    }

    pub fn last_query(&self) -> Option<&CompiledQuery> {
        self.last_query.as_ref()
    }

    /// Execute `query` on `connection`, applying hooks, retries and the error mode.
    ///
    /// Failures to open the connection are returned as-is; only statement failures
    /// go through retry and the error mode.
    pub fn run(
        &mut self,
        manager: &ConnectionManager,
        connection: &str,
        query: &CompiledQuery,
        fetch_rows: bool,
    ) -> DbResult<Executed> {
        self.last_error = None;
        self.last_query = Some(query.clone());

        let hooks = manager.hooks();
        let params = sanitize_params(&query.params);
        let conn = manager.connection(connection)?;
        let call = Call {
            hooks,
            conn: &conn,
            connection,
            query,
            params: &params,
        };

        let mut failure = match self.attempt(&call, fetch_rows, 0) {
            Ok(done) => return Ok(done),
            Err(failure) => failure,
        };

        let decision = hooks.retry_decider.as_ref().and_then(|decide| {
            decide(&RetryContext {
                connection,
                sql: &query.sql,
                params: &params,
                error: &failure.source,
                context: &failure.context,
            })
        });
        if let Some(decision) = decision {
            for attempt in 1..=decision.retries {
                tracing::warn!(
                    target: "fluentdb.sql",
                    connection,
                    attempt,
                    retries = decision.retries,
                    delay_ms = decision.delay.as_millis() as u64,
                    "retrying failed statement"
                );
                if !decision.delay.is_zero() {
                    std::thread::sleep(decision.delay);
                }
                match self.attempt(&call, decision.fetch_rows, attempt) {
                    Ok(done) => return Ok(done),
                    Err(next) => failure = next,
                }
            }
        }

        match self.error_mode {
            ErrorMode::Exception => Err(DbError::Execution(Box::new(failure.context))),
            ErrorMode::Safe => Ok(Executed::default()),
        }
    }

    fn attempt(&mut self, call: &Call<'_>, fetch_rows: bool, attempt: u32) -> Result<Executed, Failure> {
        let Call {
            hooks,
            conn,
            connection,
            query,
            params,
        } = *call;

        if let Some(hook) = &hooks.before_query {
            hook(&BeforeQueryContext {
                connection,
                sql: &query.sql,
                params,
            });
        }

        let started = Instant::now();
        let result = lock(conn).execute(&query.sql, &query.params, fetch_rows);
        let duration = started.elapsed();

        match result {
            Ok(done) => {
                self.last_error = None;
                tracing::debug!(
                    target: "fluentdb.sql",
                    connection,
                    sql = %log_sql(&query.sql),
                    param_count = params.len(),
                    row_count = done.row_count,
                    duration_us = duration.as_micros() as u64,
                    "query executed"
                );
                self.record(QueryLogEntry {
                    connection: connection.to_string(),
                    sql: query.sql.clone(),
                    params: params.to_vec(),
                    duration,
                    row_count: done.row_count,
                    error: None,
                    attempt,
                    at: Utc::now(),
                });
                if let Some(hook) = &hooks.after_query {
                    hook(&AfterQueryContext {
                        connection,
                        sql: &query.sql,
                        params,
                        duration,
                        row_count: done.row_count,
                        rows: fetch_rows.then_some(done.rows.as_slice()),
                    });
                }
                Ok(done)
            }
            Err(source) => {
                let context = ErrorContext {
                    connection: connection.to_string(),
                    sql: query.sql.clone(),
                    params: params.to_vec(),
                    duration,
                    message: source.message.clone(),
                    kind: "execution".to_string(),
                    code: source.code.clone(),
                };
                tracing::warn!(
                    target: "fluentdb.sql",
                    connection,
                    sql = %log_sql(&query.sql),
                    code = source.code.as_deref().unwrap_or("-"),
                    attempt,
                    error = %source,
                    "query failed"
                );
                self.last_error = Some(context.clone());
                self.record(QueryLogEntry {
                    connection: connection.to_string(),
                    sql: query.sql.clone(),
                    params: params.to_vec(),
                    duration,
                    row_count: 0,
                    error: Some(source.message.clone()),
                    attempt,
                    at: Utc::now(),
                });
                if let Some(hook) = &hooks.on_error {
                    hook(&ErrorHookContext {
                        connection,
                        sql: &query.sql,
                        params,
                        duration,
                        error: &context,
                        source: &source,
                    });
                }
                Err(Failure { source, context })
            }
        }
    }

    fn record(&mut self, entry: QueryLogEntry) {
        if !self.debug {
            return;
        }
        self.log.push_back(entry);
        self.trim_log();
    }

    fn trim_log(&mut self) {
        while self.log.len() > self.max_log_size {
            self.log.pop_front();
        }
    }
}

/// Everything an attempt needs besides the executor itself.
#[derive(Clone, Copy)]
struct Call<'a> {
    hooks: &'a Hooks,
    conn: &'a Mutex<ManagedConnection>,
    connection: &'a str,
    query: &'a CompiledQuery,
    params: &'a [Value],
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, DatabaseConfig};
    use crate::hooks::RetryDecision;
    use crate::row::Row;
    use crate::testing::{Script, ScriptedDriver};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(hooks: Hooks) -> (ConnectionManager, Script) {
        let driver = ScriptedDriver::new("pgsql");
        let script = driver.script();
        let config = DatabaseConfig::single(ConnectionConfig::new("scripted"));
        (ConnectionManager::new(driver, config).with_hooks(hooks), script)
    }

    fn query(sql: &str, params: Vec<Value>) -> CompiledQuery {
        CompiledQuery::new(sql, params)
    }

    #[test]
    fn success_returns_rows_and_clears_last_error() {
        let (mgr, script) = setup(Hooks::new());
        script.respond("FROM users", vec![Row::from_pairs([("id", 1)])]);
        let mut exec = Executor::default();

        let done = exec
            .run(&mgr, "default", &query("SELECT id FROM users", vec![]), true)
            .unwrap();
        assert_eq!(done.rows.len(), 1);
        assert_eq!(done.row_count, 1);
        assert!(exec.last_error().is_none());
        assert_eq!(exec.last_query().unwrap().sql, "SELECT id FROM users");
    }

    #[test]
    fn exception_mode_wraps_failure_context() {
        let (mgr, script) = setup(Hooks::new());
        script.fail_execute("UPDATE", 1);
        let mut exec = Executor::default();

        let err = exec
            .run(&mgr, "default", &query("UPDATE t SET a = ?", vec![Value::Int(1)]), false)
            .unwrap_err();
        let ctx = err.context().unwrap();
        assert_eq!(ctx.connection, "default");
        assert_eq!(ctx.code.as_deref(), Some("HY000"));
        assert_eq!(exec.last_error(), Some(ctx));
    }

    #[test]
    fn safe_mode_swallows_failure() {
        let (mgr, script) = setup(Hooks::new());
        script.fail_execute("DELETE", 1);
        let mut exec = Executor {
            error_mode: ErrorMode::Safe,
            ..Executor::default()
        };

        let done = exec
            .run(&mgr, "default", &query("DELETE FROM t WHERE id = ?", vec![Value::Int(1)]), false)
            .unwrap();
        assert_eq!(done, Executed::default());
        assert_eq!(exec.last_error().unwrap().sql, "DELETE FROM t WHERE id = ?");
    }

    #[test]
    fn hooks_see_sanitized_params() {
        let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&seen);
        let (mgr, _) = setup(Hooks::new().before_query(move |ctx| {
            sink.lock().unwrap().extend_from_slice(ctx.params);
        }));
        let long = "x".repeat(300);
        let mut exec = Executor::default();

        exec.run(&mgr, "default", &query("INSERT INTO t (a) VALUES (?)", vec![long.clone().into()]), false)
            .unwrap();

        let seen = seen.lock().unwrap();
        let Value::Text(text) = &seen[0] else {
            panic!("expected text param");
        };
        assert_eq!(text.len(), 203);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn after_and_error_hooks_fire() {
        let after = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let (a, e) = (Arc::clone(&after), Arc::clone(&errors));
        let (mgr, script) = setup(
            Hooks::new()
                .after_query(move |ctx| {
                    assert!(ctx.rows.is_some());
                    a.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |ctx| {
                    assert_eq!(ctx.error.message, ctx.source.message);
                    e.fetch_add(1, Ordering::SeqCst);
                }),
        );
        script.fail_execute("broken", 1);
        let mut exec = Executor::default();

        exec.run(&mgr, "default", &query("SELECT 1", vec![]), true).unwrap();
        assert!(exec.run(&mgr, "default", &query("SELECT broken", vec![]), true).is_err());

        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_decider_reruns_statement() {
        let (mgr, script) = setup(Hooks::new().retry_decider(|ctx| {
            (ctx.error.code.as_deref() == Some("HY000"))
                .then(|| RetryDecision::new(3, Duration::ZERO))
        }));
        script.fail_execute("flaky", 2);
        script.respond("flaky", vec![Row::from_pairs([("ok", true)])]);
        let mut exec = Executor::default();

        let done = exec
            .run(&mgr, "default", &query("SELECT flaky", vec![]), true)
            .unwrap();
        assert_eq!(done.rows.len(), 1);
        assert!(exec.last_error().is_none());
        assert_eq!(script.log().executed.len(), 3);
    }

    #[test]
    fn exhausted_retries_fall_through_to_error_mode() {
        let (mgr, script) = setup(
            Hooks::new().retry_decider(|_| Some(RetryDecision::new(2, Duration::ZERO))),
        );
        script.fail_execute("down", u32::MAX);
        let mut exec = Executor::default();

        let err = exec
            .run(&mgr, "default", &query("SELECT down", vec![]), true)
            .unwrap_err();
        assert!(err.is_execution());
        assert_eq!(script.log().executed.len(), 3);
    }

    #[test]
    fn retry_without_rows_reports_count() {
        let (mgr, script) = setup(Hooks::new().retry_decider(|_| {
            Some(RetryDecision::new(1, Duration::ZERO).fetch_rows(false))
        }));
        script.fail_execute("SELECT", 1);
        script.respond("SELECT", vec![Row::from_pairs([("a", 1)])]);
        let mut exec = Executor::default();

        let done = exec
            .run(&mgr, "default", &query("SELECT a FROM t", vec![]), true)
            .unwrap();
        assert!(done.rows.is_empty());
        assert_eq!(done.row_count, 1);
    }

    #[test]
    fn debug_log_is_fifo_bounded() {
        let (mgr, script) = setup(Hooks::new());
        script.fail_execute("SELECT 3", 1);
        let mut exec = Executor::default();

        exec.run(&mgr, "default", &query("SELECT 0", vec![]), true).unwrap();
        assert!(exec.log().is_empty());

        exec.set_debug(true, 2);
        for i in 1..=3 {
            let _ = exec.run(&mgr, "default", &query(&format!("SELECT {i}"), vec![]), true);
        }
        let sqls: Vec<_> = exec.log().iter().map(|e| e.sql.as_str()).collect();
        assert_eq!(sqls, ["SELECT 2", "SELECT 3"]);
        assert!(exec.log()[1].error.is_some());

        exec.clear_log();
        assert!(exec.log().is_empty());
    }

    #[test]
    fn fresh_copy_keeps_modes_only() {
        let (mgr, script) = setup(Hooks::new());
        script.fail_execute("x", 1);
        let mut exec = Executor {
            error_mode: ErrorMode::Safe,
            ..Executor::default()
        };
        exec.set_debug(true, 5);
        exec.run(&mgr, "default", &query("SELECT x", vec![]), true).unwrap();

        let copy = exec.fresh_copy();
        assert_eq!(copy.error_mode, ErrorMode::Safe);
        assert!(copy.debug);
        assert!(copy.log().is_empty());
        assert!(copy.last_error().is_none());
        assert!(copy.last_query().is_none());
    }

    #[test]
    fn error_mode_parses() {
        assert_eq!("SAFE".parse::<ErrorMode>().unwrap(), ErrorMode::Safe);
        assert!("loud".parse::<ErrorMode>().unwrap_err().is_argument());
    }

    #[test]
    fn log_sql_truncates_on_char_boundary() {
        let sql = "é".repeat(150);
        let logged = log_sql(&sql);
        assert!(logged.ends_with("..."));
        assert!(logged.len() <= LOG_SQL_MAX_BYTES + 3);
    }
}
