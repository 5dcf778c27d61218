//! The fluent query builder.
//!
//! A [`Db`] is bound to one named connection of a shared [`ConnectionManager`].
//! Clause methods append to its query state and return `&mut Self`; terminal calls
//! (`get`, `insert`, `update`, `raw_query`, `paginate`, ...) compile the state, run it
//! through the execution pipeline and leave the state empty, whether they succeed or
//! fail.
//!
//! # Example
//! ```ignore
//! use fluentdb::{Db, Direction};
//!
//! let mut db = Db::new(manager);
//! let users = db
//!     .and_where("active", 1)
//!     .order_by("created_at", Direction::Desc)
//!     .get("users", Some(10), "*")?;
//!
//! let id = db.insert("users", [("name", "ann"), ("email", "ann@example.com")])?;
//! let n = db.and_where("id", id).update("users", [("name", "anne")])?;
//! ```

use crate::compile::{require_where, CompiledQuery, Compiler};
use crate::connection::{ConnectionManager, Executed};
use crate::error::{DbError, DbResult, ErrorContext};
use crate::executor::{ErrorMode, Executor, QueryLogEntry};
use crate::fetch::{FetchMode, Fetched, FetchedRow, JsonOptions};
use crate::hooks::HealthCheckContext;
use crate::row::Record;
use crate::state::{Columns, Connective, Direction, JoinType, QueryState};
use crate::statement_cache::StatementCacheStats;
use crate::value::{Operand, Value};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

/// Pagination metadata returned by [`Db::paginate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub pages: u64,
    pub has_prev: bool,
    pub has_next: bool,
}

impl Pagination {
    /// Page count is `ceil(total / per_page)`, at least 1; `page` is clamped into range.
    pub fn new(total: u64, page: i64, per_page: i64) -> Self {
        let per_page = per_page.max(1) as u64;
        let pages = total.div_ceil(per_page).max(1);
        let page = (page.max(1) as u64).min(pages);
        Self {
            total,
            page,
            per_page,
            pages,
            has_prev: page > 1,
            has_next: page < pages,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page - 1) * self.per_page
    }
}

/// One page of rows plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub data: Fetched,
    pub pagination: Pagination,
}

/// Fluent builder bound to one named connection.
#[derive(Debug)]
pub struct Db {
    manager: Arc<ConnectionManager>,
    connection: String,
    state: QueryState,
    fetch_mode: FetchMode,
    exec: Executor,
}

impl Db {
    /// Builder on the manager's default connection.
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        let connection = manager.default_connection().to_string();
        Self {
            manager,
            connection,
            state: QueryState::new(),
            fetch_mode: FetchMode::default(),
            exec: Executor::default(),
        }
    }

    /// Independent builder bound to `name`.
    ///
    /// The query state is deep-copied and the manager is shared. Fetch, error and
    /// debug modes carry over; the query log, last error and last query start empty.
    pub fn with_connection(&self, name: &str) -> Db {
        Db {
            manager: Arc::clone(&self.manager),
            connection: name.to_string(),
            state: self.state.clone(),
            fetch_mode: self.fetch_mode,
            exec: self.exec.fresh_copy(),
        }
    }

    pub fn connection_name(&self) -> &str {
        &self.connection
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Clauses accumulated so far.
    pub fn state(&self) -> &QueryState {
        &self.state
    }

    // ==================== Clauses ====================

    /// `AND column = value`
    pub fn and_where(&mut self, column: &str, value: impl Into<Operand>) -> &mut Self {
        self.and_where_op(column, "=", value)
    }

    /// `AND column <op> value`
    pub fn and_where_op(&mut self, column: &str, op: &str, value: impl Into<Operand>) -> &mut Self {
        self.state
            .push_where(Connective::And, column, op, value.into());
        self
    }

    /// `OR column = value`
    pub fn or_where(&mut self, column: &str, value: impl Into<Operand>) -> &mut Self {
        self.or_where_op(column, "=", value)
    }

    pub fn or_where_op(&mut self, column: &str, op: &str, value: impl Into<Operand>) -> &mut Self {
        self.state.push_where(Connective::Or, column, op, value.into());
        self
    }

    pub fn having(&mut self, column: &str, value: impl Into<Operand>) -> &mut Self {
        self.having_op(column, "=", value)
    }

    pub fn having_op(&mut self, column: &str, op: &str, value: impl Into<Operand>) -> &mut Self {
        self.state
            .push_having(Connective::And, column, op, value.into());
        self
    }

    pub fn or_having(&mut self, column: &str, value: impl Into<Operand>) -> &mut Self {
        self.or_having_op(column, "=", value)
    }

    pub fn or_having_op(&mut self, column: &str, op: &str, value: impl Into<Operand>) -> &mut Self {
        self.state
            .push_having(Connective::Or, column, op, value.into());
        self
    }

    /// `<type> JOIN table [AS alias] ON left op right`. `on` must be a plain
    /// `identifier op identifier` comparison; it is checked at compile time.
    pub fn join(
        &mut self,
        table: &str,
        on: &str,
        join_type: JoinType,
        alias: Option<&str>,
    ) -> &mut Self {
        self.state.push_join(join_type, table, on, alias);
        self
    }

    pub fn inner_join(&mut self, table: &str, on: &str) -> &mut Self {
        self.join(table, on, JoinType::Inner, None)
    }

    pub fn left_join(&mut self, table: &str, on: &str) -> &mut Self {
        self.join(table, on, JoinType::Left, None)
    }

    pub fn right_join(&mut self, table: &str, on: &str) -> &mut Self {
        self.join(table, on, JoinType::Right, None)
    }

    pub fn group_by(&mut self, columns: impl Into<Columns>) -> &mut Self {
        self.state.push_group_by(columns.into());
        self
    }

    pub fn order_by(&mut self, column: &str, direction: Direction) -> &mut Self {
        self.state.push_order_by(column, direction);
        self
    }

    /// Negative values are floored at 0.
    pub fn limit(&mut self, n: i64) -> &mut Self {
        self.state.set_limit(n);
        self
    }

    /// Negative values are floored at 0.
    pub fn offset(&mut self, n: i64) -> &mut Self {
        self.state.set_offset(n);
        self
    }

    // ==================== Modes ====================

    /// Return plain rows (the default).
    pub fn as_array(&mut self) -> &mut Self {
        self.fetch_mode = FetchMode::Rows;
        self
    }

    /// Return owned field-name → value records.
    pub fn as_object(&mut self) -> &mut Self {
        self.fetch_mode = FetchMode::Records;
        self
    }

    /// Return one JSON string per call.
    pub fn as_json(&mut self, options: JsonOptions) -> &mut Self {
        self.fetch_mode = FetchMode::Json(options);
        self
    }

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch_mode
    }

    /// Toggle the in-memory query log, keeping at most `max_log_size` entries.
    pub fn debug(&mut self, enabled: bool, max_log_size: usize) -> &mut Self {
        self.exec.set_debug(enabled, max_log_size);
        self
    }

    pub fn error_mode(&mut self, mode: ErrorMode) -> &mut Self {
        self.exec.error_mode = mode;
        self
    }

    pub fn current_error_mode(&self) -> ErrorMode {
        self.exec.error_mode
    }

    // ==================== Introspection ====================

    /// Debug log entries, oldest first. Empty unless `debug(true, ..)` is on.
    pub fn query_log(&self) -> &VecDeque<QueryLogEntry> {
        self.exec.log()
    }

    pub fn clear_query_log(&mut self) -> &mut Self {
        self.exec.clear_log();
        self
    }

    /// Failure of the most recent statement, if it failed.
    pub fn last_error(&self) -> Option<&ErrorContext> {
        self.exec.last_error()
    }

    /// The most recently executed statement.
    pub fn last_query(&self) -> Option<&CompiledQuery> {
        self.exec.last_query()
    }

    /// SELECT for the current state, without executing it or clearing the state.
    pub fn compile_select(&self, table: &str, columns: impl Into<Columns>) -> DbResult<CompiledQuery> {
        let columns = columns.into();
        self.compile(|c| c.select(&self.state, table, &columns))
    }

    pub fn statement_cache_stats(&self) -> Option<StatementCacheStats> {
        self.manager.statement_cache_stats(&self.connection)
    }

    // ==================== Reads ====================

    /// `SELECT columns FROM table ...`, optionally limited.
    pub fn get(
        &mut self,
        table: &str,
        limit: Option<i64>,
        columns: impl Into<Columns>,
    ) -> DbResult<Fetched> {
        let mut state = self.state.take();
        if let Some(n) = limit {
            state.set_limit(n);
        }
        let columns = columns.into();
        let query = self.compile(|c| c.select(&state, table, &columns))?;
        let done = self.run(&query, true)?;
        Ok(self.fetch_mode.shape(done.rows))
    }

    /// First row of `get(table, Some(1), columns)`.
    pub fn get_one(&mut self, table: &str, columns: impl Into<Columns>) -> DbResult<Option<FetchedRow>> {
        let mut state = self.state.take();
        state.set_limit(1);
        let columns = columns.into();
        let query = self.compile(|c| c.select(&state, table, &columns))?;
        let done = self.run(&query, true)?;
        Ok(done
            .rows
            .into_iter()
            .next()
            .map(|row| self.fetch_mode.shape_one(row)))
    }

    /// First column of the first row.
    pub fn get_value(&mut self, table: &str, column: &str) -> DbResult<Option<Value>> {
        let mut state = self.state.take();
        state.set_limit(1);
        let columns = Columns::from(column);
        let query = self.compile(|c| c.select(&state, table, &columns))?;
        let done = self.run(&query, true)?;
        Ok(first_value(done))
    }

    /// Run caller-supplied SQL with `?` placeholders.
    pub fn raw_query(&mut self, sql: &str, params: &[Value]) -> DbResult<Fetched> {
        self.state.reset();
        let done = self.run(&CompiledQuery::new(sql, params.to_vec()), true)?;
        Ok(self.fetch_mode.shape(done.rows))
    }

    pub fn raw_query_one(&mut self, sql: &str, params: &[Value]) -> DbResult<Option<FetchedRow>> {
        self.state.reset();
        let done = self.run(&CompiledQuery::new(sql, params.to_vec()), true)?;
        Ok(done
            .rows
            .into_iter()
            .next()
            .map(|row| self.fetch_mode.shape_one(row)))
    }

    pub fn raw_query_value(&mut self, sql: &str, params: &[Value]) -> DbResult<Option<Value>> {
        self.state.reset();
        let done = self.run(&CompiledQuery::new(sql, params.to_vec()), true)?;
        Ok(first_value(done))
    }

    /// Run caller-supplied SQL that returns no rows; returns the affected-row count.
    pub fn raw_exec(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        self.state.reset();
        let done = self.run(&CompiledQuery::new(sql, params.to_vec()), false)?;
        Ok(done.row_count)
    }

    /// Count matching rows, then fetch page `page` (1-based, clamped) of `per_page` rows.
    pub fn paginate(
        &mut self,
        table: &str,
        page: i64,
        per_page: i64,
        columns: impl Into<Columns>,
    ) -> DbResult<Page> {
        let mut state = self.state.take();
        let columns = columns.into();

        let count = self.compile(|c| c.count(&state, table, &columns))?;
        let done = self.run(&count, true)?;
        let total = first_value(done)
            .and_then(|v| v.as_i64())
            .map_or(0, |n| n.max(0) as u64);

        let pagination = Pagination::new(total, page, per_page);
        state.limit = Some(pagination.per_page);
        state.offset = Some(pagination.offset());

        let select = self.compile(|c| c.select(&state, table, &columns))?;
        let done = self.run(&select, true)?;
        Ok(Page {
            data: self.fetch_mode.shape(done.rows),
            pagination,
        })
    }

    // ==================== Writes ====================

    /// Insert one row and return the generated id (`0` when a failure was absorbed
    /// in safe mode).
    pub fn insert(&mut self, table: &str, data: impl Into<Record>) -> DbResult<Value> {
        self.state.reset();
        let data = data.into();
        let query = self.compile(|c| c.insert(table, &data))?;
        self.run(&query, false)?;
        if self.exec.last_error().is_some() {
            return Ok(Value::Int(0));
        }
        self.manager
            .with_connection(&self.connection, |conn| conn.last_insert_id())
    }

    /// Insert several rows sharing the same ordered columns in one statement.
    pub fn insert_multi<I, R>(&mut self, table: &str, rows: I) -> DbResult<u64>
    where
        I: IntoIterator<Item = R>,
        R: Into<Record>,
    {
        self.state.reset();
        let rows: Vec<Record> = rows.into_iter().map(Into::into).collect();
        let query = self.compile(|c| c.insert_multi(table, &rows))?;
        Ok(self.run(&query, false)?.row_count)
    }

    /// `UPDATE table SET ... WHERE ...`; refuses to run without a WHERE predicate.
    pub fn update(&mut self, table: &str, data: impl Into<Record>) -> DbResult<u64> {
        let state = self.state.take();
        require_where(&state, "UPDATE")?;
        let data = data.into();
        let query = self.compile(|c| c.update(&state, table, &data))?;
        Ok(self.run(&query, false)?.row_count)
    }

    /// `DELETE FROM table WHERE ...`; refuses to run without a WHERE predicate.
    pub fn delete(&mut self, table: &str, limit: Option<i64>) -> DbResult<u64> {
        let mut state = self.state.take();
        require_where(&state, "DELETE")?;
        if let Some(n) = limit {
            state.set_limit(n);
        }
        let query = self.compile(|c| c.delete(&state, table))?;
        Ok(self.run(&query, false)?.row_count)
    }

    // ==================== Transactions ====================

    /// Begin a transaction, or a savepoint when one is already open.
    pub fn start_transaction(&mut self) -> DbResult<()> {
        self.manager.start_transaction(&self.connection).map(|_| ())
    }

    pub fn commit(&mut self) -> DbResult<()> {
        self.manager.commit(&self.connection).map(|_| ())
    }

    pub fn rollback(&mut self) -> DbResult<()> {
        self.manager.rollback(&self.connection).map(|_| ())
    }

    pub fn transaction_depth(&self) -> u32 {
        self.manager.transaction_depth(&self.connection)
    }

    /// Run `f` inside a transaction (or savepoint): commit on `Ok`, roll back on `Err`.
    pub fn transaction<T, F>(&mut self, f: F) -> DbResult<T>
    where
        F: FnOnce(&mut Db) -> DbResult<T>,
    {
        self.start_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(
                        target: "fluentdb.tx",
                        connection = %self.connection,
                        error = %rollback_err,
                        "rollback after failed transaction body also failed"
                    );
                }
                Err(err)
            }
        }
    }

    // ==================== Health ====================

    /// Ask the health-check hook, or run `SELECT 1` when none is registered.
    pub fn health_check(&self) -> bool {
        if let Some(hook) = &self.manager.hooks().health_check {
            return hook(&HealthCheckContext {
                connection: &self.connection,
            });
        }
        let probe = self
            .manager
            .with_connection(&self.connection, |conn| {
                conn.execute("SELECT 1", &[], true)
                    .map_err(|e| DbError::driver(conn.name(), e))
            });
        match probe {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    target: "fluentdb.connect",
                    connection = %self.connection,
                    error = %err,
                    "health check failed"
                );
                false
            }
        }
    }

    fn compile(
        &self,
        f: impl FnOnce(&Compiler<'_>) -> DbResult<CompiledQuery>,
    ) -> DbResult<CompiledQuery> {
        let quoter = self.manager.quoter(&self.connection)?;
        f(&Compiler::new(&quoter))
    }

    fn run(&mut self, query: &CompiledQuery, fetch_rows: bool) -> DbResult<Executed> {
        self.exec
            .run(&self.manager, &self.connection, query, fetch_rows)
    }
}

fn first_value(done: Executed) -> Option<Value> {
    done.rows
        .into_iter()
        .next()
        .and_then(|row| row.get_idx(0).cloned())
}
