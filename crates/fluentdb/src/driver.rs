//! Driver capability set consumed by fluentdb.
//!
//! A driver opens connections; a connection prepares statements and runs raw SQL and
//! transaction control; a statement binds positional parameters, executes, and exposes
//! its result set or affected-row count. Everything is synchronous and blocking.
//!
//! Adapters translate their native errors into [`DriverError`].

use crate::config::ConnectionConfig;
use crate::error::DriverError;
use crate::row::Row;
use crate::value::Value;

/// Result type alias for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Opens connections from a [`ConnectionConfig`].
pub trait Driver: Send + Sync {
    /// Connect using the DSN, credentials, timeout and driver options of `config`.
    fn connect(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn DriverConnection>>;
}

/// One open database session.
pub trait DriverConnection: Send {
    /// Driver/dialect name, e.g. `mysql`, `pgsql`, `sqlite`.
    fn driver_name(&self) -> &str;

    /// Prepare `sql` (positional `?` placeholders).
    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>>;

    /// Execute raw SQL without parameters and return the affected-row count.
    fn exec(&mut self, sql: &str) -> DriverResult<u64>;

    fn begin_transaction(&mut self) -> DriverResult<()>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    /// Identifier generated by the most recent INSERT on this session.
    fn last_insert_id(&mut self) -> DriverResult<Value>;
}

/// A prepared statement, reusable across executions with different parameters.
pub trait DriverStatement: Send {
    /// Close any open cursor and drop previous bindings and results.
    fn reset(&mut self);

    /// Bind `params` by position (0-based here, the driver maps as needed) and execute.
    fn execute(&mut self, params: &[Value]) -> DriverResult<()>;

    /// Rows produced by the last execution (empty for statements without a result set).
    fn fetch_all(&mut self) -> DriverResult<Vec<Row>>;

    /// Rows affected by the last execution.
    fn row_count(&self) -> u64;
}

impl std::fmt::Debug for dyn DriverStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DriverStatement")
    }
}

impl std::fmt::Debug for dyn DriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnection")
            .field("driver", &self.driver_name())
            .finish()
    }
}
