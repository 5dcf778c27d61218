//! # fluentdb
//!
//! A fluent, parameter-safe query builder and execution layer over synchronous
//! prepared-statement database drivers.
//!
//! ## Features
//!
//! - **Parameter safe**: every value travels as a bound `?` parameter; identifiers are
//!   validated and quoted for the connection's dialect
//! - **Fluent state**: clause methods accumulate, terminal calls compile, run and reset
//! - **Safe defaults**: UPDATE and DELETE require a WHERE predicate
//! - **Named connections**: opened lazily, with a per-connection prepared statement cache
//! - **Nested transactions**: savepoints on `mysql`, `pgsql` and `sqlite`
//! - **Observability**: `tracing` events, an in-memory query log, and user hooks
//!   (before/after query, on error, on connect, retry, health check)
//! - **Error modes**: `Exception` propagates execution failures, `Safe` absorbs them
//!   and records the last error
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use fluentdb::{ConnectionConfig, ConnectionManager, DatabaseConfig, Db, Direction, PostgresDriver};
//!
//! let config = DatabaseConfig::single(ConnectionConfig::new("host=localhost dbname=app"));
//! let manager = Arc::new(ConnectionManager::new(PostgresDriver::new()?, config));
//! let mut db = Db::new(manager);
//!
//! let users = db
//!     .and_where("active", true)
//!     .order_by("created_at", Direction::Desc)
//!     .get("users", Some(10), "*")?;
//! ```

pub mod builder;
pub mod compile;
pub mod condition;
pub mod config;
pub mod connection;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod hooks;
pub mod ident;
pub mod row;
pub mod state;
pub mod statement_cache;
pub mod value;

#[cfg(test)]
mod testing;

pub use builder::{Db, Page, Pagination};
pub use compile::{CompiledQuery, Compiler};
pub use condition::{JoinExpr, Op, normalize_operator, parse_join_expr};
pub use config::{ConnectionConfig, DatabaseConfig};
pub use connection::{ConnectionManager, ManagedConnection};
pub use driver::{Driver, DriverConnection, DriverResult, DriverStatement};
pub use error::{DbError, DbResult, DriverError, ErrorContext};
pub use executor::{DEFAULT_MAX_LOG_SIZE, ErrorMode, QueryLogEntry};
pub use fetch::{FetchMode, Fetched, FetchedRow, JsonOptions};
pub use hooks::{
    AfterQueryContext, AfterQueryHook, BeforeQueryContext, BeforeQueryHook, ConnectContext,
    ConnectHook, ErrorHook, ErrorHookContext, HealthCheckContext, HealthCheckHook, Hooks,
    RetryContext, RetryDecider, RetryDecision,
};
pub use ident::{Dialect, IdentQuoter};
pub use row::{Record, Row};
pub use state::{Columns, Connective, Direction, JoinType, QueryState};
pub use statement_cache::StatementCacheStats;
pub use value::{Operand, ParamType, Value};

#[cfg(feature = "postgres")]
pub use drivers::postgres::PostgresDriver;
