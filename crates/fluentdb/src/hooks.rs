//! Execution hooks.
//!
//! [`Hooks`] is an explicit set of optional callbacks supplied when the connection
//! manager is built. Each callback receives a read-only context borrowed for the
//! duration of the call.
//!
//! ```ignore
//! use fluentdb::{Hooks, RetryDecision};
//! use std::time::Duration;
//!
//! let hooks = Hooks::new()
//!     .after_query(|ctx| tracing::info!(sql = ctx.sql, ms = ctx.duration_ms(), "done"))
//!     .retry_decider(|ctx| {
//!         (ctx.error.code.as_deref() == Some("40001"))
//!             .then(|| RetryDecision::new(3, Duration::from_millis(50)))
//!     });
//! ```

use crate::error::{DriverError, ErrorContext};
use crate::row::Row;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Passed to `before_query`.
#[derive(Debug, Clone, Copy)]
pub struct BeforeQueryContext<'a> {
    pub connection: &'a str,
    pub sql: &'a str,
    /// Sanitized parameters.
    pub params: &'a [Value],
}

/// Passed to `after_query` once a statement succeeded.
#[derive(Debug, Clone, Copy)]
pub struct AfterQueryContext<'a> {
    pub connection: &'a str,
    pub sql: &'a str,
    pub params: &'a [Value],
    pub duration: Duration,
    pub row_count: u64,
    /// Fetched rows, for row-returning calls.
    pub rows: Option<&'a [Row]>,
}

impl AfterQueryContext<'_> {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Passed to `on_error` after a statement failed.
#[derive(Debug, Clone, Copy)]
pub struct ErrorHookContext<'a> {
    pub connection: &'a str,
    pub sql: &'a str,
    pub params: &'a [Value],
    pub duration: Duration,
    /// The recorded failure.
    pub error: &'a ErrorContext,
    /// The driver error that caused it.
    pub source: &'a DriverError,
}

impl ErrorHookContext<'_> {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Passed to `on_connect` after a connection was opened.
#[derive(Debug, Clone, Copy)]
pub struct ConnectContext<'a> {
    pub connection: &'a str,
    /// Connection config with the password redacted.
    pub config: &'a serde_json::Value,
    /// Driver name reported by the connection.
    pub driver: &'a str,
}

/// Passed to `retry_decider` after the first failure of a statement.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    pub connection: &'a str,
    pub sql: &'a str,
    pub params: &'a [Value],
    pub error: &'a DriverError,
    pub context: &'a ErrorContext,
}

/// Passed to `health_check`.
#[derive(Debug, Clone, Copy)]
pub struct HealthCheckContext<'a> {
    pub connection: &'a str,
}

/// What a retry decider asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Additional attempts after the first failure.
    pub retries: u32,
    /// Blocking sleep before each attempt.
    pub delay: Duration,
    /// Whether retried attempts read the result set.
    pub fetch_rows: bool,
}

impl RetryDecision {
    /// Retry `retries` times, `delay` apart, reading rows.
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            delay,
            fetch_rows: true,
        }
    }

    pub fn fetch_rows(mut self, fetch_rows: bool) -> Self {
        self.fetch_rows = fetch_rows;
        self
    }
}

pub type BeforeQueryHook = Arc<dyn Fn(&BeforeQueryContext<'_>) + Send + Sync>;
pub type AfterQueryHook = Arc<dyn Fn(&AfterQueryContext<'_>) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&ErrorHookContext<'_>) + Send + Sync>;
pub type ConnectHook = Arc<dyn Fn(&ConnectContext<'_>) + Send + Sync>;
pub type RetryDecider = Arc<dyn Fn(&RetryContext<'_>) -> Option<RetryDecision> + Send + Sync>;
pub type HealthCheckHook = Arc<dyn Fn(&HealthCheckContext<'_>) -> bool + Send + Sync>;

/// Optional callbacks consulted by the connection manager and the execution pipeline.
#[derive(Clone, Default)]
pub struct Hooks {
    pub before_query: Option<BeforeQueryHook>,
    pub after_query: Option<AfterQueryHook>,
    pub on_error: Option<ErrorHook>,
    pub on_connect: Option<ConnectHook>,
    pub retry_decider: Option<RetryDecider>,
    pub health_check: Option<HealthCheckHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_query<F>(mut self, f: F) -> Self
    where
        F: Fn(&BeforeQueryContext<'_>) + Send + Sync + 'static,
    {
        self.before_query = Some(Arc::new(f));
        self
    }

    pub fn after_query<F>(mut self, f: F) -> Self
    where
        F: Fn(&AfterQueryContext<'_>) + Send + Sync + 'static,
    {
        self.after_query = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&ErrorHookContext<'_>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&ConnectContext<'_>) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn retry_decider<F>(mut self, f: F) -> Self
    where
        F: Fn(&RetryContext<'_>) -> Option<RetryDecision> + Send + Sync + 'static,
    {
        self.retry_decider = Some(Arc::new(f));
        self
    }

    pub fn health_check<F>(mut self, f: F) -> Self
    where
        F: Fn(&HealthCheckContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.health_check = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_query", &self.before_query.is_some())
            .field("after_query", &self.after_query.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("retry_decider", &self.retry_decider.is_some())
            .field("health_check", &self.health_check.is_some())
            .finish()
    }
}
