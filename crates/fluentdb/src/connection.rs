//! Connection & transaction management.
//!
//! A [`ConnectionManager`] owns every named connection. Connections are opened lazily
//! on first use and then kept for the manager's lifetime. Each one carries its
//! identifier quoter (from the driver's dialect), its statement cache and its
//! transaction depth.
//!
//! Transaction depth per connection:
//!
//! | call | depth 0 | depth 1 | depth N > 1 |
//! |---|---|---|---|
//! | `start_transaction` | BEGIN → 1 | `SAVEPOINT sp_2` → 2 | `SAVEPOINT sp_{N+1}` |
//! | `commit` | no-op | COMMIT → 0 | `RELEASE SAVEPOINT sp_N` → N-1 |
//! | `rollback` | no-op | ROLLBACK → 0 | `ROLLBACK TO SAVEPOINT sp_N` → N-1 |
//!
//! Savepoint steps fail with [`DbError::Transaction`] on dialects without savepoints.

use crate::config::{validate_charset, DatabaseConfig};
use crate::driver::{Driver, DriverConnection, DriverResult};
use crate::error::{DbError, DbResult};
use crate::hooks::{ConnectContext, Hooks};
use crate::ident::{Dialect, IdentQuoter};
use crate::row::Row;
use crate::statement_cache::{StatementCache, StatementCacheStats};
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn savepoint_name(depth: u32) -> String {
    format!("sp_{depth}")
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Result of one statement execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Executed {
    pub rows: Vec<Row>,
    pub row_count: u64,
}

/// One open connection and the state the manager keeps for it.
#[derive(Debug)]
pub struct ManagedConnection {
    name: String,
    handle: Box<dyn DriverConnection>,
    quoter: IdentQuoter,
    cache: StatementCache,
    depth: u32,
}

impl ManagedConnection {
    fn new(name: &str, handle: Box<dyn DriverConnection>, cache_size: usize) -> Self {
        let quoter = IdentQuoter::new(Dialect::from_driver_name(handle.driver_name()));
        Self {
            name: name.to_string(),
            handle,
            quoter,
            cache: StatementCache::new(cache_size),
            depth: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver_name(&self) -> &str {
        self.handle.driver_name()
    }

    pub fn quoter(&self) -> &IdentQuoter {
        &self.quoter
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn cache_stats(&self) -> StatementCacheStats {
        self.cache.stats()
    }

    /// Reset, bind and execute the cached statement for `sql`.
    pub(crate) fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        fetch_rows: bool,
    ) -> DriverResult<Executed> {
        self.cache.with_statement(self.handle.as_mut(), sql, |stmt| -> DriverResult<Executed> {
            stmt.reset();
            stmt.execute(params)?;
            if fetch_rows {
                let rows = stmt.fetch_all()?;
                let row_count = rows.len() as u64;
                Ok(Executed { rows, row_count })
            } else {
                Ok(Executed {
                    rows: Vec::new(),
                    row_count: stmt.row_count(),
                })
            }
        })?
    }

    pub(crate) fn last_insert_id(&mut self) -> DbResult<Value> {
        self.handle
            .last_insert_id()
            .map_err(|e| DbError::driver(&self.name, e))
    }

    fn require_savepoints(&self, action: &str) -> DbResult<()> {
        if self.quoter.supports_savepoints() {
            return Ok(());
        }
        Err(DbError::transaction(format!(
            "cannot {action} on connection '{}': driver '{}' does not support savepoints",
            self.name,
            self.handle.driver_name()
        )))
    }

    fn exec_savepoint(&mut self, sql: &str) -> DbResult<()> {
        self.handle
            .exec(sql)
            .map(|_| ())
            .map_err(|e| DbError::driver(&self.name, e))
    }

    /// Begin a transaction, or push a savepoint when one is already active.
    pub fn begin(&mut self) -> DbResult<u32> {
        if self.depth == 0 {
            self.handle
                .begin_transaction()
                .map_err(|e| DbError::driver(&self.name, e))?;
            tracing::debug!(target: "fluentdb.tx", connection = %self.name, "BEGIN");
        } else {
            self.require_savepoints("start a nested transaction")?;
            let sql = format!("SAVEPOINT {}", savepoint_name(self.depth + 1));
            self.exec_savepoint(&sql)?;
            tracing::debug!(target: "fluentdb.tx", connection = %self.name, depth = self.depth + 1, "{sql}");
        }
        self.depth += 1;
        Ok(self.depth)
    }

    /// Commit the transaction, or release the innermost savepoint. No-op at depth 0.
    pub fn commit(&mut self) -> DbResult<u32> {
        match self.depth {
            0 => {}
            1 => {
                self.handle
                    .commit()
                    .map_err(|e| DbError::driver(&self.name, e))?;
                tracing::debug!(target: "fluentdb.tx", connection = %self.name, "COMMIT");
                self.depth = 0;
            }
            depth => {
                self.require_savepoints("release a savepoint")?;
                let sql = format!("RELEASE SAVEPOINT {}", savepoint_name(depth));
                self.exec_savepoint(&sql)?;
                tracing::debug!(target: "fluentdb.tx", connection = %self.name, depth, "{sql}");
                self.depth -= 1;
            }
        }
        Ok(self.depth)
    }

    /// Roll back the transaction, or to the innermost savepoint. No-op at depth 0.
    pub fn rollback(&mut self) -> DbResult<u32> {
        match self.depth {
            0 => {}
            1 => {
                self.handle
                    .rollback()
                    .map_err(|e| DbError::driver(&self.name, e))?;
                tracing::debug!(target: "fluentdb.tx", connection = %self.name, "ROLLBACK");
                self.depth = 0;
            }
            depth => {
                self.require_savepoints("roll back to a savepoint")?;
                let sql = format!("ROLLBACK TO SAVEPOINT {}", savepoint_name(depth));
                self.exec_savepoint(&sql)?;
                tracing::debug!(target: "fluentdb.tx", connection = %self.name, depth, "{sql}");
                self.depth -= 1;
            }
        }
        Ok(self.depth)
    }
}

/// Per-name slot; filled once the connection has been opened.
type Slot = Mutex<Option<Arc<Mutex<ManagedConnection>>>>;

/// Shared owner of all named connections.
///
/// Builders hold it behind an `Arc`; it is never copied. The name map is only locked
/// to look up or insert a slot. Opening happens under the slot's own lock, so a slow
/// connect on one name never blocks the others, and `on_connect` runs with no lock
/// held.
pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    config: DatabaseConfig,
    hooks: Hooks,
    connections: Mutex<HashMap<String, Arc<Slot>>>,
}

impl ConnectionManager {
    pub fn new<D: Driver + 'static>(driver: D, config: DatabaseConfig) -> Self {
        Self::from_arc(Arc::new(driver), config)
    }

    pub fn from_arc(driver: Arc<dyn Driver>, config: DatabaseConfig) -> Self {
        Self {
            driver,
            config,
            hooks: Hooks::default(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn default_connection(&self) -> &str {
        &self.config.default_connection
    }

    /// Whether `name` has already been opened.
    pub fn is_connected(&self, name: &str) -> bool {
        self.opened(name).is_some()
    }

    /// Open `name` if needed and return its shared handle.
    pub fn connection(&self, name: &str) -> DbResult<Arc<Mutex<ManagedConnection>>> {
        let slot = {
            let mut connections = lock(&self.connections);
            Arc::clone(connections.entry(name.to_string()).or_default())
        };

        let conn = {
            let mut slot = lock(&slot);
            if let Some(conn) = slot.as_ref() {
                return Ok(Arc::clone(conn));
            }
            let conn = Arc::new(Mutex::new(self.open(name)?));
            *slot = Some(Arc::clone(&conn));
            conn
        };

        if let Some(hook) = &self.hooks.on_connect {
            let config = self.config.get(name)?.redacted();
            let driver = lock(&conn).driver_name().to_string();
            hook(&ConnectContext {
                connection: name,
                config: &config,
                driver: &driver,
            });
        }
        Ok(conn)
    }

    /// Run `f` with exclusive access to the named connection, opening it if needed.
    pub fn with_connection<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut ManagedConnection) -> DbResult<R>,
    ) -> DbResult<R> {
        let conn = self.connection(name)?;
        let mut guard = lock(&conn);
        f(&mut guard)
    }

    pub fn quoter(&self, name: &str) -> DbResult<IdentQuoter> {
        self.with_connection(name, |c| Ok(c.quoter().clone()))
    }

    pub fn start_transaction(&self, name: &str) -> DbResult<u32> {
        self.with_connection(name, ManagedConnection::begin)
    }

    pub fn commit(&self, name: &str) -> DbResult<u32> {
        self.with_connection(name, ManagedConnection::commit)
    }

    pub fn rollback(&self, name: &str) -> DbResult<u32> {
        self.with_connection(name, ManagedConnection::rollback)
    }

    /// Current depth; `0` for connections not opened yet.
    pub fn transaction_depth(&self, name: &str) -> u32 {
        self.opened(name).map_or(0, |c| lock(&c).depth())
    }

    pub fn statement_cache_stats(&self, name: &str) -> Option<StatementCacheStats> {
        self.opened(name).map(|c| lock(&c).cache_stats())
    }

    /// Handle of an already opened connection. Never opens one.
    fn opened(&self, name: &str) -> Option<Arc<Mutex<ManagedConnection>>> {
        let slot = lock(&self.connections).get(name).cloned()?;
        lock(&slot).clone()
    }

    fn open(&self, name: &str) -> DbResult<ManagedConnection> {
        let config = self.config.get(name)?;
        let handle = self
            .driver
            .connect(config)
            .map_err(|e| DbError::driver(name, e))?;
        let mut conn = ManagedConnection::new(name, handle, self.config.statement_cache_size);

        if conn.quoter().dialect().needs_session_charset() {
            validate_charset(&config.charset)?;
            conn.handle
                .exec(&format!("SET NAMES {}", config.charset))
                .map_err(|e| DbError::driver(name, e))?;
        }

        tracing::info!(
            target: "fluentdb.connect",
            connection = name,
            driver = conn.driver_name(),
            config = %config.redacted(),
            "connection established"
        );
        Ok(conn)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = lock(&self.connections).keys().cloned().collect();
        let open: Vec<String> = names
            .into_iter()
            .filter(|name| self.is_connected(name))
            .collect();
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("open", &open)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::testing::ScriptedDriver;

    fn manager(driver_name: &str) -> (ConnectionManager, crate::testing::Script) {
        let driver = ScriptedDriver::new(driver_name);
        let script = driver.script();
        let config = DatabaseConfig::single(ConnectionConfig::new("scripted"));
        (ConnectionManager::new(driver, config), script)
    }

    #[test]
    fn connects_lazily_once() {
        let (mgr, script) = manager("pgsql");
        assert!(!mgr.is_connected("default"));
        assert_eq!(script.log().connects, 0);

        mgr.quoter("default").unwrap();
        mgr.quoter("default").unwrap();
        assert!(mgr.is_connected("default"));
        assert_eq!(script.log().connects, 1);
    }

    #[test]
    fn unknown_connection_is_configuration_error() {
        let (mgr, _) = manager("pgsql");
        let err = mgr.quoter("reporting").unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[test]
    fn mysql_sets_session_charset() {
        let (mgr, script) = manager("mysql");
        mgr.quoter("default").unwrap();
        assert_eq!(script.log().raw, vec!["SET NAMES utf8mb4"]);

        let (mgr, script) = manager("pgsql");
        mgr.quoter("default").unwrap();
        assert!(script.log().raw.is_empty());
    }

    #[test]
    fn on_connect_sees_redacted_config() {
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let driver = ScriptedDriver::new("sqlite");
        let config = DatabaseConfig::single(ConnectionConfig::new("file.db").password("pw"));
        let mgr = ConnectionManager::new(driver, config).with_hooks(Hooks::new().on_connect(
            move |ctx| {
                *sink.lock().unwrap() = Some((ctx.driver.to_string(), ctx.config["password"].clone()));
            },
        ));

        mgr.quoter("default").unwrap();
        let (driver, password) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(driver, "sqlite");
        assert_eq!(password, "***");
    }

    #[test]
    fn on_connect_may_call_back_into_manager() {
        let driver = ScriptedDriver::new("pgsql");
        let config = DatabaseConfig::single(ConnectionConfig::new("scripted"))
            .connection("replica", ConnectionConfig::new("scripted-replica"));
        let mgr = Arc::new_cyclic(|weak: &std::sync::Weak<ConnectionManager>| {
            let weak = weak.clone();
            ConnectionManager::new(driver, config).with_hooks(Hooks::new().on_connect(
                move |ctx| {
                    let Some(mgr) = weak.upgrade() else { return };
                    assert!(mgr.is_connected(ctx.connection));
                    assert_eq!(mgr.transaction_depth(ctx.connection), 0);
                    assert!(mgr.statement_cache_stats(ctx.connection).is_some());
                    if ctx.connection == "default" {
                        mgr.quoter("replica").unwrap();
                    }
                },
            ))
        });

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = Arc::clone(&mgr);
        std::thread::spawn(move || {
            let _ = tx.send(worker.quoter("default").is_ok());
        });
        let finished = rx.recv_timeout(std::time::Duration::from_secs(5));
        assert_eq!(finished, Ok(true), "on_connect hook could not reach the manager");
        assert!(mgr.is_connected("default"));
        assert!(mgr.is_connected("replica"));
    }

    #[test]
    fn connect_failure_is_not_cached() {
        let (mgr, script) = manager("pgsql");
        script.fail_connect();
        assert!(matches!(mgr.quoter("default"), Err(DbError::Driver { .. })));
        assert!(!mgr.is_connected("default"));
    }

    #[test]
    fn nested_transactions_use_positional_savepoints() {
        let (mgr, script) = manager("pgsql");

        assert_eq!(mgr.start_transaction("default").unwrap(), 1);
        assert_eq!(mgr.start_transaction("default").unwrap(), 2);
        assert_eq!(mgr.start_transaction("default").unwrap(), 3);
        assert_eq!(mgr.rollback("default").unwrap(), 2);
        assert_eq!(mgr.commit("default").unwrap(), 1);
        assert_eq!(mgr.commit("default").unwrap(), 0);
        assert_eq!(mgr.commit("default").unwrap(), 0);
        assert_eq!(mgr.rollback("default").unwrap(), 0);

        let log = script.log();
        assert_eq!(log.tx, vec!["begin", "commit"]);
        assert_eq!(
            log.raw,
            vec![
                "SAVEPOINT sp_2",
                "SAVEPOINT sp_3",
                "ROLLBACK TO SAVEPOINT sp_3",
                "RELEASE SAVEPOINT sp_2",
            ]
        );
    }

    #[test]
    fn depth_is_max_of_zero_and_starts_minus_ends() {
        for (starts, ends) in [(0u32, 3u32), (3, 1), (4, 4), (2, 5), (5, 0)] {
            let (mgr, _) = manager("sqlite");
            for _ in 0..starts {
                mgr.start_transaction("default").unwrap();
            }
            for i in 0..ends {
                if i % 2 == 0 {
                    mgr.commit("default").unwrap();
                } else {
                    mgr.rollback("default").unwrap();
                }
            }
            assert_eq!(mgr.transaction_depth("default"), starts.saturating_sub(ends));
        }
    }

    #[test]
    fn nesting_without_savepoints_fails() {
        let (mgr, script) = manager("sqlsrv");
        mgr.start_transaction("default").unwrap();
        let err = mgr.start_transaction("default").unwrap_err();
        assert!(err.is_transaction());
        assert_eq!(mgr.transaction_depth("default"), 1);
        assert!(script.log().raw.is_empty());

        mgr.rollback("default").unwrap();
        assert_eq!(mgr.transaction_depth("default"), 0);
    }

    #[test]
    fn failed_savepoint_keeps_depth() {
        let (mgr, script) = manager("pgsql");
        script.fail_raw("SAVEPOINT sp_2");
        mgr.start_transaction("default").unwrap();
        assert!(mgr.start_transaction("default").is_err());
        assert_eq!(mgr.transaction_depth("default"), 1);
    }
}
