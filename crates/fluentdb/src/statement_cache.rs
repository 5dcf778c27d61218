//! Per-connection prepared statement cache.
//!
//! Keys are SQL text. Eviction is strict FIFO by insertion order: a hit does not
//! refresh an entry's position. A capacity of `0` disables caching and every call
//! prepares a fresh statement.

use crate::driver::{DriverConnection, DriverResult, DriverStatement};
use std::collections::{HashMap, VecDeque};

/// Hit/miss counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
pub struct StatementCache {
    capacity: usize,
    map: HashMap<String, Box<dyn DriverStatement>>,
    order: VecDeque<String>,
    stats: StatementCacheStats,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
            stats: StatementCacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.map.contains_key(sql)
    }

    /// Cached SQL texts, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn stats(&self) -> StatementCacheStats {
        self.stats
    }

    /// Run `f` with the statement for `sql`, preparing (and caching) it on a miss.
    ///
    /// Cached statements are handed out as-is; `f` must reset them before reuse.
    pub fn with_statement<R>(
        &mut self,
        conn: &mut dyn DriverConnection,
        sql: &str,
        f: impl FnOnce(&mut dyn DriverStatement) -> R,
    ) -> DriverResult<R> {
        if self.capacity == 0 {
            let mut stmt = conn.prepare(sql)?;
            return Ok(f(stmt.as_mut()));
        }

        if !self.map.contains_key(sql) {
            self.stats.misses += 1;
            let stmt = conn.prepare(sql)?;
            self.map.insert(sql.to_string(), stmt);
            self.order.push_back(sql.to_string());
            self.evict_if_needed();
        } else {
            self.stats.hits += 1;
        }

        match self.map.get_mut(sql) {
            Some(stmt) => Ok(f(stmt.as_mut())),
            None => {
                // Only reachable if the new entry was itself evicted.
                let mut stmt = conn.prepare(sql)?;
                Ok(f(stmt.as_mut()))
            }
        }
    }

    /// Drop a cached statement (e.g. after the driver invalidated it).
    pub fn remove(&mut self, sql: &str) -> bool {
        let removed = self.map.remove(sql).is_some();
        if removed {
            if let Some(pos) = self.order.iter().position(|k| k == sql) {
                let _ = self.order.remove(pos);
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn evict_if_needed(&mut self) {
        while self.map.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.map.remove(&oldest).is_some() {
                self.stats.evictions += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedConnection;

    #[test]
    fn hit_reuses_prepared_statement() {
        let mut conn = ScriptedConnection::new("pgsql");
        let mut cache = StatementCache::new(4);

        cache.with_statement(&mut conn, "SELECT 1", |_| ()).unwrap();
        cache.with_statement(&mut conn, "SELECT 1", |_| ()).unwrap();

        assert_eq!(conn.log().prepared, vec!["SELECT 1"]);
        assert_eq!(
            cache.stats(),
            StatementCacheStats {
                hits: 1,
                misses: 1,
                evictions: 0
            }
        );
    }

    #[test]
    fn evicts_oldest_inserted_first() {
        let mut conn = ScriptedConnection::new("pgsql");
        let mut cache = StatementCache::new(2);

        for sql in ["A", "B", "A", "C"] {
            cache.with_statement(&mut conn, sql, |_| ()).unwrap();
        }

        // A was hit after B was inserted, but FIFO still evicts A first.
        assert_eq!(cache.keys().collect::<Vec<_>>(), ["B", "C"]);
        assert!(!cache.contains("A"));
        assert_eq!(cache.stats().evictions, 1);

        cache.with_statement(&mut conn, "A", |_| ()).unwrap();
        assert_eq!(cache.keys().collect::<Vec<_>>(), ["C", "A"]);
        assert_eq!(conn.log().prepared, vec!["A", "B", "C", "A"]);
    }

    #[test]
    fn zero_capacity_always_prepares() {
        let mut conn = ScriptedConnection::new("pgsql");
        let mut cache = StatementCache::new(0);

        for _ in 0..3 {
            cache.with_statement(&mut conn, "SELECT 1", |_| ()).unwrap();
        }

        assert!(cache.is_empty());
        assert!(!cache.is_enabled());
        assert_eq!(conn.log().prepared.len(), 3);
    }

    #[test]
    fn prepare_failure_is_not_cached() {
        let mut conn = ScriptedConnection::new("pgsql");
        conn.fail_prepare("BROKEN");
        let mut cache = StatementCache::new(2);

        assert!(cache.with_statement(&mut conn, "BROKEN", |_| ()).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_drops_entry_and_order() {
        let mut conn = ScriptedConnection::new("pgsql");
        let mut cache = StatementCache::new(2);
        cache.with_statement(&mut conn, "A", |_| ()).unwrap();
        assert!(cache.remove("A"));
        assert!(!cache.remove("A"));
        assert_eq!(cache.keys().count(), 0);
    }
}
