//! Connection configuration.
//!
//! [`ConnectionConfig`] describes one named connection; [`DatabaseConfig`] groups the
//! named connections with the default name and the statement cache size. Both can be
//! built programmatically or loaded from TOML:
//!
//! ```toml
//! default_connection = "main"
//! statement_cache_size = 50
//!
//! [connections.main]
//! dsn = "host=localhost dbname=app"
//! username = "app"
//! password = "${APP_DB_PASSWORD}"
//! timeout_secs = 3
//! ```
//!
//! `${VAR}` references in `dsn`, `username` and `password` are expanded from the
//! environment at load time.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

const REDACTED: &str = "***";

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_connection_name() -> String {
    "default".to_string()
}

fn default_statement_cache_size() -> usize {
    100
}

fn floor_timeout<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let secs = i64::deserialize(d)?;
    Ok(secs.max(0) as u64)
}

fn redact<S: Serializer>(password: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
    match password {
        Some(_) => s.serialize_some(REDACTED),
        None => s.serialize_none(),
    }
}

/// Settings for one named connection. Immutable once handed to a connection manager.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Driver specific data source name.
    pub dsn: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, serialize_with = "redact")]
    pub password: Option<String>,
    /// Session charset, applied right after connecting on dialects that need it.
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Connect timeout in seconds. Negative values are floored at 0.
    #[serde(default = "default_timeout_secs", deserialize_with = "floor_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub persistent: bool,
    /// Extra options passed through to the driver untouched.
    #[serde(default)]
    pub driver_options: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            username: None,
            password: None,
            charset: default_charset(),
            timeout_secs: default_timeout_secs(),
            persistent: false,
            driver_options: BTreeMap::new(),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Negative values are floored at 0.
    pub fn timeout_secs(mut self, secs: i64) -> Self {
        self.timeout_secs = secs.max(0) as u64;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn driver_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver_options.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// JSON form safe for logs and hook contexts (password replaced).
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Check the fields that end up in SQL or driver calls.
    pub fn validate(&self) -> DbResult<()> {
        if self.dsn.trim().is_empty() {
            return Err(DbError::configuration("dsn must not be empty"));
        }
        validate_charset(&self.charset)
    }

    fn expand_env(&mut self) -> DbResult<()> {
        self.dsn = expand_env_vars(&self.dsn)?;
        if let Some(u) = self.username.as_mut() {
            *u = expand_env_vars(u)?;
        }
        if let Some(p) = self.password.as_mut() {
            *p = expand_env_vars(p)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("dsn", &self.dsn)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| REDACTED))
            .field("charset", &self.charset)
            .field("timeout_secs", &self.timeout_secs)
            .field("persistent", &self.persistent)
            .field("driver_options", &self.driver_options)
            .finish()
    }
}

/// Charsets are interpolated into `SET NAMES`, so only word characters are allowed.
pub(crate) fn validate_charset(charset: &str) -> DbResult<()> {
    if charset.is_empty() || !charset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::configuration(format!(
            "invalid charset '{charset}': expected [A-Za-z0-9_]+"
        )));
    }
    Ok(())
}

/// Named connections plus manager-wide settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_connection_name")]
    pub default_connection: String,
    /// Prepared statements kept per connection; `0` disables caching.
    #[serde(default = "default_statement_cache_size")]
    pub statement_cache_size: usize,
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default_connection: default_connection_name(),
            statement_cache_size: default_statement_cache_size(),
            connections: BTreeMap::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config with a single connection registered under the default name.
    pub fn single(config: ConnectionConfig) -> Self {
        Self::new().connection(default_connection_name(), config)
    }

    pub fn connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn default_connection(mut self, name: impl Into<String>) -> Self {
        self.default_connection = name.into();
        self
    }

    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Look up a named connection.
    pub fn get(&self, name: &str) -> DbResult<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| DbError::configuration(format!("no connection configured named '{name}'")))
    }

    pub fn from_toml_str(raw: &str) -> DbResult<Self> {
        let mut config: DatabaseConfig = toml::from_str(raw)
            .map_err(|e| DbError::configuration(format!("failed to parse config: {e}")))?;
        for conn in config.connections.values_mut() {
            conn.expand_env()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| DbError::configuration(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> DbResult<()> {
        if self.default_connection.trim().is_empty() {
            return Err(DbError::configuration("default_connection must not be empty"));
        }
        for (name, conn) in &self.connections {
            conn.validate()
                .map_err(|e| DbError::configuration(format!("connection '{name}': {e}")))?;
        }
        Ok(())
    }
}

fn expand_env_vars(input: &str) -> DbResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(DbError::configuration(format!(
                "unterminated env var reference in '{input}'"
            )));
        };
        let key = &after[..end];
        if key.is_empty() {
            return Err(DbError::configuration("invalid env var reference: ${}"));
        }
        let value = std::env::var(key)
            .map_err(|_| DbError::configuration(format!("env var {key} is not set")))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cfg = DatabaseConfig::from_toml_str(
            r#"
            [connections.default]
            dsn = "host=localhost"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.default_connection, "default");
        assert_eq!(cfg.statement_cache_size, 100);

        let conn = cfg.get("default").unwrap();
        assert_eq!(conn.charset, "utf8mb4");
        assert_eq!(conn.timeout_secs, 5);
        assert!(!conn.persistent);
        assert!(conn.driver_options.is_empty());
    }

    #[test]
    fn negative_timeout_floors_at_zero() {
        let cfg = DatabaseConfig::from_toml_str(
            r#"
            [connections.default]
            dsn = "x"
            timeout_secs = -3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.get("default").unwrap().timeout(), Duration::ZERO);
        assert_eq!(ConnectionConfig::new("x").timeout_secs(-1).timeout_secs, 0);
    }

    #[test]
    fn password_never_shown() {
        let conn = ConnectionConfig::new("host=db").username("app").password("hunter2");
        assert!(!format!("{conn:?}").contains("hunter2"));
        let json = conn.redacted();
        assert_eq!(json["password"], "***");
        assert_eq!(json["username"], "app");
    }

    #[test]
    fn rejects_bad_charset_and_empty_dsn() {
        let err = DatabaseConfig::from_toml_str(
            r#"
            [connections.default]
            dsn = "x"
            charset = "utf8; DROP TABLE t"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));

        let err = DatabaseConfig::single(ConnectionConfig::new("  ")).validate().unwrap_err();
        assert!(err.to_string().contains("dsn"));
    }

    #[test]
    fn missing_connection_is_configuration_error() {
        let err = DatabaseConfig::new().get("reporting").unwrap_err();
        assert!(matches!(err, DbError::Configuration(_)));
    }

    #[test]
    fn expands_env_references() {
        // SAFETY: test-local variable name, not read by other tests.
        unsafe { std::env::set_var("FLUENTDB_TEST_DB_PASSWORD", "s3cret") };
        let cfg = DatabaseConfig::from_toml_str(
            r#"
            [connections.main]
            dsn = "host=localhost"
            password = "${FLUENTDB_TEST_DB_PASSWORD}"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.get("main").unwrap().password.as_deref(),
            Some("s3cret")
        );
        assert!(expand_env_vars("${UNTERMINATED").is_err());
        assert_eq!(expand_env_vars("plain").unwrap(), "plain");
    }
}
