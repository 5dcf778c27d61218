//! Blocking PostgreSQL driver over `tokio-postgres`.
//!
//! Each [`PostgresDriver`] owns a current-thread `tokio` runtime and blocks on it for
//! every call, so the rest of the crate stays synchronous. Do not call into it from
//! inside another async runtime.
//!
//! - `?` placeholders are rewritten to `$1, $2, ...` outside string literals, quoted
//!   identifiers and comments; `??` yields a literal `?` (for jsonb operators).
//! - Parameters bind by the statement's inferred parameter types: integers narrow to
//!   `INT2`/`INT4`, text parses into numeric, boolean, date/time and JSON types.
//! - Columns decode into [`Value`]: integers and booleans natively, everything else
//!   as text. Types without a text form here (e.g. `numeric`) must be cast in SQL.

use crate::config::ConnectionConfig;
use crate::driver::{Driver, DriverConnection, DriverResult, DriverStatement};
use crate::error::DriverError;
use crate::row::Row;
use crate::value::Value;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use std::error::Error;
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls, Statement};

type BoxError = Box<dyn Error + Sync + Send>;

/// Driver name reported by Postgres connections.
pub const DRIVER_NAME: &str = "pgsql";

fn pg_error(err: tokio_postgres::Error) -> DriverError {
    let message = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    let driver_err = DriverError::new(message);
    match err.code() {
        Some(state) => driver_err.with_code(state.code()),
        None => driver_err,
    }
}

/// Rewrite `?` placeholders to `$n`. Returns the SQL and the placeholder count.
pub fn rewrite_placeholders(sql: &str) -> (String, usize) {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut count = 0usize;
    let mut chars = sql.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                out.push(c);
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for c in chars.by_ref() {
                    out.push(c);
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                let mut prev = '\0';
                for c in chars.by_ref() {
                    out.push(c);
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '?' if chars.peek() == Some(&'?') => {
                chars.next();
                out.push('?');
            }
            '?' => {
                count += 1;
                let _ = write!(out, "${count}");
            }
            _ => out.push(c),
        }
    }
    (out, count)
}

/// A [`Value`] bound against the parameter type Postgres inferred.
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => match *ty {
                Type::BOOL => b.to_sql(ty, out),
                Type::INT2 | Type::INT4 | Type::INT8 => bind_int(i64::from(*b), ty, out),
                _ => bind_text(if *b { "true" } else { "false" }, ty, out),
            },
            Value::Int(i) => bind_int(*i, ty, out),
            Value::Text(s) => bind_text(s, ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind_int(i: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        Type::OID => u32::try_from(i)?.to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::BOOL => (i != 0).to_sql(ty, out),
        _ => bind_text(&i.to_string(), ty, out),
    }
}

fn parse_bool(s: &str) -> Result<bool, BoxError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "yes" | "on" => Ok(true),
        "f" | "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("invalid boolean literal '{other}'").into()),
    }
}

fn parse_timestamp(s: &str) -> Result<NaiveDateTime, BoxError> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(Into::into)
}

fn bind_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => s.trim().parse::<i16>()?.to_sql(ty, out),
        Type::INT4 => s.trim().parse::<i32>()?.to_sql(ty, out),
        Type::INT8 => s.trim().parse::<i64>()?.to_sql(ty, out),
        Type::OID => s.trim().parse::<u32>()?.to_sql(ty, out),
        Type::FLOAT4 => s.trim().parse::<f32>()?.to_sql(ty, out),
        Type::FLOAT8 => s.trim().parse::<f64>()?.to_sql(ty, out),
        Type::BOOL => parse_bool(s)?.to_sql(ty, out),
        Type::TIMESTAMP => parse_timestamp(s)?.to_sql(ty, out),
        Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s.trim())?
            .with_timezone(&Utc)
            .to_sql(ty, out),
        Type::DATE => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")?.to_sql(ty, out),
        Type::TIME => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        _ if <&str as ToSql>::accepts(ty) => <&str as ToSql>::to_sql(&s, ty, out),
        _ => Err(format!("cannot bind a text value to a parameter of type {ty}").into()),
    }
}

fn decode_column(row: &tokio_postgres::Row, idx: usize) -> Result<Value, tokio_postgres::Error> {
    let ty = row.columns()[idx].type_();
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|f| Value::Text(f.to_string())),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .map(|f| Value::Text(f.to_string())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|t| Value::Text(t.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|t| Value::Text(t.to_rfc3339())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| Value::Text(d.to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(idx)?
            .map(|t| Value::Text(t.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(idx)?
            .map(|j| Value::Text(j.to_string())),
        _ => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn decode_row(row: &tokio_postgres::Row, columns: &Arc<[String]>) -> DriverResult<Row> {
    let values = (0..row.len())
        .map(|idx| decode_column(row, idx))
        .collect::<Result<Vec<_>, _>>()
        .map_err(pg_error)?;
    Ok(Row::new(Arc::clone(columns), values))
}

/// Opens [`PostgresConnection`]s from `ConnectionConfig::dsn`.
///
/// The DSN is anything `tokio_postgres::Config` parses (`host=... dbname=...` or a
/// `postgres://` URL). `username`, `password` and `timeout_secs` override it;
/// `driver_options` may carry `application_name`, `options` and `dbname`.
pub struct PostgresDriver {
    runtime: Arc<Runtime>,
}

impl PostgresDriver {
    pub fn new() -> DriverResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DriverError::new(format!("failed to start postgres runtime: {e}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    fn pg_config(config: &ConnectionConfig) -> DriverResult<tokio_postgres::Config> {
        let mut pg: tokio_postgres::Config = config.dsn.parse().map_err(pg_error)?;
        if let Some(user) = &config.username {
            pg.user(user.as_str());
        }
        if let Some(password) = &config.password {
            pg.password(password.as_str());
        }
        if config.timeout_secs > 0 {
            pg.connect_timeout(config.timeout());
        }
        for (key, value) in &config.driver_options {
            match key.as_str() {
                "application_name" => {
                    pg.application_name(value.as_str());
                }
                "options" => {
                    pg.options(value.as_str());
                }
                "dbname" => {
                    pg.dbname(value.as_str());
                }
                other => {
                    tracing::debug!(target: "fluentdb.connect", option = other, "ignoring unknown postgres driver option");
                }
            }
        }
        Ok(pg)
    }
}

impl std::fmt::Debug for PostgresDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDriver").finish_non_exhaustive()
    }
}

impl Driver for PostgresDriver {
    fn connect(&self, config: &ConnectionConfig) -> DriverResult<Box<dyn DriverConnection>> {
        let pg = Self::pg_config(config)?;
        let (client, connection) = self
            .runtime
            .block_on(pg.connect(NoTls))
            .map_err(pg_error)?;
        self.runtime.spawn(async move {
            if let Err(e) = connection.await {
                tracing::warn!(target: "fluentdb.connect", error = %e, "postgres connection closed with error");
            }
        });
        Ok(Box::new(PostgresConnection {
            runtime: Arc::clone(&self.runtime),
            client: Arc::new(client),
        }))
    }
}

pub struct PostgresConnection {
    runtime: Arc<Runtime>,
    client: Arc<Client>,
}

impl PostgresConnection {
    fn simple(&mut self, sql: &str) -> DriverResult<()> {
        self.runtime
            .block_on(self.client.batch_execute(sql))
            .map_err(pg_error)
    }
}

impl DriverConnection for PostgresConnection {
    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn prepare(&mut self, sql: &str) -> DriverResult<Box<dyn DriverStatement>> {
        let (rewritten, _) = rewrite_placeholders(sql);
        let statement = self
            .runtime
            .block_on(self.client.prepare(&rewritten))
            .map_err(pg_error)?;
        let columns: Arc<[String]> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        Ok(Box::new(PostgresStatement {
            runtime: Arc::clone(&self.runtime),
            client: Arc::clone(&self.client),
            statement,
            columns,
            rows: Vec::new(),
            affected: 0,
        }))
    }

    fn exec(&mut self, sql: &str) -> DriverResult<u64> {
        let (rewritten, _) = rewrite_placeholders(sql);
        self.runtime
            .block_on(self.client.execute(rewritten.as_str(), &[]))
            .map_err(pg_error)
    }

    fn begin_transaction(&mut self) -> DriverResult<()> {
        self.simple("BEGIN")
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.simple("COMMIT")
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.simple("ROLLBACK")
    }

    fn last_insert_id(&mut self) -> DriverResult<Value> {
        match self
            .runtime
            .block_on(self.client.query_one("SELECT lastval()", &[]))
        {
            Ok(row) => row.try_get::<_, i64>(0).map(Value::Int).map_err(pg_error),
            // 55000: lastval is not yet defined in this session.
            Err(e) if e.code().is_some_and(|c| c.code() == "55000") => Ok(Value::Null),
            Err(e) => Err(pg_error(e)),
        }
    }
}

pub struct PostgresStatement {
    runtime: Arc<Runtime>,
    client: Arc<Client>,
    statement: Statement,
    columns: Arc<[String]>,
    rows: Vec<Row>,
    affected: u64,
}

impl DriverStatement for PostgresStatement {
    fn reset(&mut self) {
        self.rows.clear();
        self.affected = 0;
    }

    fn execute(&mut self, params: &[Value]) -> DriverResult<()> {
        let expected = self.statement.params().len();
        if params.len() != expected {
            return Err(DriverError::new(format!(
                "statement expects {expected} parameters, got {}",
                params.len()
            ))
            .with_code("08P01"));
        }

        let bound: Vec<PgParam<'_>> = params.iter().map(PgParam).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();

        if self.statement.columns().is_empty() {
            self.affected = self
                .runtime
                .block_on(self.client.execute(&self.statement, &refs))
                .map_err(pg_error)?;
        } else {
            let rows = self
                .runtime
                .block_on(self.client.query(&self.statement, &refs))
                .map_err(pg_error)?;
            self.rows = rows
                .iter()
                .map(|r| decode_row(r, &self.columns))
                .collect::<DriverResult<_>>()?;
            self.affected = self.rows.len() as u64;
        }
        Ok(())
    }

    fn fetch_all(&mut self) -> DriverResult<Vec<Row>> {
        Ok(std::mem::take(&mut self.rows))
    }

    fn row_count(&self) -> u64 {
        self.affected
    }
}
