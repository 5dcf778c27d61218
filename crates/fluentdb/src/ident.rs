//! Safe SQL identifier handling.
//!
//! [`IdentQuoter`] validates table/column/alias names and wraps them in the quote pair
//! of the connection's dialect. It is the only place identifiers enter SQL text;
//! values never do, they are always bound as parameters.
//!
//! - Every segment must match `[A-Za-z_][A-Za-z0-9_]*`
//! - Dotted names (`schema.table.column`) are validated and quoted per segment
//!
//! # Example
//! ```ignore
//! use fluentdb::ident::{Dialect, IdentQuoter};
//!
//! let q = IdentQuoter::new(Dialect::from_driver_name("mysql"));
//! assert_eq!(q.identifier_with_dots("app.users")?, "`app`.`users`");
//! # Ok::<(), fluentdb::DbError>(())
//! ```

use crate::error::{DbError, DbResult};

/// SQL dialect, derived from the driver name reported by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
    SqlServer,
    Other(String),
}

impl Dialect {
    /// Map a driver name (`mysql`, `pgsql`, `sqlite`, ...) to a dialect.
    pub fn from_driver_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Dialect::MySql,
            "pgsql" | "postgres" | "postgresql" => Dialect::Postgres,
            "sqlite" | "sqlite3" => Dialect::Sqlite,
            "sqlsrv" | "mssql" | "dblib" => Dialect::SqlServer,
            other => Dialect::Other(other.to_string()),
        }
    }

    /// Opening and closing quote characters.
    pub fn quote_pair(&self) -> (char, char) {
        match self {
            Dialect::MySql => ('`', '`'),
            _ => ('"', '"'),
        }
    }

    /// Whether nested transactions can be emulated with `SAVEPOINT`.
    pub fn supports_savepoints(&self) -> bool {
        matches!(self, Dialect::MySql | Dialect::Postgres | Dialect::Sqlite)
    }

    /// Whether a session charset has to be set right after connecting.
    pub fn needs_session_charset(&self) -> bool {
        matches!(self, Dialect::MySql)
    }
}

/// Validates and quotes identifiers for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentQuoter {
    dialect: Dialect,
    open: char,
    close: char,
}

impl IdentQuoter {
    pub fn new(dialect: Dialect) -> Self {
        let (open, close) = dialect.quote_pair();
        Self {
            dialect,
            open,
            close,
        }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn supports_savepoints(&self) -> bool {
        self.dialect.supports_savepoints()
    }

    /// Validate a single identifier segment and wrap it in the quote pair.
    pub fn identifier(&self, name: &str) -> DbResult<String> {
        validate_segment(name)?;
        let mut out = String::with_capacity(name.len() + 2);
        out.push(self.open);
        out.push_str(name);
        out.push(self.close);
        Ok(out)
    }

    /// Validate and quote each `.`-separated segment independently.
    pub fn identifier_with_dots(&self, name: &str) -> DbResult<String> {
        if name.is_empty() {
            return Err(DbError::identifier(name, "identifier cannot be empty"));
        }
        let mut out = String::with_capacity(name.len() + 4);
        for (i, segment) in name.split('.').enumerate() {
            if i > 0 {
                out.push('.');
            }
            validate_segment(segment).map_err(|_| {
                DbError::identifier(name, format!("invalid segment '{segment}'"))
            })?;
            out.push(self.open);
            out.push_str(segment);
            out.push(self.close);
        }
        Ok(out)
    }

    /// Column reference allowing `*` and `prefix.*`.
    pub fn column_or_star(&self, name: &str) -> DbResult<String> {
        if name == "*" {
            return Ok("*".to_string());
        }
        if let Some(prefix) = name.strip_suffix(".*") {
            let mut out = self.identifier_with_dots(prefix)?;
            out.push_str(".*");
            return Ok(out);
        }
        self.identifier_with_dots(name)
    }

    /// Table reference with an optional alias: `"t" AS "a"`.
    pub fn table(&self, name: &str, alias: Option<&str>) -> DbResult<String> {
        let mut out = self.identifier_with_dots(name)?;
        if let Some(alias) = alias {
            out.push_str(" AS ");
            out.push_str(&self.identifier(alias)?);
        }
        Ok(out)
    }
}

/// Check one segment against `[A-Za-z_][A-Za-z0-9_]*`.
pub fn validate_segment(name: &str) -> DbResult<()> {
    let mut chars = name.chars();
    match chars.next() {
        None => return Err(DbError::identifier(name, "identifier cannot be empty")),
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        Some(c) => {
            return Err(DbError::identifier(
                name,
                format!("invalid identifier start character '{c}'"),
            ));
        }
    }
    if let Some(c) = chars.find(|c| !(*c == '_' || c.is_ascii_alphanumeric())) {
        return Err(DbError::identifier(
            name,
            format!("invalid character '{c}' in identifier"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg() -> IdentQuoter {
        IdentQuoter::new(Dialect::Postgres)
    }

    fn my() -> IdentQuoter {
        IdentQuoter::new(Dialect::MySql)
    }

    #[test]
    fn ident_simple() {
        assert_eq!(pg().identifier("users").unwrap(), r#""users""#);
        assert_eq!(my().identifier("users").unwrap(), "`users`");
    }

    #[test]
    fn ident_dotted() {
        assert_eq!(
            pg().identifier_with_dots("public.users").unwrap(),
            r#""public"."users""#
        );
        assert_eq!(my().identifier_with_dots("a.b.c").unwrap(), "`a`.`b`.`c`");
    }

    #[test]
    fn ident_rejects_unsafe_names() {
        for bad in ["", "1table", "my table", "a;drop", "a\"b", "é", "a-b", "`x`"] {
            assert!(pg().identifier(bad).unwrap_err().is_identifier(), "{bad}");
        }
    }

    #[test]
    fn ident_rejects_bad_dotted_segments() {
        for bad in ["", "schema..table", "schema.", ".table", "a.1b"] {
            assert!(pg().identifier_with_dots(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn column_or_star_forms() {
        assert_eq!(pg().column_or_star("*").unwrap(), "*");
        assert_eq!(pg().column_or_star("u.*").unwrap(), r#""u".*"#);
        assert_eq!(pg().column_or_star("u.id").unwrap(), r#""u"."id""#);
        assert!(pg().column_or_star(".*").is_err());
        assert!(pg().column_or_star("u.**").is_err());
    }

    #[test]
    fn table_with_alias() {
        assert_eq!(my().table("users", Some("u")).unwrap(), "`users` AS `u`");
        assert_eq!(pg().table("users", None).unwrap(), r#""users""#);
        assert!(pg().table("users", Some("u.x")).is_err());
    }

    #[test]
    fn quoting_is_deterministic_and_reparsable() {
        let q = pg();
        let once = q.identifier("created_at").unwrap();
        let inner = once.trim_matches('"');
        assert_eq!(q.identifier(inner).unwrap(), once);
    }

    #[test]
    fn dialect_detection() {
        assert_eq!(Dialect::from_driver_name("MySQL"), Dialect::MySql);
        assert_eq!(Dialect::from_driver_name("pgsql"), Dialect::Postgres);
        assert!(Dialect::from_driver_name("sqlite").supports_savepoints());
        assert!(!Dialect::from_driver_name("oci").supports_savepoints());
        assert_eq!(Dialect::from_driver_name("oci").quote_pair(), ('"', '"'));
    }
}
