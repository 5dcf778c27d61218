//! Per-builder clause accumulator.
//!
//! Builder calls only append to or set fields of [`QueryState`]; validation of
//! identifiers, operators and join expressions happens when the state is compiled.

use crate::error::{DbError, DbResult};
use crate::value::Operand;
use std::fmt;
use std::str::FromStr;

/// Boolean connective placed before a predicate (ignored for the first one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}

impl Connective {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Connective::And => "AND",
            Connective::Or => "OR",
        }
    }
}

/// One WHERE/HAVING predicate as the caller supplied it.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub connective: Connective,
    pub column: String,
    pub op: String,
    pub value: Operand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER",
            JoinType::Left => "LEFT",
            JoinType::Right => "RIGHT",
        }
    }
}

impl FromStr for JoinType {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INNER" => Ok(JoinType::Inner),
            "LEFT" => Ok(JoinType::Left),
            "RIGHT" => Ok(JoinType::Right),
            other => Err(DbError::argument(format!("unsupported join type '{other}'"))),
        }
    }
}

/// A JOIN clause; `on` is parsed and validated at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub alias: Option<String>,
    pub on: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

impl FromStr for Direction {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(Direction::Asc),
            "DESC" => Ok(Direction::Desc),
            other => Err(DbError::argument(format!(
                "unsupported order direction '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A list of column references (`*`, `t.*`, `col`, `t.col`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Columns(pub Vec<String>);

impl Columns {
    pub fn star() -> Self {
        Columns(vec!["*".to_string()])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Columns {
    fn default() -> Self {
        Self::star()
    }
}

impl From<&str> for Columns {
    fn from(c: &str) -> Self {
        Columns(vec![c.to_string()])
    }
}

impl From<String> for Columns {
    fn from(c: String) -> Self {
        Columns(vec![c])
    }
}

impl From<&[&str]> for Columns {
    fn from(cs: &[&str]) -> Self {
        Columns(cs.iter().map(|c| c.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Columns {
    fn from(cs: [&str; N]) -> Self {
        Columns(cs.iter().map(|c| c.to_string()).collect())
    }
}

impl From<Vec<String>> for Columns {
    fn from(cs: Vec<String>) -> Self {
        Columns(cs)
    }
}

impl From<Vec<&str>> for Columns {
    fn from(cs: Vec<&str>) -> Self {
        Columns(cs.into_iter().map(str::to_string).collect())
    }
}

/// Mutable clause accumulator owned by one builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryState {
    pub wheres: Vec<Predicate>,
    pub havings: Vec<Predicate>,
    pub joins: Vec<Join>,
    pub group_by: Vec<String>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Clear every clause.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Move the accumulated clauses out, leaving an empty state behind.
    pub fn take(&mut self) -> QueryState {
        std::mem::take(self)
    }

    pub fn push_where(&mut self, connective: Connective, column: &str, op: &str, value: Operand) {
        self.wheres.push(Predicate {
            connective,
            column: column.to_string(),
            op: op.to_string(),
            value,
        });
    }

    pub fn push_having(&mut self, connective: Connective, column: &str, op: &str, value: Operand) {
        self.havings.push(Predicate {
            connective,
            column: column.to_string(),
            op: op.to_string(),
            value,
        });
    }

    pub fn push_join(&mut self, join_type: JoinType, table: &str, on: &str, alias: Option<&str>) {
        self.joins.push(Join {
            join_type,
            table: table.to_string(),
            alias: alias.map(str::to_string),
            on: on.to_string(),
        });
    }

    pub fn push_group_by(&mut self, columns: Columns) {
        self.group_by.extend(columns.0);
    }

    pub fn push_order_by(&mut self, column: &str, direction: Direction) {
        self.order_by.push((column.to_string(), direction));
    }

    /// Negative values are floored at 0.
    pub fn set_limit(&mut self, n: i64) {
        self.limit = Some(n.max(0) as u64);
    }

    /// Negative values are floored at 0.
    pub fn set_offset(&mut self, n: i64) {
        self.offset = Some(n.max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_and_offset_floor_at_zero() {
        let mut s = QueryState::new();
        s.set_limit(-5);
        s.set_offset(-1);
        assert_eq!(s.limit, Some(0));
        assert_eq!(s.offset, Some(0));
    }

    #[test]
    fn take_leaves_empty_state() {
        let mut s = QueryState::new();
        s.push_where(Connective::And, "a", "=", 1.into());
        s.push_order_by("b", Direction::Desc);
        let taken = s.take();
        assert!(s.is_empty());
        assert_eq!(taken.wheres.len(), 1);
    }

    #[test]
    fn clones_do_not_share_clause_lists() {
        let mut a = QueryState::new();
        a.push_where(Connective::And, "x", "=", 1.into());
        let mut b = a.clone();
        b.push_where(Connective::Or, "y", "=", 2.into());
        assert_eq!(a.wheres.len(), 1);
        assert_eq!(b.wheres.len(), 2);
    }

    #[test]
    fn parse_direction_and_join_type() {
        assert_eq!("desc".parse::<Direction>().unwrap(), Direction::Desc);
        assert_eq!(" left ".parse::<JoinType>().unwrap(), JoinType::Left);
        assert!("sideways".parse::<Direction>().unwrap_err().is_argument());
        assert!("FULL".parse::<JoinType>().is_err());
    }
}
