//! Comparison operators and join expressions.
//!
//! [`Op`] is the closed set of operators accepted in WHERE/HAVING predicates and join
//! conditions. [`JoinExpr`] accepts only `identifier operator identifier`; it is not an
//! expression parser and rejects anything else.

use crate::error::{DbError, DbResult};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Query operator for predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<>`
    LtGt,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `<=`
    Lte,
    /// `>=`
    Gte,
    Like,
    In,
    NotIn,
    Is,
    IsNot,
}

impl Op {
    /// SQL spelling of the operator.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::LtGt => "<>",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Lte => "<=",
            Op::Gte => ">=",
            Op::Like => "LIKE",
            Op::In => "IN",
            Op::NotIn => "NOT IN",
            Op::Is => "IS",
            Op::IsNot => "IS NOT",
        }
    }

    /// Operators that take a list operand.
    pub fn is_list(&self) -> bool {
        matches!(self, Op::In | Op::NotIn)
    }

    /// Operators whose operand is rendered as a literal (`NULL`/`TRUE`/`FALSE`).
    pub fn is_null_check(&self) -> bool {
        matches!(self, Op::Is | Op::IsNot)
    }
}

/// Trim, uppercase, collapse inner whitespace and validate an operator.
pub fn normalize_operator(op: &str) -> DbResult<Op> {
    let normalized = op
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_uppercase();
    match normalized.as_str() {
        "=" => Ok(Op::Eq),
        "!=" => Ok(Op::Ne),
        "<>" => Ok(Op::LtGt),
        "<" => Ok(Op::Lt),
        ">" => Ok(Op::Gt),
        "<=" => Ok(Op::Lte),
        ">=" => Ok(Op::Gte),
        "LIKE" => Ok(Op::Like),
        "IN" => Ok(Op::In),
        "NOT IN" => Ok(Op::NotIn),
        "IS" => Ok(Op::Is),
        "IS NOT" => Ok(Op::IsNot),
        _ => Err(DbError::UnsupportedOperator(op.to_string())),
    }
}

impl FromStr for Op {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        normalize_operator(s)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

fn join_expr_re() -> &'static Regex {
    static JOIN_EXPR: OnceLock<Regex> = OnceLock::new();
    JOIN_EXPR.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*([A-Za-z0-9_.*]+)\s*(=|!=|<>|<=|>=|<|>|\bLIKE\b|\bIS\s+NOT\b|\bIS\b)\s*([A-Za-z0-9_.*]+)\s*$",
        )
        .expect("invalid built-in join expression regex")
    })
}

/// A parsed `left op right` join condition. Sides are validated when quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinExpr {
    pub left: String,
    pub op: Op,
    pub right: String,
}

/// Parse a strict `identifier operator identifier` join condition.
pub fn parse_join_expr(expr: &str) -> DbResult<JoinExpr> {
    let caps = join_expr_re()
        .captures(expr)
        .ok_or_else(|| DbError::UnsafeJoinExpression(expr.to_string()))?;
    let op = normalize_operator(&caps[2])
        .map_err(|_| DbError::UnsafeJoinExpression(expr.to_string()))?;
    if op.is_list() {
        return Err(DbError::UnsafeJoinExpression(expr.to_string()));
    }
    Ok(JoinExpr {
        left: caps[1].to_string(),
        op,
        right: caps[3].to_string(),
    })
}
