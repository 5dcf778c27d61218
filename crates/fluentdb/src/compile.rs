//! SQL compilation.
//!
//! [`Compiler`] turns a [`QueryState`] plus a table, column list or data into a
//! [`CompiledQuery`]: SQL text with positional `?` placeholders and the ordered
//! parameters to bind. Compilation is pure; every identifier goes through the
//! connection's [`IdentQuoter`] and every value becomes a parameter. LIMIT/OFFSET are
//! the only numbers rendered inline, and they come from the builder as `u64`.

use crate::condition::{normalize_operator, parse_join_expr, Op};
use crate::error::{DbError, DbResult};
use crate::ident::{Dialect, IdentQuoter};
use crate::row::Record;
use crate::state::{Columns, Predicate, QueryState};
use crate::value::{Operand, Value};

/// SQL text plus ordered parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl CompiledQuery {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    fn push_bind(&mut self, value: Value) -> &mut Self {
        self.sql.push('?');
        self.params.push(value);
        self
    }
}

/// Largest LIMIT MySQL accepts; used when only OFFSET is set.
const MYSQL_MAX_LIMIT: u64 = u64::MAX;

/// Compiles query state against one dialect's identifier rules.
#[derive(Debug, Clone, Copy)]
pub struct Compiler<'a> {
    quoter: &'a IdentQuoter,
}

impl<'a> Compiler<'a> {
    pub fn new(quoter: &'a IdentQuoter) -> Self {
        Self { quoter }
    }

    /// `SELECT <cols> FROM <table> [JOIN..] [WHERE..] [GROUP BY..] [HAVING..] [ORDER BY..] [LIMIT..] [OFFSET..]`
    pub fn select(
        &self,
        state: &QueryState,
        table: &str,
        columns: &Columns,
    ) -> DbResult<CompiledQuery> {
        let mut q = CompiledQuery::default();
        q.push("SELECT ").push(&self.column_list(columns)?);
        self.push_from_and_filters(&mut q, state, table)?;

        if !state.order_by.is_empty() {
            q.push(" ORDER BY ");
            for (i, (column, direction)) in state.order_by.iter().enumerate() {
                if i > 0 {
                    q.push(", ");
                }
                q.push(&self.quoter.identifier_with_dots(column)?)
                    .push(" ")
                    .push(direction.as_sql());
            }
        }

        self.push_limit_offset(&mut q, state.limit, state.offset);
        Ok(q)
    }

    /// Same shape as [`Compiler::select`] with `COUNT(*) AS cnt` and no ORDER/LIMIT/OFFSET.
    ///
    /// With GROUP BY the grouped select over `columns` is wrapped, so `cnt` is the
    /// number of groups.
    pub fn count(
        &self,
        state: &QueryState,
        table: &str,
        columns: &Columns,
    ) -> DbResult<CompiledQuery> {
        let mut q = CompiledQuery::default();
        if state.group_by.is_empty() {
            q.push("SELECT COUNT(*) AS cnt");
            self.push_from_and_filters(&mut q, state, table)?;
        } else {
            q.push("SELECT COUNT(*) AS cnt FROM (SELECT ")
                .push(&self.column_list(columns)?);
            self.push_from_and_filters(&mut q, state, table)?;
            q.push(") AS grouped");
        }
        Ok(q)
    }

    /// `INSERT INTO <table> (<cols>) VALUES (?, ...)`
    pub fn insert(&self, table: &str, data: &Record) -> DbResult<CompiledQuery> {
        if data.is_empty() {
            return Err(DbError::argument("insert data cannot be empty"));
        }
        let mut q = CompiledQuery::default();
        q.push("INSERT INTO ")
            .push(&self.quoter.identifier_with_dots(table)?)
            .push(" (")
            .push(&self.insert_columns(data)?)
            .push(") VALUES ");
        push_tuple(&mut q, data);
        Ok(q)
    }

    /// One INSERT with a VALUES tuple per row. All rows must share the same ordered keys.
    pub fn insert_multi(&self, table: &str, rows: &[Record]) -> DbResult<CompiledQuery> {
        let Some(first) = rows.first() else {
            return Err(DbError::argument("insert_multi requires at least one row"));
        };
        if first.is_empty() {
            return Err(DbError::argument("insert_multi rows cannot be empty"));
        }
        for (i, row) in rows.iter().enumerate().skip(1) {
            if !row.field_names().eq(first.field_names()) {
                return Err(DbError::argument(format!(
                    "insert_multi row {i} has a different column set than row 0"
                )));
            }
        }

        let mut q = CompiledQuery::default();
        q.push("INSERT INTO ")
            .push(&self.quoter.identifier_with_dots(table)?)
            .push(" (")
            .push(&self.insert_columns(first)?)
            .push(") VALUES ");
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            push_tuple(&mut q, row);
        }
        Ok(q)
    }

    /// `UPDATE <table> SET a = ?, ... WHERE .. [LIMIT n]`. Requires data and a WHERE predicate.
    pub fn update(&self, state: &QueryState, table: &str, data: &Record) -> DbResult<CompiledQuery> {
        if data.is_empty() {
            return Err(DbError::argument("update data cannot be empty"));
        }
        require_where(state, "UPDATE")?;

        let mut q = CompiledQuery::default();
        q.push("UPDATE ")
            .push(&self.quoter.identifier_with_dots(table)?)
            .push(" SET ");
        for (i, (column, value)) in data.iter().enumerate() {
            if i > 0 {
                q.push(", ");
            }
            q.push(&self.quoter.identifier_with_dots(column)?).push(" = ");
            q.push_bind(value.clone());
        }
        q.push(" WHERE ");
        self.push_conditions(&mut q, &state.wheres)?;
        if let Some(limit) = state.limit {
            q.push(&format!(" LIMIT {limit}"));
        }
        Ok(q)
    }

    /// `DELETE FROM <table> WHERE .. [LIMIT n]`. Requires a WHERE predicate.
    pub fn delete(&self, state: &QueryState, table: &str) -> DbResult<CompiledQuery> {
        require_where(state, "DELETE")?;
        let mut q = CompiledQuery::default();
        q.push("DELETE FROM ")
            .push(&self.quoter.identifier_with_dots(table)?)
            .push(" WHERE ");
        self.push_conditions(&mut q, &state.wheres)?;
        if let Some(limit) = state.limit {
            q.push(&format!(" LIMIT {limit}"));
        }
        Ok(q)
    }

    fn column_list(&self, columns: &Columns) -> DbResult<String> {
        if columns.is_empty() {
            return Ok("*".to_string());
        }
        let quoted = columns
            .0
            .iter()
            .map(|c| self.quoter.column_or_star(c.trim()))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(quoted.join(", "))
    }

    fn insert_columns(&self, data: &Record) -> DbResult<String> {
        let quoted = data
            .field_names()
            .map(|c| self.quoter.identifier_with_dots(c))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(quoted.join(", "))
    }

    fn push_from_and_filters(
        &self,
        q: &mut CompiledQuery,
        state: &QueryState,
        table: &str,
    ) -> DbResult<()> {
        q.push(" FROM ").push(&self.quoter.table(table, None)?);

        for join in &state.joins {
            let on = parse_join_expr(&join.on)?;
            q.push(" ")
                .push(join.join_type.as_sql())
                .push(" JOIN ")
                .push(&self.quoter.table(&join.table, join.alias.as_deref())?)
                .push(" ON ")
                .push(&self.quoter.column_or_star(&on.left)?)
                .push(" ")
                .push(on.op.as_sql())
                .push(" ")
                .push(&self.quoter.column_or_star(&on.right)?);
        }

        if !state.wheres.is_empty() {
            q.push(" WHERE ");
            self.push_conditions(q, &state.wheres)?;
        }

        if !state.group_by.is_empty() {
            let cols = state
                .group_by
                .iter()
                .map(|c| self.quoter.identifier_with_dots(c.trim()))
                .collect::<DbResult<Vec<_>>>()?;
            q.push(" GROUP BY ").push(&cols.join(", "));
        }

        if !state.havings.is_empty() {
            q.push(" HAVING ");
            self.push_conditions(q, &state.havings)?;
        }
        Ok(())
    }

    fn push_limit_offset(&self, q: &mut CompiledQuery, limit: Option<u64>, offset: Option<u64>) {
        match (limit, offset) {
            (Some(limit), _) => {
                q.push(&format!(" LIMIT {limit}"));
            }
            // MySQL and SQLite only accept OFFSET after a LIMIT.
            (None, Some(_)) => match self.quoter.dialect() {
                Dialect::MySql => {
                    q.push(&format!(" LIMIT {MYSQL_MAX_LIMIT}"));
                }
                Dialect::Sqlite => {
                    q.push(" LIMIT -1");
                }
                _ => {}
            },
            _ => {}
        }
        if let Some(offset) = offset {
            q.push(&format!(" OFFSET {offset}"));
        }
    }

    /// Shared WHERE/HAVING compiler.
    fn push_conditions(&self, q: &mut CompiledQuery, predicates: &[Predicate]) -> DbResult<()> {
        for (i, p) in predicates.iter().enumerate() {
            if i > 0 {
                q.push(" ").push(p.connective.as_sql()).push(" ");
            }
            let op = normalize_operator(&p.op)?;
            let column = self.quoter.identifier_with_dots(&p.column)?;

            match (op, &p.value) {
                (Op::In | Op::NotIn, Operand::List(values)) => {
                    if values.is_empty() {
                        q.push(if op == Op::In { "0=1" } else { "1=1" });
                        continue;
                    }
                    q.push(&column).push(" ").push(op.as_sql()).push(" (");
                    for (j, v) in values.iter().enumerate() {
                        if j > 0 {
                            q.push(", ");
                        }
                        q.push_bind(v.clone());
                    }
                    q.push(")");
                }
                (Op::In | Op::NotIn, Operand::Scalar(_)) => {
                    return Err(DbError::argument(format!(
                        "operator {op} on '{}' requires a list of values",
                        p.column
                    )));
                }
                (Op::Is | Op::IsNot, Operand::Scalar(v)) => {
                    let literal = match v {
                        Value::Null => "NULL",
                        Value::Bool(true) => "TRUE",
                        Value::Bool(false) => "FALSE",
                        _ => {
                            return Err(DbError::argument(format!(
                                "operator {op} on '{}' accepts only NULL or a boolean",
                                p.column
                            )));
                        }
                    };
                    q.push(&column)
                        .push(" ")
                        .push(op.as_sql())
                        .push(" ")
                        .push(literal);
                }
                (_, Operand::Scalar(v)) => {
                    q.push(&column).push(" ").push(op.as_sql()).push(" ");
                    q.push_bind(v.clone());
                }
                (_, Operand::List(_)) => {
                    return Err(DbError::argument(format!(
                        "operator {op} on '{}' does not accept a list of values",
                        p.column
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Mutations must carry at least one WHERE predicate.
pub(crate) fn require_where(state: &QueryState, statement: &str) -> DbResult<()> {
    if state.wheres.is_empty() {
        return Err(DbError::policy(format!(
            "{statement} without a WHERE predicate is not allowed"
        )));
    }
    Ok(())
}

fn push_tuple(q: &mut CompiledQuery, row: &Record) {
    q.push("(");
    for (i, (_, value)) in row.iter().enumerate() {
        if i > 0 {
            q.push(", ");
        }
        q.push_bind(value.clone());
    }
    q.push(")");
}
