//! SQL AST types for cohortsql.
//!
//! Every query compiler in this crate builds one of these trees and hands it
//! to [`super::compiler::compile`]. The tree only covers the subset of
//! analytic SQL the warehouse queries need:
//! - SELECT with DISTINCT, comma joins and a WHERE filter
//! - `UNION ALL` / `UNION DISTINCT` chains
//! - `IN (...)`, `IN (subquery)`, `IN UNNEST(@array)`, `[NOT] EXISTS`
//! - derived tables, `ORDER BY` and `LIMIT`/`OFFSET`
//! - named `@parameters`
//!
//! User-supplied values never appear in the tree as literals; they are bound
//! through [`Expression::Parameter`].

/// Top-level query representation.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Box<SelectQuery>),
}

impl From<SelectQuery> for Query {
    fn from(select: SelectQuery) -> Self {
        Query::Select(Box::new(select))
    }
}

/// A SELECT query with the clauses the warehouse queries use.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub projections: Vec<SelectItem>,
    pub from: Vec<TableRef>,
    pub filter: Option<Expression>,
    /// Trailing set operation (`UNION ...`).
    pub set_op: Option<Box<SetOperation>>,
    /// Rendered after the set operation, so it orders the whole chain.
    pub order_by: Vec<Expression>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectQuery {
    /// Chain `queries` with the given set operator, preserving their order.
    ///
    /// Returns `None` for an empty input so callers never render an empty
    /// set operation. The inputs must not carry a set operation of their
    /// own; wrap a chain in a sub-query first.
    pub fn union(queries: Vec<SelectQuery>, quantifier: SetQuantifier) -> Option<SelectQuery> {
        let mut iter = queries.into_iter().rev();
        let mut tail = iter.next()?;
        for mut head in iter {
            head.set_op = Some(Box::new(SetOperation {
                op: SetOperator::Union,
                quantifier,
                right: Box::new(tail.into()),
            }));
            tail = head;
        }
        Some(tail)
    }
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

impl SelectItem {
    pub fn expr(expr: Expression) -> Self {
        SelectItem::Expression { expr, alias: None }
    }

    pub fn aliased(expr: Expression, alias: &str) -> Self {
        SelectItem::Expression {
            expr,
            alias: Some(alias.to_string()),
        }
    }
}

/// Table reference in FROM clause.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// Simple table: `` `dataset.table` AS alias``
    Table {
        dataset: Option<String>,
        name: String,
        alias: Option<String>,
    },
    /// Array expansion: `UNNEST(@param) AS alias`
    Unnest { array: Expression, alias: String },
    /// Derived table: `(SELECT ...) AS alias`
    Derived { subquery: Box<Query>, alias: String },
}

impl TableRef {
    pub fn table(dataset: Option<&str>, name: &str, alias: Option<&str>) -> Self {
        TableRef::Table {
            dataset: dataset.map(str::to_string),
            name: name.to_string(),
            alias: alias.map(str::to_string),
        }
    }
}

/// Core expression type. Recursive to support arbitrary nesting.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference: `table.column` or just `column`.
    Column { table: Option<String>, name: String },
    /// Literal value.
    Literal(Literal),
    /// Binary operation: `left op right`.
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Function call: `name([DISTINCT] args)`.
    Function {
        name: String,
        args: Vec<Expression>,
        distinct: bool,
    },
    /// EXISTS (SELECT ...).
    Exists(Box<Query>),
    /// NOT expr.
    Not(Box<Expression>),
    /// expr IN (values).
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    /// expr IN (SELECT ...).
    InSubquery {
        expr: Box<Expression>,
        subquery: Box<Query>,
        negated: bool,
    },
    /// expr IN UNNEST(array).
    InUnnest {
        expr: Box<Expression>,
        array: Box<Expression>,
        negated: bool,
    },
    /// CAST(expr AS type).
    Cast {
        expr: Box<Expression>,
        data_type: String,
    },
    /// Named parameter placeholder: `@name`.
    Parameter(String),
    /// Nested expression (parenthesized).
    Nested(Box<Expression>),
}

impl Expression {
    pub fn column(table: Option<&str>, name: &str) -> Self {
        Expression::Column {
            table: table.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn param(name: &str) -> Self {
        Expression::Parameter(name.to_string())
    }

    pub fn string(value: &str) -> Self {
        Expression::Literal(Literal::String(value.to_string()))
    }

    pub fn eq(self, right: Expression) -> Self {
        self.binary(BinaryOperator::Eq, right)
    }

    pub fn and(self, right: Expression) -> Self {
        self.binary(BinaryOperator::And, right)
    }

    pub fn or(self, right: Expression) -> Self {
        self.binary(BinaryOperator::Or, right)
    }

    pub fn in_unnest(self, array: Expression) -> Self {
        Expression::InUnnest {
            expr: Box::new(self),
            array: Box::new(array),
            negated: false,
        }
    }

    pub fn in_subquery(self, subquery: impl Into<Query>) -> Self {
        Expression::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery.into()),
            negated: false,
        }
    }

    pub fn not(self) -> Self {
        Expression::Not(Box::new(self))
    }

    pub fn nested(self) -> Self {
        Expression::Nested(Box::new(self))
    }

    fn binary(self, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    /// AND all conditions together, left to right.
    pub fn conjunction(conditions: Vec<Expression>) -> Option<Expression> {
        conditions.into_iter().reduce(Expression::and)
    }
}

/// Literal values in SQL.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Integer(i64),
    String(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOperator {
    Eq,
    And,
    Or,
}

/// Set operation: UNION.
#[derive(Debug, Clone, PartialEq)]
pub struct SetOperation {
    pub op: SetOperator,
    pub quantifier: SetQuantifier,
    pub right: Box<Query>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetOperator {
    Union,
}

/// Analytic warehouses require an explicit quantifier on set operations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetQuantifier {
    All,
    Distinct,
}
