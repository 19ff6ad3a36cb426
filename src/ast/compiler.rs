/// AST → SQL renderer.
///
/// Renders the AST into single-line, standard-SQL text in the dialect the
/// analytic warehouse accepts (`@name` parameters, `IN UNNEST`, explicit
/// `UNION DISTINCT`). Rendering is a pure function of the tree, so equal
/// trees always produce byte-identical SQL.
use super::types::*;

/// Compile a query AST into a SQL string.
pub fn compile(query: &Query) -> String {
    match query {
        Query::Select(s) => compile_select(s),
    }
}

fn compile_select(select: &SelectQuery) -> String {
    let mut parts = Vec::new();

    // SELECT [DISTINCT]
    let mut select_clause = String::from("SELECT ");
    if select.distinct {
        select_clause.push_str("DISTINCT ");
    }

    if select.projections.is_empty() {
        select_clause.push('*');
    } else {
        let items: Vec<String> = select.projections.iter().map(compile_select_item).collect();
        select_clause.push_str(&items.join(", "));
    }
    parts.push(select_clause);

    // FROM
    if !select.from.is_empty() {
        let tables: Vec<String> = select.from.iter().map(compile_table_ref).collect();
        parts.push(format!("FROM {}", tables.join(", ")));
    }

    // WHERE
    if let Some(ref filter) = select.filter {
        parts.push(format!("WHERE {}", compile_expr(filter)));
    }

    // UNION ALL | UNION DISTINCT
    if let Some(ref set_op) = select.set_op {
        let op_str = match set_op.op {
            SetOperator::Union => "UNION",
        };
        let quantifier = match set_op.quantifier {
            SetQuantifier::All => "ALL",
            SetQuantifier::Distinct => "DISTINCT",
        };
        parts.push(format!("{} {} {}", op_str, quantifier, compile(&set_op.right)));
    }

    // ORDER BY
    if !select.order_by.is_empty() {
        let items: Vec<String> = select.order_by.iter().map(compile_expr).collect();
        parts.push(format!("ORDER BY {}", items.join(", ")));
    }

    // LIMIT / OFFSET
    if let Some(limit) = select.limit {
        parts.push(format!("LIMIT {}", limit));
    }
    if let Some(offset) = select.offset {
        parts.push(format!("OFFSET {}", offset));
    }

    parts.join(" ")
}

fn compile_select_item(item: &SelectItem) -> String {
    match item {
        SelectItem::Wildcard => "*".to_string(),
        SelectItem::Expression { expr, alias } => {
            let expr_str = compile_expr(expr);
            match alias {
                Some(a) => format!("{} AS {}", expr_str, a),
                None => expr_str,
            }
        }
    }
}

fn compile_table_ref(table: &TableRef) -> String {
    match table {
        TableRef::Table {
            dataset,
            name,
            alias,
        } => {
            let mut s = match dataset {
                Some(ds) => format!("`{}.{}`", ds, name),
                None => name.clone(),
            };
            if let Some(a) = alias {
                s.push_str(&format!(" AS {}", a));
            }
            s
        }
        TableRef::Unnest { array, alias } => {
            format!("UNNEST({}) AS {}", compile_expr(array), alias)
        }
        TableRef::Derived { subquery, alias } => {
            format!("({}) AS {}", compile(subquery), alias)
        }
    }
}

fn compile_expr(expr: &Expression) -> String {
    match expr {
        Expression::Column { table, name } => match table {
            Some(t) => format!("{}.{}", t, name),
            None => name.clone(),
        },
        Expression::Literal(lit) => compile_literal(lit),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
            };
            format!("{} {} {}", compile_expr(left), op_str, compile_expr(right))
        }
        Expression::Function {
            name,
            args,
            distinct,
        } => {
            let distinct_str = if *distinct { "DISTINCT " } else { "" };
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            format!("{}({}{})", name, distinct_str, args_str.join(", "))
        }
        Expression::Exists(q) => format!("EXISTS ({})", compile(q)),
        Expression::Not(expr) => format!("NOT {}", compile_expr(expr)),
        Expression::InList {
            expr,
            list,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            let items: Vec<String> = list.iter().map(compile_expr).collect();
            format!(
                "{} {}IN ({})",
                compile_expr(expr),
                not_str,
                items.join(", ")
            )
        }
        Expression::InSubquery {
            expr,
            subquery,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            format!(
                "{} {}IN ({})",
                compile_expr(expr),
                not_str,
                compile(subquery)
            )
        }
        Expression::InUnnest {
            expr,
            array,
            negated,
        } => {
            let not_str = if *negated { "NOT " } else { "" };
            format!(
                "{} {}IN UNNEST({})",
                compile_expr(expr),
                not_str,
                compile_expr(array)
            )
        }
        Expression::Cast { expr, data_type } => {
            format!("CAST({} AS {})", compile_expr(expr), data_type)
        }
        Expression::Parameter(name) => format!("@{}", name),
        Expression::Nested(expr) => format!("({})", compile_expr(expr)),
    }
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Integer(i) => i.to_string(),
        Literal::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
    }
}
