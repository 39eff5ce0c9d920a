//! Static optimiser: recognises simple `INSERT` statements and rewrites
//! them as `put-docs` operations before they reach the wire.
//!
//! Only plain `INSERT INTO t (cols...) VALUES ...` shapes with an `_id`
//! column qualify. Anything the rewrite cannot express stays a `sql` op:
//! the rewrite must never change semantics, only the wire representation.

use sqlparser::ast::{
    Expr, Ident, ObjectName, ObjectNamePart, SetExpr, Statement, TableObject, UnaryOperator,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use crate::op::{Document, TxOp, Value};

/// Attempts to rewrite a SQL statement into `put-docs` operations.
///
/// Returns `None` when the statement is not a recognisable simple INSERT;
/// the caller then writes the op as `sql` unchanged. Parameter rows bind
/// placeholders (`?` positionally, `$n` by index) row-major across the
/// `VALUES` list; each bound row becomes its own single-document put.
pub(crate) fn rewrite_insert(query: &str, arg_rows: &[Vec<Value>]) -> Option<Vec<TxOp>> {
    let statements = Parser::parse_sql(&GenericDialect {}, query).ok()?;
    let [Statement::Insert(insert)] = statements.as_slice() else {
        return None;
    };
    let TableObject::TableName(name) = &insert.table else {
        return None;
    };
    let table = table_name(name)?;

    if insert.columns.is_empty() {
        return None;
    }
    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(table_name)
        .collect::<Option<Vec<String>>>()?;
    if !columns.iter().any(|c| c.eq_ignore_ascii_case("_id")) {
        return None;
    }

    let source = insert.source.as_deref()?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return None;
    };
    if values.rows.is_empty()
        || values.rows.iter().any(|r| r.content.len() != columns.len())
    {
        return None;
    }

    let has_placeholders = values
        .rows
        .iter()
        .flat_map(|r| &r.content)
        .any(|e| matches!(e, Expr::Value(v) if matches!(v.value, SqlValue::Placeholder(_))));
    if has_placeholders && arg_rows.is_empty() {
        return None;
    }

    let no_params: [Vec<Value>; 1] = [Vec::new()];
    let bindings: &[Vec<Value>] = if has_placeholders { arg_rows } else { &no_params };

    let mut ops = Vec::with_capacity(bindings.len() * values.rows.len());
    for params in bindings {
        let mut next_positional = 0usize;
        for row in &values.rows {
            let mut doc = Document::new();
            for (col, expr) in columns.iter().zip(&row.content) {
                doc.insert(col.clone(), eval_expr(expr, params, &mut next_positional)?);
            }
            ops.push(TxOp::PutDocs {
                table: table.clone(),
                docs: vec![doc],
                valid_from: None,
                valid_to: None,
            });
        }
    }
    tracing::debug!(table = %table, ops = ops.len(), "rewrote INSERT to put-docs");
    Some(ops)
}

/// Evaluates a `VALUES` expression to a concrete value, binding
/// placeholders from `params`. `None` disqualifies the rewrite.
fn eval_expr(expr: &Expr, params: &[Value], next_positional: &mut usize) -> Option<Value> {
    match expr {
        Expr::Value(v) => match &v.value {
            SqlValue::Number(n, _) => n
                .parse::<i64>()
                .ok()
                .map(Value::Int64)
                .or_else(|| n.parse::<f64>().ok().map(Value::Float64)),
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
                Some(Value::Utf8(s.clone()))
            }
            SqlValue::Boolean(b) => Some(Value::Bool(*b)),
            SqlValue::Null => Some(Value::Null),
            SqlValue::Placeholder(p) => {
                let idx = if p == "?" {
                    let i = *next_positional;
                    *next_positional += 1;
                    i
                } else {
                    p.strip_prefix('$')?.parse::<usize>().ok()?.checked_sub(1)?
                };
                params.get(idx).cloned()
            }
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match eval_expr(expr, params, next_positional)? {
            Value::Int64(v) => Some(Value::Int64(-v)),
            Value::Float64(v) => Some(Value::Float64(-v)),
            _ => None,
        },
        _ => None,
    }
}

/// Joins a (possibly schema-qualified) object name into `schema/table`
/// form. Deeper qualification disqualifies the rewrite.
fn table_name(name: &ObjectName) -> Option<String> {
    let idents: Vec<String> = name
        .0
        .iter()
        .map(|part| match part {
            ObjectNamePart::Identifier(id) => Some(normalize_ident(id)),
            ObjectNamePart::Function(_) => None,
        })
        .collect::<Option<Vec<String>>>()?;
    match idents.as_slice() {
        [table] => Some(table.clone()),
        [schema, table] => Some(format!("{schema}/{table}")),
        _ => None,
    }
}

/// SQL identifier case rules: unquoted identifiers fold to lowercase,
/// quoted identifiers keep their exact spelling.
fn normalize_ident(ident: &Ident) -> String {
    if ident.quote_style.is_none() {
        ident.value.to_lowercase()
    } else {
        ident.value.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_of(op: &TxOp) -> &Document {
        match op {
            TxOp::PutDocs { docs, .. } => &docs[0],
            other => panic!("expected put-docs, got {other:?}"),
        }
    }

    #[test]
    fn test_rewrites_parameterised_insert_per_arg_row() {
        let ops = rewrite_insert(
            "INSERT INTO t (_id, v) VALUES (?, ?)",
            &[
                vec![Value::Int64(1), Value::Utf8("x".into())],
                vec![Value::Int64(2), Value::Utf8("y".into())],
            ],
        )
        .unwrap();

        assert_eq!(ops.len(), 2);
        assert_eq!(doc_of(&ops[0]).get("_id"), Some(&Value::Int64(1)));
        assert_eq!(doc_of(&ops[0]).get("v"), Some(&Value::Utf8("x".into())));
        assert_eq!(doc_of(&ops[1]).get("_id"), Some(&Value::Int64(2)));
        let TxOp::PutDocs { table, .. } = &ops[0] else {
            unreachable!()
        };
        assert_eq!(table, "t");
    }

    #[test]
    fn test_rewrites_literal_insert() {
        let ops =
            rewrite_insert("INSERT INTO users (_id, name) VALUES (1, 'Ada')", &[]).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(doc_of(&ops[0]).get("name"), Some(&Value::Utf8("Ada".into())));
    }

    #[test]
    fn test_rewrites_multi_row_values() {
        let ops =
            rewrite_insert("INSERT INTO t (_id) VALUES (1), (2), (3)", &[]).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(doc_of(&ops[2]).get("_id"), Some(&Value::Int64(3)));
    }

    #[test]
    fn test_dollar_placeholders() {
        let ops = rewrite_insert(
            "INSERT INTO t (_id, v) VALUES ($2, $1)",
            &[vec![Value::Utf8("v".into()), Value::Int64(7)]],
        )
        .unwrap();
        assert_eq!(doc_of(&ops[0]).get("_id"), Some(&Value::Int64(7)));
        assert_eq!(doc_of(&ops[0]).get("v"), Some(&Value::Utf8("v".into())));
    }

    #[test]
    fn test_schema_qualified_table() {
        let ops = rewrite_insert("INSERT INTO crm.users (_id) VALUES (1)", &[]).unwrap();
        let TxOp::PutDocs { table, .. } = &ops[0] else {
            unreachable!()
        };
        assert_eq!(table, "crm/users");
    }

    #[test]
    fn test_no_rewrite_without_id_column() {
        assert!(rewrite_insert("INSERT INTO t (a, b) VALUES (1, 2)", &[]).is_none());
    }

    #[test]
    fn test_no_rewrite_without_column_list() {
        assert!(rewrite_insert("INSERT INTO t VALUES (1, 2)", &[]).is_none());
    }

    #[test]
    fn test_no_rewrite_for_select() {
        assert!(rewrite_insert("SELECT * FROM t", &[]).is_none());
    }

    #[test]
    fn test_no_rewrite_for_insert_from_select() {
        assert!(rewrite_insert("INSERT INTO t (_id) SELECT _id FROM s", &[]).is_none());
    }

    #[test]
    fn test_no_rewrite_for_expression_values() {
        assert!(rewrite_insert("INSERT INTO t (_id) VALUES (1 + 2)", &[]).is_none());
    }

    #[test]
    fn test_placeholders_without_args_stay_sql() {
        assert!(rewrite_insert("INSERT INTO t (_id) VALUES (?)", &[]).is_none());
    }
}
