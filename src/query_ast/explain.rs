//! One-line text rendering of a query tree.
//!
//! Used for debug logs, optimizer traces and test assertions. The output is
//! deterministic: same tree, same string.

use super::ast::{Ast, BinaryOp, Node, NodeId, Retrieve, Subquery, SubqueryKind};

pub fn explain(ast: &Ast, root: NodeId) -> String {
    let mut out = String::new();
    render(ast, root, &mut out);
    out
}

fn render(ast: &Ast, id: NodeId, out: &mut String) {
    match ast.node(id) {
        Node::Retrieve(r) => render_retrieve(ast, r, out),
        Node::Range(_) => render_range(ast, id, out),
        Node::Identifier(i) => {
            out.push_str(ast.range_name(i.range));
            for part in &i.path {
                out.push('.');
                out.push_str(part);
            }
        }
        Node::Binary { op, left, right } => {
            render_operand(ast, *op, *left, out);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            render_operand(ast, *op, *right, out);
        }
        Node::Not(inner) => {
            out.push_str("NOT (");
            render(ast, *inner, out);
            out.push(')');
        }
        Node::CheckNull { operand, negated } => {
            render(ast, *operand, out);
            out.push_str(if *negated { " IS NOT NULL" } else { " IS NULL" });
        }
        Node::Exists(target) => {
            out.push_str("EXISTS(");
            render(ast, *target, out);
            out.push(')');
        }
        Node::Aggregate(a) => {
            out.push_str(a.function.name());
            out.push('(');
            render(ast, a.expression, out);
            if let Some(cond) = a.conditions {
                out.push_str(" WHERE ");
                render(ast, cond, out);
            }
            out.push(')');
        }
        Node::Case(c) => {
            out.push_str("CASE WHEN ");
            render(ast, c.condition, out);
            out.push_str(" THEN ");
            render(ast, c.then, out);
            if let Some(otherwise) = c.otherwise {
                out.push_str(" ELSE ");
                render(ast, otherwise, out);
            }
            out.push_str(" END");
        }
        Node::Subquery(s) => render_subquery(ast, s, out),
        Node::Alias(a) => render(ast, a.expression, out),
        Node::Number(n) => out.push_str(n),
        Node::String(s) => {
            out.push('\'');
            out.push_str(&s.replace('\'', "''"));
            out.push('\'');
        }
        Node::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Node::Null => out.push_str("NULL"),
        Node::Parameter(p) => {
            out.push(':');
            out.push_str(p);
        }
        Node::Macro(m) => {
            out.push('@');
            out.push_str(m);
        }
    }
}

/// Under AND/OR only a different connective gets parentheses; under any other
/// operator every nested binary does.
fn render_operand(ast: &Ast, parent: BinaryOp, child: NodeId, out: &mut String) {
    let wrap = match ast.node(child) {
        Node::Binary { op, .. } if parent.is_connective() => op.is_connective() && *op != parent,
        Node::Binary { .. } => true,
        _ => false,
    };
    if wrap { out.push('('); }
    render(ast, child, out);
    if wrap { out.push(')'); }
}

fn render_range(ast: &Ast, id: NodeId, out: &mut String) {
    let Some(r) = ast.range(id) else { return };
    out.push_str("range ");
    out.push_str(&r.name);
    out.push_str(" = ");
    match (&r.entity_name, r.query) {
        (_, Some(query)) => {
            out.push('(');
            render(ast, query, out);
            out.push(')');
        }
        (Some(entity), None) => out.push_str(entity),
        (None, None) => out.push('?'),
    }
    if let Some(join) = r.join_property {
        out.push_str(" via ");
        render(ast, join, out);
        if r.required { out.push_str(" [required]"); }
    }
    if !r.include_as_join { out.push_str(" [excluded]"); }
}

fn render_ranges(ast: &Ast, ranges: &[NodeId], out: &mut String) {
    for &range in ranges {
        render_range(ast, range, out);
        out.push_str("; ");
    }
}

fn render_retrieve(ast: &Ast, r: &Retrieve, out: &mut String) {
    render_ranges(ast, &r.ranges, out);
    out.push_str("retrieve ");
    if r.unique { out.push_str("unique "); }
    out.push('(');
    for (i, &value) in r.values.iter().enumerate() {
        if i > 0 { out.push_str(", "); }
        if let Node::Alias(a) = ast.node(value)
            && a.name != format!("value{i}")
        {
            out.push_str(&a.name);
            out.push_str(" = ");
        }
        render(ast, value, out);
    }
    out.push(')');
    if let Some(cond) = r.conditions {
        out.push_str(" where ");
        render(ast, cond, out);
    }
    if !r.sort.is_empty() {
        out.push_str(" sort by ");
        for (i, item) in r.sort.iter().enumerate() {
            if i > 0 { out.push_str(", "); }
            render(ast, item.expression, out);
            if item.descending { out.push_str(" desc"); }
        }
    }
    if let Some(w) = r.window {
        out.push_str(&format!(" window {},{}", w.offset, w.size));
    }
}

fn render_subquery(ast: &Ast, s: &Subquery, out: &mut String) {
    let body = |out: &mut String| {
        let mut first = true;
        for &range in &s.ranges {
            if !first { out.push_str("; "); }
            render_range(ast, range, out);
            first = false;
        }
        if let Some(cond) = s.conditions {
            if !first { out.push_str("; "); }
            out.push_str("where ");
            render(ast, cond, out);
        }
    };
    match s.kind {
        SubqueryKind::Exists => {
            out.push_str("EXISTS(");
            body(out);
            out.push(')');
        }
        SubqueryKind::CaseWhen => {
            out.push_str("CASE WHEN EXISTS(");
            body(out);
            out.push_str(") THEN 1 ELSE 0 END");
        }
        SubqueryKind::Scalar => {
            out.push_str("(SELECT ");
            match s.expression {
                Some(expr) => render(ast, expr, out),
                None => out.push('1'),
            }
            if !s.ranges.is_empty() || s.conditions.is_some() { out.push_str("; "); }
            body(out);
            out.push(')');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_ast::ast::AggregateFn;
    use crate::query_ast::builder::QueryBuilder;

    #[test]
    fn renders_ranges_projection_and_clauses() {
        let mut b = QueryBuilder::new();
        let o = b.range("o", "Order");
        let c = b.range("c", "Customer");
        let on = b.join_eq(c, "id", o, "customerId");
        b.via(c, on, true);
        let id = b.ident(o, "id");
        b.select(id);
        let amount = b.ident(o, "amount");
        let sum = b.aggregate(AggregateFn::Sum, amount, None);
        b.select_as("total", sum, true);
        let big = b.cmp(o, "total", BinaryOp::Gt, "100");
        let name = b.text("O'Neil");
        let who = b.ident(c, "name");
        let named = b.eq(who, name);
        let either = b.or(big, named);
        let open = b.cmp(o, "open", BinaryOp::Eq, "1");
        b.filter(either);
        b.filter(open);
        b.window(0, 1);
        let q = b.build().unwrap();

        assert_eq!(
            explain(q.ast(), q.root()),
            "range o = Order; range c = Customer via c.id = o.customerId [required]; \
             retrieve (o.id, total = SUM(o.amount)) \
             where (o.total > 100 OR c.name = 'O''Neil') AND o.open = 1 window 0,1"
        );
    }
}
