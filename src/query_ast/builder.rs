//! Programmatic construction of `retrieve` queries.
//!
//! Stands where a text parser would sit: it produces a range-resolved AST
//! (identifiers already bound to their range nodes) for the compile pipeline.

use std::collections::BTreeMap;

use super::ast::{AggregateFn, Ast, BinaryOp, Directive, Node, NodeId, Query, Range, Retrieve, SortItem, Window};
use super::errors::QueryError;

#[derive(Debug, Default)]
pub struct QueryBuilder {
    ast: Ast,
    ranges: Vec<NodeId>,
    values: Vec<NodeId>,
    conditions: Option<NodeId>,
    sort: Vec<SortItem>,
    window: Option<Window>,
    unique: bool,
    macros: BTreeMap<String, NodeId>,
    directives: BTreeMap<String, Directive>,
}

impl QueryBuilder {
    pub fn new() -> Self { Self::default() }

    /// Continue building inside an existing arena (used for nested queries).
    pub fn with_ast(ast: Ast) -> Self { Self { ast, ..Self::default() } }

    pub fn ast(&mut self) -> &mut Ast { &mut self.ast }

    /// Declare `range of <name> is <entity>` without a join predicate.
    pub fn range(&mut self, name: &str, entity: &str) -> NodeId {
        let id = self.ast.add(Node::Range(Range {
            name: name.to_string(),
            entity_name: Some(entity.to_string()),
            join_property: None,
            required: false,
            include_as_join: true,
            query: None,
        }));
        self.ranges.push(id);
        id
    }

    /// Declare a temporary range over a nested retrieve built in the same arena.
    pub fn temporary_range(&mut self, name: &str, query: NodeId) -> NodeId {
        let id = self.ast.add(Node::Range(Range {
            name: name.to_string(),
            entity_name: None,
            join_property: None,
            required: false,
            include_as_join: true,
            query: Some(query),
        }));
        self.ranges.push(id);
        id
    }

    /// Attach a `via` predicate to a declared range.
    pub fn via(&mut self, range: NodeId, predicate: NodeId, required: bool) {
        self.ast.set_join_property(range, Some(predicate));
        if let Some(r) = self.ast.range_mut(range) { r.required = required; }
    }

    pub fn ident(&mut self, range: NodeId, field: &str) -> NodeId { self.ast.identifier_node(range, &[field]) }

    pub fn path(&mut self, range: NodeId, path: &[&str]) -> NodeId { self.ast.identifier_node(range, path) }

    pub fn num(&mut self, value: impl Into<String>) -> NodeId { self.ast.number(value) }

    pub fn text(&mut self, value: impl Into<String>) -> NodeId { self.ast.string(value) }

    pub fn macro_ref(&mut self, name: &str) -> NodeId { self.ast.add(Node::Macro(name.to_string())) }

    pub fn bin(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId { self.ast.binary(op, left, right) }

    pub fn eq(&mut self, left: NodeId, right: NodeId) -> NodeId { self.ast.eq(left, right) }

    pub fn and(&mut self, left: NodeId, right: NodeId) -> NodeId { self.ast.and(left, right) }

    pub fn or(&mut self, left: NodeId, right: NodeId) -> NodeId { self.ast.or(left, right) }

    pub fn not(&mut self, inner: NodeId) -> NodeId { self.ast.add(Node::Not(inner)) }

    pub fn is_null(&mut self, operand: NodeId) -> NodeId { self.ast.check_null(operand, false) }

    pub fn is_not_null(&mut self, operand: NodeId) -> NodeId { self.ast.check_null(operand, true) }

    /// `field op value` on a range, e.g. `cmp(o, "total", Gt, "100")`.
    pub fn cmp(&mut self, range: NodeId, field: &str, op: BinaryOp, number: &str) -> NodeId {
        let left = self.ident(range, field);
        let right = self.num(number);
        self.bin(op, left, right)
    }

    /// `a.fa = b.fb`
    pub fn join_eq(&mut self, a: NodeId, fa: &str, b: NodeId, fb: &str) -> NodeId {
        let left = self.ident(a, fa);
        let right = self.ident(b, fb);
        self.eq(left, right)
    }

    pub fn exists(&mut self, range: NodeId) -> NodeId {
        let target = self.ast.identifier_node(range, &[]);
        self.ast.add(Node::Exists(target))
    }

    pub fn aggregate(&mut self, function: AggregateFn, expression: NodeId, conditions: Option<NodeId>) -> NodeId {
        self.ast.aggregate_node(function, expression, conditions)
    }

    pub fn any(&mut self, expression: NodeId, conditions: Option<NodeId>) -> NodeId {
        self.aggregate(AggregateFn::Any, expression, conditions)
    }

    /// Add a visible projection; the alias defaults to the rendered position.
    pub fn select(&mut self, expression: NodeId) -> NodeId {
        let name = format!("value{}", self.values.len());
        self.select_as(&name, expression, true)
    }

    pub fn select_as(&mut self, name: &str, expression: NodeId, visible: bool) -> NodeId {
        let alias = self.ast.alias(name, expression, visible);
        self.values.push(alias);
        alias
    }

    /// AND `predicate` into the WHERE clause.
    pub fn filter(&mut self, predicate: NodeId) {
        self.conditions = Some(match self.conditions {
            Some(existing) => self.ast.and(existing, predicate),
            None => predicate,
        });
    }

    pub fn order_by(&mut self, expression: NodeId, descending: bool) {
        self.sort.push(SortItem { expression, descending });
    }

    pub fn window(&mut self, offset: u64, size: u64) { self.window = Some(Window { offset, size }); }

    pub fn unique(&mut self) { self.unique = true; }

    pub fn define_macro(&mut self, name: &str, body: NodeId) { self.macros.insert(name.to_string(), body); }

    pub fn directive(&mut self, name: &str, value: Directive) { self.directives.insert(name.to_string(), value); }

    /// Finish a nested retrieve inside the shared arena and hand the arena back.
    pub fn finish_nested(self) -> (Ast, NodeId) {
        let mut ast = self.ast;
        let root = ast.add(Node::Retrieve(Retrieve {
            ranges: self.ranges,
            values: self.values,
            conditions: self.conditions,
            sort: self.sort,
            window: self.window,
            unique: self.unique,
            macros: self.macros,
            directives: self.directives,
        }));
        (ast, root)
    }

    pub fn build(self) -> Result<Query, QueryError> {
        let (ast, root) = self.finish_nested();
        Query::new(ast, root)
    }
}
