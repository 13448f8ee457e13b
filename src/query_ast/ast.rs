//! Arena-backed ObjectQuel AST.
//!
//! Nodes live in one `Ast` arena and point at each other through `NodeId`
//! handles. Every attached node records its parent, so a pass can walk upwards
//! in O(1) and swap a node for another without knowing the parent's concrete
//! variant (see [`Ast::replace_child`]).
//!
//! Identifiers hold a non-owning `range` handle. Re-pointing that handle is how
//! ranges get merged.

use std::collections::{BTreeMap, HashMap};

use super::errors::QueryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize { self.0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp { And, Or, Eq, NotEq, Lt, LtEq, Gt, GtEq, Add, Sub, Mul, Div, Like }

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Like => "LIKE",
        }
    }

    pub fn is_connective(self) -> bool { matches!(self, BinaryOp::And | BinaryOp::Or) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn { Count, CountUnique, Sum, SumUnique, Avg, AvgUnique, Min, Max, Any }

impl AggregateFn {
    pub fn name(self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::CountUnique => "COUNTU",
            AggregateFn::Sum => "SUM",
            AggregateFn::SumUnique => "SUMU",
            AggregateFn::Avg => "AVG",
            AggregateFn::AvgUnique => "AVGU",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
            AggregateFn::Any => "ANY",
        }
    }

    pub fn is_any(self) -> bool { self == AggregateFn::Any }
}

/// Shape of a subquery produced by the ANY/aggregate rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubqueryKind {
    /// `(SELECT agg FROM ... WHERE ...)`
    Scalar,
    /// `EXISTS(SELECT 1 FROM ... WHERE ...)`
    Exists,
    /// `CASE WHEN EXISTS(SELECT 1 FROM ... WHERE ...) THEN 1 ELSE 0 END`
    CaseWhen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive { Flag(bool), Value(String) }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window { pub offset: u64, pub size: u64 }

#[derive(Debug, Clone, PartialEq)]
pub struct SortItem { pub expression: NodeId, pub descending: bool }

/// Query root.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Retrieve {
    pub ranges: Vec<NodeId>,
    /// `Alias` nodes, in projection order.
    pub values: Vec<NodeId>,
    pub conditions: Option<NodeId>,
    pub sort: Vec<SortItem>,
    pub window: Option<Window>,
    pub unique: bool,
    /// Detached macro bodies; expanded by deep clone during processing.
    pub macros: BTreeMap<String, NodeId>,
    pub directives: BTreeMap<String, Directive>,
}

impl Retrieve {
    pub fn directive(&self, name: &str) -> Option<&Directive> { self.directives.get(name) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub name: String,
    /// `None` for temporary ranges backed by `query`.
    pub entity_name: Option<String>,
    /// ON-condition. `None` marks the anchor (SQL `FROM` target).
    pub join_property: Option<NodeId>,
    /// `true` = INNER JOIN, `false` = LEFT JOIN.
    pub required: bool,
    /// Soft delete: `false` keeps the range in the list but drops it from JOIN emission.
    pub include_as_join: bool,
    pub query: Option<NodeId>,
}

impl Range {
    pub fn is_anchor(&self) -> bool { self.join_property.is_none() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub range: NodeId,
    /// Property chain after the range alias, e.g. `["customer", "name"]`.
    pub path: Vec<String>,
}

impl Identifier {
    pub fn field(&self) -> &str { self.path.last().map(String::as_str).unwrap_or("") }

    /// `true` when the identifier names a column on the range's own entity.
    pub fn is_direct(&self) -> bool { self.path.len() == 1 }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub function: AggregateFn,
    pub expression: NodeId,
    pub conditions: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseWhen {
    pub condition: NodeId,
    pub then: NodeId,
    pub otherwise: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub kind: SubqueryKind,
    pub ranges: Vec<NodeId>,
    /// Value selected by a `Scalar` subquery; `None` selects the constant 1.
    pub expression: Option<NodeId>,
    pub conditions: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alias {
    pub name: String,
    pub expression: NodeId,
    /// `false` for technical fields the caller did not ask for.
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Retrieve(Retrieve),
    Range(Range),
    Identifier(Identifier),
    Binary { op: BinaryOp, left: NodeId, right: NodeId },
    Not(NodeId),
    CheckNull { operand: NodeId, negated: bool },
    /// `EXISTS(range)`: the range must produce a row.
    Exists(NodeId),
    Aggregate(Aggregate),
    Case(CaseWhen),
    Subquery(Subquery),
    Alias(Alias),
    Number(String),
    String(String),
    Bool(bool),
    Null,
    Parameter(String),
    Macro(String),
}

/// Nodes that carry an embedded filter condition.
pub trait HasConditions {
    fn conditions(&self) -> Option<NodeId>;
    fn conditions_mut(&mut self) -> &mut Option<NodeId>;
}

impl HasConditions for Retrieve {
    fn conditions(&self) -> Option<NodeId> { self.conditions }
    fn conditions_mut(&mut self) -> &mut Option<NodeId> { &mut self.conditions }
}

impl HasConditions for Aggregate {
    fn conditions(&self) -> Option<NodeId> { self.conditions }
    fn conditions_mut(&mut self) -> &mut Option<NodeId> { &mut self.conditions }
}

impl HasConditions for Subquery {
    fn conditions(&self) -> Option<NodeId> { self.conditions }
    fn conditions_mut(&mut self) -> &mut Option<NodeId> { &mut self.conditions }
}

impl Node {
    /// Owned children in slot order. Identifier range handles are not children.
    pub fn children(&self) -> Vec<NodeId> {
        match self {
            Node::Retrieve(r) => {
                let mut out = Vec::with_capacity(r.ranges.len() + r.values.len() + r.sort.len() + 1);
                out.extend(r.ranges.iter().copied());
                out.extend(r.values.iter().copied());
                out.extend(r.conditions);
                out.extend(r.sort.iter().map(|s| s.expression));
                out
            }
            Node::Range(r) => r.join_property.into_iter().chain(r.query).collect(),
            Node::Binary { left, right, .. } => vec![*left, *right],
            Node::Not(inner) | Node::Exists(inner) => vec![*inner],
            Node::CheckNull { operand, .. } => vec![*operand],
            Node::Aggregate(a) => std::iter::once(a.expression).chain(a.conditions).collect(),
            Node::Case(c) => [c.condition, c.then].into_iter().chain(c.otherwise).collect(),
            Node::Subquery(s) => s.ranges.iter().copied().chain(s.expression).chain(s.conditions).collect(),
            Node::Alias(a) => vec![a.expression],
            Node::Identifier(_) | Node::Number(_) | Node::String(_) | Node::Bool(_) | Node::Null | Node::Parameter(_) | Node::Macro(_) => Vec::new(),
        }
    }

    fn child_slots_mut(&mut self) -> Vec<&mut NodeId> {
        match self {
            Node::Retrieve(r) => {
                let Retrieve { ranges, values, conditions, sort, .. } = r;
                ranges.iter_mut()
                    .chain(values.iter_mut())
                    .chain(conditions.iter_mut())
                    .chain(sort.iter_mut().map(|s| &mut s.expression))
                    .collect()
            }
            Node::Range(r) => {
                let Range { join_property, query, .. } = r;
                join_property.iter_mut().chain(query.iter_mut()).collect()
            }
            Node::Binary { left, right, .. } => vec![left, right],
            Node::Not(inner) | Node::Exists(inner) => vec![inner],
            Node::CheckNull { operand, .. } => vec![operand],
            Node::Aggregate(a) => {
                let Aggregate { expression, conditions, .. } = a;
                std::iter::once(expression).chain(conditions.iter_mut()).collect()
            }
            Node::Case(c) => {
                let CaseWhen { condition, then, otherwise } = c;
                vec![condition, then].into_iter().chain(otherwise.iter_mut()).collect()
            }
            Node::Subquery(s) => {
                let Subquery { ranges, expression, conditions, .. } = s;
                ranges.iter_mut().chain(expression.iter_mut()).chain(conditions.iter_mut()).collect()
            }
            Node::Alias(a) => vec![&mut a.expression],
            Node::Identifier(_) | Node::Number(_) | Node::String(_) | Node::Bool(_) | Node::Null | Node::Parameter(_) | Node::Macro(_) => Vec::new(),
        }
    }

    /// Capability check used by generic traversals (aggregates, subqueries, retrieve).
    pub fn as_conditioned(&self) -> Option<&dyn HasConditions> {
        match self {
            Node::Retrieve(r) => Some(r as &dyn HasConditions),
            Node::Aggregate(a) => Some(a as &dyn HasConditions),
            Node::Subquery(s) => Some(s as &dyn HasConditions),
            _ => None,
        }
    }

    fn as_conditioned_mut(&mut self) -> Option<&mut dyn HasConditions> {
        match self {
            Node::Retrieve(r) => Some(r as &mut dyn HasConditions),
            Node::Aggregate(a) => Some(a as &mut dyn HasConditions),
            Node::Subquery(s) => Some(s as &mut dyn HasConditions),
            _ => None,
        }
    }

    pub fn is_and(&self) -> bool { matches!(self, Node::Binary { op: BinaryOp::And, .. }) }
    pub fn is_or(&self) -> bool { matches!(self, Node::Binary { op: BinaryOp::Or, .. }) }
}

#[derive(Debug, Clone)]
struct Slot {
    node: Node,
    parent: Option<NodeId>,
}

/// Node arena. Replaced nodes stay allocated but unreachable.
#[derive(Debug, Clone, Default)]
pub struct Ast {
    slots: Vec<Slot>,
}

impl Ast {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.slots.len() }

    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    /// Allocate a node and adopt its children.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.slots.len());
        let children = node.children();
        self.slots.push(Slot { node, parent: None });
        for child in children { self.slots[child.0].parent = Some(id); }
        id
    }

    pub fn node(&self, id: NodeId) -> &Node { &self.slots[id.0].node }

    /// Raw mutable access. Callers changing child slots must use the setters
    /// below (or `replace_child`) so parent links stay correct.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node { &mut self.slots[id.0].node }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> { self.slots[id.0].parent }

    pub fn range(&self, id: NodeId) -> Option<&Range> {
        match self.node(id) { Node::Range(r) => Some(r), _ => None }
    }

    pub fn range_mut(&mut self, id: NodeId) -> Option<&mut Range> {
        match self.node_mut(id) { Node::Range(r) => Some(r), _ => None }
    }

    pub fn range_name(&self, id: NodeId) -> &str {
        self.range(id).map(|r| r.name.as_str()).unwrap_or("")
    }

    pub fn retrieve(&self, id: NodeId) -> Option<&Retrieve> {
        match self.node(id) { Node::Retrieve(r) => Some(r), _ => None }
    }

    pub fn retrieve_mut(&mut self, id: NodeId) -> Option<&mut Retrieve> {
        match self.node_mut(id) { Node::Retrieve(r) => Some(r), _ => None }
    }

    pub fn identifier(&self, id: NodeId) -> Option<&Identifier> {
        match self.node(id) { Node::Identifier(i) => Some(i), _ => None }
    }

    pub fn aggregate(&self, id: NodeId) -> Option<&Aggregate> {
        match self.node(id) { Node::Aggregate(a) => Some(a), _ => None }
    }

    pub fn subquery(&self, id: NodeId) -> Option<&Subquery> {
        match self.node(id) { Node::Subquery(s) => Some(s), _ => None }
    }

    fn adopt(&mut self, parent: NodeId, child: Option<NodeId>) {
        if let Some(c) = child { self.slots[c.0].parent = Some(parent); }
    }

    /// Clear `child`'s parent link if it still points at `owner`. A child that
    /// was re-attached elsewhere in the meantime keeps its new parent.
    fn release(&mut self, owner: NodeId, child: Option<NodeId>) {
        if let Some(c) = child
            && self.slots[c.0].parent == Some(owner)
        {
            self.slots[c.0].parent = None;
        }
    }

    pub fn set_join_property(&mut self, range: NodeId, predicate: Option<NodeId>) {
        let old = match self.range_mut(range) {
            Some(r) => std::mem::replace(&mut r.join_property, predicate),
            None => return,
        };
        if old != predicate {
            self.release(range, old);
            self.adopt(range, predicate);
        }
    }

    /// Set the embedded condition of a retrieve, aggregate or subquery node.
    pub fn set_conditions(&mut self, owner: NodeId, conditions: Option<NodeId>) {
        let old = match self.node_mut(owner).as_conditioned_mut() {
            Some(c) => std::mem::replace(c.conditions_mut(), conditions),
            None => return,
        };
        if old != conditions {
            self.release(owner, old);
            self.adopt(owner, conditions);
        }
    }

    pub fn conditions_of(&self, owner: NodeId) -> Option<NodeId> {
        self.node(owner).as_conditioned().and_then(|c| c.conditions())
    }

    /// Replace the range list of a retrieve or subquery node.
    pub fn set_ranges(&mut self, owner: NodeId, ranges: Vec<NodeId>) {
        let old = match self.node_mut(owner) {
            Node::Retrieve(r) => std::mem::replace(&mut r.ranges, ranges.clone()),
            Node::Subquery(s) => std::mem::replace(&mut s.ranges, ranges.clone()),
            _ => return,
        };
        for id in old { if !ranges.contains(&id) { self.release(owner, Some(id)); } }
        for id in ranges { self.adopt(owner, Some(id)); }
    }

    /// Swap `old` for `new` in whichever slot of `parent` holds it.
    pub fn replace_child(&mut self, parent: NodeId, old: NodeId, new: NodeId) -> bool {
        let mut replaced = false;
        for slot in self.slots[parent.0].node.child_slots_mut() {
            if *slot == old {
                *slot = new;
                replaced = true;
                break;
            }
        }
        if replaced {
            self.release(parent, Some(old));
            self.slots[new.0].parent = Some(parent);
        }
        replaced
    }

    /// Swap `old` for `new` using the recorded parent of `old`.
    pub fn replace(&mut self, old: NodeId, new: NodeId) -> bool {
        match self.parent(old) {
            Some(parent) => self.replace_child(parent, old, new),
            None => false,
        }
    }

    /// Independent copy of the subtree at `root`. The copy has no parent.
    pub fn deep_clone(&mut self, root: NodeId) -> NodeId {
        self.deep_clone_with(root, &HashMap::new())
    }

    /// Deep clone where identifiers bound to a key of `rebind` are re-pointed
    /// at the mapped range. Ranges cloned as part of the subtree are always
    /// followed by the identifiers cloned with them.
    pub fn deep_clone_with(&mut self, root: NodeId, rebind: &HashMap<NodeId, NodeId>) -> NodeId {
        let mut mapping = rebind.clone();
        let copy = self.clone_subtree(root, &mut mapping);
        self.rebind_identifiers(copy, &mapping);
        copy
    }

    fn clone_subtree(&mut self, id: NodeId, mapping: &mut HashMap<NodeId, NodeId>) -> NodeId {
        let mut node = self.slots[id.0].node.clone();
        for slot in node.child_slots_mut() {
            *slot = self.clone_subtree(*slot, mapping);
        }
        if let Node::Retrieve(r) = &mut node {
            for body in r.macros.values_mut() {
                *body = self.clone_subtree(*body, mapping);
            }
        }
        let copy = self.add(node);
        mapping.insert(id, copy);
        copy
    }

    /// Re-point every identifier under `root` whose range is a key of `map`.
    /// Returns the number of identifiers changed.
    pub fn rebind_identifiers(&mut self, root: NodeId, map: &HashMap<NodeId, NodeId>) -> usize {
        let mut changed = 0;
        for id in self.descendants(root) {
            if let Node::Identifier(ident) = &mut self.slots[id.0].node
                && let Some(&to) = map.get(&ident.range)
                && to != ident.range
            {
                ident.range = to;
                changed += 1;
            }
        }
        changed
    }

    pub fn identifier_node(&mut self, range: NodeId, path: &[&str]) -> NodeId {
        self.add(Node::Identifier(Identifier { range, path: path.iter().map(|s| s.to_string()).collect() }))
    }

    pub fn binary(&mut self, op: BinaryOp, left: NodeId, right: NodeId) -> NodeId {
        self.add(Node::Binary { op, left, right })
    }

    pub fn and(&mut self, left: NodeId, right: NodeId) -> NodeId { self.binary(BinaryOp::And, left, right) }

    pub fn or(&mut self, left: NodeId, right: NodeId) -> NodeId { self.binary(BinaryOp::Or, left, right) }

    pub fn eq(&mut self, left: NodeId, right: NodeId) -> NodeId { self.binary(BinaryOp::Eq, left, right) }

    pub fn number(&mut self, value: impl Into<String>) -> NodeId { self.add(Node::Number(value.into())) }

    pub fn string(&mut self, value: impl Into<String>) -> NodeId { self.add(Node::String(value.into())) }

    pub fn null(&mut self) -> NodeId { self.add(Node::Null) }

    pub fn check_null(&mut self, operand: NodeId, negated: bool) -> NodeId {
        self.add(Node::CheckNull { operand, negated })
    }

    pub fn aggregate_node(&mut self, function: AggregateFn, expression: NodeId, conditions: Option<NodeId>) -> NodeId {
        self.add(Node::Aggregate(Aggregate { function, expression, conditions }))
    }

    pub fn case_when(&mut self, condition: NodeId, then: NodeId, otherwise: Option<NodeId>) -> NodeId {
        self.add(Node::Case(CaseWhen { condition, then, otherwise }))
    }

    pub fn alias(&mut self, name: impl Into<String>, expression: NodeId, visible: bool) -> NodeId {
        self.add(Node::Alias(Alias { name: name.into(), expression, visible }))
    }
}

/// A query arena together with its `Retrieve` root.
#[derive(Debug, Clone)]
pub struct Query {
    ast: Ast,
    root: NodeId,
}

impl Query {
    pub fn new(ast: Ast, root: NodeId) -> Result<Self, QueryError> {
        if ast.retrieve(root).is_none() { return Err(QueryError::EmptyQuery); }
        Ok(Self { ast, root })
    }

    pub fn ast(&self) -> &Ast { &self.ast }

    pub fn ast_mut(&mut self) -> &mut Ast { &mut self.ast }

    pub fn root(&self) -> NodeId { self.root }

    pub fn retrieve(&self) -> &Retrieve {
        match self.ast.node(self.root) {
            Node::Retrieve(r) => r,
            _ => unreachable!("Query::new only accepts retrieve roots"),
        }
    }

    pub fn retrieve_mut(&mut self) -> &mut Retrieve {
        match self.ast.node_mut(self.root) {
            Node::Retrieve(r) => r,
            _ => unreachable!("Query::new only accepts retrieve roots"),
        }
    }

    pub fn ranges(&self) -> Vec<NodeId> { self.retrieve().ranges.clone() }

    /// The retrieve node of `scope`: the root or a query behind a temporary range.
    pub fn scope(&self, scope: NodeId) -> &Retrieve {
        match self.ast.node(scope) {
            Node::Retrieve(r) => r,
            _ => unreachable!("scope {scope:?} is not a retrieve node"),
        }
    }

    pub fn scope_mut(&mut self, scope: NodeId) -> &mut Retrieve {
        match self.ast.node_mut(scope) {
            Node::Retrieve(r) => r,
            _ => unreachable!("scope {scope:?} is not a retrieve node"),
        }
    }

    /// Every retrieve scope, innermost first. The root comes last.
    pub fn scopes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        collect_scopes(&self.ast, self.root, &mut out);
        out
    }

    pub fn range_by_name(&self, name: &str) -> Option<NodeId> {
        self.retrieve().ranges.iter().copied().find(|&id| self.ast.range_name(id) == name)
    }

    pub fn range(&self, name: &str) -> Option<&Range> {
        self.range_by_name(name).and_then(|id| self.ast.range(id))
    }
}

fn collect_scopes(ast: &Ast, scope: NodeId, out: &mut Vec<NodeId>) {
    let Some(retrieve) = ast.retrieve(scope) else { return };
    for &range in &retrieve.ranges {
        if let Some(nested) = ast.range(range).and_then(|r| r.query) {
            collect_scopes(ast, nested, out);
        }
    }
    out.push(scope);
}
