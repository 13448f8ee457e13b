use std::collections::{BTreeSet, HashMap};

use objectquel::query_ast::ast::{Ast, BinaryOp, Node, NodeId};
use objectquel::query_ast::optimizer::predicate_split::split;
use objectquel::QueryBuilder;
use proptest::prelude::*;

/// Range aliases by leaf tag: tags 0 and 1 are live, 2 and 3 correlation.
const ALIASES: [&str; 4] = ["l0", "l1", "c0", "c1"];
const MAX_LEAVES: usize = 10;

#[derive(Debug, Clone)]
enum Shape {
    Leaf(usize),
    And(Box<Shape>, Box<Shape>),
    Or(Box<Shape>, Box<Shape>),
}

impl Shape {
    fn leaves(&self) -> usize {
        match self {
            Shape::Leaf(_) => 1,
            Shape::And(a, b) | Shape::Or(a, b) => a.leaves() + b.leaves(),
        }
    }

    fn tags(&self, out: &mut BTreeSet<bool>) {
        match self {
            Shape::Leaf(tag) => {
                out.insert(*tag < 2);
            }
            Shape::And(a, b) | Shape::Or(a, b) => {
                a.tags(out);
                b.tags(out);
            }
        }
    }

    /// Some OR node has both live and correlation leaves below it.
    fn has_mixed_or(&self) -> bool {
        match self {
            Shape::Leaf(_) => false,
            Shape::And(a, b) => a.has_mixed_or() || b.has_mixed_or(),
            Shape::Or(a, b) => {
                let mut tags = BTreeSet::new();
                self.tags(&mut tags);
                tags.len() == 2 || a.has_mixed_or() || b.has_mixed_or()
            }
        }
    }
}

fn shape() -> impl Strategy<Value = Shape> {
    let leaf = (0usize..4).prop_map(Shape::Leaf);
    leaf.prop_recursive(4, 12, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| Shape::And(Box::new(a), Box::new(b))),
            (inner.clone(), inner).prop_map(|(a, b)| Shape::Or(Box::new(a), Box::new(b))),
        ]
    })
}

fn build(b: &mut QueryBuilder, ranges: &[NodeId], shape: &Shape, leaves: &mut Vec<NodeId>) -> NodeId {
    match shape {
        Shape::Leaf(tag) => {
            let leaf = b.cmp(ranges[*tag], &format!("f{}", leaves.len()), BinaryOp::Eq, "1");
            leaves.push(leaf);
            leaf
        }
        Shape::And(l, r) => {
            let left = build(b, ranges, l, leaves);
            let right = build(b, ranges, r, leaves);
            b.and(left, right)
        }
        Shape::Or(l, r) => {
            let left = build(b, ranges, l, leaves);
            let right = build(b, ranges, r, leaves);
            b.or(left, right)
        }
    }
}

fn eval(ast: &Ast, id: NodeId, assignment: &HashMap<NodeId, bool>) -> bool {
    match ast.node(id) {
        Node::Binary { op: BinaryOp::And, left, right } => eval(ast, *left, assignment) && eval(ast, *right, assignment),
        Node::Binary { op: BinaryOp::Or, left, right } => eval(ast, *left, assignment) || eval(ast, *right, assignment),
        _ => assignment[&id],
    }
}

fn names(list: &[&str]) -> BTreeSet<String> { list.iter().map(|s| s.to_string()).collect() }

fn setup(shape: &Shape) -> (QueryBuilder, NodeId, Vec<NodeId>) {
    let mut b = QueryBuilder::new();
    let ranges: Vec<NodeId> = ALIASES.iter().map(|a| b.range(a, "Entity")).collect();
    let mut leaves = Vec::new();
    let root = build(&mut b, &ranges, shape, &mut leaves);
    (b, root, leaves)
}

proptest! {
    #[test]
    fn split_preserves_meaning(shape in shape()) {
        prop_assume!(shape.leaves() <= MAX_LEAVES);
        let (mut b, root, leaves) = setup(&shape);
        let live = names(&ALIASES[..2]);
        let corr = names(&ALIASES[2..]);
        let parts = split(b.ast(), Some(root), &live, &corr);
        let ast = b.ast();

        for bits in 0u32..(1 << leaves.len()) {
            let assignment: HashMap<NodeId, bool> =
                leaves.iter().enumerate().map(|(i, &leaf)| (leaf, bits & (1 << i) != 0)).collect();
            let expected = eval(ast, root, &assignment);
            let got = match (parts.inner, parts.correlation) {
                (Some(i), Some(c)) => eval(ast, i, &assignment) && eval(ast, c, &assignment),
                (Some(only), None) | (None, Some(only)) => eval(ast, only, &assignment),
                (None, None) => true,
            };
            prop_assert_eq!(got, expected);
        }
    }

    #[test]
    fn mixed_or_is_never_split(shape in shape()) {
        prop_assume!(shape.leaves() <= MAX_LEAVES && shape.has_mixed_or());
        let (mut b, root, _) = setup(&shape);
        let parts = split(b.ast(), Some(root), &names(&ALIASES[..2]), &names(&ALIASES[2..]));
        prop_assert_eq!(parts.inner, Some(root));
        prop_assert_eq!(parts.correlation, None);
    }

    #[test]
    fn inner_part_never_mentions_correlation_ranges(shape in shape()) {
        prop_assume!(shape.leaves() <= MAX_LEAVES && !shape.has_mixed_or());
        let (mut b, root, _) = setup(&shape);
        let corr = names(&ALIASES[2..]);
        let parts = split(b.ast(), Some(root), &names(&ALIASES[..2]), &corr);
        if let Some(inner) = parts.inner {
            let mentioned = b.ast().referenced_range_names(inner);
            prop_assert!(mentioned.is_disjoint(&corr), "inner part mentions {:?}", mentioned);
        }
    }
}
