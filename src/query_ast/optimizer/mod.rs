//! Optimizer passes over a validated `retrieve` query.
//!
//! Passes run once each, in a fixed order. Every pass visits each retrieve
//! scope of the query, innermost first: the queries behind temporary ranges,
//! then the top level. Requiredness decisions precede
//! dead-join elimination, and EXISTS extraction precedes the requiredness
//! rules. A pass never fails: when a rewrite is not provably safe it leaves the
//! tree as it found it and reports no change.

pub mod aggregate;
pub mod anchor;
pub mod any_exists;
pub mod exists_extraction;
pub mod join_optimizer;
pub mod predicate_split;
pub mod predicates;
pub mod range_usage;
pub mod self_join;

use std::collections::BTreeSet;

use log::{debug, trace};

use self::aggregate::{AggregateOptimizer, AggregateStrategy};
use self::anchor::{anchor_first, current_anchor, ensure_single_anchor};
use self::any_exists::AnyOptimizer;
use self::join_optimizer::{JoinOptimizer, eliminate_dead_joins, included_ranges};
use self::range_usage::analyze;
use super::ast::{NodeId, Query};
use super::explain::explain;
use crate::config::OptimizerSettings;
use crate::entity_store::EntityMetadata;

/// Shared state handed to every pass of one compilation.
pub struct PassContext<'a> {
    pub metadata: &'a dyn EntityMetadata,
    pub strategy: &'a dyn AggregateStrategy,
    /// Ranges made required by `EXISTS(range)`.
    pub pinned: BTreeSet<NodeId>,
}

impl<'a> PassContext<'a> {
    pub fn new(metadata: &'a dyn EntityMetadata, strategy: &'a dyn AggregateStrategy) -> Self {
        Self { metadata, strategy, pinned: BTreeSet::new() }
    }
}

pub trait OptimizerPass: Send + Sync {
    /// Name used in logs, traces and `OptimizerSettings::disable`.
    fn name(&self) -> &'static str;

    /// Rewrite the retrieve scope `scope` of `query` in place. Returns whether
    /// anything changed.
    fn apply(&self, query: &mut Query, scope: NodeId, ctx: &mut PassContext<'_>) -> bool;
}

pub struct ExistsExtraction;

impl OptimizerPass for ExistsExtraction {
    fn name(&self) -> &'static str { "exists_extraction" }

    fn apply(&self, query: &mut Query, scope: NodeId, ctx: &mut PassContext<'_>) -> bool {
        let pinned = exists_extraction::extract_exists(query, scope);
        let changed = !pinned.is_empty();
        ctx.pinned.extend(pinned);
        changed
    }
}

pub struct AnyRewrite;

impl OptimizerPass for AnyRewrite {
    fn name(&self) -> &'static str { "any_optimizer" }

    fn apply(&self, query: &mut Query, scope: NodeId, ctx: &mut PassContext<'_>) -> bool {
        AnyOptimizer::new(ctx.metadata).optimize(query, scope)
    }
}

pub struct AggregateRewrite;

impl OptimizerPass for AggregateRewrite {
    fn name(&self) -> &'static str { "aggregate_optimizer" }

    fn apply(&self, query: &mut Query, scope: NodeId, ctx: &mut PassContext<'_>) -> bool {
        AggregateOptimizer::new(ctx.metadata, ctx.strategy).optimize(query, scope)
    }
}

pub struct SelfJoinElimination;

impl OptimizerPass for SelfJoinElimination {
    fn name(&self) -> &'static str { "self_join_optimizer" }

    fn apply(&self, query: &mut Query, scope: NodeId, _ctx: &mut PassContext<'_>) -> bool {
        self_join::optimize_self_joins(query, scope)
    }
}

pub struct JoinRequiredness;

impl OptimizerPass for JoinRequiredness {
    fn name(&self) -> &'static str { "join_optimizer" }

    fn apply(&self, query: &mut Query, scope: NodeId, ctx: &mut PassContext<'_>) -> bool {
        JoinOptimizer::new(ctx.metadata, &ctx.pinned).optimize(query, scope)
    }
}

/// Guarantees every scope starts with its anchor. Cannot be disabled.
pub struct AnchorNormalization;

impl OptimizerPass for AnchorNormalization {
    fn name(&self) -> &'static str { "anchor_normalization" }

    fn apply(&self, query: &mut Query, scope: NodeId, ctx: &mut PassContext<'_>) -> bool {
        let all = query.scope(scope).ranges.clone();
        let included = included_ranges(query, scope);
        if included.is_empty() { return false; }

        let retrieve = query.scope(scope);
        let conditions = retrieve.conditions;
        let expressions: Vec<NodeId> =
            retrieve.values.iter().copied().chain(retrieve.sort.iter().map(|s| s.expression)).collect();
        let ast = query.ast_mut();
        let mut changed = false;

        if current_anchor(ast, &included).is_none() {
            let usage = analyze(ast, ctx.metadata, &expressions, conditions, &included);
            let (_, promoted) = ensure_single_anchor(ast, &included, conditions, &usage);
            if promoted != conditions {
                ast.set_conditions(scope, promoted);
            }
            changed = current_anchor(ast, &included).is_some();
        }

        let Some(anchor) = current_anchor(ast, &included) else {
            debug!("scope {:?} has no anchor range", scope);
            return changed;
        };
        let ordered = anchor_first(&all, anchor);
        if ordered != all {
            ast.set_ranges(scope, ordered);
            changed = true;
        }
        changed
    }
}

pub struct DeadJoinElimination;

impl OptimizerPass for DeadJoinElimination {
    fn name(&self) -> &'static str { "dead_join_elimination" }

    fn apply(&self, query: &mut Query, scope: NodeId, _ctx: &mut PassContext<'_>) -> bool {
        eliminate_dead_joins(query, scope)
    }
}

/// Pass order of a full compilation.
pub fn default_passes() -> Vec<Box<dyn OptimizerPass>> {
    vec![
        Box::new(ExistsExtraction),
        Box::new(AnyRewrite),
        Box::new(AggregateRewrite),
        Box::new(SelfJoinElimination),
        Box::new(JoinRequiredness),
        Box::new(AnchorNormalization),
        Box::new(DeadJoinElimination),
    ]
}

/// One pass application, recorded when tracing is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassTrace {
    pub pass: &'static str,
    pub before: String,
    pub after: String,
    pub changed: bool,
}

impl PassTrace {
    pub fn format(&self) -> String {
        let mark = if self.changed { "changed" } else { "unchanged" };
        format!("[{}] {}\n  before: {}\n  after:  {}", self.pass, mark, self.before, self.after)
    }
}

/// What a compilation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileReport {
    /// Passes that changed the tree, in run order.
    pub passes_applied: Vec<&'static str>,
    pub trace: Vec<PassTrace>,
}

impl CompileReport {
    pub fn applied(&self, pass: &str) -> bool { self.passes_applied.iter().any(|p| *p == pass) }

    pub fn format_trace(&self) -> String {
        self.trace.iter().map(PassTrace::format).collect::<Vec<_>>().join("\n")
    }
}

pub struct Optimizer {
    passes: Vec<Box<dyn OptimizerPass>>,
    settings: OptimizerSettings,
}

impl Optimizer {
    pub fn new(settings: OptimizerSettings) -> Self { Self { passes: default_passes(), settings } }

    pub fn with_passes(passes: Vec<Box<dyn OptimizerPass>>, settings: OptimizerSettings) -> Self {
        Self { passes, settings }
    }

    pub fn run(&self, query: &mut Query, ctx: &mut PassContext<'_>) -> CompileReport {
        let mut report = CompileReport::default();
        let scopes = query.scopes();
        for pass in &self.passes {
            if !self.settings.is_enabled(pass.name()) {
                trace!("pass '{}' disabled", pass.name());
                continue;
            }
            let before = self.settings.trace.then(|| explain(query.ast(), query.root()));
            let mut changed = false;
            for &scope in &scopes {
                changed |= pass.apply(query, scope, ctx);
            }
            if changed {
                debug!("pass '{}' changed the query", pass.name());
                report.passes_applied.push(pass.name());
            }
            if let Some(before) = before {
                report.trace.push(PassTrace {
                    pass: pass.name(),
                    before,
                    after: explain(query.ast(), query.root()),
                    changed,
                });
            }
        }
        if self.settings.trace {
            debug!("optimizer trace:\n{}", report.format_trace());
        }
        report
    }
}
