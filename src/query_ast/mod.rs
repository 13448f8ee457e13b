//! ObjectQuel query AST and the compile pipeline that prepares it for SQL
//! generation.
//!
//! Pipeline: processing (macros, `via` relations), validation, then the
//! optimizer passes over every retrieve scope. After a successful compile the
//! tree guarantees that every scope starts with exactly one anchor range, that
//! no aggregate keeps an embedded condition and that no ANY node is left. An
//! ANY the optimizer cannot anchor fails the compile.

pub mod ast;
pub mod builder;
pub mod errors;
pub mod explain;
pub mod optimizer;
pub mod processing;
pub mod validation;
pub mod visitor;

pub use ast::{Ast, NodeId, Query};
pub use builder::QueryBuilder;
pub use errors::*;
pub use optimizer::CompileReport;

use log::debug;

use crate::config::OptimizerSettings;
use crate::entity_store::EntityMetadata;
use optimizer::aggregate::{AggregateStrategy, PreferCaseWhen};
use optimizer::{Optimizer, PassContext};

/// Compiles queries against one metadata source.
pub struct ObjectQuel<'a> {
    metadata: &'a dyn EntityMetadata,
    settings: OptimizerSettings,
    strategy: Box<dyn AggregateStrategy>,
}

impl<'a> ObjectQuel<'a> {
    /// Uses the process-wide settings and the `CASE WHEN` aggregate policy.
    pub fn new(metadata: &'a dyn EntityMetadata) -> Self {
        Self { metadata, settings: OptimizerSettings::global().clone(), strategy: Box::new(PreferCaseWhen) }
    }

    pub fn with_settings(mut self, settings: OptimizerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_aggregate_strategy(mut self, strategy: Box<dyn AggregateStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn settings(&self) -> &OptimizerSettings { &self.settings }

    /// Process, validate and optimize `query` in place.
    pub fn compile(&self, query: &mut Query) -> Result<CompileReport, QueryError> {
        processing::expand_macros(query)?;
        processing::expand_via_relations(query, self.metadata)?;
        validation::validate(query)?;

        let mut ctx = PassContext::new(self.metadata, self.strategy.as_ref());
        let report = Optimizer::new(self.settings.clone()).run(query, &mut ctx);
        if self.settings.is_enabled("any_optimizer") {
            validation::ensure_any_rewritten(query)?;
        }
        debug!("compiled: {}", explain::explain(query.ast(), query.root()));
        Ok(report)
    }
}

/// Compile with default settings and policy.
pub fn compile(query: &mut Query, metadata: &dyn EntityMetadata) -> Result<CompileReport, QueryError> {
    ObjectQuel::new(metadata).compile(query)
}
