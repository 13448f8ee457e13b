pub mod config;
pub mod entity_store;
pub mod query_ast;

pub use config::OptimizerSettings;
pub use entity_store::{EntityMetadata, EntityStore, RelationAnnotation, RelationKind};
pub use query_ast::{CompileReport, ObjectQuel, Query, QueryBuilder, QueryError, compile};

/// Install `env_logger` with this crate at debug level. Safe to call more than once.
pub fn init_logging() {
    dotenv::dotenv().ok();
    let _ = env_logger::Builder::from_default_env()
        .filter_module("objectquel", log::LevelFilter::Debug)
        .is_test(false)
        .try_init();
}

/// Crate version, for diagnostics.
pub fn version() -> &'static str { env!("CARGO_PKG_VERSION") }
