#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("duplicate range name: {0}")] DuplicateRange(String),
    #[error("query has no range without a join predicate")] NoAnchorRange,
    #[error("{clause} references undeclared range '{range}'")] UndeclaredRange { clause: String, range: String },
    #[error("aggregate function {0} is not allowed directly in WHERE")] AggregateInWhere(String),
    #[error("aggregate function {function} is not allowed in the join predicate of range '{range}'")] AggregateInJoin { range: String, function: String },
    #[error("ANY is not allowed in ORDER BY")] AnyInSort,
    #[error("{0} could not be rewritten: no range can anchor its subquery")] UnresolvedAny(String),
    #[error("range '{range}' uses unknown relation '{relation}'")] InvalidViaRelation { range: String, relation: String },
    #[error("unknown macro: {0}")] UnknownMacro(String),
    #[error("query root is not a retrieve statement")] EmptyQuery,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")] Io(#[from] std::io::Error),
    #[error("config parse error: {0}")] Json(#[from] serde_json::Error),
}
