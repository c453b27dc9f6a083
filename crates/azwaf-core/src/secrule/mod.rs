//! ModSecurity SecRule engine
//!
//! Rules are parsed into an AST ([`ast`]), compiled into a request scanner
//! that answers most predicates in one pass over the request fields
//! ([`scanner`]), and evaluated phase by phase ([`evaluator`]). [`engine`]
//! ties the two passes together per request.

pub mod ast;
pub mod engine;
pub mod environment;
pub mod evaluator;
pub mod libinjection;
pub mod loader;
pub mod operators;
pub mod parser;
pub mod scanner;
pub mod transformations;
pub mod value;
pub mod writer;

pub use ast::Statement;
pub use engine::{SecRuleEngine, SecRuleEngineFactory, SecRuleEvaluation};
pub use loader::{CrsRuleLoader, OsRuleLoaderFileSystem, RuleLoader, StandaloneRuleLoader};
pub use operators::{CustomOperator, CustomOperators};
