//! Declarative custom rules
//!
//! Custom rules are transpiled into SecRule statements ([`transpiler`]) and
//! evaluated by a dedicated [`SecRuleEngine`](crate::SecRuleEngine) with the
//! `GeoMatch` operator registered ([`geomatch`]).

pub mod engine;
pub mod geomatch;
pub mod model;
pub mod transpiler;

pub use engine::{CustomRuleEngine, CustomRuleResultsLogger};
pub use geomatch::{GeoDb, GeoIpRecord, GeoMatch, RangeGeoDb};
pub use model::{CustomRule, CustomRuleAction, MatchCondition, MatchOperator, MatchTransform, MatchVariable, MatchVariableName};
