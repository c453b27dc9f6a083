//! Declarative custom rule definitions as they appear in policy JSON

use serde::{Deserialize, Serialize};

/// What a triggered custom rule does to the request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CustomRuleAction {
    Allow,
    Block,
    /// Record the match and keep evaluating
    Log,
}

/// Request entity a condition inspects
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchVariableName {
    RemoteAddr,
    RequestMethod,
    QueryString,
    PostArgs,
    RequestUri,
    RequestHeaders,
    RequestBody,
    RequestCookies,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOperator {
    #[serde(rename = "IPMatch")]
    IpMatch,
    GeoMatch,
    Equals,
    Contains,
    BeginsWith,
    EndsWith,
    Regex,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchTransform {
    Lowercase,
    Trim,
    UrlDecode,
    UrlEncode,
    RemoveNulls,
    HtmlEntityDecode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchVariable {
    pub variable_name: MatchVariableName,
    /// Header, cookie or argument name; empty for the whole collection
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
}

impl MatchVariable {
    pub fn new(variable_name: MatchVariableName) -> Self {
        Self {
            variable_name,
            selector: String::new(),
        }
    }

    pub fn with_selector(variable_name: MatchVariableName, selector: impl Into<String>) -> Self {
        Self {
            variable_name,
            selector: selector.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    pub match_variables: Vec<MatchVariable>,
    pub operator: MatchOperator,
    #[serde(default)]
    pub negate_condition: bool,
    pub match_values: Vec<String>,
    #[serde(default)]
    pub transforms: Vec<MatchTransform>,
}

fn default_rule_type() -> String {
    MATCH_RULE.to_string()
}

pub const MATCH_RULE: &str = "MatchRule";

/// One customer-defined rule. Lower priorities run first.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRule {
    pub name: String,
    pub priority: i64,
    #[serde(default = "default_rule_type")]
    pub rule_type: String,
    pub action: CustomRuleAction,
    pub match_conditions: Vec<MatchCondition>,
}
