//! Custom rules compiled onto the SecRule engine

use super::geomatch::{GeoDb, GeoMatch};
use super::model::{CustomRule, CustomRuleAction, MatchOperator};
use super::transpiler::{to_statements, GEO_MATCH_OPERATOR};
use crate::bodyparsing::BodyType;
use crate::multiregex::MultiRegexEngineFactory;
use crate::secrule::{CustomOperators, SecRuleEngine, SecRuleEvaluation};
use crate::waf::{HttpRequest, ResultsLogger};
use crate::{Decision, Result, WafError};
use std::collections::HashMap;
use std::sync::Arc;

/// Ruleset id reported for transpiled custom rules
pub const CUSTOM_RULES_RULESET_ID: &str = "CustomRules";

#[derive(Clone, Debug)]
struct RuleInfo {
    name: String,
    action: CustomRuleAction,
}

/// A policy's custom rules, ready to evaluate requests
pub struct CustomRuleEngine {
    secrule: SecRuleEngine,
    rules: HashMap<i64, RuleInfo>,
}

impl CustomRuleEngine {
    pub fn new(
        rules: &[CustomRule],
        multi_regex_factory: &MultiRegexEngineFactory,
        geo_db: Option<Arc<dyn GeoDb>>,
    ) -> Result<Self> {
        let uses_geo_match = rules
            .iter()
            .flat_map(|r| &r.match_conditions)
            .any(|c| c.operator == MatchOperator::GeoMatch);

        let mut custom_operators = CustomOperators::new();
        match geo_db {
            Some(db) => custom_operators.register(GEO_MATCH_OPERATOR, Arc::new(GeoMatch::new(db))),
            None if uses_geo_match => {
                return Err(WafError::Config("GeoMatch custom rules need a GeoIP database".into()));
            }
            None => {}
        }

        let statements = to_statements(rules)?;
        let secrule = SecRuleEngine::new(
            statements,
            CUSTOM_RULES_RULESET_ID,
            &[],
            multi_regex_factory,
            custom_operators,
        )?;

        let rules = rules
            .iter()
            .map(|r| {
                let info = RuleInfo {
                    name: r.name.clone(),
                    action: r.action,
                };
                (r.priority, info)
            })
            .collect();

        Ok(Self { secrule, rules })
    }

    /// Wrap `inner` so triggered rules are reported as custom rules
    pub fn results_logger<'a>(&'a self, inner: &'a dyn ResultsLogger) -> CustomRuleResultsLogger<'a> {
        CustomRuleResultsLogger { engine: self, inner }
    }

    /// Start evaluating `request` with a logger made by [`results_logger`](Self::results_logger)
    pub fn new_evaluation<'a>(
        &'a self,
        request: &'a HttpRequest,
        body_type: BodyType,
        results_logger: &'a CustomRuleResultsLogger<'a>,
    ) -> Result<SecRuleEvaluation<'a>> {
        self.secrule.new_evaluation(request, body_type, results_logger)
    }
}

/// Translates SecRule notifications of transpiled rules back to custom rule names
pub struct CustomRuleResultsLogger<'a> {
    engine: &'a CustomRuleEngine,
    inner: &'a dyn ResultsLogger,
}

impl ResultsLogger for CustomRuleResultsLogger<'_> {
    fn field_bytes_limit_exceeded(&self, limit: usize) {
        self.inner.field_bytes_limit_exceeded(limit)
    }

    fn pausable_bytes_limit_exceeded(&self, limit: usize) {
        self.inner.pausable_bytes_limit_exceeded(limit)
    }

    fn total_bytes_limit_exceeded(&self, limit: usize) {
        self.inner.total_bytes_limit_exceeded(limit)
    }

    fn total_full_raw_request_body_limit_exceeded(&self, limit: usize) {
        self.inner.total_full_raw_request_body_limit_exceeded(limit)
    }

    fn body_parse_error(&self, err: &WafError) {
        self.inner.body_parse_error(err)
    }

    fn header_parse_error(&self, err: &WafError) {
        self.inner.header_parse_error(err)
    }

    fn secrule_triggered(&self, rule_id: i64, decision: Decision, msg: &str, log_data: &str, ruleset_id: &str) {
        match self.engine.rules.get(&rule_id) {
            Some(info) => self.inner.custom_rule_triggered(&info.name, rule_id, info.action),
            None => self.inner.secrule_triggered(rule_id, decision, msg, log_data, ruleset_id),
        }
    }

    fn custom_rule_triggered(&self, rule_name: &str, priority: i64, action: CustomRuleAction) {
        self.inner.custom_rule_triggered(rule_name, priority, action)
    }

    fn ip_reputation_triggered(&self, client_ip: std::net::IpAddr) {
        self.inner.ip_reputation_triggered(client_ip)
    }
}
