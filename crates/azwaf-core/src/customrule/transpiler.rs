//! Custom rules to SecRule statements
//!
//! Each custom rule becomes one phase 2 chained rule whose id is the rule's
//! priority. Every match condition is one chain item; the terminal action
//! sits on the first item.

use super::model::{
    CustomRule, CustomRuleAction, MatchCondition, MatchOperator, MatchTransform, MatchVariable, MatchVariableName,
    MATCH_RULE,
};
use crate::secrule::ast::{Action, Operator, Rule, RuleItem, RulePredicate, Statement, Target, TargetName, Transformation};
use crate::secrule::value::Value;
use crate::{Result, WafError};
use std::collections::HashSet;

/// Name the GeoMatch custom operator is registered under
pub const GEO_MATCH_OPERATOR: &str = "GeoMatch";

const CUSTOM_RULE_PHASE: u8 = 2;

fn to_target(v: &MatchVariable) -> Target {
    let name = match v.variable_name {
        MatchVariableName::RemoteAddr => TargetName::RemoteAddr,
        MatchVariableName::RequestMethod => TargetName::RequestMethod,
        MatchVariableName::QueryString => TargetName::QueryString,
        MatchVariableName::PostArgs => TargetName::ArgsPost,
        MatchVariableName::RequestUri => TargetName::RequestUri,
        MatchVariableName::RequestHeaders => TargetName::RequestHeaders,
        MatchVariableName::RequestBody => TargetName::RequestBody,
        MatchVariableName::RequestCookies => TargetName::RequestCookies,
    };
    if v.selector.is_empty() {
        Target::new(name)
    } else {
        Target::with_selector(name, v.selector.to_lowercase())
    }
}

fn to_transformation(t: MatchTransform) -> Transformation {
    match t {
        MatchTransform::Lowercase => Transformation::Lowercase,
        MatchTransform::Trim => Transformation::Trim,
        MatchTransform::UrlDecode => Transformation::UrlDecode,
        MatchTransform::UrlEncode => Transformation::UrlEncode,
        MatchTransform::RemoveNulls => Transformation::RemoveNulls,
        MatchTransform::HtmlEntityDecode => Transformation::HtmlEntityDecode,
    }
}

fn numeric_values(cond: &MatchCondition) -> Result<Vec<i64>> {
    cond.match_values
        .iter()
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| WafError::Config(format!("{:?} needs integer match values, got {v:?}", cond.operator)))
        })
        .collect()
}

fn alternation(values: &[String], escape: bool) -> String {
    let parts: Vec<String> = values
        .iter()
        .map(|v| if escape { regex::escape(v) } else { v.clone() })
        .collect();
    format!("({})", parts.join("|"))
}

/// Operator and operand for one match condition
pub fn to_operator_and_value(cond: &MatchCondition) -> Result<(Operator, String)> {
    if cond.match_values.is_empty() {
        return Err(WafError::Config(format!("{:?} condition has no match values", cond.operator)));
    }

    let values = &cond.match_values;
    Ok(match cond.operator {
        MatchOperator::IpMatch => (Operator::IpMatch, values.join(",")),
        MatchOperator::GeoMatch => (Operator::Custom(GEO_MATCH_OPERATOR.to_string()), values.join(",")),
        MatchOperator::Regex => (Operator::Rx, alternation(values, false)),
        MatchOperator::Contains => (Operator::Rx, alternation(values, true)),
        MatchOperator::BeginsWith => (Operator::Rx, format!("^{}", alternation(values, true))),
        MatchOperator::EndsWith => (Operator::Rx, format!("{}$", alternation(values, true))),
        MatchOperator::Equals => (Operator::Rx, format!("^{}$", alternation(values, true))),
        MatchOperator::LessThan | MatchOperator::LessThanOrEqual => {
            let max = numeric_values(cond)?.into_iter().max().unwrap_or_default();
            let op = if cond.operator == MatchOperator::LessThan {
                Operator::Lt
            } else {
                Operator::Le
            };
            (op, max.to_string())
        }
        MatchOperator::GreaterThan | MatchOperator::GreaterThanOrEqual => {
            let min = numeric_values(cond)?.into_iter().min().unwrap_or_default();
            let op = if cond.operator == MatchOperator::GreaterThan {
                Operator::Gt
            } else {
                Operator::Ge
            };
            (op, min.to_string())
        }
    })
}

/// Transpile one `MatchRule`
pub fn to_statement(rule: &CustomRule) -> Result<Statement> {
    if rule.match_conditions.is_empty() {
        return Err(WafError::Config(format!("custom rule {} has no match conditions", rule.name)));
    }

    let last = rule.match_conditions.len() - 1;
    let mut items = Vec::with_capacity(rule.match_conditions.len());
    for (i, cond) in rule.match_conditions.iter().enumerate() {
        let (op, val) = to_operator_and_value(cond)?;

        let mut actions = Vec::new();
        if i == 0 {
            actions.push(Action::Msg(Value::from(rule.name.as_str())));
            actions.push(match rule.action {
                CustomRuleAction::Allow => Action::Allow,
                CustomRuleAction::Block => Action::Deny,
                CustomRuleAction::Log => Action::Log,
            });
        }
        if i != last {
            actions.push(Action::Chain);
        }

        items.push(RuleItem {
            predicate: RulePredicate {
                targets: cond.match_variables.iter().map(to_target).collect(),
                except_targets: Vec::new(),
                op,
                neg: cond.negate_condition,
                val: Value::from(val.as_str()),
            },
            actions,
            transformations: cond.transforms.iter().copied().map(to_transformation).collect(),
            pm_phrases: Vec::new(),
        });
    }

    Ok(Statement::Rule(Rule {
        id: rule.priority,
        phase: CUSTOM_RULE_PHASE,
        items,
    }))
}

/// Transpile `rules` in ascending priority order.
///
/// Rules of a type other than `MatchRule` are skipped. Two rules with the
/// same priority are an error.
pub fn to_statements(rules: &[CustomRule]) -> Result<Vec<Statement>> {
    let mut sorted: Vec<&CustomRule> = rules.iter().collect();
    sorted.sort_by_key(|r| r.priority);

    let mut seen = HashSet::new();
    let mut statements = Vec::with_capacity(sorted.len());
    for rule in sorted {
        if !seen.insert(rule.priority) {
            return Err(WafError::Config(format!(
                "custom rules share priority {}: {}",
                rule.priority, rule.name
            )));
        }
        if rule.rule_type != MATCH_RULE {
            tracing::warn!(rule = %rule.name, rule_type = %rule.rule_type, "Skipping custom rule of unsupported type");
            continue;
        }
        statements.push(to_statement(rule)?);
    }

    tracing::info!(count = statements.len(), "Converted custom rules into SecRules");
    Ok(statements)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(op: MatchOperator, values: &[&str]) -> MatchCondition {
        MatchCondition {
            match_variables: vec![MatchVariable::new(MatchVariableName::QueryString)],
            operator: op,
            negate_condition: false,
            match_values: values.iter().map(|v| v.to_string()).collect(),
            transforms: Vec::new(),
        }
    }

    fn value_of(op: MatchOperator, values: &[&str]) -> String {
        to_operator_and_value(&condition(op, values)).unwrap().1
    }

    #[test]
    fn test_string_operator_values() {
        assert_eq!(value_of(MatchOperator::Contains, &["str1"]), "(str1)");
        assert_eq!(value_of(MatchOperator::Contains, &["str1", "str2"]), "(str1|str2)");
        assert_eq!(value_of(MatchOperator::BeginsWith, &["str1", "str2"]), "^(str1|str2)");
        assert_eq!(value_of(MatchOperator::EndsWith, &["str1", "str2"]), "(str1|str2)$");
        assert_eq!(value_of(MatchOperator::Equals, &["str1", "str2"]), "^(str1|str2)$");
        assert_eq!(value_of(MatchOperator::Equals, &["a.b"]), r"^(a\.b)$");
        assert_eq!(value_of(MatchOperator::Regex, &["ab+c"]), "(ab+c)");
    }

    #[test]
    fn test_ip_and_geo_values() {
        assert_eq!(value_of(MatchOperator::IpMatch, &["192.168.0.1"]), "192.168.0.1");
        assert_eq!(
            value_of(MatchOperator::IpMatch, &["192.168.0.1", "192.168.0.2"]),
            "192.168.0.1,192.168.0.2"
        );
        let (op, val) = to_operator_and_value(&condition(MatchOperator::GeoMatch, &["US", "ca"])).unwrap();
        assert_eq!(op, Operator::Custom(GEO_MATCH_OPERATOR.into()));
        assert_eq!(val, "US,ca");
    }

    #[test]
    fn test_numeric_values() {
        assert_eq!(value_of(MatchOperator::LessThan, &["12"]), "12");
        assert_eq!(value_of(MatchOperator::LessThan, &["12", "15"]), "15");
        assert_eq!(value_of(MatchOperator::LessThanOrEqual, &["12", "15"]), "15");
        assert_eq!(value_of(MatchOperator::GreaterThan, &["12", "15"]), "12");
        assert_eq!(value_of(MatchOperator::GreaterThanOrEqual, &["12", "15"]), "12");
        assert!(to_operator_and_value(&condition(MatchOperator::GreaterThan, &["x"])).is_err());
        assert!(to_operator_and_value(&condition(MatchOperator::Contains, &[])).is_err());
    }

    #[test]
    fn test_to_statement() {
        let rule = CustomRule {
            name: "blockEvilBot".into(),
            priority: 2,
            rule_type: MATCH_RULE.into(),
            action: CustomRuleAction::Block,
            match_conditions: vec![
                MatchCondition {
                    match_variables: vec![MatchVariable::with_selector(MatchVariableName::RequestHeaders, "User-Agent")],
                    operator: MatchOperator::Contains,
                    negate_condition: true,
                    match_values: vec!["evilbot".into(), "badbot".into()],
                    transforms: vec![MatchTransform::Lowercase, MatchTransform::Trim],
                },
                MatchCondition {
                    match_variables: vec![MatchVariable::new(MatchVariableName::RemoteAddr)],
                    operator: MatchOperator::IpMatch,
                    negate_condition: false,
                    match_values: vec!["192.168.0.1".into(), "192.168.0.2".into()],
                    transforms: Vec::new(),
                },
            ],
        };

        let Statement::Rule(r) = to_statement(&rule).unwrap() else {
            panic!("expected a rule");
        };
        assert_eq!(r.id, 2);
        assert_eq!(r.phase, 2);
        assert_eq!(r.items.len(), 2);

        let first = &r.items[0];
        assert_eq!(first.predicate.targets, vec![Target::with_selector(TargetName::RequestHeaders, "user-agent")]);
        assert!(first.predicate.neg);
        assert_eq!(first.predicate.op, Operator::Rx);
        assert_eq!(first.predicate.val, Value::from("(evilbot|badbot)"));
        assert_eq!(first.transformations, vec![Transformation::Lowercase, Transformation::Trim]);
        assert!(first.actions.contains(&Action::Deny));
        assert!(first.has_chain());

        let second = &r.items[1];
        assert_eq!(second.predicate.targets, vec![Target::new(TargetName::RemoteAddr)]);
        assert_eq!(second.predicate.op, Operator::IpMatch);
        assert!(second.actions.is_empty());
    }

    fn rule(name: &str, priority: i64) -> CustomRule {
        CustomRule {
            name: name.into(),
            priority,
            rule_type: MATCH_RULE.into(),
            action: CustomRuleAction::Log,
            match_conditions: vec![condition(MatchOperator::Contains, &["x"])],
        }
    }

    #[test]
    fn test_to_statements_sorted_and_unique() {
        let stmts = to_statements(&[rule("b", 100), rule("a", 1)]).unwrap();
        let ids: Vec<i64> = stmts.iter().map(Statement::id).collect();
        assert_eq!(ids, vec![1, 100]);

        assert!(matches!(
            to_statements(&[rule("a", 5), rule("b", 5)]),
            Err(WafError::Config(_))
        ));

        let mut other = rule("c", 7);
        other.rule_type = "RateLimitRule".into();
        assert_eq!(to_statements(&[other]).unwrap().len(), 0);
    }
}
