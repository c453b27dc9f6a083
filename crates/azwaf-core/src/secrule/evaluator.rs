//! Rule evaluation (pass 2)
//!
//! Walks the statements of one phase in order. Predicates answered during
//! scanning are looked up in [`ScanResults`]; the rest are evaluated here
//! against the [`Environment`].

use super::ast::{Action, CtlSetting, RuleItem, SetVarAction, SetVarOperator, Statement, Target, TargetName};
use super::environment::Environment;
use super::operators::{eval_operator, CustomOperators, RegexCache};
use super::scanner::{requires_late_scan, Match, ScanResults};
use super::transformations::apply_pipeline;
use super::value::{EnvVarName, Value};
use crate::{Decision, Result, WafError};
use std::sync::Arc;

/// Capture groups stored as `TX:0` to `TX:9`
const MAX_CAPTURE_GROUPS: usize = 10;

/// Notification for a rule whose last item matched
#[derive(Debug)]
pub struct TriggeredRule<'a> {
    pub statement: &'a Statement,
    pub decision: Decision,
    pub msg: Vec<u8>,
    pub log_data: Vec<u8>,
}

/// Result of one phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub decision: Decision,
    /// Set by `ctl:forceRequestBodyVariable=on`
    pub force_request_body_variable: bool,
}

/// Per-statement bookkeeping
#[derive(Default)]
struct StatementState {
    should_log: bool,
    msg: Option<Value>,
    log_data: Option<Value>,
    captured: Vec<String>,
}

pub struct RuleEvaluator {
    statements: Arc<Vec<Statement>>,
    custom_operators: CustomOperators,
    regexes: RegexCache,
}

impl RuleEvaluator {
    pub fn new(statements: Arc<Vec<Statement>>, custom_operators: CustomOperators) -> Self {
        Self {
            statements,
            custom_operators,
            regexes: RegexCache::new(),
        }
    }

    /// Evaluate every statement of `phase`, stopping at the first `allow` or
    /// `deny`. In phase 5 decisions are reported but not enforced.
    pub fn process_phase(
        &self,
        phase: u8,
        env: &mut Environment,
        results: &ScanResults,
        on_triggered: &mut dyn FnMut(TriggeredRule<'_>),
    ) -> PhaseOutcome {
        let mut outcome = PhaseOutcome::default();
        let mut skip_after: Option<&str> = None;

        for stmt in self.statements.iter() {
            if let Some(label) = skip_after {
                if matches!(stmt, Statement::Marker(m) if m.label == label) {
                    skip_after = None;
                }
                continue;
            }

            if stmt.phase() != Some(phase) {
                continue;
            }

            let mut state = StatementState {
                should_log: true,
                ..Default::default()
            };

            let decision = match stmt {
                Statement::Rule(rule) => {
                    env.reset_matches_collections();
                    env.set(EnvVarName::Rule, "id", Value::int(rule.id));
                    self.eval_rule(rule.id, &rule.items, env, results, &mut state, &mut outcome, &mut skip_after)
                }
                Statement::Action(a) => {
                    env.set(EnvVarName::Rule, "id", Value::int(a.id));
                    run_actions(&a.actions, None, env, &mut state, &mut outcome);
                    Some(run_actions_after_all(a.actions.iter(), &mut state, &mut skip_after))
                }
                Statement::Marker(_) => None,
            };

            for key in state.captured.drain(..) {
                env.delete(EnvVarName::Tx, &key);
            }

            let Some(mut decision) = decision else { continue };
            if phase == 5 {
                decision = Decision::Pass;
            }

            if state.should_log {
                on_triggered(TriggeredRule {
                    statement: stmt,
                    decision,
                    msg: state.msg.as_ref().map(|v| env.expand_macros(v).to_bytes()).unwrap_or_default(),
                    log_data: state.log_data.as_ref().map(|v| env.expand_macros(v).to_bytes()).unwrap_or_default(),
                });
            }

            if decision != Decision::Pass {
                outcome.decision = decision;
                return outcome;
            }
        }

        outcome
    }

    /// Returns the rule's decision if every item matched
    #[allow(clippy::too_many_arguments)]
    fn eval_rule<'s>(
        &'s self,
        rule_id: i64,
        items: &'s [RuleItem],
        env: &mut Environment,
        results: &ScanResults,
        state: &mut StatementState,
        outcome: &mut PhaseOutcome,
        skip_after: &mut Option<&'s str>,
    ) -> Option<Decision> {
        for (item_idx, item) in items.iter().enumerate() {
            let mut any_triggered = false;

            for target in &item.predicate.targets {
                let (triggered, matches) = self.eval_predicate(rule_id, item_idx, item, target, env, results);
                if !triggered {
                    continue;
                }
                any_triggered = true;

                env.update_matches(&matches);
                if matches.is_empty() {
                    run_actions(&item.actions, None, env, state, outcome);
                }
                for m in &matches {
                    run_actions(&item.actions, Some(m), env, state, outcome);
                }
            }

            if !any_triggered {
                return None;
            }
        }

        let all_actions = items.iter().flat_map(|i| i.actions.iter());
        Some(run_actions_after_all(all_actions, state, skip_after))
    }

    fn eval_predicate(
        &self,
        rule_id: i64,
        item_idx: usize,
        item: &RuleItem,
        target: &Target,
        env: &Environment,
        results: &ScanResults,
    ) -> (bool, Vec<Match>) {
        let neg = item.predicate.neg;

        if requires_late_scan(item, target) {
            // An unset TX variable never triggers, negated or not
            if is_unset_tx_target(target, env) {
                return (false, Vec::new());
            }
            return match self.eval_late(item, target, env, results) {
                Ok(Some(m)) if !neg => (true, vec![m]),
                Ok(Some(_)) => (false, Vec::new()),
                Ok(None) => (neg, Vec::new()),
                Err(e) => {
                    tracing::warn!(rule_id, target = %target, error = %e, "Error evaluating late-bound predicate");
                    (false, Vec::new())
                }
            };
        }

        if results.target_count(target) == 0 {
            return (false, Vec::new());
        }

        match results.results_for(rule_id, item_idx, target) {
            Some(m) if !neg => (true, m.to_vec()),
            Some(_) => (false, Vec::new()),
            None => (neg, Vec::new()),
        }
    }

    /// Values a late-bound target currently has
    fn late_target_values(&self, target: &Target, env: &Environment, results: &ScanResults) -> Result<Vec<Value>> {
        let scalar =
            |name: EnvVarName, selector: &str| -> Vec<Value> { env.get(name, selector).cloned().into_iter().collect() };

        Ok(match target.name {
            TargetName::Tx if target.is_regex_selector => {
                let vals = env.tx_vars_via_regex_selector(&target.selector)?;
                if target.is_count {
                    vec![Value::int(vals.len() as i64)]
                } else {
                    vals.into_iter().cloned().collect()
                }
            }
            TargetName::Tx if target.is_count => {
                vec![Value::int(i64::from(env.get(EnvVarName::Tx, &target.selector).is_some()))]
            }
            TargetName::Tx => {
                let v = env
                    .get(EnvVarName::Tx, &target.selector)
                    .ok_or_else(|| WafError::Operator(format!("TX variable {} not set", target.selector)))?;
                vec![v.clone()]
            }
            _ if target.is_count => vec![Value::int(results.target_count(target) as i64)],
            TargetName::MatchedVar => scalar(EnvVarName::MatchedVar, ""),
            TargetName::MatchedVarName => scalar(EnvVarName::MatchedVarName, ""),
            TargetName::MatchedVars => env.matched_vars().to_vec(),
            TargetName::MatchedVarsNames => env.matched_vars_names().to_vec(),
            TargetName::RequestLine => scalar(EnvVarName::RequestLine, ""),
            TargetName::RequestMethod => scalar(EnvVarName::RequestMethod, ""),
            TargetName::RequestProtocol => scalar(EnvVarName::RequestProtocol, ""),
            TargetName::RequestHeaders if target.selector == "host" => scalar(EnvVarName::RequestHeaders, "host"),
            TargetName::ReqbodyProcessor => scalar(EnvVarName::ReqbodyProcessor, ""),
            TargetName::ReqbodyError => scalar(EnvVarName::ReqbodyProcessorError, ""),
            TargetName::MultipartStrictError => scalar(EnvVarName::MultipartStrictError, ""),
            TargetName::MultipartUnmatchedBoundary => scalar(EnvVarName::MultipartUnmatchedBoundary, ""),
            _ => {
                return Err(WafError::Unsupported(format!("target {target} cannot be evaluated after scanning")));
            }
        })
    }

    fn eval_late(&self, item: &RuleItem, target: &Target, env: &Environment, results: &ScanResults) -> Result<Option<Match>> {
        let expected = env.expand_macros(&item.predicate.val);

        for actual in self.late_target_values(target, env, results)? {
            let actual = if actual.as_int().is_some() && actual.tokens().len() == 1 {
                actual
            } else {
                Value::from_bytes_auto(&apply_pipeline(&actual.to_bytes(), &item.transformations))
            };

            let Some(m) = eval_operator(
                &item.predicate.op,
                &actual,
                &expected,
                &item.pm_phrases,
                &self.custom_operators,
                &self.regexes,
            )?
            else {
                continue;
            };

            let content = actual.to_bytes();
            let data = if m.data.is_empty() { content.clone() } else { m.data };
            return Ok(Some(Match::new(target.name, &target.selector, &content, data, m.capture_groups)));
        }

        Ok(None)
    }
}

fn is_unset_tx_target(target: &Target, env: &Environment) -> bool {
    if target.name != TargetName::Tx || target.is_count {
        return false;
    }
    if target.is_regex_selector {
        matches!(env.tx_vars_via_regex_selector(&target.selector), Ok(vals) if vals.is_empty())
    } else {
        env.get(EnvVarName::Tx, &target.selector).is_none()
    }
}

/// Actions that run once per match of every item
fn run_actions(
    actions: &[Action],
    m: Option<&Match>,
    env: &mut Environment,
    state: &mut StatementState,
    outcome: &mut PhaseOutcome,
) {
    for action in actions {
        match action {
            Action::SetVar(sv) => {
                if let Err(e) = exec_setvar(sv, env) {
                    tracing::warn!(error = %e, "Failed to execute setvar");
                }
            }
            Action::NoLog => state.should_log = false,
            Action::Log => state.should_log = true,
            Action::Capture => {
                let Some(m) = m else { continue };
                for (i, group) in m.capture_groups.iter().take(MAX_CAPTURE_GROUPS).enumerate() {
                    let key = i.to_string();
                    env.set(EnvVarName::Tx, &key, Value::from_bytes_auto(group));
                    state.captured.push(key);
                }
            }
            Action::Ctl(ctl) => match ctl.setting {
                CtlSetting::ForceRequestBodyVariable => {
                    if env.expand_macros(&ctl.value).to_string_lossy().eq_ignore_ascii_case("on") {
                        outcome.force_request_body_variable = true;
                    }
                }
                other => tracing::warn!(setting = ?other, "Unsupported ctl setting ignored"),
            },
            _ => {}
        }
    }
}

/// Actions that run once when the whole rule matched
fn run_actions_after_all<'s>(
    actions: impl Iterator<Item = &'s Action>,
    state: &mut StatementState,
    skip_after: &mut Option<&'s str>,
) -> Decision {
    let mut decision = Decision::Pass;
    for action in actions {
        match action {
            Action::SkipAfter(label) => *skip_after = Some(label),
            Action::Msg(v) => state.msg = Some(v.clone()),
            Action::LogData(v) => state.log_data = Some(v.clone()),
            Action::Allow => decision = Decision::Allow,
            Action::Deny => decision = Decision::Block,
            _ => {}
        }
    }
    decision
}

fn exec_setvar(sv: &SetVarAction, env: &mut Environment) -> Result<()> {
    let name = env.expand_macros(&sv.variable).to_string_lossy().to_lowercase();
    let key = name
        .strip_prefix("tx.")
        .ok_or_else(|| WafError::Unsupported(format!("setvar to a non-TX collection: {name}")))?;

    match sv.operator {
        SetVarOperator::Set => {
            let val = env.expand_macros(&sv.value);
            env.set(EnvVarName::Tx, key, val);
        }
        SetVarOperator::Increment | SetVarOperator::Decrement => {
            let cur = match env.get(EnvVarName::Tx, key) {
                Some(v) => v
                    .as_int()
                    .ok_or_else(|| WafError::Operator(format!("TX variable {key} is not an integer")))?,
                None => 0,
            };
            let delta = env
                .expand_macros(&sv.value)
                .as_int()
                .ok_or_else(|| WafError::Operator(format!("setvar value for {key} is not an integer")))?;
            let next = if sv.operator == SetVarOperator::Increment {
                cur.saturating_add(delta)
            } else {
                cur.saturating_sub(delta)
            };
            env.set(EnvVarName::Tx, key, Value::int(next));
        }
        SetVarOperator::Delete => env.delete(EnvVarName::Tx, key),
    }

    Ok(())
}
