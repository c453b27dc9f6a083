//! Compiled SecRule rule sets and per-request evaluations

use super::ast::{Statement, TargetName};
use super::environment::{compile_tx_regex_selectors, Environment, TxRegexSelectors};
use super::evaluator::{RuleEvaluator, TriggeredRule};
use super::loader::RuleLoader;
use super::operators::CustomOperators;
use super::scanner::{RequestScanner, ScanResults, ScannerScratch};
use super::value::{EnvVarName, Value};
use crate::bodyparsing::{BodyType, FieldType};
use crate::multiregex::MultiRegexEngineFactory;
use crate::waf::{Exclusion, HttpRequest, ResultsLogger};
use crate::{Decision, Result};
use std::sync::Arc;
use std::time::Instant;

/// ModSecurity truncates `msg` and `logdata` to this many bytes
const MAX_LOG_FIELD_LEN: usize = 512;

/// Builds [`SecRuleEngine`]s from ruleset ids
pub struct SecRuleEngineFactory {
    loader: Arc<dyn RuleLoader>,
    regex_factory: MultiRegexEngineFactory,
    custom_operators: CustomOperators,
}

impl SecRuleEngineFactory {
    pub fn new(loader: Arc<dyn RuleLoader>, regex_factory: MultiRegexEngineFactory) -> Self {
        Self {
            loader,
            regex_factory,
            custom_operators: CustomOperators::new(),
        }
    }

    /// Operators that rules can reference by name, e.g. `@GeoMatch`
    pub fn with_custom_operators(mut self, custom_operators: CustomOperators) -> Self {
        self.custom_operators = custom_operators;
        self
    }

    /// Load and compile the rules of `ruleset_id`.
    pub fn new_engine(&self, ruleset_id: &str, exclusions: &[Exclusion]) -> Result<SecRuleEngine> {
        let started = Instant::now();
        let statements = self.loader.rules(ruleset_id)?;
        let engine = SecRuleEngine::new(
            statements,
            ruleset_id,
            exclusions,
            &self.regex_factory,
            self.custom_operators.clone(),
        )?;

        tracing::info!(
            ruleset_id,
            statements = engine.statements().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "SecRule engine created"
        );
        Ok(engine)
    }
}

/// Compiled rule set, shared by all evaluations
pub struct SecRuleEngine {
    ruleset_id: String,
    statements: Arc<Vec<Statement>>,
    scanner: RequestScanner,
    evaluator: RuleEvaluator,
    tx_regex_selectors: Arc<TxRegexSelectors>,
    uses_request_body: bool,
}

impl SecRuleEngine {
    pub fn new(
        statements: Vec<Statement>,
        ruleset_id: &str,
        exclusions: &[Exclusion],
        regex_factory: &MultiRegexEngineFactory,
        custom_operators: CustomOperators,
    ) -> Result<Self> {
        let statements = Arc::new(statements);
        let scanner = RequestScanner::new(statements.clone(), exclusions, regex_factory, custom_operators.clone())?;
        let tx_regex_selectors = Arc::new(compile_tx_regex_selectors(&statements)?);
        let uses_request_body = uses_request_body_target(&statements);

        Ok(Self {
            ruleset_id: ruleset_id.to_string(),
            evaluator: RuleEvaluator::new(statements.clone(), custom_operators),
            statements,
            scanner,
            tx_regex_selectors,
            uses_request_body,
        })
    }

    pub fn ruleset_id(&self) -> &str {
        &self.ruleset_id
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Start evaluating `request`. Scratch space is returned to the pool on drop.
    pub fn new_evaluation<'a>(
        &'a self,
        request: &'a HttpRequest,
        body_type: BodyType,
        results_logger: &'a dyn ResultsLogger,
    ) -> Result<SecRuleEvaluation<'a>> {
        let mut env = Environment::new(self.tx_regex_selectors.clone());
        env.set(EnvVarName::ReqbodyProcessorError, "", Value::int(0));
        env.set(EnvVarName::ReqbodyProcessor, "", Value::from(body_type.processor_name()));

        Ok(SecRuleEvaluation {
            engine: self,
            request,
            body_type,
            results_logger,
            scratch: Some(self.scanner.acquire_scratch()?),
            results: ScanResults::new(),
            env,
            force_request_body_variable: false,
        })
    }
}

fn uses_request_body_target(statements: &[Statement]) -> bool {
    statements.iter().any(|stmt| match stmt {
        Statement::Rule(rule) => rule
            .items
            .iter()
            .any(|item| item.predicate.targets.iter().any(|t| t.name == TargetName::RequestBody)),
        _ => false,
    })
}

fn truncate_log_field(mut b: Vec<u8>) -> String {
    if b.len() > MAX_LOG_FIELD_LEN {
        b.truncate(MAX_LOG_FIELD_LEN - 3);
        b.extend_from_slice(b"...");
    }
    String::from_utf8_lossy(&b).into_owned()
}

/// State of one request against one [`SecRuleEngine`]
pub struct SecRuleEvaluation<'a> {
    engine: &'a SecRuleEngine,
    request: &'a HttpRequest,
    body_type: BodyType,
    results_logger: &'a dyn ResultsLogger,
    scratch: Option<ScannerScratch>,
    results: ScanResults,
    env: Environment,
    force_request_body_variable: bool,
}

impl SecRuleEvaluation<'_> {
    /// True if the body parser should also emit the whole raw body
    pub fn also_scan_full_raw_request_body(&self) -> bool {
        (self.engine.uses_request_body && self.body_type == BodyType::UrlEncoded) || self.force_request_body_variable
    }

    pub fn scan_headers(&mut self) -> Result<()> {
        if let Some(scratch) = self.scratch.as_mut() {
            self.engine.scanner.scan_headers(scratch, self.request, &mut self.results)?;
        }

        let r = &self.results;
        self.env.set(EnvVarName::RequestLine, "", Value::string(r.request_line.clone()));
        self.env.set(EnvVarName::RequestMethod, "", Value::string(r.request_method.clone()));
        self.env.set(EnvVarName::RequestProtocol, "", Value::string(r.request_protocol.clone()));
        self.env.set(EnvVarName::RequestHeaders, "host", Value::string(r.host_header.clone()));
        Ok(())
    }

    pub fn scan_body_field(&mut self, field_type: FieldType, field_name: &str, data: &[u8]) -> Result<()> {
        match self.scratch.as_mut() {
            Some(scratch) => self
                .engine
                .scanner
                .scan_body_field(scratch, field_type, field_name, data, &mut self.results),
            None => Ok(()),
        }
    }

    pub fn eval_rules_phase1(&mut self) -> Decision {
        self.eval_rules(1)
    }

    /// Phases 2 to 5; stops at the first `allow` or `deny`
    pub fn eval_rules_phase2to5(&mut self) -> Decision {
        self.populate_multipart_strictness_results();

        let mut decision = Decision::Pass;
        for phase in 2..=5 {
            decision = self.eval_rules(phase);
            if decision != Decision::Pass {
                break;
            }
        }
        decision
    }

    /// Mark the body as unparseable for `REQBODY_ERROR`
    pub fn body_parse_error_occurred(&mut self) {
        self.env.set(EnvVarName::ReqbodyProcessorError, "", Value::int(1));
    }

    fn eval_rules(&mut self, phase: u8) -> Decision {
        if tracing::enabled!(tracing::Level::TRACE) {
            for (key, matches) in &self.results.matches {
                for m in matches {
                    tracing::trace!(
                        rule_id = key.rule_id,
                        item = key.item_idx,
                        target = %key.target,
                        data = %String::from_utf8_lossy(&m.data),
                        "Request scanning found a match"
                    );
                }
            }
        }

        let ruleset_id = self.engine.ruleset_id.as_str();
        let logger = self.results_logger;
        let mut on_triggered = |t: TriggeredRule<'_>| {
            let rule_id = t.statement.id();
            let msg = truncate_log_field(t.msg);
            let log_data = truncate_log_field(t.log_data);
            tracing::info!(rule_id, decision = ?t.decision, msg = %msg, log_data = %log_data, "SecRule triggered");
            logger.secrule_triggered(rule_id, t.decision, &msg, &log_data, ruleset_id);
        };

        let outcome = self
            .engine
            .evaluator
            .process_phase(phase, &mut self.env, &self.results, &mut on_triggered);
        self.force_request_body_variable |= outcome.force_request_body_variable;

        tracing::debug!(phase, decision = ?outcome.decision, "SecRule engine rule evaluation decision");
        outcome.decision
    }

    fn populate_multipart_strictness_results(&mut self) {
        let flags = self.results.multipart;
        let reqbody_error = self
            .env
            .get(EnvVarName::ReqbodyProcessorError, "")
            .and_then(Value::as_int)
            == Some(1);
        let strict_error = reqbody_error || flags.any();

        let as_val = |b: bool| Value::int(i64::from(b));
        let env = &mut self.env;
        env.set(EnvVarName::MultipartBoundaryQuoted, "", as_val(flags.boundary_quoted));
        env.set(EnvVarName::MultipartBoundaryWhitespace, "", as_val(flags.boundary_whitespace));
        env.set(EnvVarName::MultipartDataAfter, "", as_val(flags.data_after));
        env.set(EnvVarName::MultipartDataBefore, "", as_val(flags.data_before));
        env.set(EnvVarName::MultipartFileLimitExceeded, "", as_val(flags.file_limit_exceeded));
        env.set(EnvVarName::MultipartHeaderFolding, "", as_val(flags.header_folding));
        env.set(EnvVarName::MultipartInvalidHeaderFolding, "", as_val(flags.invalid_header_folding));
        env.set(EnvVarName::MultipartInvalidQuoting, "", as_val(flags.invalid_quoting));
        env.set(EnvVarName::MultipartLfLine, "", as_val(flags.lf_line));
        env.set(EnvVarName::MultipartMissingSemicolon, "", as_val(flags.missing_semicolon));
        env.set(EnvVarName::MultipartStrictError, "", as_val(strict_error));
        env.set(EnvVarName::MultipartUnmatchedBoundary, "", as_val(flags.unmatched_boundary));
    }

    #[cfg(test)]
    fn env(&self) -> &Environment {
        &self.env
    }
}

impl Drop for SecRuleEvaluation<'_> {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            self.engine.scanner.release_scratch(scratch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrule::parser::parse;
    use crate::waf::logging::tests::RecordingLogger;

    fn engine(rules: &str) -> SecRuleEngine {
        let statements = parse(rules, None, None).unwrap();
        SecRuleEngine::new(statements, "test", &[], &MultiRegexEngineFactory::default(), CustomOperators::new()).unwrap()
    }

    fn get(uri: &str) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            uri: uri.into(),
            protocol: "HTTP/1.1".into(),
            remote_addr: "10.0.0.1".into(),
            headers: vec![("Host".into(), "example.com".into())],
            ..Default::default()
        }
    }

    /// Headers only, all phases
    fn run(engine: &SecRuleEngine, req: &HttpRequest, logger: &RecordingLogger) -> Decision {
        let mut eval = engine.new_evaluation(req, BodyType::Other, logger).unwrap();
        eval.scan_headers().unwrap();
        match eval.eval_rules_phase1() {
            Decision::Pass => eval.eval_rules_phase2to5(),
            d => d,
        }
    }

    #[test]
    fn test_args_scan_match() {
        let e = engine(r#"SecRule ARGS "ab+c" "id:100,deny""#);
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/a.php?arg1=aaaaaaabccc"), &logger), Decision::Block);
        assert_eq!(logger.secrule_ids(), vec![100]);
    }

    #[test]
    fn test_chain_single_notification() {
        let e = engine("SecRule ARGS \"abc\" \"id:1,chain\"\nSecRule ARGS \"def\" \"deny\"");
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/?x=abc&y=def"), &logger), Decision::Block);
        assert_eq!(logger.secrule_ids(), vec![1]);
    }

    #[test]
    fn test_setvar_then_tx_rule() {
        let e = engine(
            "SecAction \"id:100,setvar:tx.myvar=hello1234,nolog\"\n\
             SecRule TX:myvar \"@streq hello1234\" \"id:101,deny\"",
        );
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/"), &logger), Decision::Block);
        assert_eq!(logger.secrule_ids(), vec![101]);
    }

    #[test]
    fn test_capture_scoped_to_rule() {
        let e = engine(
            "SecRule ARGS \"hello(\\d+)worlda\" \"id:1,capture,chain\"\n\
             SecRule TX:1 \"@streq 1234\" \"deny\"\n\
             SecRule TX:1 \"@rx .\" \"id:2,deny\"",
        );
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/?a=hello1234worlda"), &logger), Decision::Block);
        assert_eq!(logger.secrule_ids(), vec![1]);

        let e = engine(
            "SecRule ARGS \"hello(\\d+)worlda\" \"id:1,capture,nolog\"\n\
             SecRule TX:1 \"@rx .\" \"id:2,deny\"",
        );
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/?a=hello1234worlda"), &logger), Decision::Pass);
    }

    #[test]
    fn test_skip_after_marker() {
        let e = engine(
            "SecAction \"id:100,skipAfter:L1\"\n\
             SecAction \"id:200,setvar:tx.v=20\"\n\
             SecMarker L1\n\
             SecAction \"id:300,setvar:tx.other=10\"",
        );
        let req = get("/");
        let logger = RecordingLogger::default();
        let mut eval = e.new_evaluation(&req, BodyType::Other, &logger).unwrap();
        eval.scan_headers().unwrap();
        assert_eq!(eval.eval_rules_phase1(), Decision::Pass);
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Pass);

        assert!(eval.env().get(EnvVarName::Tx, "v").is_none());
        assert_eq!(eval.env().get(EnvVarName::Tx, "other"), Some(&Value::int(10)));
        assert_eq!(logger.secrule_ids(), vec![100, 300]);
    }

    #[test]
    fn test_phase5_deny_passes() {
        let e = engine(r#"SecRule REQUEST_URI "/admin" "id:9,phase:5,deny""#);
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/admin"), &logger), Decision::Pass);
        assert_eq!(logger.secrule_ids(), vec![9]);
    }

    #[test]
    fn test_request_line_and_host_env() {
        let e = engine(
            "SecRule REQUEST_HEADERS:Host \"@streq example.com\" \"id:1,chain\"\n\
             SecRule REQUEST_LINE \"@beginsWith GET /x\" \"deny\"",
        );
        let logger = RecordingLogger::default();
        assert_eq!(run(&e, &get("/x?y=1"), &logger), Decision::Block);
    }

    #[test]
    fn test_raw_body_and_force_variable() {
        let e = engine(
            "SecAction \"id:1,phase:1,nolog,ctl:forceRequestBodyVariable=on\"\n\
             SecRule REQUEST_BODY \"evil\" \"id:2,deny\"",
        );
        let req = get("/");
        let logger = RecordingLogger::default();

        let mut eval = e.new_evaluation(&req, BodyType::Json, &logger).unwrap();
        assert!(!eval.also_scan_full_raw_request_body());
        eval.scan_headers().unwrap();
        assert_eq!(eval.eval_rules_phase1(), Decision::Pass);
        assert!(eval.also_scan_full_raw_request_body());
        eval.scan_body_field(FieldType::FullRawRequestBody, "", b"{\"a\":\"evil\"}").unwrap();
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Block);
        drop(eval);

        let eval = e.new_evaluation(&req, BodyType::UrlEncoded, &logger).unwrap();
        assert!(eval.also_scan_full_raw_request_body());
    }

    #[test]
    fn test_reqbody_error_and_strictness() {
        let e = engine(
            "SecRule REQBODY_ERROR \"!@eq 0\" \"id:1,phase:2,deny\"\n\
             SecRule MULTIPART_STRICT_ERROR \"!@eq 0\" \"id:2,phase:2,deny\"",
        );
        let req = get("/");
        let logger = RecordingLogger::default();

        let mut eval = e.new_evaluation(&req, BodyType::Multipart, &logger).unwrap();
        eval.scan_headers().unwrap();
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Pass);
        drop(eval);

        let mut eval = e.new_evaluation(&req, BodyType::Multipart, &logger).unwrap();
        eval.scan_headers().unwrap();
        eval.scan_body_field(FieldType::MultipartFormDataStrictnessWarning, "MultipartFormDataStrictnessWarningLfLine", b"")
            .unwrap();
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Block);
        assert_eq!(logger.secrule_ids(), vec![2]);
        drop(eval);

        let logger = RecordingLogger::default();
        let mut eval = e.new_evaluation(&req, BodyType::Multipart, &logger).unwrap();
        eval.body_parse_error_occurred();
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Block);
        assert_eq!(logger.secrule_ids(), vec![1]);
    }

    #[test]
    fn test_reqbody_processor() {
        let e = engine(r#"SecRule REQBODY_PROCESSOR "@streq JSON" "id:1,deny""#);
        let req = get("/");
        let logger = RecordingLogger::default();
        let mut eval = e.new_evaluation(&req, BodyType::Json, &logger).unwrap();
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Block);
        drop(eval);
        let mut eval = e.new_evaluation(&req, BodyType::Xml, &logger).unwrap();
        assert_eq!(eval.eval_rules_phase2to5(), Decision::Pass);
    }

    #[test]
    fn test_msg_truncation() {
        assert_eq!(truncate_log_field(b"short".to_vec()), "short");
        let long = truncate_log_field(vec![b'a'; 600]);
        assert_eq!(long.len(), MAX_LOG_FIELD_LEN);
        assert!(long.ends_with("..."));
    }

    #[test]
    fn test_uses_request_body_target() {
        assert!(uses_request_body_target(&parse(r#"SecRule REQUEST_BODY "x" "id:1""#, None, None).unwrap()));
        assert!(!uses_request_body_target(&parse(r#"SecRule ARGS "x" "id:1""#, None, None).unwrap()));
    }
}
