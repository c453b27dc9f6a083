//! Top level request evaluation
//!
//! A [`Waf`] holds one compiled policy per `config_id`. Policies are swapped
//! atomically by [`Waf::put_config`]; requests already being evaluated keep
//! the policies they started with. SecRule engines are shared between
//! policies with the same ruleset and exclusions.
//!
//! Policies with IP reputation enabled check the request's addresses against
//! the bad-IP list before any rule engine runs.

use super::config::{PolicyConfig, SecRuleConfig, WafConfig};
use super::ipreputation::{IpReputationEngine, OsIpListFileSystem, DEFAULT_LIST_FILE};
use super::logging::ResultsLogger;
use super::request::HttpRequest;
use crate::bodyparsing::{FieldType, LengthLimits, RequestBodyParser};
use crate::customrule::{CustomRuleEngine, GeoDb, GeoIpRecord, RangeGeoDb};
use crate::multiregex::cache::{DbCache, OsCacheFilesystem};
use crate::multiregex::MultiRegexEngineFactory;
use crate::secrule::{
    CrsRuleLoader, OsRuleLoaderFileSystem, RuleLoader, SecRuleEngine, SecRuleEngineFactory, SecRuleEvaluation,
    StandaloneRuleLoader,
};
use crate::{Decision, Result, WafError};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

struct CompiledPolicy {
    config_id: String,
    is_detection_mode: bool,
    ip_reputation: bool,
    secrule: Option<Arc<SecRuleEngine>>,
    custom_rules: Option<CustomRuleEngine>,
}

/// Everything [`Waf::put_config`] replaces at once
struct State {
    body_parser: RequestBodyParser,
    profiling_enabled: bool,
    policies: HashMap<String, CompiledPolicy>,
}

/// The WAF: routes requests to their policy and returns a [`Decision`]
pub struct Waf {
    state: ArcSwap<State>,
    secrule_factory: SecRuleEngineFactory,
    regex_factory: MultiRegexEngineFactory,
    /// Keyed by ruleset id and exclusions
    secrule_engines: DashMap<String, Arc<SecRuleEngine>>,
    geo_db: Arc<RangeGeoDb>,
    ip_reputation: IpReputationEngine,
}

impl Waf {
    /// Build from `config`, loading rule files from disk.
    ///
    /// `standalone_secrule_path`, `rulesets_dir`, `db_cache_enabled` and
    /// `ip_reputation_list_path` are only read here; later
    /// [`put_config`](Self::put_config) calls keep the loader, cache and
    /// bad-IP list file chosen at construction.
    pub fn new(config: &WafConfig) -> Result<Self> {
        let fs = Arc::new(OsRuleLoaderFileSystem);
        let loader: Arc<dyn RuleLoader> = match &config.standalone_secrule_path {
            Some(path) => Arc::new(StandaloneRuleLoader::new(fs, path.clone())),
            None => Arc::new(CrsRuleLoader::new(fs, config.rulesets_dir.clone())),
        };
        let cache = config
            .db_cache_enabled
            .then(|| Arc::new(DbCache::new(Box::new(OsCacheFilesystem::new()))));

        let ip_list_path = config
            .ip_reputation_list_path
            .clone()
            .unwrap_or_else(|| DEFAULT_LIST_FILE.into());
        let ip_reputation = IpReputationEngine::with_store(Box::new(OsIpListFileSystem), ip_list_path);

        Self::build(config, loader, MultiRegexEngineFactory::new(cache), ip_reputation)
    }

    /// Build with a caller-supplied rule loader. The bad-IP list is kept in memory only.
    pub fn with_rule_loader(
        config: &WafConfig,
        loader: Arc<dyn RuleLoader>,
        regex_factory: MultiRegexEngineFactory,
    ) -> Result<Self> {
        Self::build(config, loader, regex_factory, IpReputationEngine::new())
    }

    fn build(
        config: &WafConfig,
        loader: Arc<dyn RuleLoader>,
        regex_factory: MultiRegexEngineFactory,
        ip_reputation: IpReputationEngine,
    ) -> Result<Self> {
        let waf = Self {
            state: ArcSwap::from_pointee(State {
                body_parser: RequestBodyParser::default(),
                profiling_enabled: false,
                policies: HashMap::new(),
            }),
            secrule_factory: SecRuleEngineFactory::new(loader, regex_factory.clone()),
            regex_factory,
            secrule_engines: DashMap::new(),
            geo_db: Arc::new(RangeGeoDb::new()),
            ip_reputation,
        };
        waf.put_config(config)?;
        Ok(waf)
    }

    /// Compile every policy of `config` and switch to them.
    ///
    /// On error the previous policies stay active.
    pub fn put_config(&self, config: &WafConfig) -> Result<()> {
        let started = Instant::now();
        let mut used_engines = HashSet::new();
        let mut policies = HashMap::with_capacity(config.policies.len());
        for policy in &config.policies {
            let compiled = self.compile_policy(policy, &mut used_engines)?;
            policies.insert(policy.config_id.clone(), compiled);
        }

        self.secrule_engines.retain(|key, _| used_engines.contains(key));
        self.state.store(Arc::new(State {
            body_parser: RequestBodyParser::new(config.length_limits),
            profiling_enabled: config.profiling_enabled,
            policies,
        }));

        tracing::info!(
            policies = config.policies.len(),
            secrule_engines = self.secrule_engines.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "WAF config applied"
        );
        Ok(())
    }

    /// Replace the GeoIP ranges used by `GeoMatch` custom rules
    pub fn put_geo_ip_data(&self, records: Vec<GeoIpRecord>) -> Result<()> {
        self.geo_db.put_geo_ip_data(records)
    }

    /// Replace the bad-IP list shared by every policy with IP reputation enabled
    pub fn put_ip_reputation_list<S: AsRef<str>>(&self, entries: &[S]) -> Result<()> {
        self.ip_reputation.put_list(entries)
    }

    fn compile_policy(&self, policy: &PolicyConfig, used_engines: &mut HashSet<String>) -> Result<CompiledPolicy> {
        let secrule = match &policy.secrule {
            Some(secrule) if secrule.enabled => {
                let key = engine_cache_key(secrule);
                let cached = self.secrule_engines.get(&key).map(|e| Arc::clone(e.value()));
                let engine = match cached {
                    Some(engine) => engine,
                    None => {
                        let engine = Arc::new(self.secrule_factory.new_engine(&secrule.ruleset_id, &secrule.exclusions)?);
                        self.secrule_engines.insert(key.clone(), Arc::clone(&engine));
                        engine
                    }
                };
                used_engines.insert(key);
                Some(engine)
            }
            _ => None,
        };

        let custom_rules = match &policy.custom_rules {
            Some(rules) if !rules.is_empty() => {
                let geo_db = policy
                    .geodb_enabled
                    .then(|| Arc::clone(&self.geo_db) as Arc<dyn GeoDb>);
                Some(CustomRuleEngine::new(rules, &self.regex_factory, geo_db)?)
            }
            _ => None,
        };

        let ip_reputation = policy.ip_reputation.as_ref().is_some_and(|c| c.enabled);

        tracing::debug!(
            config_id = %policy.config_id,
            secrule = secrule.is_some(),
            custom_rules = custom_rules.is_some(),
            ip_reputation = ip_reputation,
            "Policy compiled"
        );

        Ok(CompiledPolicy {
            config_id: policy.config_id.clone(),
            is_detection_mode: policy.is_detection_mode,
            ip_reputation,
            secrule,
            custom_rules,
        })
    }

    /// Evaluate `request` against the policy named by its `config_id`.
    ///
    /// Only an unknown `config_id` or a failure to start an evaluation is an
    /// error. Body limit and format errors are reported to `logger` and
    /// turn into [`Decision::Block`].
    pub fn evaluate(&self, request: &HttpRequest, logger: &dyn ResultsLogger) -> Result<Decision> {
        let state = self.state.load_full();
        let policy = state
            .policies
            .get(&request.config_id)
            .ok_or_else(|| WafError::Config(format!("no policy for config id {:?}", request.config_id)))?;

        let started = Instant::now();
        let decision = if policy.ip_reputation && self.ip_reputation.eval_request(request, logger) == Decision::Block {
            Decision::Block
        } else {
            evaluate_policy(&state.body_parser, policy, request, logger)?
        };
        if state.profiling_enabled {
            tracing::debug!(
                config_id = %policy.config_id,
                decision = ?decision,
                elapsed_us = started.elapsed().as_micros() as u64,
                "Request evaluated"
            );
        }

        if decision == Decision::Block && policy.is_detection_mode {
            tracing::info!(config_id = %policy.config_id, uri = %request.uri, "Detection mode, request not blocked");
            return Ok(Decision::Pass);
        }
        Ok(decision)
    }
}

fn engine_cache_key(secrule: &SecRuleConfig) -> String {
    let mut key = secrule.ruleset_id.clone();
    for e in &secrule.exclusions {
        key.push('\n');
        key.push_str(&e.match_variable);
        key.push('\t');
        key.push_str(&e.selector_match_operator);
        key.push('\t');
        key.push_str(&e.selector);
    }
    key
}

/// Custom rules go first: their decision stands over the SecRule one
fn evaluate_policy(
    body_parser: &RequestBodyParser,
    policy: &CompiledPolicy,
    request: &HttpRequest,
    logger: &dyn ResultsLogger,
) -> Result<Decision> {
    let body_type = request.body_type();
    let custom_logger = policy.custom_rules.as_ref().map(|c| c.results_logger(logger));

    let mut evaluations: Vec<SecRuleEvaluation<'_>> = Vec::with_capacity(2);
    if let (Some(engine), Some(custom_logger)) = (&policy.custom_rules, &custom_logger) {
        evaluations.push(engine.new_evaluation(request, body_type, custom_logger)?);
    }
    if let Some(engine) = &policy.secrule {
        evaluations.push(engine.new_evaluation(request, body_type, logger)?);
    }
    if evaluations.is_empty() {
        return Ok(Decision::Pass);
    }

    for eval in evaluations.iter_mut() {
        if let Err(e) = eval.scan_headers() {
            logger.header_parse_error(&e);
            return Ok(Decision::Block);
        }
    }

    let phase1: Vec<Decision> = evaluations.iter_mut().map(|e| e.eval_rules_phase1()).collect();
    if phase1[0] != Decision::Pass {
        return Ok(phase1[0]);
    }

    let capture_raw = evaluations.iter().any(SecRuleEvaluation::also_scan_full_raw_request_body);
    let boundary = request.multipart_boundary();
    let parsed = {
        let mut on_field = |field_type: FieldType, name: &str, data: &[u8]| -> Result<()> {
            for eval in evaluations.iter_mut() {
                eval.scan_body_field(field_type, name, data)?;
            }
            Ok(())
        };
        body_parser.parse(
            request.body.as_ref(),
            &mut on_field,
            body_type,
            request.content_length(),
            boundary.as_deref(),
            capture_raw,
        )
    };

    let body_failed = match parsed {
        Ok(()) => false,
        Err(e) if e.is_limit_error() => {
            report_limit_error(&e, &body_parser.length_limits(), logger);
            return Ok(Decision::Block);
        }
        Err(e) => {
            logger.body_parse_error(&e);
            for eval in evaluations.iter_mut() {
                eval.body_parse_error_occurred();
            }
            true
        }
    };

    for (eval, phase1) in evaluations.iter_mut().zip(phase1) {
        let decision = match phase1 {
            Decision::Pass => eval.eval_rules_phase2to5(),
            d => d,
        };
        if decision != Decision::Pass {
            return Ok(decision);
        }
    }

    Ok(if body_failed { Decision::Block } else { Decision::Pass })
}

fn report_limit_error(err: &WafError, limits: &LengthLimits, logger: &dyn ResultsLogger) {
    match err {
        WafError::FieldBytesLimitExceeded => logger.field_bytes_limit_exceeded(limits.max_length_field),
        WafError::PausableBytesLimitExceeded => logger.pausable_bytes_limit_exceeded(limits.max_length_pausable),
        WafError::TotalBytesLimitExceeded => logger.total_bytes_limit_exceeded(limits.max_length_total),
        WafError::TotalFullRawRequestBodyExceeded => {
            logger.total_full_raw_request_body_limit_exceeded(limits.max_length_total_full_raw_request_body)
        }
        _ => {}
    }
}
