//! Request scanning (pass 1)
//!
//! At construction the rule set is inverted into scan groups: one group per
//! distinct `(target, transformation pipeline)`, each owning a multi-regex
//! database with the patterns of every condition subscribed to it. Each
//! request field is then transformed once per group and scanned once.

use super::ast::{Operator, RuleItem, Statement, Target, TargetName, Transformation};
use super::operators::{eval_operator, is_handled_by_regex_engine, CustomOperators, RegexCache};
use super::transformations::TransformCache;
use super::value::Value;
use crate::bodyparsing::{FieldType, StrictnessWarning};
use crate::encoding::weak_url_unescape;
use crate::multiregex::{MultiRegexEngine, MultiRegexEngineFactory, Pattern, Scratch};
use crate::waf::{Exclusion, HttpRequest};
use crate::{Result, WafError};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A matched field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Match {
    pub data: Vec<u8>,
    pub capture_groups: Vec<Vec<u8>>,
    /// Whole field before transformations; what `MATCHED_VAR` refers to
    pub entire_field_content: Vec<u8>,
    pub target_name: TargetName,
    pub field_name: Vec<u8>,
}

impl Match {
    pub fn new(
        target_name: TargetName,
        field_name: &str,
        entire_field_content: &[u8],
        data: Vec<u8>,
        capture_groups: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            data,
            capture_groups,
            entire_field_content: entire_field_content.to_vec(),
            target_name,
            field_name: field_name.as_bytes().to_vec(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub rule_id: i64,
    pub item_idx: usize,
    pub target: Target,
}

/// Multipart anomalies seen in the Content-Type header and the body stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MultipartFlags {
    pub boundary_quoted: bool,
    pub boundary_whitespace: bool,
    pub data_after: bool,
    pub data_before: bool,
    pub file_limit_exceeded: bool,
    pub header_folding: bool,
    pub incomplete: bool,
    pub invalid_header_folding: bool,
    pub invalid_quoting: bool,
    pub lf_line: bool,
    pub missing_semicolon: bool,
    pub unmatched_boundary: bool,
}

impl MultipartFlags {
    pub fn any(&self) -> bool {
        self.boundary_quoted
            || self.boundary_whitespace
            || self.data_after
            || self.data_before
            || self.file_limit_exceeded
            || self.header_folding
            || self.incomplete
            || self.invalid_header_folding
            || self.invalid_quoting
            || self.lf_line
            || self.missing_semicolon
            || self.unmatched_boundary
    }
}

/// Output of pass 1 for one request
#[derive(Clone, Debug, Default)]
pub struct ScanResults {
    pub matches: HashMap<MatchKey, Vec<Match>>,
    /// Field instances observed per target
    pub targets_count: HashMap<Target, usize>,
    pub request_line: Vec<u8>,
    pub request_method: Vec<u8>,
    pub request_protocol: Vec<u8>,
    pub host_header: Vec<u8>,
    pub multipart: MultipartFlags,
}

impl ScanResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results_for(&self, rule_id: i64, item_idx: usize, target: &Target) -> Option<&[Match]> {
        let key = MatchKey {
            rule_id,
            item_idx,
            target: target.clone(),
        };
        self.matches.get(&key).map(Vec::as_slice)
    }

    pub fn target_count(&self, target: &Target) -> usize {
        self.targets_count.get(target).copied().unwrap_or(0)
    }
}

/// True if `(predicate, target)` can only be evaluated during rule
/// evaluation, because either side is unknown while scanning.
pub fn requires_late_scan(item: &RuleItem, target: &Target) -> bool {
    matches!(
        target.name,
        TargetName::MatchedVar
            | TargetName::MatchedVars
            | TargetName::MatchedVarName
            | TargetName::MatchedVarsNames
            | TargetName::Tx
            | TargetName::ReqbodyProcessor
            | TargetName::ReqbodyError
            | TargetName::MultipartStrictError
            | TargetName::MultipartUnmatchedBoundary
    ) || target.is_count
        || item.predicate.val.has_macros()
}

#[derive(Clone, Debug)]
struct ConditionRef {
    rule_id: i64,
    stmt_idx: usize,
    item_idx: usize,
    target: Target,
}

/// Conditions sharing a target and a transformation pipeline
struct ScanGroup {
    transformations: Vec<Transformation>,
    engine: Option<MultiRegexEngine>,
    conditions: Vec<ConditionRef>,
    /// Pattern id to index into `conditions`
    pattern_refs: Vec<usize>,
}

/// Per-evaluation working memory of a [`RequestScanner`]
pub struct ScannerScratch {
    engines: Vec<Option<Scratch>>,
    transforms: TransformCache,
}

/// Compiled pass-1 view of a rule set
pub struct RequestScanner {
    statements: Arc<Vec<Statement>>,
    groups: Vec<ScanGroup>,
    groups_for_target: HashMap<Target, Vec<usize>>,
    targets_simple: HashSet<Target>,
    targets_regex_selector: HashMap<TargetName, Vec<(Target, Regex)>>,
    except_regex_selectors: HashMap<String, Regex>,
    /// `None` excludes the whole collection
    global_exclusions: Vec<(TargetName, Option<Regex>)>,
    custom_operators: CustomOperators,
    regexes: RegexCache,
}

fn exclusion_target_names(match_variable: &str) -> &'static [TargetName] {
    match match_variable {
        "RequestArgNames" => &[TargetName::Args, TargetName::ArgsGet, TargetName::ArgsPost],
        "RequestCookieNames" => &[TargetName::RequestCookies],
        "RequestHeaderNames" => &[TargetName::RequestHeaders],
        _ => &[],
    }
}

/// Expressions the multi-regex engine scans for on behalf of `item`
fn rx_exprs(item: &RuleItem) -> Vec<String> {
    let s = item.predicate.val.to_string_lossy();
    let quoted = regex::escape(&s);
    match item.predicate.op {
        Operator::Rx => vec![s],
        Operator::Pm | Operator::Pmf | Operator::PmFromFile => item
            .pm_phrases
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| format!("(?i:{})", regex::escape(p)))
            .collect(),
        Operator::BeginsWith => vec![format!("^{quoted}")],
        Operator::EndsWith => vec![format!("{quoted}$")],
        Operator::Contains | Operator::Strmatch => vec![quoted],
        Operator::ContainsWord => vec![format!(r"\b{quoted}\b")],
        Operator::Streq => vec![format!("^{quoted}$")],
        _ => Vec::new(),
    }
}

impl RequestScanner {
    pub fn new(
        statements: Arc<Vec<Statement>>,
        exclusions: &[Exclusion],
        factory: &MultiRegexEngineFactory,
        custom_operators: CustomOperators,
    ) -> Result<Self> {
        let mut groups: Vec<ScanGroup> = Vec::new();
        let mut groups_for_target: HashMap<Target, Vec<usize>> = HashMap::new();
        let mut targets_simple = HashSet::new();
        let mut targets_regex_selector: HashMap<TargetName, Vec<(Target, Regex)>> = HashMap::new();
        let mut except_regex_selectors = HashMap::new();

        for (stmt_idx, stmt) in statements.iter().enumerate() {
            let Statement::Rule(rule) = stmt else { continue };

            for (item_idx, item) in rule.items.iter().enumerate() {
                for target in &item.predicate.targets {
                    if target.is_regex_selector {
                        let known = targets_regex_selector.entry(target.name).or_default();
                        if !known.iter().any(|(t, _)| t == target) {
                            let re = Regex::new(&target.selector).map_err(|e| {
                                WafError::Regex(format!("invalid regex selector {}: {e}", target.selector))
                            })?;
                            known.push((target.clone(), re));
                        }
                    } else {
                        targets_simple.insert(target.clone());
                    }

                    if requires_late_scan(item, target) {
                        continue;
                    }

                    let slots = groups_for_target.entry(target.clone()).or_default();
                    let idx = match slots.iter().find(|&&g| groups[g].transformations == item.transformations) {
                        Some(&g) => g,
                        None => {
                            groups.push(ScanGroup {
                                transformations: item.transformations.clone(),
                                engine: None,
                                conditions: Vec::new(),
                                pattern_refs: Vec::new(),
                            });
                            slots.push(groups.len() - 1);
                            groups.len() - 1
                        }
                    };

                    groups[idx].conditions.push(ConditionRef {
                        rule_id: rule.id,
                        stmt_idx,
                        item_idx,
                        target: target.clone(),
                    });
                }

                for et in &item.predicate.except_targets {
                    if et.is_regex_selector && !except_regex_selectors.contains_key(&et.selector) {
                        let re = Regex::new(&et.selector).map_err(|e| {
                            WafError::Regex(format!("invalid regex selector {}: {e}", et.selector))
                        })?;
                        except_regex_selectors.insert(et.selector.clone(), re);
                    }
                }
            }
        }

        for group in &mut groups {
            let mut patterns = Vec::new();
            for (cond_idx, cond) in group.conditions.iter().enumerate() {
                let Some(Statement::Rule(rule)) = statements.get(cond.stmt_idx) else { continue };
                let item = &rule.items[cond.item_idx];
                if !is_handled_by_regex_engine(&item.predicate.op) {
                    continue;
                }
                for expr in rx_exprs(item) {
                    patterns.push(Pattern {
                        id: group.pattern_refs.len(),
                        expr,
                    });
                    group.pattern_refs.push(cond_idx);
                }
            }

            if !patterns.is_empty() {
                let engine = factory
                    .build(&patterns)
                    .map_err(|e| WafError::Regex(format!("failed to create multi-regex engine: {e}")))?;
                group.engine = Some(engine);
            }
        }

        let mut global_exclusions = Vec::new();
        for e in exclusions {
            for &name in exclusion_target_names(&e.match_variable) {
                if e.selector_match_operator.is_empty() || e.selector.is_empty() {
                    global_exclusions.push((name, None));
                    continue;
                }

                let escaped = regex::escape(&e.selector);
                let expr = match e.selector_match_operator.as_str() {
                    "StartsWith" => format!("(?i)^{escaped}"),
                    "EndsWith" => format!("(?i){escaped}$"),
                    "Contains" => format!("(?i){escaped}"),
                    "Equals" | "Equal" => format!("(?i)^{escaped}$"),
                    other => {
                        return Err(WafError::Config(format!("unsupported exclusion selector operator {other}")));
                    }
                };
                let re = Regex::new(&expr).map_err(|e| WafError::Regex(e.to_string()))?;
                global_exclusions.push((name, Some(re)));
            }
        }

        tracing::debug!(
            scan_groups = groups.len(),
            regex_databases = groups.iter().filter(|g| g.engine.is_some()).count(),
            "Request scanner compiled"
        );

        Ok(Self {
            statements,
            groups,
            groups_for_target,
            targets_simple,
            targets_regex_selector,
            except_regex_selectors,
            global_exclusions,
            custom_operators,
            regexes: RegexCache::new(),
        })
    }

    /// Take one scratch space per regex database from the engine pools.
    pub fn acquire_scratch(&self) -> Result<ScannerScratch> {
        let engines = self
            .groups
            .iter()
            .map(|g| g.engine.as_ref().map(MultiRegexEngine::acquire_scratch).transpose())
            .collect::<Result<Vec<_>>>()?;
        Ok(ScannerScratch {
            engines,
            transforms: TransformCache::new(),
        })
    }

    pub fn release_scratch(&self, scratch: ScannerScratch) {
        for (group, s) in self.groups.iter().zip(scratch.engines) {
            if let (Some(engine), Some(s)) = (&group.engine, s) {
                engine.release_scratch(s);
            }
        }
    }

    /// Targets that subscribe to field `field_name` of collection `name`
    fn targets_for(&self, name: TargetName, field_name: &str) -> Vec<Target> {
        let mut out = Vec::new();
        let mut push_simple = |t: Target| {
            let count = Target { is_count: true, ..t.clone() };
            if self.targets_simple.contains(&t) {
                out.push(t);
            }
            if self.targets_simple.contains(&count) {
                out.push(count);
            }
        };

        if !field_name.is_empty() {
            push_simple(Target::new(name));
        }
        push_simple(Target::with_selector(name, field_name.to_lowercase()));

        if let Some(selectors) = self.targets_regex_selector.get(&name) {
            out.extend(selectors.iter().filter(|(_, re)| re.is_match(field_name)).map(|(t, _)| t.clone()));
        }

        out
    }

    fn matches_except_targets(&self, name: TargetName, field_name: &str, except: &[Target]) -> bool {
        let rule_excluded = except.iter().any(|et| {
            if et.name != name {
                return false;
            }
            if et.is_regex_selector {
                return self.except_regex_selectors.get(&et.selector).is_some_and(|re| re.is_match(field_name));
            }
            et.selector.is_empty() || field_name.eq_ignore_ascii_case(&et.selector)
        });

        rule_excluded
            || self.global_exclusions.iter().any(|(n, re)| {
                *n == name && re.as_ref().map_or(true, |re| re.is_match(field_name))
            })
    }

    fn rule_item(&self, cond: &ConditionRef) -> Option<&RuleItem> {
        match self.statements.get(cond.stmt_idx)? {
            Statement::Rule(rule) => rule.items.get(cond.item_idx),
            _ => None,
        }
    }

    /// Scan one field of collection `name` and record matches in `results`.
    pub fn scan_field(
        &self,
        scratch: &mut ScannerScratch,
        name: TargetName,
        field_name: &str,
        content: &[u8],
        results: &mut ScanResults,
    ) -> Result<()> {
        let mut group_ids = Vec::new();
        for target in self.targets_for(name, field_name) {
            if let Some(ids) = self.groups_for_target.get(&target) {
                group_ids.extend_from_slice(ids);
            }
            *results.targets_count.entry(target).or_insert(0) += 1;
        }

        if group_ids.is_empty() {
            return Ok(());
        }

        let ScannerScratch { engines, transforms } = scratch;
        transforms.clear();
        let mut seen: HashSet<MatchKey> = HashSet::new();

        let mut record = |cond: &ConditionRef, data: Vec<u8>, capture_groups: Vec<Vec<u8>>| {
            let key = MatchKey {
                rule_id: cond.rule_id,
                item_idx: cond.item_idx,
                target: cond.target.clone(),
            };
            if !seen.insert(key.clone()) {
                return;
            }
            results
                .matches
                .entry(key)
                .or_default()
                .push(Match::new(name, field_name, content, data, capture_groups));
        };

        for gid in group_ids {
            let group = &self.groups[gid];
            let transformed = transforms.transformed(content, &group.transformations);

            if let (Some(engine), Some(Some(s))) = (&group.engine, engines.get_mut(gid)) {
                for m in engine.scan(transformed, s)? {
                    let Some(cond) = group.pattern_refs.get(m.id).and_then(|&c| group.conditions.get(c)) else {
                        continue;
                    };
                    let Some(item) = self.rule_item(cond) else { continue };
                    if self.matches_except_targets(name, field_name, &item.predicate.except_targets) {
                        continue;
                    }
                    record(cond, m.data, m.capture_groups);
                }
            }

            for cond in &group.conditions {
                let Some(item) = self.rule_item(cond) else { continue };
                if is_handled_by_regex_engine(&item.predicate.op) {
                    continue;
                }
                if self.matches_except_targets(name, field_name, &item.predicate.except_targets) {
                    continue;
                }

                let actual = Value::from_bytes_auto(transformed);
                match eval_operator(
                    &item.predicate.op,
                    &actual,
                    &item.predicate.val,
                    &item.pm_phrases,
                    &self.custom_operators,
                    &self.regexes,
                ) {
                    Ok(Some(m)) if m.data.is_empty() => record(cond, content.to_vec(), vec![content.to_vec()]),
                    Ok(Some(m)) => record(cond, m.data, m.capture_groups),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(rule_id = cond.rule_id, item = cond.item_idx, error = %e, "Error evaluating operator while scanning");
                    }
                }
            }
        }

        Ok(())
    }

    /// Scan the request line, URI-derived targets, cookies and headers.
    pub fn scan_headers(&self, scratch: &mut ScannerScratch, req: &HttpRequest, results: &mut ScanResults) -> Result<()> {
        let request_line = format!("{} {} {}", req.method, req.uri, req.protocol);
        self.scan_field(scratch, TargetName::RequestLine, "", request_line.as_bytes(), results)?;
        results.request_line = request_line.into_bytes();
        results.request_protocol = req.protocol.as_bytes().to_vec();

        self.scan_field(scratch, TargetName::RemoteAddr, "", req.remote_addr.as_bytes(), results)?;

        results.request_method = req.method.as_bytes().to_vec();
        self.scan_field(scratch, TargetName::RequestMethod, "", req.method.as_bytes(), results)?;

        self.scan_uri(scratch, &req.uri, results)?;

        self.scan_field(scratch, TargetName::RequestProtocol, "", req.protocol.as_bytes(), results)?;

        for (k, v) in &req.headers {
            if k.eq_ignore_ascii_case("host") {
                results.host_header = v.as_bytes().to_vec();
            }
            if k.eq_ignore_ascii_case("cookie") {
                self.scan_cookies(scratch, v, results)?;
            }
            if k.eq_ignore_ascii_case("content-type") {
                scan_content_type(v, &mut results.multipart);
            }

            self.scan_field(scratch, TargetName::RequestHeadersNames, "", k.as_bytes(), results)?;
            self.scan_field(scratch, TargetName::RequestHeaders, k, v.as_bytes(), results)?;
        }

        Ok(())
    }

    fn scan_uri(&self, scratch: &mut ScannerScratch, uri: &str, results: &mut ScanResults) -> Result<()> {
        self.scan_field(scratch, TargetName::RequestUri, "", uri.as_bytes(), results)?;
        self.scan_field(scratch, TargetName::RequestUriRaw, "", uri.as_bytes(), results)?;

        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));

        let filename = weak_url_unescape(path.as_bytes());
        self.scan_field(scratch, TargetName::RequestFilename, "", &filename, results)?;

        let basename = match filename.iter().rposition(|&c| c == b'/' || c == b'\\') {
            Some(n) => &filename[n + 1..],
            None => &filename[..],
        };
        self.scan_field(scratch, TargetName::RequestBasename, "", basename, results)?;

        self.scan_field(scratch, TargetName::QueryString, "", query.as_bytes(), results)?;

        let mut scanned_keys = HashSet::new();
        for (key, val) in parse_query(query) {
            if scanned_keys.insert(key.clone()) {
                self.scan_field(scratch, TargetName::ArgsNames, "", key.as_bytes(), results)?;
                self.scan_field(scratch, TargetName::ArgsGetNames, "", key.as_bytes(), results)?;
            }
            self.scan_field(scratch, TargetName::Args, &key, &val, results)?;
            self.scan_field(scratch, TargetName::ArgsGet, &key, &val, results)?;
        }

        Ok(())
    }

    fn scan_cookies(&self, scratch: &mut ScannerScratch, header: &str, results: &mut ScanResults) -> Result<()> {
        for cookie in header.split(';') {
            let cookie = cookie.trim_matches(' ');
            let (k, v) = cookie.split_once('=').unwrap_or((cookie, ""));
            self.scan_field(scratch, TargetName::RequestCookiesNames, "", k.as_bytes(), results)?;
            self.scan_field(scratch, TargetName::RequestCookies, k, v.as_bytes(), results)?;
        }
        Ok(())
    }

    /// Scan one tuple emitted by the body parser.
    pub fn scan_body_field(
        &self,
        scratch: &mut ScannerScratch,
        field_type: FieldType,
        field_name: &str,
        data: &[u8],
        results: &mut ScanResults,
    ) -> Result<()> {
        match field_type {
            FieldType::MultipartFormDataContent | FieldType::UrlEncodedContent => {
                self.scan_field(scratch, TargetName::ArgsNames, "", field_name.as_bytes(), results)?;
                self.scan_field(scratch, TargetName::Args, field_name, data, results)?;
                self.scan_field(scratch, TargetName::ArgsPost, field_name, data, results)?;
            }
            FieldType::MultipartFormDataFileNames => {
                self.scan_field(scratch, TargetName::FilesNames, "", field_name.as_bytes(), results)?;
                self.scan_field(scratch, TargetName::Files, "", data, results)?;
            }
            FieldType::MultipartFormDataStrictnessWarning => {
                let flags = &mut results.multipart;
                match StrictnessWarning::from_name(field_name) {
                    Some(StrictnessWarning::DataAfter) => flags.data_after = true,
                    Some(StrictnessWarning::DataBefore) => flags.data_before = true,
                    Some(StrictnessWarning::HeaderFolding) => flags.header_folding = true,
                    Some(StrictnessWarning::InvalidHeaderFolding) => flags.invalid_header_folding = true,
                    Some(StrictnessWarning::LfLine) => flags.lf_line = true,
                    Some(StrictnessWarning::UnmatchedBoundary) => flags.unmatched_boundary = true,
                    Some(StrictnessWarning::FileLimitExceeded) => flags.file_limit_exceeded = true,
                    Some(StrictnessWarning::Incomplete) => flags.incomplete = true,
                    None => tracing::debug!(warning = field_name, "Unknown multipart strictness warning"),
                }
            }
            FieldType::JsonContent => self.scan_field(scratch, TargetName::Args, "", data, results)?,
            FieldType::XmlCharData => self.scan_field(scratch, TargetName::Xml, "/*", data, results)?,
            FieldType::FullRawRequestBody => self.scan_field(scratch, TargetName::RequestBody, "", data, results)?,
        }
        Ok(())
    }
}

/// Record multipart Content-Type anomalies
fn scan_content_type(value: &str, flags: &mut MultipartFlags) {
    let v = value.to_lowercase();
    let v = v.trim_start_matches(' ');
    if !v.starts_with("multipart/form-data") {
        return;
    }

    if !v.contains(';') {
        flags.missing_semicolon = true;
        return;
    }

    for param in v.split(';') {
        let Some(boundary) = param.trim_start_matches(' ').strip_prefix("boundary=") else {
            continue;
        };
        if boundary.len() >= 2 && boundary.starts_with('"') && boundary.ends_with('"') {
            flags.boundary_quoted = true;
        } else if boundary.contains(['\'', '"']) {
            flags.invalid_quoting = true;
        }
        if boundary.chars().any(char::is_whitespace) {
            flags.boundary_whitespace = true;
        }
    }
}

/// Split a query string on `&` only; `;` is not a separator.
fn parse_query(query: &str) -> Vec<(String, Vec<u8>)> {
    if query.is_empty() {
        return Vec::new();
    }

    query
        .split('&')
        .map(|arg| {
            let (k, v) = arg.split_once('=').unwrap_or((arg, ""));
            let key = String::from_utf8_lossy(&weak_url_unescape(k.as_bytes())).into_owned();
            (key, weak_url_unescape(v.as_bytes()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrule::parser::parse;

    fn scanner(rules: &str) -> RequestScanner {
        scanner_with_exclusions(rules, &[])
    }

    fn scanner_with_exclusions(rules: &str, exclusions: &[Exclusion]) -> RequestScanner {
        let statements = Arc::new(parse(rules, None, None).unwrap());
        RequestScanner::new(statements, exclusions, &MultiRegexEngineFactory::default(), CustomOperators::new()).unwrap()
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "GET".into(),
            uri: uri.into(),
            protocol: "HTTP/1.1".into(),
            remote_addr: "10.0.0.1".into(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    fn scan(s: &RequestScanner, req: &HttpRequest) -> ScanResults {
        let mut scratch = s.acquire_scratch().unwrap();
        let mut results = ScanResults::new();
        s.scan_headers(&mut scratch, req, &mut results).unwrap();
        s.release_scratch(scratch);
        results
    }

    #[test]
    fn test_scan_args_regex() {
        let s = scanner(r#"SecRule ARGS "ab+c" "id:100""#);
        let results = scan(&s, &request("/a.php?arg1=aaaaaaabccc", &[]));

        let target = Target::new(TargetName::Args);
        let m = results.results_for(100, 0, &target).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].data, b"abc");
        assert_eq!(m[0].entire_field_content, b"aaaaaaabccc");
        assert_eq!(m[0].field_name, b"arg1");
        assert_eq!(results.target_count(&target), 1);
    }

    #[test]
    fn test_no_match() {
        let s = scanner(r#"SecRule ARGS "xyz" "id:100""#);
        let results = scan(&s, &request("/a.php?arg1=abc&arg2=def", &[]));
        assert!(results.results_for(100, 0, &Target::new(TargetName::Args)).is_none());
        assert_eq!(results.target_count(&Target::new(TargetName::Args)), 2);
    }

    #[test]
    fn test_selector_and_transformations() {
        let s = scanner(r#"SecRule ARGS:Foo "^hello$" "id:1,t:lowercase,t:urlDecode""#);
        let results = scan(&s, &request("/?FOO=HeLLo&bar=hello", &[]));
        let target = Target::with_selector(TargetName::Args, "foo");
        let m = results.results_for(1, 0, &target).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].field_name, b"FOO");
        assert_eq!(results.target_count(&target), 1);
    }

    #[test]
    fn test_regex_selector() {
        let s = scanner(r#"SecRule ARGS:/^ab/ "x" "id:1""#);
        let results = scan(&s, &request("/?abc=x&zab=x", &[]));
        let target = parse(r#"SecRule ARGS:/^ab/ "x" "id:1""#, None, None).unwrap();
        let Statement::Rule(rule) = &target[0] else { panic!() };
        let m = results.results_for(1, 0, &rule.items[0].predicate.targets[0]).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].field_name, b"abc");
    }

    #[test]
    fn test_except_target() {
        let s = scanner(r#"SecRule ARGS|!ARGS:b "x" "id:1""#);
        let results = scan(&s, &request("/?b=x", &[]));
        assert!(results.results_for(1, 0, &Target::new(TargetName::Args)).is_none());

        let results = scan(&s, &request("/?a=x", &[]));
        assert!(results.results_for(1, 0, &Target::new(TargetName::Args)).is_some());
    }

    #[test]
    fn test_global_exclusions() {
        let exclusions = vec![
            Exclusion {
                match_variable: "RequestArgNames".into(),
                selector_match_operator: "StartsWith".into(),
                selector: "skip".into(),
            },
            Exclusion {
                match_variable: "RequestCookieNames".into(),
                selector_match_operator: String::new(),
                selector: String::new(),
            },
        ];
        let s = scanner_with_exclusions(
            "SecRule ARGS \"evil\" \"id:1\"\nSecRule REQUEST_COOKIES \"evil\" \"id:2\"",
            &exclusions,
        );

        let results = scan(&s, &request("/?SKIPME=evil", &[("Cookie", "a=evil")]));
        assert!(results.results_for(1, 0, &Target::new(TargetName::Args)).is_none());
        assert!(results.results_for(2, 0, &Target::new(TargetName::RequestCookies)).is_none());

        let results = scan(&s, &request("/?other=evil", &[]));
        assert!(results.results_for(1, 0, &Target::new(TargetName::Args)).is_some());
    }

    #[test]
    fn test_unknown_exclusion_operator() {
        let exclusions = vec![Exclusion {
            match_variable: "RequestArgNames".into(),
            selector_match_operator: "Matches".into(),
            selector: "x".into(),
        }];
        let statements = Arc::new(parse(r#"SecRule ARGS "x" "id:1""#, None, None).unwrap());
        let r = RequestScanner::new(statements, &exclusions, &MultiRegexEngineFactory::default(), CustomOperators::new());
        assert!(matches!(r, Err(WafError::Config(_))));
    }

    #[test]
    fn test_uri_targets() {
        let s = scanner(
            "SecRule REQUEST_FILENAME \"^/a b/c\\.php$\" \"id:1\"\n\
             SecRule REQUEST_BASENAME \"^c\\.php$\" \"id:2\"\n\
             SecRule QUERY_STRING \"^x=1&y$\" \"id:3\"\n\
             SecRule ARGS_NAMES \"^y$\" \"id:4\"\n\
             SecRule REQUEST_LINE \"^GET /a%20b/c\\.php\\?x=1&y HTTP/1\\.1$\" \"id:5\"",
        );
        let results = scan(&s, &request("/a%20b/c.php?x=1&y", &[]));
        assert!(results.results_for(1, 0, &Target::new(TargetName::RequestFilename)).is_some());
        assert!(results.results_for(2, 0, &Target::new(TargetName::RequestBasename)).is_some());
        assert!(results.results_for(3, 0, &Target::new(TargetName::QueryString)).is_some());
        assert!(results.results_for(4, 0, &Target::new(TargetName::ArgsNames)).is_some());
        assert!(results.results_for(5, 0, &Target::new(TargetName::RequestLine)).is_some());
        assert_eq!(results.request_method, b"GET");
    }

    #[test]
    fn test_cookies_and_headers() {
        let s = scanner(
            "SecRule REQUEST_COOKIES:session \"^abc$\" \"id:1\"\n\
             SecRule REQUEST_COOKIES_NAMES \"^theme$\" \"id:2\"\n\
             SecRule REQUEST_HEADERS:User-Agent \"bot\" \"id:3\"",
        );
        let req = request(
            "/",
            &[("Cookie", "session=abc; theme=dark"), ("User-Agent", "evilbot"), ("Host", "example.com")],
        );
        let results = scan(&s, &req);
        assert!(results
            .results_for(1, 0, &Target::with_selector(TargetName::RequestCookies, "session"))
            .is_some());
        assert!(results.results_for(2, 0, &Target::new(TargetName::RequestCookiesNames)).is_some());
        assert!(results
            .results_for(3, 0, &Target::with_selector(TargetName::RequestHeaders, "user-agent"))
            .is_some());
        assert_eq!(results.host_header, b"example.com");
    }

    #[test]
    fn test_pm_keeps_first_match_per_field() {
        let s = scanner(r#"SecRule ARGS "@pm foo bar" "id:1""#);
        let results = scan(&s, &request("/?a=foobar&b=BAR", &[]));
        let m = results.results_for(1, 0, &Target::new(TargetName::Args)).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m[0].field_name, b"a");
        assert_eq!(m[1].field_name, b"b");
    }

    #[test]
    fn test_inline_operators() {
        let s = scanner(
            "SecRule ARGS \"@detectSQLi\" \"id:1\"\n\
             SecRule ARGS \"@validateByteRange 32-126\" \"id:2\"\n\
             SecRule REMOTE_ADDR \"@ipMatch 10.0.0.0/8\" \"id:3\"",
        );
        let results = scan(&s, &request("/?q=1%20union%20select%202&r=%01", &[]));

        let m = results.results_for(1, 0, &Target::new(TargetName::Args)).unwrap();
        assert_eq!(m[0].data, b"1UE1");

        let m = results.results_for(2, 0, &Target::new(TargetName::Args)).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m[0].field_name, b"r");
        assert_eq!(m[0].data, b"\x01");

        assert!(results.results_for(3, 0, &Target::new(TargetName::RemoteAddr)).is_some());
    }

    #[test]
    fn test_late_scan_targets_not_scanned() {
        let s = scanner(
            "SecRule &ARGS \"@eq 2\" \"id:1\"\n\
             SecRule REQUEST_LINE \"%{tx.x}\" \"id:2\"\n\
             SecRule TX:x \"abc\" \"id:3\"",
        );
        let results = scan(&s, &request("/?a=1&b=2", &[]));
        let count = Target {
            is_count: true,
            ..Target::new(TargetName::Args)
        };
        assert_eq!(results.target_count(&count), 2);
        assert!(results.results_for(1, 0, &count).is_none());
        assert!(results.results_for(2, 0, &Target::new(TargetName::RequestLine)).is_none());
        assert!(s.groups.is_empty());
    }

    #[test]
    fn test_macro_on_scan_phase_target_rejected() {
        let err = parse("SecRule ARGS \"%{tx.x}\" \"id:2\"", None, None).unwrap_err();
        assert!(matches!(err, WafError::Unsupported(_)));
    }

    #[test]
    fn test_content_type_flags() {
        let mut f = MultipartFlags::default();
        scan_content_type("multipart/form-data", &mut f);
        assert!(f.missing_semicolon);

        let mut f = MultipartFlags::default();
        scan_content_type("multipart/form-data; boundary=\"abc\"", &mut f);
        assert!(f.boundary_quoted && !f.invalid_quoting);

        let mut f = MultipartFlags::default();
        scan_content_type("multipart/form-data; boundary=ab'c", &mut f);
        assert!(f.invalid_quoting);

        let mut f = MultipartFlags::default();
        scan_content_type("multipart/form-data; boundary=a b", &mut f);
        assert!(f.boundary_whitespace);

        let mut f = MultipartFlags::default();
        scan_content_type("application/json", &mut f);
        assert!(!f.any());
    }

    #[test]
    fn test_body_fields() {
        let s = scanner(
            "SecRule ARGS_POST:a \"evil\" \"id:1\"\n\
             SecRule FILES \"\\.exe$\" \"id:2\"\n\
             SecRule XML:/* \"evil\" \"id:3\"\n\
             SecRule REQUEST_BODY \"evil\" \"id:4\"",
        );
        let mut scratch = s.acquire_scratch().unwrap();
        let mut r = ScanResults::new();
        s.scan_body_field(&mut scratch, FieldType::UrlEncodedContent, "a", b"evil", &mut r).unwrap();
        s.scan_body_field(&mut scratch, FieldType::MultipartFormDataFileNames, "f", b"x.exe", &mut r).unwrap();
        s.scan_body_field(&mut scratch, FieldType::XmlCharData, "", b"evil", &mut r).unwrap();
        s.scan_body_field(&mut scratch, FieldType::FullRawRequestBody, "", b"a=evil", &mut r).unwrap();
        s.scan_body_field(&mut scratch, FieldType::MultipartFormDataStrictnessWarning, StrictnessWarning::LfLine.as_str(), b"", &mut r)
            .unwrap();

        assert!(r.results_for(1, 0, &Target::with_selector(TargetName::ArgsPost, "a")).is_some());
        assert!(r.results_for(2, 0, &Target::new(TargetName::Files)).is_some());
        assert!(r.results_for(3, 0, &Target::with_selector(TargetName::Xml, "/*")).is_some());
        assert!(r.results_for(4, 0, &Target::new(TargetName::RequestBody)).is_some());
        assert!(r.multipart.lf_line);
        s.release_scratch(scratch);
    }

    #[test]
    fn test_parse_query() {
        assert!(parse_query("").is_empty());
        assert_eq!(
            parse_query("a=1&b&c=%41;d"),
            vec![
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), Vec::new()),
                ("c".to_string(), b"A;d".to_vec()),
            ]
        );
    }
}
