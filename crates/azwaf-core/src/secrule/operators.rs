//! Operator evaluation for predicates that are not answered by the multi-regex scan

use super::ast::Operator;
use super::libinjection;
use super::value::Value;
use crate::encoding;
use crate::multiregex::pcre;
use crate::{Result, WafError};
use aho_corasick::AhoCorasickBuilder;
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use regex::bytes::Regex;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Successful operator result
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OperatorMatch {
    /// Matched bytes; empty when the operator has no natural match data
    pub data: Vec<u8>,
    pub capture_groups: Vec<Vec<u8>>,
}

impl OperatorMatch {
    fn simple(data: Vec<u8>) -> Self {
        Self {
            capture_groups: vec![data.clone()],
            data,
        }
    }
}

/// Operator registered by name at engine construction, e.g. `GeoMatch`
pub trait CustomOperator: Send + Sync {
    /// `actual` is the transformed target content, `expected` the expanded rule value.
    fn eval(&self, actual: &[u8], expected: &[u8]) -> Result<bool>;
}

impl<F> CustomOperator for F
where
    F: Fn(&[u8], &[u8]) -> Result<bool> + Send + Sync,
{
    fn eval(&self, actual: &[u8], expected: &[u8]) -> Result<bool> {
        self(actual, expected)
    }
}

/// Name-keyed table of custom operators
#[derive(Clone, Default)]
pub struct CustomOperators {
    ops: HashMap<String, Arc<dyn CustomOperator>>,
}

impl CustomOperators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `op` under a case-insensitive name
    pub fn register(&mut self, name: &str, op: Arc<dyn CustomOperator>) {
        self.ops.insert(name.to_ascii_lowercase(), op);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomOperator>> {
        self.ops.get(&name.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl fmt::Debug for CustomOperators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ops.keys()).finish()
    }
}

/// Operators the request scanner compiles into its multi-regex databases
pub fn is_handled_by_regex_engine(op: &Operator) -> bool {
    matches!(
        op,
        Operator::Rx
            | Operator::Pm
            | Operator::Pmf
            | Operator::PmFromFile
            | Operator::BeginsWith
            | Operator::EndsWith
            | Operator::Contains
            | Operator::ContainsWord
            | Operator::Streq
            | Operator::Strmatch
    )
}

const MAX_CACHED_REGEXES: usize = 1024;

/// `@rx` expressions compiled at evaluation time, keyed by the expanded expression.
///
/// Emptied when full, since macro expansion can produce a new expression per request.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: DashMap<String, Arc<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, expr: &str) -> Result<Arc<Regex>> {
        if let Some(re) = self.compiled.get(expr) {
            return Ok(Arc::clone(re.value()));
        }
        let re = Arc::new(pcre::compile(&pcre::prepare(expr).expr)?);
        if self.compiled.len() >= MAX_CACHED_REGEXES {
            self.compiled.clear();
        }
        self.compiled.insert(expr.to_string(), Arc::clone(&re));
        Ok(re)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// Evaluate `op` with `actual` as the (already transformed) target value and
/// `expected` as the macro-expanded rule value.
pub fn eval_operator(
    op: &Operator,
    actual: &Value,
    expected: &Value,
    pm_phrases: &[String],
    custom: &CustomOperators,
    regexes: &RegexCache,
) -> Result<Option<OperatorMatch>> {
    let target = actual.to_bytes();
    let found = |b: bool| if b { Some(OperatorMatch::simple(Vec::new())) } else { None };

    Ok(match op {
        Operator::Rx => rx(&target, &*regexes.get_or_compile(&expected.to_string_lossy())?),
        Operator::Pm | Operator::Pmf | Operator::PmFromFile => {
            if pm_phrases.is_empty() {
                found(phrase_search(&target, expected.to_bytes().split(|&b| b == b' '))?)
            } else {
                found(phrase_search(&target, pm_phrases.iter().map(String::as_bytes))?)
            }
        }
        Operator::Eq => found(match (actual.as_int(), expected.as_int()) {
            (Some(a), Some(b)) => a == b,
            _ => target == expected.to_bytes(),
        }),
        Operator::Streq => found(target == expected.to_bytes()),
        Operator::Ge | Operator::Gt | Operator::Le | Operator::Lt => {
            let (Some(a), Some(b)) = (actual.as_int(), expected.as_int()) else {
                return Ok(None);
            };
            found(match op {
                Operator::Ge => a >= b,
                Operator::Gt => a > b,
                Operator::Le => a <= b,
                _ => a < b,
            })
        }
        Operator::BeginsWith => found(target.starts_with(&expected.to_bytes())),
        Operator::EndsWith => found(target.ends_with(&expected.to_bytes())),
        Operator::Contains | Operator::Strmatch => {
            found(memchr::memmem::find(&target, &expected.to_bytes()).is_some())
        }
        Operator::ContainsWord => found(contains_word(&target, &expected.to_bytes())),
        Operator::Within => {
            let haystack = expected.to_bytes();
            found(!target.is_empty() && memchr::memmem::find(&haystack, &target).is_some())
        }
        Operator::DetectSqli => libinjection::is_sqli(&target).map(|fp| OperatorMatch::simple(fp.into_bytes())),
        Operator::DetectXss => found(libinjection::is_xss(&target)),
        Operator::ValidateUrlEncoding => found(!encoding::is_valid_url_encoding(&target)),
        Operator::ValidateUtf8Encoding => found(std::str::from_utf8(&target).is_err()),
        Operator::ValidateByteRange => {
            let range = expected
                .byte_range()
                .ok_or_else(|| WafError::Operator("@validateByteRange without a byte range".into()))?;
            found(target.iter().any(|&b| !range.allows(b)))
        }
        Operator::IpMatch => found(ip_match(&target, &expected.to_string_lossy())?),
        Operator::Custom(name) => {
            let f = custom
                .get(name)
                .ok_or_else(|| WafError::Operator(format!("custom operator {name} is not registered")))?;
            found(f.eval(&target, &expected.to_bytes())?)
        }
        Operator::IpMatchFromFile | Operator::GeoLookup | Operator::Rbl => {
            return Err(WafError::Operator(format!("unsupported operator: {op:?}")));
        }
    })
}

fn rx(target: &[u8], re: &Regex) -> Option<OperatorMatch> {
    let caps = re.captures(target)?;
    let groups: Vec<Vec<u8>> = (0..caps.len())
        .map(|i| caps.get(i).map_or_else(Vec::new, |m| m.as_bytes().to_vec()))
        .collect();
    Some(OperatorMatch {
        data: groups.first().cloned().unwrap_or_default(),
        capture_groups: groups,
    })
}

/// Case-insensitive search for any non-empty phrase
fn phrase_search<'a>(target: &[u8], phrases: impl Iterator<Item = &'a [u8]>) -> Result<bool> {
    let phrases: Vec<&[u8]> = phrases.filter(|p| !p.is_empty()).collect();
    if phrases.is_empty() {
        return Ok(false);
    }
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(&phrases)
        .map_err(|e| WafError::Operator(format!("failed to build phrase matcher: {e}")))?;
    Ok(ac.is_match(target))
}

fn is_word_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn contains_word(target: &[u8], word: &[u8]) -> bool {
    if word.is_empty() {
        return false;
    }
    memchr::memmem::find_iter(target, word).any(|start| {
        let end = start + word.len();
        let before = start == 0 || !is_word_char(target[start - 1]);
        let after = end == target.len() || !is_word_char(target[end]);
        before && after
    })
}

/// Parse a comma-separated list of addresses and CIDR blocks
pub fn parse_networks(list: &str) -> Result<Vec<IpNetwork>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNetwork>()
                .or_else(|_| s.parse::<IpAddr>().map(IpNetwork::from))
                .map_err(|e| WafError::Operator(format!("invalid IP address or range {s}: {e}")))
        })
        .collect()
}

fn ip_match(target: &[u8], list: &str) -> Result<bool> {
    let Ok(addr) = String::from_utf8_lossy(target).trim().parse::<IpAddr>() else {
        return Ok(false);
    };
    Ok(parse_networks(list)?.iter().any(|n| n.contains(addr)))
}
