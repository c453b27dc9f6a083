//! Per-request environment: scalars, the TX collection, matched-variable
//! collections and macro expansion

use super::ast::{Statement, TargetName};
use super::scanner::Match;
use super::value::{EnvVarName, Token, Value};
use crate::{Result, WafError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;

/// Compiled `TX:/regex/` selectors, keyed by their source text
pub type TxRegexSelectors = HashMap<String, Regex>;

/// Collect and compile every `TX:/regex/` selector in `statements`.
/// Selectors match case-insensitively.
pub fn compile_tx_regex_selectors(statements: &[Statement]) -> Result<TxRegexSelectors> {
    let mut selectors = TxRegexSelectors::new();
    for stmt in statements {
        let Statement::Rule(rule) = stmt else { continue };
        for item in &rule.items {
            for t in &item.predicate.targets {
                if t.name != TargetName::Tx || !t.is_regex_selector || selectors.contains_key(&t.selector) {
                    continue;
                }
                let re = Regex::new(&format!("(?i:{})", t.selector))
                    .map_err(|e| WafError::Regex(format!("invalid TX-target regex selector {}: {e}", t.selector)))?;
                selectors.insert(t.selector.clone(), re);
            }
        }
    }
    Ok(selectors)
}

/// Variables visible to rules while a request is evaluated
#[derive(Debug)]
pub struct Environment {
    tx_regex_selectors: Arc<TxRegexSelectors>,
    scalars: HashMap<EnvVarName, Value>,
    host_header: Option<Value>,
    tx: HashMap<String, Value>,
    rule: HashMap<String, Value>,
    matched_vars: Vec<Value>,
    matched_vars_names: Vec<Value>,
}

impl Environment {
    pub fn new(tx_regex_selectors: Arc<TxRegexSelectors>) -> Self {
        Self {
            tx_regex_selectors,
            scalars: HashMap::new(),
            host_header: None,
            tx: HashMap::new(),
            rule: HashMap::new(),
            matched_vars: Vec::new(),
            matched_vars_names: Vec::new(),
        }
    }

    pub fn get(&self, name: EnvVarName, selector: &str) -> Option<&Value> {
        match name {
            EnvVarName::RequestHeaders => {
                if selector.eq_ignore_ascii_case("host") {
                    self.host_header.as_ref()
                } else {
                    None
                }
            }
            EnvVarName::Tx => self.tx.get(&selector.to_ascii_lowercase()),
            EnvVarName::Rule => self.rule.get(&selector.to_ascii_lowercase()),
            EnvVarName::Ip => None,
            _ => self.scalars.get(&name),
        }
    }

    pub fn set(&mut self, name: EnvVarName, selector: &str, val: Value) {
        match name {
            EnvVarName::RequestHeaders => {
                if selector.eq_ignore_ascii_case("host") {
                    self.host_header = Some(val);
                }
            }
            EnvVarName::Tx => {
                self.tx.insert(selector.to_ascii_lowercase(), val);
            }
            EnvVarName::Rule => {
                self.rule.insert(selector.to_ascii_lowercase(), val);
            }
            EnvVarName::Ip => {}
            _ => {
                self.scalars.insert(name, val);
            }
        }
    }

    pub fn delete(&mut self, name: EnvVarName, selector: &str) {
        match name {
            EnvVarName::RequestHeaders => {
                if selector.eq_ignore_ascii_case("host") {
                    self.host_header = None;
                }
            }
            EnvVarName::Tx => {
                self.tx.remove(&selector.to_ascii_lowercase());
            }
            EnvVarName::Rule => {
                self.rule.remove(&selector.to_ascii_lowercase());
            }
            EnvVarName::Ip => {}
            _ => {
                self.scalars.remove(&name);
            }
        }
    }

    /// `MATCHED_VARS` of the current rule
    pub fn matched_vars(&self) -> &[Value] {
        &self.matched_vars
    }

    /// `MATCHED_VARS_NAMES` of the current rule
    pub fn matched_vars_names(&self) -> &[Value] {
        &self.matched_vars_names
    }

    /// TX values whose key matches a precompiled regex selector
    pub fn tx_vars_via_regex_selector(&self, selector: &str) -> Result<Vec<&Value>> {
        let re = self.tx_regex_selectors.get(selector).ok_or_else(|| {
            WafError::Operator(format!("regex for TX-variable selector {selector} was not found in the precompiled set"))
        })?;
        Ok(self.tx.iter().filter(|(k, _)| re.is_match(k)).map(|(_, v)| v).collect())
    }

    /// Clear `MATCHED_VARS` and `MATCHED_VARS_NAMES`; done at the start of every rule
    pub fn reset_matches_collections(&mut self) {
        self.matched_vars.clear();
        self.matched_vars_names.clear();
    }

    /// Record matches; the last one becomes `MATCHED_VAR` / `MATCHED_VAR_NAME`.
    pub fn update_matches(&mut self, matches: &[Match]) {
        for m in matches {
            let val = Value::from_bytes_auto(&m.entire_field_content);

            let mut name = m.target_name.as_str().as_bytes().to_vec();
            if !m.field_name.is_empty() {
                name.push(b':');
                name.extend_from_slice(&m.field_name);
            }
            let name = Value::string(name);

            self.scalars.insert(EnvVarName::MatchedVar, val.clone());
            self.scalars.insert(EnvVarName::MatchedVarName, name.clone());
            self.matched_vars.push(val);
            self.matched_vars_names.push(name);
        }
    }

    /// Copy of `v` with every macro replaced by its current value.
    /// Unresolved macros expand to nothing.
    pub fn expand_macros(&self, v: &Value) -> Value {
        if !v.has_macros() {
            return v.clone();
        }

        let mut out = Value(Vec::with_capacity(v.tokens().len()));
        for t in v.tokens() {
            match t {
                Token::Macro(m) => {
                    if let Some(resolved) = self.get(m.name, &m.selector) {
                        out.0.extend(resolved.tokens().iter().cloned());
                    }
                }
                _ => out.push(t.clone()),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrule::value::MacroToken;

    fn env() -> Environment {
        Environment::new(Arc::new(TxRegexSelectors::new()))
    }

    fn macro_token(name: EnvVarName, selector: &str) -> Token {
        Token::Macro(MacroToken {
            name,
            selector: selector.into(),
        })
    }

    #[test]
    fn test_tx_keys_case_insensitive() {
        let mut e = env();
        e.set(EnvVarName::Tx, "MyVar", Value::from("hello"));
        assert_eq!(e.get(EnvVarName::Tx, "myvar"), Some(&Value::from("hello")));
        assert_eq!(e.get(EnvVarName::Tx, "MYVAR"), Some(&Value::from("hello")));
        e.delete(EnvVarName::Tx, "myVAR");
        assert!(e.get(EnvVarName::Tx, "myvar").is_none());
    }

    #[test]
    fn test_host_header_only() {
        let mut e = env();
        e.set(EnvVarName::RequestHeaders, "Host", Value::from("example.com"));
        e.set(EnvVarName::RequestHeaders, "user-agent", Value::from("x"));
        assert_eq!(e.get(EnvVarName::RequestHeaders, "host"), Some(&Value::from("example.com")));
        assert!(e.get(EnvVarName::RequestHeaders, "user-agent").is_none());
    }

    #[test]
    fn test_expand_macros() {
        let mut e = env();
        e.set(EnvVarName::Tx, "a", Value::int(5));
        e.set(EnvVarName::RequestMethod, "", Value::from("GET"));

        let v = Value(vec![
            Token::Str(b"x=".to_vec()),
            macro_token(EnvVarName::Tx, "a"),
            Token::Str(b" m=".to_vec()),
            macro_token(EnvVarName::RequestMethod, ""),
            macro_token(EnvVarName::Tx, "missing"),
        ]);
        let expanded = e.expand_macros(&v);
        assert!(!expanded.has_macros());
        assert_eq!(expanded.to_bytes(), b"x=5 m=GET");
    }

    #[test]
    fn test_update_matches() {
        let mut e = env();
        let matches = vec![
            Match::new(TargetName::Args, "a", b"abc", b"b".to_vec(), vec![b"b".to_vec()]),
            Match::new(TargetName::RequestUri, "", b"42", Vec::new(), Vec::new()),
        ];
        e.update_matches(&matches);

        assert_eq!(e.matched_vars(), &[Value::from("abc"), Value::int(42)]);
        assert_eq!(e.matched_vars_names(), &[Value::from("ARGS:a"), Value::from("REQUEST_URI")]);
        assert_eq!(e.get(EnvVarName::MatchedVar, ""), Some(&Value::int(42)));
        assert_eq!(e.get(EnvVarName::MatchedVarName, ""), Some(&Value::from("REQUEST_URI")));

        e.reset_matches_collections();
        assert!(e.matched_vars().is_empty());
        assert!(e.matched_vars_names().is_empty());
    }

    #[test]
    fn test_tx_regex_selector() {
        let stmts = crate::secrule::parser::parse(r#"SecRule TX:/^header_name_/ "@rx x" "id:1""#, None, None).unwrap();
        let selectors = compile_tx_regex_selectors(&stmts).unwrap();
        assert_eq!(selectors.len(), 1);

        let mut e = Environment::new(Arc::new(selectors));
        e.set(EnvVarName::Tx, "header_name_a", Value::from("1"));
        e.set(EnvVarName::Tx, "HEADER_NAME_B", Value::from("2"));
        e.set(EnvVarName::Tx, "other", Value::from("3"));

        let mut found: Vec<String> = e
            .tx_vars_via_regex_selector("^header_name_")
            .unwrap()
            .into_iter()
            .map(|v| v.to_string())
            .collect();
        found.sort();
        assert_eq!(found, vec!["1", "2"]);
        assert!(e.tx_vars_via_regex_selector("^nope").is_err());
    }
}
