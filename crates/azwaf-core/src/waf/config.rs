//! WAF configuration

use crate::bodyparsing::LengthLimits;
use crate::customrule::CustomRule;
use crate::{Result, WafError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WafConfig {
    /// Request body byte limits
    pub length_limits: LengthLimits,
    /// Fallback for `RUST_LOG`
    pub log_level: String,
    /// Log per-phase timings at debug level
    pub profiling_enabled: bool,
    /// Load this one SecRule file instead of the CRS rulesets
    pub standalone_secrule_path: Option<PathBuf>,
    /// Overrides the `rulesetfiles` directory next to the executable
    pub rulesets_dir: Option<PathBuf>,
    /// Cache prepared regex databases on disk
    pub db_cache_enabled: bool,
    /// Bad-IP list file, `badbots.txt` in the working directory by default
    pub ip_reputation_list_path: Option<PathBuf>,
    pub policies: Vec<PolicyConfig>,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            length_limits: LengthLimits::default(),
            log_level: "info".into(),
            profiling_enabled: false,
            standalone_secrule_path: None,
            rulesets_dir: None,
            db_cache_enabled: true,
            ip_reputation_list_path: None,
            policies: Vec::new(),
        }
    }
}

impl WafConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| WafError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| WafError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Policy for a request's config id
    pub fn policy(&self, config_id: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.config_id == config_id)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        for p in &self.policies {
            if !ids.insert(p.config_id.as_str()) {
                return Err(WafError::Config(format!("duplicate policy config_id {:?}", p.config_id)));
            }
            if let Some(secrule) = &p.secrule {
                for e in &secrule.exclusions {
                    e.validate()?;
                }
            }
        }
        Ok(())
    }
}

/// Settings for one protected site, selected by [`HttpRequest::config_id`](super::HttpRequest)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub config_id: String,
    /// Log blocking decisions but let requests through
    pub is_detection_mode: bool,
    pub secrule: Option<SecRuleConfig>,
    pub custom_rules: Option<Vec<CustomRule>>,
    /// Enables the `GeoMatch` custom rule operator
    pub geodb_enabled: bool,
    pub ip_reputation: Option<IpReputationConfig>,
}

/// Checks client addresses against the bad-IP list before any rule runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpReputationConfig {
    pub enabled: bool,
}

impl Default for IpReputationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecRuleConfig {
    pub enabled: bool,
    pub ruleset_id: String,
    pub exclusions: Vec<Exclusion>,
}

impl Default for SecRuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ruleset_id: "OWASP CRS 3.0".into(),
            exclusions: Vec::new(),
        }
    }
}

/// Global exclusion removing matching fields from every rule.
///
/// `match_variable` is `RequestArgNames`, `RequestCookieNames` or
/// `RequestHeaderNames`; `selector_match_operator` is `Equals`, `StartsWith`,
/// `EndsWith` or `Contains`. Without an operator and selector the whole
/// collection is excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exclusion {
    pub match_variable: String,
    pub selector_match_operator: String,
    pub selector: String,
}

impl Exclusion {
    pub fn new(match_variable: &str, selector_match_operator: &str, selector: &str) -> Self {
        Self {
            match_variable: match_variable.into(),
            selector_match_operator: selector_match_operator.into(),
            selector: selector.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !matches!(
            self.match_variable.as_str(),
            "RequestArgNames" | "RequestCookieNames" | "RequestHeaderNames"
        ) {
            return Err(WafError::Config(format!(
                "unknown exclusion match variable {:?}",
                self.match_variable
            )));
        }
        if !matches!(
            self.selector_match_operator.as_str(),
            "" | "Equals" | "StartsWith" | "EndsWith" | "Contains"
        ) {
            return Err(WafError::Config(format!(
                "unknown exclusion operator {:?}",
                self.selector_match_operator
            )));
        }
        Ok(())
    }
}
