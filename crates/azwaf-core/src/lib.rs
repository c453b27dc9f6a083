//! AzWaf Core
//!
//! Streaming Web Application Firewall engine evaluating HTTP requests against
//! ModSecurity SecRule rule sets (OWASP CRS) and declarative custom rules.
//!
//! ## Features
//!
//! - Multi-regex prefilter with per-pattern verification and capture groups
//! - SecRule parser with includes, phrase files and chained rules
//! - Two-pass evaluation: bulk field scanning, then late-bound predicates
//! - Size-capped streaming body parsing (multipart, urlencoded, JSON, XML)
//! - Strict multipart anomaly detection
//! - Custom rules transpiled onto the SecRule engine

pub mod bodyparsing;
pub mod customrule;
pub mod encoding;
pub mod multiregex;
pub mod secrule;
pub mod waf;

pub use bodyparsing::{FieldType, LengthLimits, RequestBodyParser};
pub use customrule::{CustomRule, CustomRuleEngine};
pub use multiregex::{MultiRegexEngine, MultiRegexEngineFactory};
pub use secrule::{SecRuleEngine, SecRuleEngineFactory, Statement};
pub use waf::{HttpRequest, ResultsLogger, Waf, WafConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types
#[derive(Error, Debug)]
pub enum WafError {
    /// SecRule text could not be parsed
    #[error("{0}")]
    Parse(String),

    /// Rule file missing, unreadable or cyclically included
    #[error("rule loading error: {0}")]
    RuleLoad(String),

    /// Regex could not be made PCRE compatible or compiled
    #[error("regex error: {0}")]
    Regex(String),

    /// Rule uses a construct this engine does not support
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("field length limit exceeded")]
    FieldBytesLimitExceeded,

    #[error("request length limit exceeded")]
    PausableBytesLimitExceeded,

    #[error("total request length limit exceeded")]
    TotalBytesLimitExceeded,

    #[error("total full raw request body length limit exceeded")]
    TotalFullRawRequestBodyExceeded,

    /// Body could not be parsed as its declared content type
    #[error("{media_type} body scanning error: {message}")]
    BodyFormat { media_type: String, message: String },

    /// Operator could not be applied to its input
    #[error("operator error: {0}")]
    Operator(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WafError {
    /// True for the four byte-count sentinels
    pub fn is_limit_error(&self) -> bool {
        matches!(
            self,
            Self::FieldBytesLimitExceeded
                | Self::PausableBytesLimitExceeded
                | Self::TotalBytesLimitExceeded
                | Self::TotalFullRawRequestBodyExceeded
        )
    }
}

pub type Result<T> = std::result::Result<T, WafError>;

/// Final verdict for a request
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    /// No rule decided; the request continues
    #[default]
    Pass,
    /// Allowed regardless of remaining rules
    Allow,
    /// Blocked regardless of remaining rules
    Block,
}

impl Decision {
    /// HTTP status a front-end should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Block => 403,
            Self::Pass | Self::Allow => 200,
        }
    }
}
