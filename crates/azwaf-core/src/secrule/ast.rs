//! SecRule abstract syntax tree

use super::value::Value;
use std::fmt;

/// Phase used when a statement declares none
pub const DEFAULT_PHASE: u8 = 2;

/// Top-level SecRule-language statement
#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Rule(Rule),
    Action(ActionStmt),
    Marker(Marker),
}

impl Statement {
    pub fn id(&self) -> i64 {
        match self {
            Statement::Rule(r) => r.id,
            Statement::Action(a) => a.id,
            Statement::Marker(_) => 0,
        }
    }

    /// Effective phase; markers have none
    pub fn phase(&self) -> Option<u8> {
        let p = match self {
            Statement::Rule(r) => r.phase,
            Statement::Action(a) => a.phase,
            Statement::Marker(_) => return None,
        };
        Some(if p == 0 { DEFAULT_PHASE } else { p })
    }
}

/// One or more chained `SecRule` items
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rule {
    pub id: i64,
    pub phase: u8,
    pub items: Vec<RuleItem>,
}

/// `SecAction`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionStmt {
    pub id: i64,
    pub phase: u8,
    pub actions: Vec<Action>,
}

/// `SecMarker`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    pub label: String,
}

/// Single link of a rule chain
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleItem {
    pub predicate: RulePredicate,
    pub actions: Vec<Action>,
    pub transformations: Vec<Transformation>,
    /// Literal phrases of `@pm`, `@pmf` and `@pmFromFile`
    pub pm_phrases: Vec<String>,
}

impl RuleItem {
    pub fn has_chain(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Chain))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RulePredicate {
    pub targets: Vec<Target>,
    pub except_targets: Vec<Target>,
    pub op: Operator,
    pub neg: bool,
    pub val: Value,
}

/// Request field selection such as `ARGS`, `!ARGS:foo` or `&TX:/^x_/`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub name: TargetName,
    pub selector: String,
    pub is_regex_selector: bool,
    pub is_count: bool,
}

impl Target {
    pub fn new(name: TargetName) -> Self {
        Self {
            name,
            selector: String::new(),
            is_regex_selector: false,
            is_count: false,
        }
    }

    pub fn with_selector(name: TargetName, selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            ..Self::new(name)
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_count {
            f.write_str("&")?;
        }
        f.write_str(self.name.as_str())?;
        match (self.selector.is_empty(), self.is_regex_selector) {
            (true, _) => Ok(()),
            (false, true) => write!(f, ":/{}/", self.selector),
            (false, false) => write!(f, ":{}", self.selector),
        }
    }
}

macro_rules! target_names {
    ($($variant:ident => $name:literal,)*) => {
        /// Named request variable a rule can inspect
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum TargetName {
            $($variant,)*
        }

        impl TargetName {
            pub const ALL: &'static [TargetName] = &[$(TargetName::$variant,)*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(TargetName::$variant => $name,)*
                }
            }

            /// Look up an upper-case target name
            pub fn from_name(s: &str) -> Option<Self> {
                match s {
                    $($name => Some(TargetName::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

target_names! {
    Args => "ARGS",
    ArgsCombinedSize => "ARGS_COMBINED_SIZE",
    ArgsGet => "ARGS_GET",
    ArgsGetNames => "ARGS_GET_NAMES",
    ArgsNames => "ARGS_NAMES",
    ArgsPost => "ARGS_POST",
    Duration => "DURATION",
    Files => "FILES",
    FilesCombinedSize => "FILES_COMBINED_SIZE",
    FilesNames => "FILES_NAMES",
    Geo => "GEO",
    Ip => "IP",
    MatchedVar => "MATCHED_VAR",
    MatchedVarName => "MATCHED_VAR_NAME",
    MatchedVars => "MATCHED_VARS",
    MatchedVarsNames => "MATCHED_VARS_NAMES",
    MultipartStrictError => "MULTIPART_STRICT_ERROR",
    MultipartUnmatchedBoundary => "MULTIPART_UNMATCHED_BOUNDARY",
    QueryString => "QUERY_STRING",
    RemoteAddr => "REMOTE_ADDR",
    ReqbodyError => "REQBODY_ERROR",
    ReqbodyProcessor => "REQBODY_PROCESSOR",
    RequestBasename => "REQUEST_BASENAME",
    RequestBody => "REQUEST_BODY",
    RequestCookies => "REQUEST_COOKIES",
    RequestCookiesNames => "REQUEST_COOKIES_NAMES",
    RequestFilename => "REQUEST_FILENAME",
    RequestHeaders => "REQUEST_HEADERS",
    RequestHeadersNames => "REQUEST_HEADERS_NAMES",
    RequestLine => "REQUEST_LINE",
    RequestMethod => "REQUEST_METHOD",
    RequestProtocol => "REQUEST_PROTOCOL",
    RequestUri => "REQUEST_URI",
    RequestUriRaw => "REQUEST_URI_RAW",
    Resource => "RESOURCE",
    ResponseBody => "RESPONSE_BODY",
    ResponseStatus => "RESPONSE_STATUS",
    Tx => "TX",
    UniqueId => "UNIQUE_ID",
    WebserverErrorLog => "WEBSERVER_ERROR_LOG",
    Xml => "XML",
}

impl TargetName {
    /// Targets whose content is only known while scanning request fields
    pub fn is_scan_phase(&self) -> bool {
        matches!(
            self,
            TargetName::Args
                | TargetName::ArgsGet
                | TargetName::ArgsNames
                | TargetName::Files
                | TargetName::FilesNames
                | TargetName::QueryString
                | TargetName::RequestBasename
                | TargetName::RequestBody
                | TargetName::RequestCookies
                | TargetName::RequestCookiesNames
                | TargetName::RequestFilename
                | TargetName::RequestHeaders
                | TargetName::RequestHeadersNames
                | TargetName::RequestUri
                | TargetName::RequestUriRaw
                | TargetName::Xml
        )
    }
}

impl fmt::Display for TargetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate operator
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Operator {
    BeginsWith,
    EndsWith,
    Contains,
    ContainsWord,
    DetectSqli,
    DetectXss,
    Eq,
    Ge,
    Gt,
    Le,
    Lt,
    Pm,
    Pmf,
    PmFromFile,
    #[default]
    Rx,
    Streq,
    Strmatch,
    ValidateByteRange,
    ValidateUrlEncoding,
    ValidateUtf8Encoding,
    Within,
    GeoLookup,
    IpMatch,
    IpMatchFromFile,
    Rbl,
    /// Engine-registered operator, looked up by name at evaluation time
    Custom(String),
}

impl Operator {
    /// Look up a lower-cased operator name without the `@`
    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "beginswith" => Self::BeginsWith,
            "endswith" => Self::EndsWith,
            "contains" => Self::Contains,
            "containsword" => Self::ContainsWord,
            "detectsqli" => Self::DetectSqli,
            "detectxss" => Self::DetectXss,
            "eq" => Self::Eq,
            "ge" => Self::Ge,
            "gt" => Self::Gt,
            "le" => Self::Le,
            "lt" => Self::Lt,
            "pm" => Self::Pm,
            "pmf" => Self::Pmf,
            "pmfromfile" => Self::PmFromFile,
            "rx" => Self::Rx,
            "streq" => Self::Streq,
            "strmatch" => Self::Strmatch,
            "validatebyterange" => Self::ValidateByteRange,
            "validateurlencoding" => Self::ValidateUrlEncoding,
            "validateutf8encoding" => Self::ValidateUtf8Encoding,
            "within" => Self::Within,
            "geolookup" => Self::GeoLookup,
            "ipmatch" => Self::IpMatch,
            "ipmatchfromfile" => Self::IpMatchFromFile,
            "rbl" => Self::Rbl,
            _ => return None,
        })
    }

    pub fn is_phrase_match(&self) -> bool {
        matches!(self, Self::Pm | Self::Pmf | Self::PmFromFile)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Eq | Self::Ge | Self::Gt | Self::Le | Self::Lt)
    }
}

/// Content transformation applied before an operator runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transformation {
    CmdLine,
    CompressWhitespace,
    CssDecode,
    HexEncode,
    HtmlEntityDecode,
    JsDecode,
    Length,
    Lowercase,
    None,
    NormalisePath,
    NormalisePathWin,
    NormalizePath,
    NormalizePathWin,
    RemoveComments,
    RemoveNulls,
    RemoveWhitespace,
    ReplaceComments,
    Sha1,
    Trim,
    UrlDecode,
    UrlDecodeUni,
    UrlEncode,
    Utf8ToUnicode,
}

impl Transformation {
    /// Look up a lower-cased `t:` name
    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "cmdline" => Self::CmdLine,
            "compresswhitespace" => Self::CompressWhitespace,
            "cssdecode" => Self::CssDecode,
            "hexencode" => Self::HexEncode,
            "htmlentitydecode" => Self::HtmlEntityDecode,
            "jsdecode" => Self::JsDecode,
            "length" => Self::Length,
            "lowercase" => Self::Lowercase,
            "none" => Self::None,
            "normalisepath" => Self::NormalisePath,
            "normalisepathwin" => Self::NormalisePathWin,
            "normalizepath" => Self::NormalizePath,
            "normalizepathwin" => Self::NormalizePathWin,
            "removecomments" => Self::RemoveComments,
            "removenulls" => Self::RemoveNulls,
            "removewhitespace" => Self::RemoveWhitespace,
            "replacecomments" => Self::ReplaceComments,
            "sha1" => Self::Sha1,
            "trim" => Self::Trim,
            "urldecode" => Self::UrlDecode,
            "urldecodeuni" => Self::UrlDecodeUni,
            "urlencode" => Self::UrlEncode,
            "utf8tounicode" => Self::Utf8ToUnicode,
            _ => return None,
        })
    }
}

/// Item of a rule's action list
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Chain,
    Allow,
    Deny,
    Capture,
    Log,
    NoLog,
    Msg(Value),
    LogData(Value),
    SkipAfter(String),
    SetVar(SetVarAction),
    Ctl(CtlAction),
    /// Action without an engine effect, such as `tag` or `severity`
    Raw { key: String, val: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetVarOperator {
    Set,
    Increment,
    Decrement,
    Delete,
}

/// `setvar:tx.name=value`
#[derive(Clone, Debug, PartialEq)]
pub struct SetVarAction {
    pub variable: Value,
    pub operator: SetVarOperator,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CtlSetting {
    AuditEngine,
    AuditLogParts,
    ForceRequestBodyVariable,
    RequestBodyAccess,
    RequestBodyProcessor,
    RuleEngine,
    RuleRemoveById,
    RuleRemoveByTag,
    RuleRemoveTargetById,
    RuleRemoveTargetByTag,
}

impl CtlSetting {
    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "auditengine" => Self::AuditEngine,
            "auditlogparts" => Self::AuditLogParts,
            "forcerequestbodyvariable" => Self::ForceRequestBodyVariable,
            "requestbodyaccess" => Self::RequestBodyAccess,
            "requestbodyprocessor" => Self::RequestBodyProcessor,
            "ruleengine" => Self::RuleEngine,
            "ruleremovebyid" => Self::RuleRemoveById,
            "ruleremovebytag" => Self::RuleRemoveByTag,
            "ruleremovetargetbyid" => Self::RuleRemoveTargetById,
            "ruleremovetargetbytag" => Self::RuleRemoveTargetByTag,
            _ => return None,
        })
    }
}

/// `ctl:setting=value`
#[derive(Clone, Debug, PartialEq)]
pub struct CtlAction {
    pub setting: CtlSetting,
    pub value: Value,
}
