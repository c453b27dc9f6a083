//! Render statements back into SecRule-language text

use super::ast::{
    Action, ActionStmt, CtlSetting, Operator, Rule, RuleItem, SetVarOperator, Statement, Target, TargetName,
    Transformation,
};
use super::value::{EnvVarName, Token, Value};
use std::fmt::{self, Write};

fn env_var_name(n: EnvVarName) -> &'static str {
    match n {
        EnvVarName::Ip => "ip",
        EnvVarName::MatchedVar => "matched_var",
        EnvVarName::MatchedVarName => "matched_var_name",
        EnvVarName::MultipartBoundaryQuoted => "multipart_boundary_quoted",
        EnvVarName::MultipartBoundaryWhitespace => "multipart_boundary_whitespace",
        EnvVarName::MultipartDataAfter => "multipart_data_after",
        EnvVarName::MultipartDataBefore => "multipart_data_before",
        EnvVarName::MultipartFileLimitExceeded => "multipart_file_limit_exceeded",
        EnvVarName::MultipartHeaderFolding => "multipart_header_folding",
        EnvVarName::MultipartInvalidHeaderFolding => "multipart_invalid_header_folding",
        EnvVarName::MultipartInvalidQuoting => "multipart_invalid_quoting",
        EnvVarName::MultipartLfLine => "multipart_lf_line",
        EnvVarName::MultipartMissingSemicolon => "multipart_missing_semicolon",
        EnvVarName::MultipartStrictError => "multipart_strict_error",
        EnvVarName::MultipartUnmatchedBoundary => "multipart_unmatched_boundary",
        EnvVarName::RemoteAddr => "remote_addr",
        EnvVarName::ReqbodyErrorMsg => "reqbody_error_msg",
        EnvVarName::ReqbodyProcessor => "reqbody_processor",
        EnvVarName::ReqbodyProcessorError => "reqbody_processor_error",
        EnvVarName::RequestHeaders => "request_headers",
        EnvVarName::RequestLine => "request_line",
        EnvVarName::RequestMethod => "request_method",
        EnvVarName::RequestProtocol => "request_protocol",
        EnvVarName::Rule => "rule",
        EnvVarName::Tx => "tx",
    }
}

fn operator_name(op: &Operator) -> &str {
    match op {
        Operator::BeginsWith => "beginsWith",
        Operator::EndsWith => "endsWith",
        Operator::Contains => "contains",
        Operator::ContainsWord => "containsWord",
        Operator::DetectSqli => "detectSQLi",
        Operator::DetectXss => "detectXSS",
        Operator::Eq => "eq",
        Operator::Ge => "ge",
        Operator::Gt => "gt",
        Operator::Le => "le",
        Operator::Lt => "lt",
        Operator::Pm => "pm",
        Operator::Pmf => "pmf",
        Operator::PmFromFile => "pmFromFile",
        Operator::Rx => "rx",
        Operator::Streq => "streq",
        Operator::Strmatch => "strmatch",
        Operator::ValidateByteRange => "validateByteRange",
        Operator::ValidateUrlEncoding => "validateUrlEncoding",
        Operator::ValidateUtf8Encoding => "validateUtf8Encoding",
        Operator::Within => "within",
        Operator::GeoLookup => "geoLookup",
        Operator::IpMatch => "ipMatch",
        Operator::IpMatchFromFile => "ipMatchFromFile",
        Operator::Rbl => "rbl",
        Operator::Custom(name) => name,
    }
}

fn transformation_name(t: Transformation) -> &'static str {
    match t {
        Transformation::CmdLine => "cmdLine",
        Transformation::CompressWhitespace => "compressWhitespace",
        Transformation::CssDecode => "cssDecode",
        Transformation::HexEncode => "hexEncode",
        Transformation::HtmlEntityDecode => "htmlEntityDecode",
        Transformation::JsDecode => "jsDecode",
        Transformation::Length => "length",
        Transformation::Lowercase => "lowercase",
        Transformation::None => "none",
        Transformation::NormalisePath => "normalisePath",
        Transformation::NormalisePathWin => "normalisePathWin",
        Transformation::NormalizePath => "normalizePath",
        Transformation::NormalizePathWin => "normalizePathWin",
        Transformation::RemoveComments => "removeComments",
        Transformation::RemoveNulls => "removeNulls",
        Transformation::RemoveWhitespace => "removeWhitespace",
        Transformation::ReplaceComments => "replaceComments",
        Transformation::Sha1 => "sha1",
        Transformation::Trim => "trim",
        Transformation::UrlDecode => "urlDecode",
        Transformation::UrlDecodeUni => "urlDecodeUni",
        Transformation::UrlEncode => "urlEncode",
        Transformation::Utf8ToUnicode => "utf8toUnicode",
    }
}

fn ctl_setting_name(s: CtlSetting) -> &'static str {
    match s {
        CtlSetting::AuditEngine => "auditEngine",
        CtlSetting::AuditLogParts => "auditLogParts",
        CtlSetting::ForceRequestBodyVariable => "forceRequestBodyVariable",
        CtlSetting::RequestBodyAccess => "requestBodyAccess",
        CtlSetting::RequestBodyProcessor => "requestBodyProcessor",
        CtlSetting::RuleEngine => "ruleEngine",
        CtlSetting::RuleRemoveById => "ruleRemoveById",
        CtlSetting::RuleRemoveByTag => "ruleRemoveByTag",
        CtlSetting::RuleRemoveTargetById => "ruleRemoveTargetById",
        CtlSetting::RuleRemoveTargetByTag => "ruleRemoveTargetByTag",
    }
}

/// Value source text, with macros written as `%{name.selector}`
pub fn value_text(v: &Value) -> String {
    let mut out = String::new();
    for t in v.tokens() {
        match t {
            Token::Int(n) => out.push_str(&n.to_string()),
            Token::Str(s) => out.push_str(&String::from_utf8_lossy(s)),
            Token::Macro(m) if m.selector.is_empty() => {
                let _ = write!(out, "%{{{}}}", env_var_name(m.name));
            }
            Token::Macro(m) => {
                let _ = write!(out, "%{{{}.{}}}", env_var_name(m.name), m.selector);
            }
            Token::ByteRange(r) => {
                let mut parts = Vec::new();
                let mut b = 0usize;
                while b < 256 {
                    if !r.0[b] {
                        b += 1;
                        continue;
                    }
                    let start = b;
                    while b + 1 < 256 && r.0[b + 1] {
                        b += 1;
                    }
                    parts.push(if start == b { start.to_string() } else { format!("{start}-{b}") });
                    b += 1;
                }
                out.push_str(&parts.join(","));
            }
        }
    }
    out
}

fn double_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn single_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "\\'"))
}

fn target_text(t: &Target, except: bool) -> String {
    let mut out = String::new();
    if except {
        out.push('!');
    }
    if t.is_count {
        out.push('&');
    }
    out.push_str(t.name.as_str());
    if t.selector.is_empty() {
        return out;
    }

    out.push(':');
    if t.is_regex_selector {
        let _ = write!(out, "/{}/", t.selector);
    } else if t.name != TargetName::Xml && t.selector.contains(|c| matches!(c, '|' | ',' | ' ' | '\t' | '\'')) {
        out.push_str(&single_quote(&t.selector));
    } else {
        out.push_str(&t.selector);
    }
    out
}

fn action_text(a: &Action) -> String {
    match a {
        Action::Chain => "chain".into(),
        Action::Allow => "allow".into(),
        Action::Deny => "deny".into(),
        Action::Capture => "capture".into(),
        Action::Log => "log".into(),
        Action::NoLog => "nolog".into(),
        Action::Msg(v) => format!("msg:{}", single_quote(&value_text(v))),
        Action::LogData(v) => format!("logdata:{}", single_quote(&value_text(v))),
        Action::SkipAfter(label) => format!("skipAfter:{label}"),
        Action::SetVar(sv) => {
            let var = value_text(&sv.variable);
            let body = match sv.operator {
                SetVarOperator::Delete => format!("!{var}"),
                SetVarOperator::Set => format!("{var}={}", value_text(&sv.value)),
                SetVarOperator::Increment => format!("{var}=+{}", value_text(&sv.value)),
                SetVarOperator::Decrement => format!("{var}=-{}", value_text(&sv.value)),
            };
            format!("setvar:{}", single_quote(&body))
        }
        Action::Ctl(c) => format!("ctl:{}={}", ctl_setting_name(c.setting), value_text(&c.value)),
        Action::Raw { key, val } if val.is_empty() => key.clone(),
        Action::Raw { key, val } => format!("{key}:{}", single_quote(val)),
    }
}

fn write_rule(f: &mut fmt::Formatter<'_>, rule: &Rule) -> fmt::Result {
    for (idx, item) in rule.items.iter().enumerate() {
        let mut actions = Vec::new();
        if idx == 0 {
            actions.push(format!("id:{}", rule.id));
            if rule.phase != 0 {
                actions.push(format!("phase:{}", rule.phase));
            }
        }
        actions.extend(item.transformations.iter().map(|t| format!("t:{}", transformation_name(*t))));
        actions.extend(item.actions.iter().map(action_text));

        writeln!(
            f,
            "SecRule {} {} {}",
            double_quote(&targets_text(item)),
            double_quote(&operator_text(item)),
            double_quote(&actions.join(","))
        )?;
    }
    Ok(())
}

fn targets_text(item: &RuleItem) -> String {
    let p = &item.predicate;
    p.targets
        .iter()
        .map(|t| target_text(t, false))
        .chain(p.except_targets.iter().map(|t| target_text(t, true)))
        .collect::<Vec<_>>()
        .join("|")
}

fn operator_text(item: &RuleItem) -> String {
    let p = &item.predicate;
    let neg = if p.neg { "!" } else { "" };
    let val = value_text(&p.val);
    if val.is_empty() {
        format!("{neg}@{}", operator_name(&p.op))
    } else {
        format!("{neg}@{} {val}", operator_name(&p.op))
    }
}

fn write_action_stmt(f: &mut fmt::Formatter<'_>, a: &ActionStmt) -> fmt::Result {
    let mut actions = vec![format!("id:{}", a.id)];
    if a.phase != 0 {
        actions.push(format!("phase:{}", a.phase));
    }
    actions.extend(a.actions.iter().map(action_text));
    writeln!(f, "SecAction {}", double_quote(&actions.join(",")))
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Rule(r) => write_rule(f, r),
            Statement::Action(a) => write_action_stmt(f, a),
            Statement::Marker(m) => writeln!(f, "SecMarker {}", double_quote(&m.label)),
        }
    }
}

/// Render a whole rule set, one statement per line
pub fn to_rule_text(statements: &[Statement]) -> String {
    statements.iter().map(ToString::to_string).collect()
}
