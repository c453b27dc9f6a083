//! SecRule language parser
//!
//! Statements are split on newlines (a trailing `\` continues a statement),
//! then each argument is tokenised with `nom` combinators.

use super::ast::{
    Action, ActionStmt, CtlAction, CtlSetting, Marker, Operator, Rule, RuleItem, SetVarAction,
    SetVarOperator, Statement, Target, TargetName, Transformation,
};
use super::value::{ByteRange, EnvVarName, MacroToken, Token, Value};
use crate::{Result, WafError};
use nom::branch::alt;
use nom::bytes::complete::{is_not, tag, tag_no_case, take_while1};
use nom::character::complete::{anychar, char, none_of};
use nom::combinator::{opt, recognize};
use nom::multi::{many0, many1};
use nom::sequence::{delimited, pair, preceded, terminated, tuple};
use nom::IResult;

/// Loads the phrases of a `@pmf` file named relative to the current rule file
pub type PhraseLoader<'a> = dyn FnMut(&str) -> Result<Vec<String>> + 'a;

/// Loads and parses the statements of an `include`d file
pub type IncludeLoader<'a> = dyn FnMut(&str) -> Result<Vec<Statement>> + 'a;

type Res<'a, T> = IResult<&'a str, T>;

fn parse_error(msg: impl Into<String>) -> WafError {
    WafError::Parse(msg.into())
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn word(i: &str) -> Res<&str> {
    take_while1(is_word_char)(i)
}

fn space_unit(i: &str) -> Res<&str> {
    alt((tag(" "), tag("\t"), tag("\\\n")))(i)
}

/// Whitespace between arguments, including escaped newlines
fn arg_space(i: &str) -> &str {
    match recognize(many0(space_unit))(i) {
        Ok((rest, _)) => rest,
        Err(_) => i,
    }
}

fn statement_name(i: &str) -> Res<&str> {
    terminated(word, many1(space_unit))(i)
}

fn escaped_char(i: &str) -> Res<&str> {
    recognize(pair(char('\\'), anychar))(i)
}

fn double_quoted(i: &str) -> Res<&str> {
    delimited(
        char('"'),
        recognize(many0(alt((escaped_char, recognize(none_of("\"\\")))))),
        char('"'),
    )(i)
}

fn single_quoted(i: &str) -> Res<&str> {
    delimited(
        char('\''),
        recognize(many0(alt((escaped_char, recognize(none_of("'\\")))))),
        char('\''),
    )(i)
}

fn bare_arg(i: &str) -> Res<&str> {
    is_not(" \t")(i)
}

/// Take one quoted or unquoted argument from the front of `s`.
fn next_arg(s: &str) -> (String, &str) {
    if let Ok((rest, inner)) = double_quoted(s) {
        let arg = inner.replace("\\\"", "\"").replace("\\\n", " ").replace("\\\\", "\\");
        return (arg, rest);
    }
    if let Ok((rest, inner)) = single_quoted(s) {
        let arg = inner.replace("\\'", "'").replace("\\\n", " ").replace("\\\\", "\\");
        return (arg, rest);
    }
    match bare_arg(s) {
        Ok((rest, arg)) => (arg.to_string(), rest),
        Err(_) => (String::new(), s),
    }
}

fn selector_char_run(i: &str) -> Res<&str> {
    is_not("| \t\r\n,")(i)
}

fn target_token(i: &str) -> Res<&str> {
    recognize(tuple((
        opt(char('!')),
        opt(char('&')),
        alt((
            recognize(pair(tag_no_case("XML:/"), selector_char_run)),
            recognize(tuple((
                word,
                tag(":/"),
                many1(alt((escaped_char, recognize(none_of("/\\"))))),
                char('/'),
            ))),
            recognize(tuple((
                word,
                tag(":'"),
                many1(alt((escaped_char, recognize(none_of("'\\"))))),
                char('\''),
            ))),
            recognize(tuple((word, char(':'), selector_char_run))),
            word,
        )),
    )))(i)
}

fn action_token(i: &str) -> Res<&str> {
    alt((
        recognize(tuple((
            word,
            char(':'),
            alt((
                recognize(delimited(
                    char('\''),
                    many1(alt((escaped_char, recognize(none_of("'\\"))))),
                    char('\''),
                )),
                is_not(","),
            )),
        ))),
        word,
    ))(i)
}

fn macro_ref(i: &str) -> Res<&str> {
    delimited(tag("%{"), is_not("}"), char('}'))(i)
}

fn operator_name(i: &str) -> Res<&str> {
    preceded(char('@'), word)(i)
}

/// Take the next statement, joining continuation lines. Returns an empty
/// statement at end of input.
fn next_statement<'a>(input: &'a str, line_number: &mut usize) -> (String, &'a str) {
    let mut stmt = String::new();
    let mut rest = input;
    loop {
        let line = match rest.find('\n') {
            Some(pos) => {
                let (line, r) = rest.split_at(pos + 1);
                rest = r;
                line
            }
            None => std::mem::take(&mut rest),
        };
        *line_number += 1;

        let trimmed = line.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n'));
        if trimmed.is_empty() && !rest.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            if rest.is_empty() {
                break;
            }
            continue;
        }

        stmt.push_str(trimmed);
        if trimmed.ends_with('\\') {
            stmt.push('\n');
            if rest.is_empty() {
                break;
            }
        } else {
            break;
        }
    }

    (stmt, rest)
}

/// Parse SecRule-language text into statements.
///
/// `phrases` resolves `@pmf` files and `includes` resolves `include`
/// statements; either may be `None` when the text is known not to need it.
pub fn parse(
    input: &str,
    mut phrases: Option<&mut PhraseLoader<'_>>,
    mut includes: Option<&mut IncludeLoader<'_>>,
) -> Result<Vec<Statement>> {
    let mut statements = Vec::new();
    let mut cur_rule = Rule::default();
    let mut rest = input;
    let mut line_number = 0;

    loop {
        let (stmt, r) = next_statement(rest, &mut line_number);
        rest = r;
        if stmt.is_empty() {
            break;
        }

        // A commented-out first line can leave dangling quoted args behind
        if stmt.starts_with('"') {
            continue;
        }

        let (args, name) = match statement_name(&stmt) {
            Ok((args, name)) => (args, name.to_ascii_lowercase()),
            Err(_) => (stmt.as_str(), String::new()),
        };

        match name.as_str() {
            "secrule" => parse_sec_rule(args, &mut cur_rule, &mut statements, phrases.as_deref_mut())
                .map_err(|e| parse_error(format!("parse error in SecRule on line {line_number}: {e}")))?,
            "secaction" => parse_sec_action(args, &mut statements)
                .map_err(|e| parse_error(format!("parse error in SecAction on line {line_number}: {e}")))?,
            "secmarker" => parse_sec_marker(args, &mut statements)
                .map_err(|e| parse_error(format!("parse error in SecMarker on line {line_number}: {e}")))?,
            "secdefaultaction" | "seccollectiontimeout" | "seccomponentsignature" => {}
            "include" => {
                let loader = includes.as_deref_mut().ok_or_else(|| {
                    parse_error("rules include statement, but no loader callback was given")
                })?;
                let path = args.trim_matches(|c| matches!(c, ' ' | '\\' | '\t' | '\r' | '\n' | '"'));
                let included = loader(path).map_err(|e| {
                    parse_error(format!("error in file included from line number {line_number}: {e}"))
                })?;
                statements.extend(included);
            }
            _ => return Err(parse_error(format!("unknown statement on line {line_number}: {stmt}"))),
        }
    }

    if !cur_rule.items.is_empty() {
        return Err(parse_error(format!("rule {} has an unterminated chain", cur_rule.id)));
    }

    check_for_unsupported_features(&statements)?;
    Ok(statements)
}

fn ensure_consumed(s: &str) -> Result<()> {
    let (arg, _) = next_arg(arg_space(s));
    if arg.is_empty() {
        Ok(())
    } else {
        Err(parse_error(format!("unexpected arg: {arg}")))
    }
}

fn parse_sec_rule(
    s: &str,
    cur_rule: &mut Rule,
    statements: &mut Vec<Statement>,
    phrases: Option<&mut PhraseLoader<'_>>,
) -> Result<()> {
    let mut item = RuleItem::default();

    let (targets, except_targets, s) = parse_targets(s)?;
    item.predicate.targets = targets;
    item.predicate.except_targets = except_targets;

    let (op, val, neg, s) = parse_operator(arg_space(s))?;
    match &op {
        Operator::Pm => {
            item.pm_phrases = val.to_string_lossy().split(' ').map(str::to_string).collect();
        }
        Operator::Pmf | Operator::PmFromFile => {
            let loader = phrases.ok_or_else(|| parse_error("rules contained @pmf but no loader callback was given"))?;
            item.pm_phrases = loader(&val.to_string_lossy())?;
        }
        _ => {}
    }
    item.predicate.op = op;
    item.predicate.val = val;
    item.predicate.neg = neg;

    let (raw, s) = parse_raw_actions(arg_space(s))?;
    ensure_consumed(s)?;

    let parsed = parse_actions(raw).map_err(|e| parse_error(format!("error while parsing actions: {e}")))?;
    item.actions = parsed.actions;
    item.transformations = parsed.transformations;

    if cur_rule.id == 0 {
        if parsed.id == 0 {
            return Err(parse_error("missing ID"));
        }
        cur_rule.id = parsed.id;
    }

    if parsed.phase != 0 {
        if cur_rule.phase != 0 {
            return Err(parse_error("rule chain has conflicting phases"));
        }
        cur_rule.phase = parsed.phase;
    }

    cur_rule.items.push(item);

    if !parsed.chain {
        statements.push(Statement::Rule(std::mem::take(cur_rule)));
    }

    Ok(())
}

fn parse_sec_action(s: &str, statements: &mut Vec<Statement>) -> Result<()> {
    let (raw, s) = parse_raw_actions(s)?;
    ensure_consumed(s)?;

    let parsed = parse_actions(raw)?;
    if parsed.id == 0 {
        return Err(parse_error("missing ID"));
    }

    statements.push(Statement::Action(ActionStmt {
        id: parsed.id,
        phase: parsed.phase,
        actions: parsed.actions,
    }));
    Ok(())
}

fn parse_sec_marker(s: &str, statements: &mut Vec<Statement>) -> Result<()> {
    let (label, s) = next_arg(s);
    ensure_consumed(s)?;
    statements.push(Statement::Marker(Marker { label }));
    Ok(())
}

fn parse_targets(s: &str) -> Result<(Vec<Target>, Vec<Target>, &str)> {
    let (arg, rest) = next_arg(s);
    let mut targets = Vec::new();
    let mut except_targets = Vec::new();
    let mut s = arg.as_str();

    loop {
        let (after, token) = target_token(s).map_err(|_| parse_error("unable to parse targets"))?;
        s = after;

        let (is_negate, token) = match token.strip_prefix('!') {
            Some(t) => (true, t),
            None => (false, token),
        };
        let (is_count, token) = match token.strip_prefix('&') {
            Some(t) => (true, t),
            None => (false, token),
        };

        let (name_str, mut selector) = match token.split_once(':') {
            Some((n, sel)) => (n, sel.to_string()),
            None => (token, String::new()),
        };

        let name = TargetName::from_name(&name_str.to_ascii_uppercase())
            .ok_or_else(|| parse_error(format!("invalid target name: {name_str}")))?;

        if selector.len() >= 2 && selector.starts_with('\'') && selector.ends_with('\'') {
            selector = next_arg(&selector).0;
        }

        let mut is_regex_selector = false;
        if name != TargetName::Xml && selector.len() >= 2 && selector.starts_with('/') && selector.ends_with('/') {
            is_regex_selector = true;
            selector = selector[1..selector.len() - 1].to_string();
            regex::Regex::new(&selector)
                .map_err(|e| parse_error(format!("invalid regex target selector: {e}")))?;
        } else {
            selector = selector.to_lowercase();
        }

        let target = Target {
            name,
            selector,
            is_regex_selector,
            is_count,
        };
        if is_negate {
            except_targets.push(target);
        } else {
            targets.push(target);
        }

        s = arg_space(s);
        if s.is_empty() {
            break;
        }
        if let Some(after) = s.strip_prefix(|c| c == '|' || c == ',') {
            s = arg_space(after);
        }
    }

    Ok((targets, except_targets, rest))
}

fn parse_operator(s: &str) -> Result<(Operator, Value, bool, &str)> {
    let (arg, rest) = next_arg(s);
    let mut body = arg.as_str();

    let neg = match body.strip_prefix('!') {
        Some(b) => {
            body = b;
            true
        }
        None => false,
    };

    let mut op = Operator::Rx;
    if let Ok((after, name)) = operator_name(body) {
        op = Operator::from_name(&name.to_ascii_lowercase()).ok_or_else(|| parse_error("unable to parse operator"))?;
        body = after.trim_start_matches(' ');
    }

    let mut val = parse_value(body)?;

    if op == Operator::ValidateByteRange {
        if val.has_macros() {
            return Err(parse_error("macros in @validateByteRange not supported"));
        }
        val = parse_validate_byte_range(&val.to_string_lossy())?;
    }

    Ok((op, val, neg, rest))
}

/// Key/value pair of the actions argument before interpretation
#[derive(Clone, Debug, PartialEq, Eq)]
struct RawAction {
    key: String,
    val: String,
}

fn parse_raw_actions(s: &str) -> Result<(Vec<RawAction>, &str)> {
    let (arg, rest) = next_arg(s);
    let mut s = arg.trim_matches(|c| matches!(c, ' ' | '\t' | '\r' | '\n'));
    let mut actions = Vec::new();

    while !s.is_empty() {
        let (after, token) = action_token(s).map_err(|_| parse_error("unable to parse actions"))?;
        actions.push(parse_action_key_value(token));

        s = arg_space(after);
        if let Some(after) = s.strip_prefix(',') {
            s = arg_space(after);
        }
    }

    Ok((actions, rest))
}

fn parse_action_key_value(s: &str) -> RawAction {
    let Some((key, val)) = s.split_once(':') else {
        return RawAction {
            key: s.to_ascii_lowercase(),
            val: String::new(),
        };
    };

    let val = match val.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')) {
        Some(quoted) => quoted.replace("\\'", "'"),
        None => val.trim_end().to_string(),
    };

    RawAction {
        key: key.to_ascii_lowercase(),
        val,
    }
}

#[derive(Default)]
struct ParsedActions {
    actions: Vec<Action>,
    id: i64,
    transformations: Vec<Transformation>,
    chain: bool,
    phase: u8,
}

fn parse_actions(raw: Vec<RawAction>) -> Result<ParsedActions> {
    let mut p = ParsedActions::default();

    for RawAction { key, val } in raw {
        match key.as_str() {
            "id" => {
                p.id = val
                    .parse()
                    .map_err(|_| parse_error(format!("invalid rule id: {val}")))?;
            }
            "chain" => {
                p.chain = true;
                p.actions.push(Action::Chain);
            }
            "allow" => p.actions.push(Action::Allow),
            "deny" => p.actions.push(Action::Deny),
            "msg" => p.actions.push(Action::Msg(parse_value(&val)?)),
            "logdata" => p.actions.push(Action::LogData(parse_value(&val)?)),
            "t" => match Transformation::from_name(&val.to_ascii_lowercase()) {
                Some(Transformation::None) => p.transformations.clear(),
                Some(t) => p.transformations.push(t),
                None => return Err(parse_error(format!("unknown transformation: {val}"))),
            },
            "setvar" => p.actions.push(Action::SetVar(parse_setvar(&val)?)),
            "nolog" => p.actions.push(Action::NoLog),
            "log" => p.actions.push(Action::Log),
            "phase" => p.phase = parse_phase(&val)?,
            "skipafter" => p.actions.push(Action::SkipAfter(val)),
            "capture" => p.actions.push(Action::Capture),
            "ctl" => p.actions.push(Action::Ctl(parse_ctl(&val)?)),
            _ => p.actions.push(Action::Raw { key, val }),
        }
    }

    Ok(p)
}

fn parse_phase(s: &str) -> Result<u8> {
    match s {
        "1" => Ok(1),
        "2" | "request" => Ok(2),
        "3" => Ok(3),
        "4" | "response" => Ok(4),
        "5" | "logging" => Ok(5),
        _ => Err(parse_error(format!("unknown phase: {s}"))),
    }
}

/// `[!]variable[=[+-]value]`
fn parse_setvar(parameter: &str) -> Result<SetVarAction> {
    let (delete, body) = match parameter.strip_prefix('!') {
        Some(b) => (true, b),
        None => (false, parameter),
    };

    if body.is_empty() || body.starts_with('=') {
        return Err(parse_error(format!("unsupported parameter {parameter} for setvar operation")));
    }

    let (variable, operator, value) = match body.split_once('=') {
        Some((variable, after)) => match after.as_bytes().first() {
            Some(b'+') => (variable, SetVarOperator::Increment, &after[1..]),
            Some(b'-') => (variable, SetVarOperator::Decrement, &after[1..]),
            _ => (variable, SetVarOperator::Set, after),
        },
        None => (body, SetVarOperator::Set, ""),
    };

    let operator = if delete { SetVarOperator::Delete } else { operator };
    let value = if value.is_empty() { "1" } else { value };

    Ok(SetVarAction {
        variable: parse_value(variable)?,
        operator,
        value: parse_value(value)?,
    })
}

/// `setting=value`
fn parse_ctl(parameter: &str) -> Result<CtlAction> {
    let (setting, value) = parameter
        .split_once('=')
        .filter(|(s, v)| !s.is_empty() && !v.is_empty())
        .ok_or_else(|| parse_error(format!("unsupported parameter {parameter} for ctl operation")))?;

    let setting = CtlSetting::from_name(&setting.to_ascii_lowercase())
        .ok_or_else(|| parse_error(format!("unsupported setting {setting} for ctl operation")))?;

    Ok(CtlAction {
        setting,
        value: parse_value(value)?,
    })
}

/// Parse a string that may contain `%{macro}` references.
pub fn parse_value(s: &str) -> Result<Value> {
    let mut tokens = Vec::new();
    let mut literal_start = 0;
    let mut search = 0;

    while let Some(offset) = s[search..].find("%{") {
        let start = search + offset;
        let Ok((after, name)) = macro_ref(&s[start..]) else {
            search = start + 1;
            continue;
        };

        if literal_start != start {
            tokens.push(Token::Str(s[literal_start..start].as_bytes().to_vec()));
        }
        tokens.push(Token::Macro(parse_macro(name)?));

        let end = s.len() - after.len();
        literal_start = end;
        search = end;
    }

    if !tokens.is_empty() {
        if literal_start != s.len() {
            tokens.push(Token::Str(s[literal_start..].as_bytes().to_vec()));
        }
        return Ok(Value(tokens));
    }

    Ok(match s.parse::<i64>() {
        Ok(n) => Value::int(n),
        Err(_) => Value::string(s.as_bytes().to_vec()),
    })
}

fn parse_macro(m: &str) -> Result<MacroToken> {
    let m = m.to_lowercase();
    let unsupported = || parse_error(format!("unsupported macro {m}"));

    let parts: Vec<&str> = m.split('.').collect();
    match parts.as_slice() {
        [name] => Ok(MacroToken {
            name: EnvVarName::from_name(name).ok_or_else(unsupported)?,
            selector: String::new(),
        }),
        [name, selector] => {
            let name = EnvVarName::from_name(name).ok_or_else(unsupported)?;
            if !name.is_collection() {
                return Err(unsupported());
            }
            if name == EnvVarName::RequestHeaders && *selector != "host" {
                return Err(unsupported());
            }
            Ok(MacroToken {
                name,
                selector: selector.to_string(),
            })
        }
        _ => Err(unsupported()),
    }
}

/// `32-126,9,10` into an allowed-byte set
fn parse_validate_byte_range(s: &str) -> Result<Value> {
    let mut range = ByteRange::empty();

    for part in s.split(',') {
        let bounds: Vec<&str> = part.split('-').map(str::trim).collect();
        match bounds.as_slice() {
            [single] => {
                let b: u8 = single
                    .parse()
                    .map_err(|e| parse_error(format!("failed to parse number in @validateByteRange: {e}")))?;
                range.0[b as usize] = true;
            }
            [from, to] => {
                let from: u8 = from
                    .parse()
                    .map_err(|e| parse_error(format!("failed to parse number in @validateByteRange: {e}")))?;
                let to: u8 = to
                    .parse()
                    .map_err(|e| parse_error(format!("failed to parse number in @validateByteRange: {e}")))?;
                if from >= to {
                    return Err(parse_error("invalid range in @validateByteRange"));
                }
                for b in from..=to {
                    range.0[b as usize] = true;
                }
            }
            _ => return Err(parse_error("invalid @validateByteRange format")),
        }
    }

    Ok(Value(vec![Token::ByteRange(Box::new(range))]))
}

/// Reject scan-phase targets compared against macro values. Their content is
/// consumed while streaming, before any macro could be expanded.
fn check_for_unsupported_features(statements: &[Statement]) -> Result<()> {
    for stmt in statements {
        let Statement::Rule(rule) = stmt else { continue };
        for item in &rule.items {
            let numeric = matches!(item.predicate.op, Operator::Ge | Operator::Gt | Operator::Le | Operator::Lt);
            for t in &item.predicate.targets {
                if t.is_count || numeric {
                    continue;
                }
                if t.name.is_scan_phase() && item.predicate.val.has_macros() {
                    return Err(WafError::Unsupported(format!(
                        "rule {} is scanning for a macro in the scan-phase variable {}, which is unsupported by this SecRule engine",
                        rule.id, t.name
                    )));
                }
            }
        }
    }
    Ok(())
}
