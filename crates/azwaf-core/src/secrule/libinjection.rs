//! Syntactic SQL injection and XSS detection for `@detectSQLi` / `@detectXSS`
//!
//! SQL input is tokenised the way an SQL lexer would see it in three contexts
//! (as-is, after a closing `'`, after a closing `"`). The token types form a
//! short fingerprint such as `s&1o1`, which is checked against known attack
//! shapes. XSS detection walks the input looking for executable markup.

/// Fingerprint length considered per context
const MAX_TOKENS: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tok {
    Str,
    Number,
    Bareword,
    Keyword,
    Union,
    Expression,
    Function,
    Variable,
    Operator,
    Logic,
    Comment,
    LeftParen,
    RightParen,
    Comma,
    Semicolon,
}

impl Tok {
    fn code(self) -> char {
        match self {
            Tok::Str => 's',
            Tok::Number => '1',
            Tok::Bareword => 'n',
            Tok::Keyword => 'k',
            Tok::Union => 'U',
            Tok::Expression => 'E',
            Tok::Function => 'f',
            Tok::Variable => 'v',
            Tok::Operator => 'o',
            Tok::Logic => '&',
            Tok::Comment => 'c',
            Tok::LeftParen => '(',
            Tok::RightParen => ')',
            Tok::Comma => ',',
            Tok::Semicolon => ';',
        }
    }

    fn is_operand(self) -> bool {
        matches!(self, Tok::Str | Tok::Number | Tok::Bareword | Tok::Variable)
    }
}

const EXPRESSION_WORDS: &[&str] = &[
    "select", "insert", "update", "delete", "drop", "create", "alter", "truncate", "exec", "execute", "declare",
    "shutdown", "grant", "revoke", "replace", "merge", "call",
];

const KEYWORDS: &[&str] = &[
    "from", "where", "into", "values", "table", "database", "having", "group", "order", "by", "limit", "offset",
    "join", "case", "when", "then", "else", "end", "as", "set", "like", "rlike", "regexp", "between", "is", "null",
    "not", "in", "exists", "waitfor", "delay", "procedure", "information_schema", "all", "distinct",
];

const FUNCTIONS: &[&str] = &[
    "sleep", "benchmark", "char", "chr", "concat", "concat_ws", "load_file", "version", "user", "database",
    "substring", "substr", "ascii", "hex", "unhex", "md5", "count", "cast", "convert", "extractvalue",
    "updatexml", "pg_sleep", "group_concat", "if", "ifnull", "coalesce", "xp_cmdshell", "sp_executesql",
];

fn classify_word(word: &str, next_non_space: Option<u8>) -> Tok {
    let lower = word.to_ascii_lowercase();
    match lower.as_str() {
        "union" => Tok::Union,
        "and" | "or" | "xor" | "div" | "mod" => Tok::Logic,
        w if EXPRESSION_WORDS.contains(&w) => Tok::Expression,
        w if next_non_space == Some(b'(') && FUNCTIONS.contains(&w) => Tok::Function,
        w if KEYWORDS.contains(&w) => Tok::Keyword,
        w if w.starts_with("xp_") || w.starts_with("sp_") => Tok::Function,
        _ => Tok::Bareword,
    }
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c == b'.' || c >= 0x80
}

/// Tokenise `input`. With `quote` set, the input starts inside a string
/// literal delimited by that character.
fn tokenize(input: &[u8], quote: Option<u8>) -> Vec<Tok> {
    let mut toks = Vec::new();
    let mut i = 0;

    if let Some(q) = quote {
        match memchr::memchr(q, input) {
            Some(end) => {
                toks.push(Tok::Str);
                i = end + 1;
            }
            None => return vec![Tok::Str],
        }
    }

    while i < input.len() && toks.len() < MAX_TOKENS {
        let c = input[i];
        let rest = &input[i..];

        if c.is_ascii_whitespace() || c == 0x0b || c == 0xa0 {
            i += 1;
            continue;
        }

        if rest.starts_with(b"--") || c == b'#' {
            toks.push(Tok::Comment);
            break;
        }
        if rest.starts_with(b"/*") {
            toks.push(Tok::Comment);
            i = match memchr::memmem::find(&rest[2..], b"*/") {
                Some(end) => i + 2 + end + 2,
                None => input.len(),
            };
            continue;
        }

        match c {
            b'\'' | b'"' | b'`' => {
                let end = memchr::memchr(c, &rest[1..]).map_or(input.len(), |e| i + 1 + e + 1);
                push_folded(&mut toks, Tok::Str);
                i = end;
            }
            b'0'..=b'9' => {
                let len = rest
                    .iter()
                    .take_while(|&&b| b.is_ascii_hexdigit() || matches!(b, b'.' | b'x' | b'X'))
                    .count();
                toks.push(Tok::Number);
                i += len;
            }
            b'@' => {
                let len = 1 + rest[1..].iter().take_while(|&&b| is_word_byte(b) || b == b'@').count();
                toks.push(Tok::Variable);
                i += len;
            }
            b'(' => {
                toks.push(Tok::LeftParen);
                i += 1;
            }
            b')' => {
                toks.push(Tok::RightParen);
                i += 1;
            }
            b',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            b';' => {
                toks.push(Tok::Semicolon);
                i += 1;
            }
            b'&' | b'|' if rest.get(1) == Some(&c) => {
                toks.push(Tok::Logic);
                i += 2;
            }
            b'=' | b'<' | b'>' | b'!' | b'+' | b'-' | b'*' | b'/' | b'%' | b'^' | b'~' | b'&' | b'|' => {
                let len = rest.iter().take(3).take_while(|&&b| matches!(b, b'=' | b'<' | b'>' | b'!')).count().max(1);
                toks.push(Tok::Operator);
                i += len;
            }
            c if is_word_byte(c) => {
                let len = rest.iter().take_while(|&&b| is_word_byte(b)).count();
                let word = String::from_utf8_lossy(&rest[..len]);
                let next = rest[len..].iter().copied().find(|b| !b.is_ascii_whitespace());
                toks.push(classify_word(&word, next));
                i += len;
            }
            _ => i += 1,
        }
    }

    toks
}

fn push_folded(toks: &mut Vec<Tok>, t: Tok) {
    if t == Tok::Str && toks.last() == Some(&Tok::Str) {
        return;
    }
    toks.push(t);
}

/// True when the token shape matches an injection
fn is_attack_shape(toks: &[Tok], quoted: bool) -> bool {
    let at = |i: usize| toks.get(i).copied();

    for (i, &t) in toks.iter().enumerate() {
        match t {
            // union select
            Tok::Union => {
                if matches!(at(i + 1), Some(Tok::Expression) | Some(Tok::Keyword) | Some(Tok::LeftParen)) {
                    return true;
                }
            }
            // stacked query
            Tok::Semicolon => {
                if matches!(at(i + 1), Some(Tok::Expression)) {
                    return true;
                }
            }
            // tautology: x' or '1'='1, 1 or 1=1
            Tok::Logic if i > 0 && toks[i - 1].is_operand() || i > 0 && toks[i - 1] == Tok::RightParen => {
                let mut j = i + 1;
                while at(j) == Some(Tok::LeftParen) {
                    j += 1;
                }
                let rhs = at(j);
                if matches!(rhs, Some(Tok::Function)) {
                    return true;
                }
                if rhs.is_some_and(Tok::is_operand) {
                    if quoted && i == 1 {
                        return true;
                    }
                    if at(j + 1) == Some(Tok::Operator) && at(j + 2).is_some_and(Tok::is_operand) {
                        return true;
                    }
                }
            }
            // sleep(, benchmark( directly after the break-out
            Tok::Function => {
                if at(i + 1) == Some(Tok::LeftParen) && (i == 0 || quoted) {
                    return true;
                }
            }
            Tok::Expression => {
                if i == 0 || quoted || matches!(at(i.wrapping_sub(1)), Some(Tok::LeftParen) | Some(Tok::Semicolon)) {
                    let has_clause = toks[i + 1..].contains(&Tok::Keyword);
                    let has_target = toks[i + 1..].iter().any(|t| t.is_operand() || *t == Tok::Operator);
                    if has_clause && has_target {
                        return true;
                    }
                }
            }
            _ => {}
        }
    }

    // admin'-- , admin'#
    quoted && matches!(toks, [Tok::Str, Tok::Comment, ..] | [Tok::Str, Tok::Operator, Tok::Comment, ..])
}

/// Detect SQL injection. Returns the fingerprint of the offending context.
pub fn is_sqli(input: &[u8]) -> Option<String> {
    if input.is_empty() {
        return None;
    }

    let mut contexts: Vec<(Option<u8>, bool)> = vec![(None, false)];
    if input.contains(&b'\'') {
        contexts.push((Some(b'\''), true));
    }
    if input.contains(&b'"') {
        contexts.push((Some(b'"'), true));
    }

    for (quote, quoted) in contexts {
        let toks = tokenize(input, quote);
        if is_attack_shape(&toks, quoted) {
            return Some(toks.iter().map(|t| t.code()).collect());
        }
    }
    None
}

const DANGEROUS_TAGS: &[&[u8]] = &[
    b"script", b"iframe", b"object", b"embed", b"applet", b"svg", b"math", b"frameset", b"frame", b"base",
    b"link", b"meta", b"style", b"xss", b"isindex", b"vmlframe",
];

const EVENT_NAMES: &[&[u8]] = &[
    b"abort", b"animationend", b"animationstart", b"beforeunload", b"begin", b"blur", b"change", b"click",
    b"contextmenu", b"copy", b"cut", b"dblclick", b"drag", b"drop", b"end", b"error", b"focus", b"focusin",
    b"hashchange", b"input", b"keydown", b"keypress", b"keyup", b"load", b"message", b"mousedown",
    b"mouseenter", b"mouseleave", b"mousemove", b"mouseout", b"mouseover", b"mouseup", b"paste", b"pointerover",
    b"readystatechange", b"repeat", b"reset", b"resize", b"scroll", b"select", b"start", b"submit", b"toggle",
    b"transitionend", b"unload", b"wheel",
];

const DANGEROUS_SCHEMES: &[&[u8]] = &[b"javascript:", b"vbscript:", b"livescript:", b"data:text/html"];

/// Lower-cased copy without NULs, tabs and newlines, which browsers skip
/// inside tag names and URL schemes
fn normalize_markup(input: &[u8]) -> Vec<u8> {
    input
        .iter()
        .filter(|&&c| !matches!(c, 0 | b'\t' | b'\n' | b'\r'))
        .map(u8::to_ascii_lowercase)
        .collect()
}

fn starts_with_any(s: &[u8], words: &[&[u8]]) -> Option<usize> {
    words.iter().find(|w| s.starts_with(w)).map(|w| w.len())
}

/// Detect cross-site scripting markup
pub fn is_xss(input: &[u8]) -> bool {
    let s = normalize_markup(input);

    for (i, &c) in s.iter().enumerate() {
        match c {
            b'<' => {
                let mut j = i + 1;
                if s.get(j) == Some(&b'/') {
                    j += 1;
                }
                if let Some(len) = starts_with_any(&s[j..], DANGEROUS_TAGS) {
                    let after = s.get(j + len).copied();
                    if after.map_or(true, |a| !a.is_ascii_alphanumeric()) {
                        return true;
                    }
                }
                // <!-- and <? can hide script in legacy parsers
                if s[j..].starts_with(b"?") || s[j..].starts_with(b"!--") && s[j..].windows(6).any(|w| w == b"script") {
                    return true;
                }
            }
            b'o' => {
                let boundary = i == 0 || matches!(s[i - 1], b' ' | b'/' | b'"' | b'\'' | b'`' | b';' | 0x0b | 0x0c);
                if boundary && s[i..].starts_with(b"on") {
                    let len = s[i + 2..].iter().take_while(|b| b.is_ascii_alphabetic()).count();
                    if EVENT_NAMES.contains(&&s[i + 2..i + 2 + len]) {
                        let rest = &s[i + 2 + len..];
                        let eq = rest.iter().position(|&b| b != b' ').map(|p| rest[p] == b'=');
                        if eq == Some(true) {
                            return true;
                        }
                    }
                }
            }
            b'j' | b'v' | b'l' | b'd' => {
                let boundary = i == 0 || !s[i - 1].is_ascii_alphanumeric();
                if boundary && starts_with_any(&s[i..], DANGEROUS_SCHEMES).is_some() {
                    return true;
                }
            }
            b'e' => {
                if s[i..].starts_with(b"expression(") {
                    return true;
                }
            }
            _ => {}
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqli_detected() {
        for attack in [
            "1' or '1'='1",
            "admin'--",
            "1 union select password from users",
            "x'; drop table users; --",
            "1 or 1=1",
            "' or sleep(5)#",
            "1) or (1=1",
            "\" or \"\"=\"",
            "select * from users where id = 1",
        ] {
            assert!(is_sqli(attack.as_bytes()).is_some(), "{attack}");
        }
    }

    #[test]
    fn test_sqli_fingerprint() {
        assert_eq!(is_sqli(b"1 union select 2").as_deref(), Some("1UE1"));
        assert_eq!(is_sqli(b"admin'--").as_deref(), Some("sc"));
    }

    #[test]
    fn test_sqli_benign() {
        for benign in [
            "",
            "hello world",
            "O'Reilly",
            "rock and roll",
            "Please select your option from the list",
            "john.doe@example.com",
            "1234",
            "a-b-c",
        ] {
            assert!(is_sqli(benign.as_bytes()).is_none(), "{benign}");
        }
    }

    #[test]
    fn test_xss_detected() {
        for attack in [
            "<script>alert(1)</script>",
            "<img src=x onerror=alert(1)>",
            "\" onmouseover=\"alert(1)",
            "<a href=\"javascript:alert(1)\">x</a>",
            "<a href=\"java\tscript:alert(1)\">x</a>",
            "<IFRAME SRC=x>",
            "<svg/onload=alert(1)>",
            "<div style=\"width: expression(alert(1))\">",
        ] {
            assert!(is_xss(attack.as_bytes()), "{attack}");
        }
    }

    #[test]
    fn test_xss_benign() {
        for benign in [
            "hello world",
            "a < b and c > d",
            "the onion router",
            "question=answer",
            "<b>bold</b>",
            "scriptures",
        ] {
            assert!(!is_xss(benign.as_bytes()), "{benign}");
        }
    }
}
