//! PCRE compatibility layer
//!
//! CRS regexes are written for PCRE. The verifier engine has no possessive
//! quantifiers and treats `\xHH` as a code point rather than a byte, so every
//! expression is normalised here before compilation.

use crate::{Result, WafError};
use regex::bytes::{Regex, RegexBuilder};

/// Expression ready for both the prefilter and the verifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedRegex {
    pub expr: String,
    pub binary: bool,
}

/// Remove PCRE possessive quantifiers (`++`, `*+`, `?+`, `{n,m}+`).
///
/// The verifier never backtracks, so the possessive hint carries no meaning
/// and only needs to be dropped.
pub fn remove_possessive_quantifiers(expr: &str) -> String {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = String::with_capacity(expr.len());
    let mut i = 0;
    let mut class_start: Option<usize> = None;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
                continue;
            }
            '[' if class_start.is_none() => class_start = Some(i),
            ']' if class_start.is_some() => {
                // `[]` and `[^]` open with a literal bracket
                let start = class_start.unwrap_or(i);
                let literal = i == start + 1 || (i == start + 2 && chars[start + 1] == '^');
                if !literal {
                    class_start = None;
                }
            }
            '+' | '*' | '?' if class_start.is_none() => {
                out.push(c);
                i += if chars.get(i + 1) == Some(&'+') { 2 } else { 1 };
                continue;
            }
            '{' if class_start.is_none() => {
                if let Some(len) = counted_repetition_len(&chars[i..]) {
                    out.extend(&chars[i..i + len]);
                    i += len;
                    if chars.get(i) == Some(&'+') {
                        i += 1;
                    }
                    continue;
                }
            }
            _ => {}
        }
        out.push(c);
        i += 1;
    }

    out
}

/// Length of a `{n}`, `{n,}` or `{n,m}` quantifier at the start of `s`
fn counted_repetition_len(s: &[char]) -> Option<usize> {
    let mut i = 1;
    let digits = |from: usize| s[from..].iter().take_while(|c| c.is_ascii_digit()).count();

    let n = digits(i);
    if n == 0 {
        return None;
    }
    i += n;
    if s.get(i) == Some(&',') {
        i += 1;
        i += digits(i);
    }
    if s.get(i) == Some(&'}') {
        Some(i + 1)
    } else {
        None
    }
}

/// True if the expression contains an unescaped `\xHH` escape
pub fn contains_hex_escaped_bytes(expr: &str) -> bool {
    let b = expr.as_bytes();
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' {
            if b.get(i + 1) == Some(&b'x')
                && b.get(i + 2).map_or(false, u8::is_ascii_hexdigit)
                && b.get(i + 3).map_or(false, u8::is_ascii_hexdigit)
            {
                return true;
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    false
}

/// Rewrite bytes outside printable ASCII as `\xHH`. Returns whether any were found.
pub fn escape_non_printable(expr: &str) -> (String, bool) {
    let mut out = String::with_capacity(expr.len());
    let mut found = false;
    for &b in expr.as_bytes() {
        if (b' '..=b'~').contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{:02X}", b));
            found = true;
        }
    }
    (out, found)
}

/// Normalise a PCRE expression for the byte-oriented engines.
pub fn prepare(expr: &str) -> PreparedRegex {
    let stripped = remove_possessive_quantifiers(expr);
    let (escaped, had_raw_bytes) = escape_non_printable(&stripped);
    let binary = had_raw_bytes || contains_hex_escaped_bytes(&escaped);
    let expr = if binary {
        format!("(?-u){escaped}")
    } else {
        escaped
    };

    PreparedRegex { expr, binary }
}

/// Compile a prepared expression for verification.
pub fn compile(expr: &str) -> Result<Regex> {
    RegexBuilder::new(expr)
        .size_limit(64 << 20)
        .build()
        .map_err(|e| WafError::Regex(format!("failed to compile regex pattern {expr}: {e}")))
}
