//! Content transformations (`t:` actions)
//!
//! Transformations work on raw bytes. A pipeline is applied in order; `t:none`
//! inside a pipeline restarts from the untransformed content.

use super::ast::Transformation;
use crate::encoding::{hex_pair, url_encode, weak_url_unescape, weak_url_unescape_uni};
use sha1::{Digest, Sha1};
use std::borrow::Cow;
use std::collections::HashMap;

/// Whitespace as the SecRule language defines it, including NBSP
fn is_secrule_space(c: u8) -> bool {
    matches!(c, b' ' | 0x0c | b'\t' | b'\n' | b'\r' | 0x0b | 0xa0)
}

fn is_c_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// Apply a single transformation. `None` is the identity here.
pub fn apply(t: Transformation, input: &[u8]) -> Cow<'_, [u8]> {
    match t {
        Transformation::None => Cow::Borrowed(input),
        Transformation::CmdLine => Cow::Owned(cmd_line(input)),
        Transformation::CompressWhitespace => compress_whitespace(input),
        Transformation::CssDecode => css_decode(input),
        Transformation::HexEncode => Cow::Owned(hex::encode(input).into_bytes()),
        Transformation::HtmlEntityDecode => html_entity_decode(input),
        Transformation::JsDecode => js_decode(input),
        Transformation::Length => Cow::Owned(input.len().to_string().into_bytes()),
        Transformation::Lowercase => {
            if input.iter().any(u8::is_ascii_uppercase) {
                Cow::Owned(input.to_ascii_lowercase())
            } else {
                Cow::Borrowed(input)
            }
        }
        Transformation::NormalisePath | Transformation::NormalizePath => Cow::Owned(normalize_path(input)),
        Transformation::NormalisePathWin | Transformation::NormalizePathWin => {
            let slashed: Vec<u8> = input.iter().map(|&c| if c == b'\\' { b'/' } else { c }).collect();
            Cow::Owned(normalize_path(&slashed))
        }
        Transformation::RemoveComments => remove_comments(input),
        Transformation::RemoveNulls => {
            if input.contains(&0) {
                Cow::Owned(input.iter().copied().filter(|&c| c != 0).collect())
            } else {
                Cow::Borrowed(input)
            }
        }
        Transformation::RemoveWhitespace => {
            if input.iter().any(|&c| is_secrule_space(c)) {
                Cow::Owned(input.iter().copied().filter(|&c| !is_secrule_space(c)).collect())
            } else {
                Cow::Borrowed(input)
            }
        }
        Transformation::ReplaceComments => replace_comments(input),
        Transformation::Sha1 => Cow::Owned(Sha1::digest(input).to_vec()),
        Transformation::Trim => {
            let start = input.iter().position(|&c| !is_c_space(c)).unwrap_or(input.len());
            let end = input.iter().rposition(|&c| !is_c_space(c)).map_or(start, |p| p + 1);
            Cow::Borrowed(&input[start..end.max(start)])
        }
        Transformation::UrlDecode => {
            if input.contains(&b'%') || input.contains(&b'+') {
                Cow::Owned(weak_url_unescape(input))
            } else {
                Cow::Borrowed(input)
            }
        }
        Transformation::UrlDecodeUni => {
            if input.contains(&b'%') || input.contains(&b'+') {
                Cow::Owned(weak_url_unescape_uni(input))
            } else {
                Cow::Borrowed(input)
            }
        }
        Transformation::UrlEncode => Cow::Owned(url_encode(input)),
        Transformation::Utf8ToUnicode => utf8_to_unicode(input),
    }
}

/// Apply a whole pipeline.
pub fn apply_pipeline<'a>(input: &'a [u8], pipeline: &[Transformation]) -> Cow<'a, [u8]> {
    let mut cur: Cow<'a, [u8]> = Cow::Borrowed(input);
    for &t in pipeline {
        if t == Transformation::None {
            cur = Cow::Borrowed(input);
            continue;
        }
        let next = match apply(t, &cur) {
            Cow::Owned(o) => Some(o),
            Cow::Borrowed(b) if b.len() != cur.len() => Some(b.to_vec()),
            Cow::Borrowed(_) => None,
        };
        if let Some(o) = next {
            cur = Cow::Owned(o);
        }
    }
    cur
}

/// Memo of pipeline prefixes applied to one field's content.
///
/// Scan groups with pipelines such as `[UrlDecodeUni]` and
/// `[UrlDecodeUni, Lowercase]` share the work of the common prefix.
#[derive(Debug, Default)]
pub struct TransformCache {
    results: HashMap<Vec<Transformation>, Vec<u8>>,
}

impl TransformCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget results; call when moving on to another field.
    pub fn clear(&mut self) {
        self.results.clear();
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result of `pipeline` over `input`, reusing the longest cached prefix.
    pub fn transformed<'s>(&'s mut self, input: &'s [u8], pipeline: &[Transformation]) -> &'s [u8] {
        if pipeline.is_empty() {
            return input;
        }

        if !self.results.contains_key(pipeline) {
            let cached = (1..pipeline.len())
                .rev()
                .find_map(|k| self.results.get(&pipeline[..k]).map(|v| (k, v.clone())));
            let (mut done, mut cur) = cached.unwrap_or_else(|| (0, input.to_vec()));

            while done < pipeline.len() {
                let t = pipeline[done];
                cur = if t == Transformation::None {
                    input.to_vec()
                } else {
                    apply(t, &cur).into_owned()
                };
                done += 1;
                self.results.insert(pipeline[..done].to_vec(), cur.clone());
            }
        }

        self.results.get(pipeline).map_or(input, Vec::as_slice)
    }
}

fn compress_whitespace(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.iter().any(|&c| is_secrule_space(c) && c != b' ') && !input.windows(2).any(|w| w == b"  ") {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut in_space = false;
    for &c in input {
        if is_secrule_space(c) {
            if !in_space {
                out.push(b' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    Cow::Owned(out)
}

/// Windows/Unix command line normalisation.
fn cmd_line(input: &[u8]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(input.len());
    let mut space = false;
    for &c in input {
        match c {
            b'"' | b'\'' | b'\\' | b'^' => {}
            b' ' | b',' | b';' | b'\t' | b'\r' | b'\n' => {
                if !space {
                    out.push(b' ');
                    space = true;
                }
            }
            b'/' | b'(' => {
                if space {
                    out.pop();
                }
                space = false;
                out.push(c);
            }
            _ => {
                out.push(c.to_ascii_lowercase());
                space = false;
            }
        }
    }
    out
}

fn fold_full_width(cp: u32) -> u32 {
    if (0xff01..=0xff5e).contains(&cp) {
        (cp & 0xff) + 0x20
    } else {
        cp
    }
}

fn css_decode(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.contains(&b'\\') {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'\\' {
            out.push(input[i]);
            i += 1;
            continue;
        }

        i += 1;
        let Some(&next) = input.get(i) else { break };

        let digits = input[i..]
            .iter()
            .take(6)
            .take_while(|c| c.is_ascii_hexdigit())
            .count();
        if digits > 0 {
            let mut cp = 0u32;
            for &c in &input[i..i + digits] {
                cp = cp << 4 | (c as char).to_digit(16).unwrap_or(0);
            }
            let cp = fold_full_width(cp);
            out.push((cp & 0xff) as u8);
            i += digits;
            if input.get(i).is_some_and(|&c| is_c_space(c)) {
                i += 1;
            }
        } else if next == b'\n' {
            i += 1;
        } else {
            out.push(next);
            i += 1;
        }
    }
    Cow::Owned(out)
}

fn html_entity_decode(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.contains(&b'&') {
        return Cow::Borrowed(input);
    }

    const NAMED: &[(&[u8], u8)] = &[
        (b"quot", b'"'),
        (b"amp", b'&'),
        (b"lt", b'<'),
        (b"gt", b'>'),
        (b"nbsp", 0xa0),
        (b"apos", b'\''),
    ];

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'&' {
            out.push(input[i]);
            i += 1;
            continue;
        }

        let rest = &input[i + 1..];
        let mut decoded = None;

        if let Some(num) = rest.strip_prefix(b"#") {
            let (hex, digits_at) = match num.first() {
                Some(b'x') | Some(b'X') => (true, 1),
                _ => (false, 0),
            };
            let digits = num[digits_at..]
                .iter()
                .take_while(|c| if hex { c.is_ascii_hexdigit() } else { c.is_ascii_digit() })
                .count();
            if digits > 0 {
                let text = String::from_utf8_lossy(&num[digits_at..digits_at + digits]);
                let value = u32::from_str_radix(&text, if hex { 16 } else { 10 }).unwrap_or(u32::MAX);
                let mut consumed = 1 + 1 + digits_at + digits;
                if num.get(digits_at + digits) == Some(&b';') {
                    consumed += 1;
                }
                decoded = Some(((value & 0xff) as u8, consumed));
            }
        } else {
            for (name, byte) in NAMED {
                if rest.len() >= name.len() && rest[..name.len()].eq_ignore_ascii_case(name) {
                    let mut consumed = 1 + name.len();
                    if rest.get(name.len()) == Some(&b';') {
                        consumed += 1;
                    }
                    decoded = Some((*byte, consumed));
                    break;
                }
            }
        }

        match decoded {
            Some((b, consumed)) => {
                out.push(b);
                i += consumed;
            }
            None => {
                out.push(b'&');
                i += 1;
            }
        }
    }
    Cow::Owned(out)
}

fn push_code_point(out: &mut Vec<u8>, cp: u32) {
    let c = char::from_u32(fold_full_width(cp)).unwrap_or(char::REPLACEMENT_CHARACTER);
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    std::str::from_utf8(digits).ok().and_then(|s| u32::from_str_radix(s, 16).ok())
}

/// JavaScript string-literal unescaping.
///
/// Malformed escapes are written out without their backslash.
fn js_decode(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.contains(&b'\\') {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] != b'\\' {
            out.push(input[i]);
            i += 1;
            continue;
        }

        let Some(&c) = input.get(i + 1) else {
            break;
        };
        match c {
            b'\'' | b'"' | b'\\' => {
                out.push(c);
                i += 2;
            }
            b'b' => {
                out.push(0x08);
                i += 2;
            }
            b'f' => {
                out.push(0x0c);
                i += 2;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'v' => {
                out.push(0x0b);
                i += 2;
            }
            b'x' => match hex_pair(input, i + 2) {
                Some(b) => {
                    out.push(b);
                    i += 4;
                }
                None => {
                    out.push(b'x');
                    i += 2;
                }
            },
            b'u' if input.get(i + 2) == Some(&b'{') => {
                let body = &input[i + 3..];
                let digits = body.iter().take_while(|c| c.is_ascii_hexdigit()).count();
                let closed = body.get(digits) == Some(&b'}');
                match parse_hex(&body[..digits]).filter(|&cp| closed && cp <= 0x10ffff) {
                    Some(cp) => {
                        push_code_point(&mut out, cp);
                        i += 3 + digits + 1;
                    }
                    None => {
                        // Drop only the backslash, keeping the text up to the offending byte
                        let end = (i + 3 + digits + 1).min(input.len());
                        out.extend_from_slice(&input[i + 1..end]);
                        i = end;
                    }
                }
            }
            b'u' => {
                let body = &input[(i + 2).min(input.len())..];
                let digits = body.iter().take(4).take_while(|c| c.is_ascii_hexdigit()).count();
                match parse_hex(&body[..digits]).filter(|_| digits == 4) {
                    Some(cp) => {
                        push_code_point(&mut out, cp);
                        i += 6;
                    }
                    None => {
                        out.push(b'u');
                        i += 2;
                    }
                }
            }
            b'0'..=b'7' => {
                let digits = input[i + 1..]
                    .iter()
                    .take(3)
                    .take_while(|c| (b'0'..=b'7').contains(*c))
                    .count();
                let mut v = 0u32;
                for &d in &input[i + 1..i + 1 + digits] {
                    v = v * 8 + u32::from(d - b'0');
                }
                out.push((v & 0xff) as u8);
                i += 1 + digits;
            }
            _ => {
                out.push(c);
                i += 2;
            }
        }
    }
    Cow::Owned(out)
}

/// Resolve `.`, `..` and repeated slashes
fn normalize_path(input: &[u8]) -> Vec<u8> {
    if input.is_empty() {
        return Vec::new();
    }

    let absolute = input[0] == b'/';
    let trailing = input.ends_with(b"/") || input.ends_with(b"/.") || input.ends_with(b"/..") || input == b"." || input == b"..";

    let mut segments: Vec<&[u8]> = Vec::new();
    for seg in input.split(|&c| c == b'/') {
        match seg {
            b"" | b"." => {}
            b".." => match segments.last() {
                Some(&last) if last != b".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(seg),
            },
            _ => segments.push(seg),
        }
    }

    let mut out = Vec::with_capacity(input.len());
    if absolute {
        out.push(b'/');
    }
    out.extend_from_slice(&segments.join(&b'/'));
    if trailing && !segments.is_empty() {
        out.push(b'/');
    }
    out
}

fn remove_comments(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.iter().any(|&c| matches!(c, b'/' | b'<' | b'-' | b'#')) {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let rest = &input[i..];
        if rest.starts_with(b"/*") {
            match memchr::memmem::find(&rest[2..], b"*/") {
                Some(end) => i += 2 + end + 2,
                None => {
                    out.push(b' ');
                    break;
                }
            }
        } else if rest.starts_with(b"<!--") {
            match memchr::memmem::find(&rest[4..], b"-->") {
                Some(end) => i += 4 + end + 3,
                None => {
                    out.push(b' ');
                    break;
                }
            }
        } else if rest.starts_with(b"--") || rest[0] == b'#' {
            break;
        } else {
            out.push(rest[0]);
            i += 1;
        }
    }
    Cow::Owned(out)
}

fn replace_comments(input: &[u8]) -> Cow<'_, [u8]> {
    if memchr::memmem::find(input, b"/*").is_none() {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i..].starts_with(b"/*") {
            out.push(b' ');
            match memchr::memmem::find(&input[i + 2..], b"*/") {
                Some(end) => i += 2 + end + 2,
                None => break,
            }
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Cow::Owned(out)
}

/// Multi-byte UTF-8 sequences become `%uHHHH`
fn utf8_to_unicode(input: &[u8]) -> Cow<'_, [u8]> {
    if input.is_ascii() {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len() * 2);
    let mut rest = input;
    while !rest.is_empty() {
        let (valid, invalid_len) = match std::str::from_utf8(rest) {
            Ok(s) => (s, 0),
            Err(e) => {
                let valid = std::str::from_utf8(&rest[..e.valid_up_to()]).unwrap_or_default();
                (valid, e.error_len().unwrap_or(rest.len() - e.valid_up_to()))
            }
        };

        for c in valid.chars() {
            if c.is_ascii() {
                out.push(c as u8);
            } else {
                out.extend_from_slice(format!("%u{:04x}", c as u32).as_bytes());
            }
        }

        let consumed = valid.len();
        out.extend_from_slice(&rest[consumed..consumed + invalid_len]);
        rest = &rest[consumed + invalid_len..];
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use Transformation as T;

    fn t(tr: Transformation, input: &str) -> Vec<u8> {
        apply(tr, input.as_bytes()).into_owned()
    }

    #[test]
    fn test_simple_transformations() {
        assert_eq!(t(T::Lowercase, "AbC"), b"abc");
        assert_eq!(t(T::Length, "hello"), b"5");
        assert_eq!(t(T::RemoveNulls, "a\0b"), b"ab");
        assert_eq!(t(T::RemoveWhitespace, " a \t b\n"), b"ab");
        assert_eq!(t(T::CompressWhitespace, "a  \t b\x0bc"), b"a b c");
        assert_eq!(t(T::Trim, " \t abc \n"), b"abc");
        assert_eq!(t(T::Trim, "   "), b"");
        assert_eq!(t(T::HexEncode, "ab"), b"6162");
        assert_eq!(t(T::UrlDecode, "a%20b+c"), b"a b c");
        assert_eq!(t(T::UrlDecodeUni, "%u0041%uff1c"), b"A<");
        assert_eq!(t(T::UrlEncode, "a b"), b"a+b");
    }

    #[test]
    fn test_sha1() {
        assert_eq!(
            hex::encode(t(T::Sha1, "abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_cmd_line() {
        assert_eq!(t(T::CmdLine, "C^O\"M'M\\A^N^D  /C"), b"command/c");
        assert_eq!(t(T::CmdLine, "echo , ; (x)"), b"echo(x)");
    }

    #[test]
    fn test_css_decode() {
        assert_eq!(t(T::CssDecode, "\\61 bc"), b"abc");
        assert_eq!(t(T::CssDecode, "\\ff1c"), b"<");
        assert_eq!(t(T::CssDecode, "a\\\nb\\z"), b"abz");
    }

    #[test]
    fn test_html_entity_decode() {
        assert_eq!(t(T::HtmlEntityDecode, "&lt;script&gt;"), b"<script>");
        assert_eq!(t(T::HtmlEntityDecode, "&#60;&#x3e;&#X3C"), b"<><");
        assert_eq!(t(T::HtmlEntityDecode, "&QUOT;&amp&unknown;"), b"\"&&unknown;");
        assert_eq!(t(T::HtmlEntityDecode, "a & b"), b"a & b");
    }

    #[test]
    fn test_js_decode() {
        assert_eq!(t(T::JsDecode, r#"\x41\u0042\u{43}\n"#), b"ABC\n");
        assert_eq!(t(T::JsDecode, r"\uff1c"), b"<");
        assert_eq!(t(T::JsDecode, r"\101\60"), b"A0");
        assert_eq!(t(T::JsDecode, r"\q\xZZ"), b"qxZZ");
        assert_eq!(t(T::JsDecode, r"\u12"), b"u12");
        assert_eq!(t(T::JsDecode, "\\u4f60"), "你".as_bytes());
        assert_eq!(t(T::JsDecode, "end\\"), b"end");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(t(T::NormalizePath, "/a/b/../c/./d//e"), b"/a/c/d/e");
        assert_eq!(t(T::NormalizePath, "/../../etc/passwd"), b"/etc/passwd");
        assert_eq!(t(T::NormalizePath, "a/../../b/"), b"../b/");
        assert_eq!(t(T::NormalisePathWin, "C:\\x\\..\\y"), b"C:/y");
    }

    #[test]
    fn test_comments() {
        assert_eq!(t(T::RemoveComments, "a/*x*/b<!--y-->c"), b"abc");
        assert_eq!(t(T::RemoveComments, "1 or 1=1-- rest"), b"1 or 1=1");
        assert_eq!(t(T::RemoveComments, "a/*open"), b"a ");
        assert_eq!(t(T::ReplaceComments, "a/*x*/b/*c"), b"a b ");
        assert_eq!(t(T::ReplaceComments, "a*/b"), b"a*/b");
    }

    #[test]
    fn test_utf8_to_unicode() {
        assert_eq!(t(T::Utf8ToUnicode, "a你b"), b"a%u4f60b");
        assert_eq!(apply(T::Utf8ToUnicode, b"a\xffb").as_ref(), b"a\xffb");
    }

    #[test]
    fn test_pipeline_with_none() {
        let out = apply_pipeline(b"A%20B", &[T::Lowercase, T::None, T::UrlDecode]);
        assert_eq!(out.as_ref(), b"A B");
    }

    #[test]
    fn test_cache_shares_prefixes() {
        let mut cache = TransformCache::new();
        let input = b"A%41b";
        assert_eq!(cache.transformed(input, &[T::UrlDecode]), b"AAb");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.transformed(input, &[T::UrlDecode, T::Lowercase]), b"aab");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.transformed(input, &[]), input);

        cache.clear();
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn prop_lowercase_idempotent(input in proptest::collection::vec(any::<u8>(), 0..64)) {
            let once = apply(T::Lowercase, &input).into_owned();
            let twice = apply(T::Lowercase, &once).into_owned();
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn prop_none_is_identity(input in proptest::collection::vec(any::<u8>(), 0..64)) {
            let out = apply(T::None, &input);
            prop_assert_eq!(out.as_ref(), input.as_slice());
            let out = apply_pipeline(&input, &[T::None]);
            prop_assert_eq!(out.as_ref(), input.as_slice());
        }

        #[test]
        fn prop_cache_matches_pipeline(input in "[A-Za-z%0-9 +]{0,24}") {
            let pipeline = [T::UrlDecode, T::Lowercase, T::CompressWhitespace];
            let mut cache = TransformCache::new();
            let cached = cache.transformed(input.as_bytes(), &pipeline).to_vec();
            prop_assert_eq!(cached, apply_pipeline(input.as_bytes(), &pipeline).into_owned());
        }

        #[test]
        fn prop_decoders_never_panic(input in proptest::collection::vec(any::<u8>(), 0..64)) {
            for tr in [T::JsDecode, T::CssDecode, T::HtmlEntityDecode, T::NormalizePath, T::RemoveComments, T::Utf8ToUnicode] {
                let _ = apply(tr, &input);
            }
        }
    }
}
