//! URL percent-encoding helpers shared by the body parser, the request scanner
//! and the transformations.

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode two hex digits at `s[i]` and `s[i + 1]`
pub(crate) fn hex_pair(s: &[u8], i: usize) -> Option<u8> {
    let hi = hex_val(*s.get(i)?)?;
    let lo = hex_val(*s.get(i + 1)?)?;
    Some(hi << 4 | lo)
}

/// Every `%` must be followed by two hex digits.
pub fn is_valid_url_encoding(s: &[u8]) -> bool {
    let mut i = 0;
    while i < s.len() {
        if s[i] == b'%' {
            if hex_pair(s, i + 1).is_none() {
                return false;
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    true
}

/// Percent-decode, turning `+` into a space. Invalid escapes are kept literally.
pub fn weak_url_unescape(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        match s[i] {
            b'%' => match hex_pair(s, i + 1) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Like [`weak_url_unescape`] but also decodes IIS-style `%uHHHH` escapes.
///
/// Full-width ASCII (U+FF01..U+FF5E) folds to its ASCII counterpart; any
/// other code point keeps only its low byte. Invalid escapes stay literal.
pub fn weak_url_unescape_uni(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] == b'%' {
            if matches!(s.get(i + 1), Some(b'u') | Some(b'U')) {
                if let (Some(hi), Some(lo)) = (hex_pair(s, i + 2), hex_pair(s, i + 4)) {
                    let cp = u16::from(hi) << 8 | u16::from(lo);
                    if (0xff01..=0xff5e).contains(&cp) {
                        out.push((cp & 0xff) as u8 + 0x20);
                    } else {
                        out.push(lo);
                    }
                    i += 6;
                    continue;
                }
            } else if let Some(b) = hex_pair(s, i + 1) {
                out.push(b);
                i += 3;
                continue;
            }
            out.push(b'%');
            i += 1;
        } else if s[i] == b'+' {
            out.push(b' ');
            i += 1;
        } else {
            out.push(s[i]);
            i += 1;
        }
    }
    out
}

/// Percent-encode everything except unreserved characters; spaces become `+`.
pub fn url_encode(s: &[u8]) -> Vec<u8> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(s.len());
    for &c in s {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(c),
            b' ' => out.push(b'+'),
            _ => {
                out.push(b'%');
                out.push(HEX[(c >> 4) as usize]);
                out.push(HEX[(c & 0xf) as usize]);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_url_encoding() {
        assert!(is_valid_url_encoding(b"abc%20def"));
        assert!(is_valid_url_encoding(b""));
        assert!(!is_valid_url_encoding(b"abc%2"));
        assert!(!is_valid_url_encoding(b"abc%xxdef"));
        assert!(!is_valid_url_encoding(b"%"));
    }

    #[test]
    fn test_weak_url_unescape() {
        assert_eq!(weak_url_unescape(b"a%62c"), b"abc");
        assert_eq!(weak_url_unescape(b"a+b"), b"a b");
        assert_eq!(weak_url_unescape(b"aaa%61aaabcc%xxc"), b"aaaaaaabcc%xxc");
        assert_eq!(weak_url_unescape(b"trailing%"), b"trailing%");
        assert_eq!(weak_url_unescape(b"trailing%4"), b"trailing%4");
    }

    #[test]
    fn test_weak_url_unescape_uni() {
        assert_eq!(weak_url_unescape_uni(b"%u0041bc"), b"Abc");
        assert_eq!(weak_url_unescape_uni(b"%uff1c"), b"<");
        assert_eq!(weak_url_unescape_uni(b"%u12"), b"%u12");
        assert_eq!(weak_url_unescape_uni(b"%3c"), b"<");
    }

    #[test]
    fn test_url_encode() {
        assert_eq!(url_encode(b"a b&c"), b"a+b%26c");
        assert_eq!(weak_url_unescape(&url_encode(b"x=1;y")), b"x=1;y");
    }

    proptest! {
        #[test]
        fn prop_unescape_never_grows(input in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assert!(weak_url_unescape(&input).len() <= input.len());
            prop_assert!(weak_url_unescape_uni(&input).len() <= input.len());
        }
    }
}
