//! `application/x-www-form-urlencoded` decoder

use super::limits::ReadCounters;
use super::{FieldCallback, FieldType};
use crate::encoding::weak_url_unescape;
use crate::Result;
use std::io::Read;

const READ_CHUNK: usize = 1000;

/// Emit each `key=value` pair in input order.
///
/// Only `&` separates pairs. A pair without `=` is `(key, "")`. Invalid
/// percent escapes are kept as literal bytes.
pub(crate) fn parse<R: Read>(mut reader: R, counters: &ReadCounters, on_field: &mut FieldCallback<'_>) -> Result<()> {
    let mut pair = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }

        let mut segments = chunk[..n].split(|&b| b == b'&').peekable();
        while let Some(segment) = segments.next() {
            pair.extend_from_slice(segment);
            if segments.peek().is_some() {
                emit_pair(&pair, on_field)?;
                pair.clear();
                counters.reset_field();
            }
        }
    }

    emit_pair(&pair, on_field)
}

fn emit_pair(pair: &[u8], on_field: &mut FieldCallback<'_>) -> Result<()> {
    if pair.is_empty() {
        return Ok(());
    }

    let (key, value) = match memchr::memchr(b'=', pair) {
        Some(i) => (&pair[..i], &pair[i + 1..]),
        None => (pair, &[][..]),
    };
    let key = weak_url_unescape(key);
    let value = weak_url_unescape(value);
    on_field(FieldType::UrlEncodedContent, &String::from_utf8_lossy(&key), &value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bodyparsing::LengthLimits;

    fn run(body: &[u8]) -> Vec<(String, Vec<u8>)> {
        let counters = ReadCounters::new(LengthLimits::default());
        let mut out = Vec::new();
        parse(body, &counters, &mut |t, k, v| {
            assert_eq!(t, FieldType::UrlEncodedContent);
            out.push((k.to_string(), v.to_vec()));
            Ok(())
        })
        .unwrap();
        out
    }

    fn pairs(p: &[(&str, &str)]) -> Vec<(String, Vec<u8>)> {
        p.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect()
    }

    #[test]
    fn test_decodes_keys_and_values() {
        assert_eq!(
            run(b"%62=aaa%61aaabcc%xxc&%61=h%65lloworld1"),
            pairs(&[("b", "aaaaaaabcc%xxc"), ("a", "helloworld1")])
        );
    }

    #[test]
    fn test_missing_value_and_empty_pairs() {
        assert_eq!(run(b"a&&b=&c=1="), pairs(&[("a", ""), ("b", ""), ("c", "1=")]));
        assert!(run(b"").is_empty());
        assert_eq!(run(b"x+y=1+2"), pairs(&[("x y", "1 2")]));
    }

    #[test]
    fn test_pair_spanning_reads() {
        let long = "v".repeat(READ_CHUNK * 2 + 7);
        let body = format!("first=1&long={long}&last=2");
        assert_eq!(
            run(body.as_bytes()),
            pairs(&[("first", "1"), ("long", &long), ("last", "2")])
        );
    }
}
