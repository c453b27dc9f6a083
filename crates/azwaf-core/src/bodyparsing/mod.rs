//! Streaming request body parsing
//!
//! A body is read once through a size-capping reader and decoded according
//! to its media type. Every scannable value is handed to a callback as a
//! `(FieldType, name, value)` tuple; nothing beyond the current field is
//! buffered unless raw body capture was requested.

mod json;
mod limits;
mod multipart;
mod strict;
mod urlencoded;
mod xml;

pub use limits::LengthLimits;
pub use strict::StrictnessFlags;

use crate::{Result, WafError};
use limits::{LimitedReader, ReadCounters};
use std::io::{self, Read};
use strict::StrictReader;

/// Kind of value emitted by the body parser
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    UrlEncodedContent,
    MultipartFormDataContent,
    MultipartFormDataFileNames,
    /// Name is a [`StrictnessWarning`] code, value is empty
    MultipartFormDataStrictnessWarning,
    JsonContent,
    XmlCharData,
    FullRawRequestBody,
}

/// Body decoder selected from the `Content-Type` header
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BodyType {
    #[default]
    Other,
    Multipart,
    UrlEncoded,
    Xml,
    Json,
}

impl BodyType {
    pub fn from_content_type(content_type: &str) -> Self {
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        match media_type.to_ascii_lowercase().as_str() {
            "multipart/form-data" => Self::Multipart,
            "application/x-www-form-urlencoded" => Self::UrlEncoded,
            "application/xml" | "text/xml" => Self::Xml,
            "application/json" => Self::Json,
            _ => Self::Other,
        }
    }

    /// Value of `REQBODY_PROCESSOR`
    pub fn processor_name(&self) -> &'static str {
        match self {
            Self::Other => "",
            Self::Multipart => "MULTIPART",
            Self::UrlEncoded => "URLENCODED",
            Self::Xml => "XML",
            Self::Json => "JSON",
        }
    }

    /// Label used in body format errors
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Other => "request",
            Self::Multipart => "multipart/form-data",
            Self::UrlEncoded => "application/x-www-form-urlencoded",
            Self::Xml => "application/xml",
            Self::Json => "application/json",
        }
    }
}

/// Multipart anomaly reported through [`FieldType::MultipartFormDataStrictnessWarning`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StrictnessWarning {
    DataAfter,
    DataBefore,
    HeaderFolding,
    InvalidHeaderFolding,
    LfLine,
    UnmatchedBoundary,
    FileLimitExceeded,
    /// The stream ended before the final boundary line
    Incomplete,
}

impl StrictnessWarning {
    const ALL: [Self; 8] = [
        Self::DataAfter,
        Self::DataBefore,
        Self::HeaderFolding,
        Self::InvalidHeaderFolding,
        Self::LfLine,
        Self::UnmatchedBoundary,
        Self::FileLimitExceeded,
        Self::Incomplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataAfter => "MultipartFormDataStrictnessWarningDataAfter",
            Self::DataBefore => "MultipartFormDataStrictnessWarningDataBefore",
            Self::HeaderFolding => "MultipartFormDataStrictnessWarningHeaderFolding",
            Self::InvalidHeaderFolding => "MultipartFormDataStrictnessWarningInvalidHeaderFolding",
            Self::LfLine => "MultipartFormDataStrictnessWarningLfLine",
            Self::UnmatchedBoundary => "MultipartFormDataStrictnessWarningUnmatchedBoundary",
            Self::FileLimitExceeded => "MultipartFormDataStrictnessWarningFileLimitExceeded",
            Self::Incomplete => "MultipartFormDataStrictnessWarningIncomplete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.as_str() == name)
    }
}

/// The `boundary` parameter of a `multipart/form-data` content type
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (k, v) = param.split_once('=')?;
        if !k.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let v = v.trim();
        let v = v.strip_prefix('"').and_then(|v| v.strip_suffix('"')).unwrap_or(v);
        (!v.is_empty()).then(|| v.to_string())
    })
}

/// Callback receiving each parsed field
pub type FieldCallback<'a> = dyn FnMut(FieldType, &str, &[u8]) -> Result<()> + 'a;

/// Body parser configured with one set of [`LengthLimits`]
#[derive(Clone, Debug, Default)]
pub struct RequestBodyParser {
    limits: LengthLimits,
}

impl RequestBodyParser {
    pub fn new(limits: LengthLimits) -> Self {
        Self { limits }
    }

    pub fn length_limits(&self) -> LengthLimits {
        self.limits
    }

    /// Parse `reader` as `body_type`, calling `on_field` for every value.
    ///
    /// Limit errors are returned as their sentinel variants. Any other
    /// failure, including errors returned by `on_field`, is reported as
    /// [`WafError::BodyFormat`].
    pub fn parse<R: Read>(
        &self,
        reader: R,
        on_field: &mut FieldCallback<'_>,
        body_type: BodyType,
        declared_length: Option<usize>,
        boundary: Option<&str>,
        capture_raw: bool,
    ) -> Result<()> {
        let raw_limit = self.limits.max_length_total_full_raw_request_body;
        if let Some(len) = declared_length {
            if len > self.limits.max_length_total {
                return Err(WafError::TotalBytesLimitExceeded);
            }
            if capture_raw && len > raw_limit {
                return Err(WafError::TotalFullRawRequestBodyExceeded);
            }
        }

        let counters = ReadCounters::new(self.limits);
        let raw = capture_raw.then(|| Vec::with_capacity(declared_length.unwrap_or(0).min(raw_limit)));
        let mut limited = LimitedReader::new(reader, &counters, raw);

        let result = match body_type {
            BodyType::Multipart => match boundary {
                Some(boundary) => parse_multipart(&mut limited, boundary, &counters, on_field),
                None => Err(WafError::BodyFormat {
                    media_type: body_type.media_type().into(),
                    message: "missing boundary".into(),
                }),
            },
            BodyType::UrlEncoded => urlencoded::parse(&mut limited, &counters, on_field),
            BodyType::Json => json::parse(&mut limited, &counters, on_field),
            BodyType::Xml => xml::parse(&mut limited, &counters, on_field),
            BodyType::Other if capture_raw => io::copy(&mut limited, &mut io::sink())
                .map(drop)
                .map_err(WafError::from),
            BodyType::Other => Ok(()),
        };
        result.map_err(|e| classify_error(e, &counters, body_type))?;

        if let Some(raw) = limited.into_raw() {
            on_field(FieldType::FullRawRequestBody, "", &raw)
                .map_err(|e| classify_error(e, &counters, body_type))?;
        }
        Ok(())
    }
}

fn parse_multipart<R: Read>(
    reader: R,
    boundary: &str,
    counters: &ReadCounters,
    on_field: &mut FieldCallback<'_>,
) -> Result<()> {
    let mut strict = StrictReader::new(reader, boundary);
    let result = multipart::parse(&mut strict, boundary, counters, on_field);

    let hit_limit = counters.limit_exceeded().is_some() || result.as_ref().is_err_and(WafError::is_limit_error);
    if hit_limit || counters.total() == 0 {
        return result;
    }

    for warning in strict.warnings() {
        on_field(FieldType::MultipartFormDataStrictnessWarning, warning.as_str(), b"")?;
    }
    result
}

/// Recover limit sentinels that a decoder wrapped, and label everything else
fn classify_error(err: WafError, counters: &ReadCounters, body_type: BodyType) -> WafError {
    if let Some(kind) = counters.limit_exceeded() {
        return kind.error();
    }
    match err {
        e if e.is_limit_error() => e,
        e @ WafError::BodyFormat { .. } => e,
        e => WafError::BodyFormat {
            media_type: body_type.media_type().into(),
            message: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "------------------------1aa6ce6559102";

    type Fields = Vec<(FieldType, String, Vec<u8>)>;

    fn parse_with(
        parser: &RequestBodyParser,
        body: impl Read,
        body_type: BodyType,
        capture_raw: bool,
    ) -> (Result<()>, Fields) {
        let mut fields = Vec::new();
        let result = parser.parse(
            body,
            &mut |t, n, v| {
                fields.push((t, n.to_string(), v.to_vec()));
                Ok(())
            },
            body_type,
            None,
            Some(BOUNDARY),
            capture_raw,
        );
        (result, fields)
    }

    #[test]
    fn test_body_type_from_content_type() {
        assert_eq!(
            BodyType::from_content_type("multipart/form-data; boundary=x"),
            BodyType::Multipart
        );
        assert_eq!(
            BodyType::from_content_type("Application/X-WWW-Form-Urlencoded"),
            BodyType::UrlEncoded
        );
        assert_eq!(BodyType::from_content_type("text/xml; charset=utf-8"), BodyType::Xml);
        assert_eq!(BodyType::from_content_type("application/json"), BodyType::Json);
        assert_eq!(BodyType::from_content_type("text/plain"), BodyType::Other);
        assert_eq!(BodyType::Other.processor_name(), "");
        assert_eq!(BodyType::Json.processor_name(), "JSON");
    }

    #[test]
    fn test_multipart_boundary() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=abc").as_deref(),
            Some("abc")
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; charset=utf-8; Boundary=\"a b\"").as_deref(),
            Some("a b")
        );
        assert_eq!(multipart_boundary("multipart/form-data"), None);
    }

    #[test]
    fn test_strictness_warning_names() {
        for w in StrictnessWarning::ALL {
            assert_eq!(StrictnessWarning::from_name(w.as_str()), Some(w));
        }
        assert_eq!(StrictnessWarning::from_name("nope"), None);
    }

    #[test]
    fn test_multipart_two_fields() {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhello world 1\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\naaaaaaabccc\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let (result, fields) = parse_with(&RequestBodyParser::default(), body.as_bytes(), BodyType::Multipart, false);
        result.unwrap();
        assert_eq!(
            fields,
            vec![
                (FieldType::MultipartFormDataContent, "a".into(), b"hello world 1".to_vec()),
                (FieldType::MultipartFormDataContent, "b".into(), b"aaaaaaabccc".to_vec()),
            ]
        );
    }

    #[test]
    fn test_multipart_strictness_warnings_emitted() {
        let body = format!(
            "--{b}\nContent-Disposition: form-data; name=\"a\"\n\nx\n--{b}--\n",
            b = BOUNDARY
        );
        let (result, fields) = parse_with(&RequestBodyParser::default(), body.as_bytes(), BodyType::Multipart, false);
        result.unwrap();
        assert_eq!(fields[0].2, b"x");
        assert_eq!(
            fields[1],
            (
                FieldType::MultipartFormDataStrictnessWarning,
                StrictnessWarning::LfLine.as_str().to_string(),
                Vec::new()
            )
        );
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_urlencoded_body() {
        let (result, fields) = parse_with(
            &RequestBodyParser::default(),
            &b"%62=aaa%61aaabcc%xxc&%61=h%65lloworld1"[..],
            BodyType::UrlEncoded,
            false,
        );
        result.unwrap();
        assert_eq!(
            fields,
            vec![
                (FieldType::UrlEncodedContent, "b".into(), b"aaaaaaabcc%xxc".to_vec()),
                (FieldType::UrlEncodedContent, "a".into(), b"helloworld1".to_vec()),
            ]
        );
    }

    /// Multipart body with one file part of `file_len` filler bytes
    fn file_upload(file_len: usize) -> impl Read {
        let head = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"b\"; filename=\"vcredist_x64.exe\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY
        );
        let tail = format!("\r\n--{b}--\r\n", b = BOUNDARY);
        io::Cursor::new(head.into_bytes())
            .chain(io::repeat(b'a').take(file_len as u64))
            .chain(io::Cursor::new(tail.into_bytes()))
    }

    #[test]
    fn test_file_bytes_skip_pausable_limit() {
        let parser = RequestBodyParser::new(LengthLimits {
            max_length_field: 20 * 1024,
            max_length_pausable: 20 * 1024,
            max_length_total: 100 * 1024,
            max_length_total_full_raw_request_body: 20 * 1024,
        });

        let (result, fields) = parse_with(&parser, file_upload(50 * 1024), BodyType::Multipart, false);
        result.unwrap();
        assert_eq!(fields[0], (FieldType::MultipartFormDataContent, "b".into(), Vec::new()));
        assert_eq!(
            fields[1],
            (FieldType::MultipartFormDataFileNames, "b".into(), b"vcredist_x64.exe".to_vec())
        );

        let (result, _) = parse_with(&parser, file_upload(200 * 1024), BodyType::Multipart, false);
        assert!(matches!(result, Err(WafError::TotalBytesLimitExceeded)));
    }

    #[test]
    fn test_field_limit() {
        let parser = RequestBodyParser::new(LengthLimits {
            max_length_field: 1024,
            ..LengthLimits::default()
        });
        let body = format!("a={}", "x".repeat(4096));
        let (result, _) = parse_with(&parser, body.as_bytes(), BodyType::UrlEncoded, false);
        assert!(matches!(result, Err(WafError::FieldBytesLimitExceeded)));
    }

    #[test]
    fn test_declared_length_fails_early() {
        let parser = RequestBodyParser::new(LengthLimits {
            max_length_total: 10,
            ..LengthLimits::default()
        });
        let result = parser.parse(&b""[..], &mut |_, _, _| Ok(()), BodyType::Json, Some(11), None, false);
        assert!(matches!(result, Err(WafError::TotalBytesLimitExceeded)));

        let parser = RequestBodyParser::default();
        let too_big = parser.length_limits().max_length_total_full_raw_request_body + 1;
        let result = parser.parse(&b""[..], &mut |_, _, _| Ok(()), BodyType::Json, Some(too_big), None, true);
        assert!(matches!(result, Err(WafError::TotalFullRawRequestBodyExceeded)));
    }

    #[test]
    fn test_raw_body_capture() {
        let (result, fields) = parse_with(&RequestBodyParser::default(), &b"a=1&b=2"[..], BodyType::UrlEncoded, true);
        result.unwrap();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[2], (FieldType::FullRawRequestBody, String::new(), b"a=1&b=2".to_vec()));

        let (result, fields) = parse_with(&RequestBodyParser::default(), &b"plain text"[..], BodyType::Other, true);
        result.unwrap();
        assert_eq!(fields, vec![(FieldType::FullRawRequestBody, String::new(), b"plain text".to_vec())]);

        let (result, fields) = parse_with(&RequestBodyParser::default(), &b"plain text"[..], BodyType::Other, false);
        result.unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn test_format_errors_are_labelled() {
        let (result, _) = parse_with(&RequestBodyParser::default(), &b"{\"a\": "[..], BodyType::Json, false);
        match result {
            Err(WafError::BodyFormat { media_type, .. }) => assert_eq!(media_type, "application/json"),
            other => panic!("unexpected result: {other:?}"),
        }

        let (result, _) = parse_with(&RequestBodyParser::default(), &b"<a><b></a>"[..], BodyType::Xml, false);
        assert!(matches!(result, Err(WafError::BodyFormat { .. })));
    }

    #[test]
    fn test_callback_error_is_wrapped() {
        let result = RequestBodyParser::default().parse(
            &b"a=1"[..],
            &mut |_, _, _| Err(WafError::Operator("boom".into())),
            BodyType::UrlEncoded,
            None,
            None,
            false,
        );
        assert!(matches!(result, Err(WafError::BodyFormat { .. })));
    }
}
