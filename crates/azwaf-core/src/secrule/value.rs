//! Values: token lists that keep macros intact until evaluation time

use std::fmt;

/// Environment variables a macro may reference
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvVarName {
    Ip,
    MatchedVar,
    MatchedVarName,
    MultipartBoundaryQuoted,
    MultipartBoundaryWhitespace,
    MultipartDataAfter,
    MultipartDataBefore,
    MultipartFileLimitExceeded,
    MultipartHeaderFolding,
    MultipartInvalidHeaderFolding,
    MultipartInvalidQuoting,
    MultipartLfLine,
    MultipartMissingSemicolon,
    MultipartStrictError,
    MultipartUnmatchedBoundary,
    RemoteAddr,
    ReqbodyErrorMsg,
    ReqbodyProcessor,
    ReqbodyProcessorError,
    RequestHeaders,
    RequestLine,
    RequestMethod,
    RequestProtocol,
    Rule,
    Tx,
}

impl EnvVarName {
    /// Look up a lower-cased macro name
    pub fn from_name(s: &str) -> Option<Self> {
        Some(match s {
            "ip" => Self::Ip,
            "matched_var" => Self::MatchedVar,
            "matched_var_name" => Self::MatchedVarName,
            "multipart_boundary_quoted" => Self::MultipartBoundaryQuoted,
            "multipart_boundary_whitespace" => Self::MultipartBoundaryWhitespace,
            "multipart_data_after" => Self::MultipartDataAfter,
            "multipart_data_before" => Self::MultipartDataBefore,
            "multipart_file_limit_exceeded" => Self::MultipartFileLimitExceeded,
            "multipart_header_folding" => Self::MultipartHeaderFolding,
            "multipart_invalid_header_folding" => Self::MultipartInvalidHeaderFolding,
            "multipart_invalid_quoting" => Self::MultipartInvalidQuoting,
            "multipart_lf_line" => Self::MultipartLfLine,
            "multipart_semicolon_missing" | "multipart_missing_semicolon" => Self::MultipartMissingSemicolon,
            "multipart_strict_error" => Self::MultipartStrictError,
            "multipart_unmatched_boundary" => Self::MultipartUnmatchedBoundary,
            "remote_addr" => Self::RemoteAddr,
            "reqbody_error_msg" => Self::ReqbodyErrorMsg,
            "reqbody_processor" => Self::ReqbodyProcessor,
            "reqbody_processor_error" | "reqbody_error" => Self::ReqbodyProcessorError,
            "request_headers" => Self::RequestHeaders,
            "request_line" => Self::RequestLine,
            "request_method" => Self::RequestMethod,
            "request_protocol" => Self::RequestProtocol,
            "rule" => Self::Rule,
            "tx" => Self::Tx,
            _ => return None,
        })
    }

    /// True for names that may carry a `.selector`
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::RequestHeaders | Self::Tx | Self::Ip | Self::Rule)
    }
}

/// `%{name}` or `%{name.selector}`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacroToken {
    pub name: EnvVarName,
    pub selector: String,
}

/// Allowed-byte bit set of `@validateByteRange`
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ByteRange(pub [bool; 256]);

impl ByteRange {
    pub fn empty() -> Self {
        Self([false; 256])
    }

    pub fn allows(&self, b: u8) -> bool {
        self.0[b as usize]
    }
}

impl fmt::Debug for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allowed = self.0.iter().filter(|&&a| a).count();
        write!(f, "ByteRange({allowed} allowed)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    Int(i64),
    Str(Vec<u8>),
    Macro(MacroToken),
    ByteRange(Box<ByteRange>),
}

/// Ordered token list
#[derive(Clone, Debug, Default)]
pub struct Value(pub Vec<Token>);

impl Value {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn int(n: i64) -> Self {
        Self(vec![Token::Int(n)])
    }

    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        Self(vec![Token::Str(s.into())])
    }

    /// String value, or an integer if the whole content parses as one
    pub fn from_bytes_auto(b: &[u8]) -> Self {
        match std::str::from_utf8(b).ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(n) => Self::int(n),
            None => Self::string(b.to_vec()),
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.0
    }

    pub fn push(&mut self, t: Token) {
        self.0.push(t);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_macros(&self) -> bool {
        self.0.iter().any(|t| matches!(t, Token::Macro(_)))
    }

    /// Flatten into bytes. Unexpanded macros contribute nothing.
    pub fn to_bytes(&self) -> Vec<u8> {
        if let [Token::Str(s)] = self.0.as_slice() {
            return s.clone();
        }

        let mut out = Vec::new();
        for t in &self.0 {
            match t {
                Token::Int(n) => out.extend_from_slice(n.to_string().as_bytes()),
                Token::Str(s) => out.extend_from_slice(s),
                Token::Macro(_) | Token::ByteRange(_) => {}
            }
        }
        out
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.to_bytes()).into_owned()
    }

    /// Integer content, parsing a string if needed
    pub fn as_int(&self) -> Option<i64> {
        match self.0.as_slice() {
            [Token::Int(n)] => Some(*n),
            _ if self.has_macros() => None,
            _ => std::str::from_utf8(&self.to_bytes()).ok()?.trim().parse().ok(),
        }
    }

    /// The single byte-range token, if this value is one
    pub fn byte_range(&self) -> Option<&ByteRange> {
        match self.0.as_slice() {
            [Token::ByteRange(r)] => Some(r),
            _ => None,
        }
    }

    /// Adjacent strings merged, empty strings dropped
    fn normalized(&self) -> Vec<Token> {
        let mut out: Vec<Token> = Vec::with_capacity(self.0.len());
        for t in &self.0 {
            match (t, out.last_mut()) {
                (Token::Str(s), _) if s.is_empty() => {}
                (Token::Str(s), Some(Token::Str(prev))) => prev.extend_from_slice(s),
                _ => out.push(t.clone()),
            }
        }
        out
    }
}

impl PartialEq for Value {
    /// Equality is insensitive to how string literals are split across tokens.
    fn eq(&self, other: &Self) -> bool {
        self.normalized() == other.normalized()
    }
}

impl Eq for Value {}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::string(s.as_bytes().to_vec())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}
