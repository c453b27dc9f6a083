//! Request as handed to the WAF by a front-end

use crate::bodyparsing::{multipart_boundary, BodyType};
use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    /// Request target as sent, including the query string
    pub uri: String,
    pub protocol: String,
    /// Client address, optionally with a port
    pub remote_addr: String,
    /// Headers in arrival order; names keep their original case
    pub headers: Vec<(String, String)>,
    /// Selects the [`PolicyConfig`](super::PolicyConfig)
    pub config_id: String,
    pub body: Bytes,
}

impl HttpRequest {
    /// First header with this case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Declared `Content-Length`, if present and numeric
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")?.trim().parse().ok()
    }

    pub fn body_type(&self) -> BodyType {
        self.content_type().map(BodyType::from_content_type).unwrap_or_default()
    }

    pub fn multipart_boundary(&self) -> Option<String> {
        self.content_type().and_then(multipart_boundary)
    }
}
