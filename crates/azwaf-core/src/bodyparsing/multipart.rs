//! Streaming `multipart/form-data` parser
//!
//! Holds at most one non-file part in memory. File part bodies are skipped
//! while byte counting is paused, so uploads only count toward the total
//! limit.

use super::limits::ReadCounters;
use super::{FieldCallback, FieldType, StrictnessWarning};
use crate::{Result, WafError};
use std::io::Read;

const READ_CHUNK: usize = 8 * 1024;

/// File parts beyond this many raise `MultipartFormDataStrictnessWarningFileLimitExceeded`
const MAX_FILE_PARTS: usize = 100;

fn format_error(message: impl Into<String>) -> WafError {
    WafError::BodyFormat {
        media_type: "multipart/form-data".into(),
        message: message.into(),
    }
}

/// Buffered reader over the body with line and delimiter scanning
struct PartScanner<R> {
    inner: R,
    buf: Vec<u8>,
    start: usize,
    eof: bool,
}

impl<R: Read> PartScanner<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            start: 0,
            eof: false,
        }
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Read one more chunk; false at end of input
    fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }

        let len = self.buf.len();
        self.buf.resize(len + READ_CHUNK, 0);
        let n = self.inner.read(&mut self.buf[len..]);
        let n = match n {
            Ok(n) => n,
            Err(e) => {
                self.buf.truncate(len);
                return Err(e.into());
            }
        };
        self.buf.truncate(len + n);
        if n == 0 {
            self.eof = true;
        }
        Ok(n > 0)
    }

    /// Next line without its `\n` or `\r\n`; `None` at end of input
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut searched = 0;
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.pending()[searched..]) {
                let end = searched + i;
                let mut line = self.pending()[..end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.start += end + 1;
                return Ok(Some(line));
            }
            searched = self.pending().len();

            if !self.fill()? {
                if self.pending().is_empty() {
                    return Ok(None);
                }
                let line = self.pending().to_vec();
                self.start = self.buf.len();
                return Ok(Some(line));
            }
        }
    }

    /// Stream part content to `sink` up to (not including) the line break
    /// before the next `delimiter` line.
    fn read_part_body(&mut self, delimiter: &[u8], sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        let mut needle = Vec::with_capacity(delimiter.len() + 1);
        needle.push(b'\n');
        needle.extend_from_slice(delimiter);

        let mut from = 0;
        loop {
            if let Some(i) = memchr::memmem::find(&self.pending()[from..], &needle) {
                let at = from + i;
                let after = at + needle.len();
                // `--boundaryX` is content, not a delimiter
                match self.pending().get(after) {
                    Some(b'-' | b'\r' | b'\n' | b' ' | b'\t') => {}
                    Some(_) => {
                        from = at + 1;
                        continue;
                    }
                    None if !self.eof => {
                        self.fill()?;
                        continue;
                    }
                    None => {}
                }

                let mut content = &self.pending()[..at];
                if content.last() == Some(&b'\r') {
                    content = &content[..content.len() - 1];
                }
                sink(content);
                self.start += at + 1;
                return Ok(());
            }

            // Keep enough to recognise a delimiter split across reads
            let keep = needle.len() + 1;
            let pending = self.pending().len();
            if pending > keep {
                let emit = pending - keep;
                sink(&self.pending()[..emit]);
                self.start += emit;
            }
            from = 0;

            if !self.fill()? {
                return Err(format_error("unexpected end of input in part content"));
            }
        }
    }

    fn drain(&mut self) -> Result<()> {
        self.start = self.buf.len();
        while self.fill()? {
            self.start = self.buf.len();
        }
        Ok(())
    }
}

/// `Content-Disposition` of one part
#[derive(Debug, Default, PartialEq, Eq)]
struct Disposition {
    name: String,
    filename: Option<String>,
}

/// Split `;`-separated parameters, honouring quoted strings
fn split_params(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn unquote(v: &str) -> String {
    match v.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => v.to_string(),
    }
}

fn parse_disposition(value: &str) -> Result<Disposition> {
    let mut params = split_params(value).into_iter();
    let kind = params.next().unwrap_or_default().trim();
    if kind.is_empty() || kind.contains(['=', '"']) {
        return Err(format_error(format!("invalid Content-Disposition: {value}")));
    }

    let mut d = Disposition::default();
    for p in params {
        let p = p.trim();
        if p.is_empty() {
            continue;
        }
        let (k, v) = p
            .split_once('=')
            .ok_or_else(|| format_error(format!("invalid Content-Disposition parameter: {p}")))?;
        match k.trim().to_ascii_lowercase().as_str() {
            "name" => d.name = unquote(v.trim()),
            "filename" => d.filename = Some(unquote(v.trim())),
            _ => {}
        }
    }
    Ok(d)
}

/// Header lines of one part, with folded lines joined
fn read_part_headers<R: Read>(scanner: &mut PartScanner<R>) -> Result<Vec<(String, String)>> {
    let mut headers: Vec<(String, String)> = Vec::new();
    loop {
        let line = scanner
            .read_line()?
            .ok_or_else(|| format_error("unexpected end of input in part headers"))?;
        if line.is_empty() {
            return Ok(headers);
        }

        let line = String::from_utf8_lossy(&line);
        if line.starts_with([' ', '\t']) {
            if let Some((_, v)) = headers.last_mut() {
                v.push(' ');
                v.push_str(line.trim());
                continue;
            }
        }

        let (k, v) = line
            .split_once(':')
            .ok_or_else(|| format_error(format!("malformed part header: {line}")))?;
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }
}

/// Parse a multipart body, emitting content, file name and file limit tuples.
pub(crate) fn parse<R: Read>(
    reader: R,
    boundary: &str,
    counters: &ReadCounters,
    on_field: &mut FieldCallback<'_>,
) -> Result<()> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut scanner = PartScanner::new(reader);

    // Preamble
    loop {
        counters.reset_field();
        match scanner.read_line()? {
            Some(line) if line.starts_with(&delimiter) => break,
            Some(_) => {}
            None if counters.total() == 0 => return Ok(()),
            None => return Err(format_error("no boundary found")),
        }
    }

    let mut buf = Vec::new();
    let mut file_parts = 0;

    for part_number in 0.. {
        counters.reset_field();
        counters.set_paused(false);
        let headers = read_part_headers(&mut scanner)?;

        let disposition = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-disposition"))
            .map(|(_, v)| v.as_str())
            .unwrap_or_default();
        let disposition = parse_disposition(disposition).map_err(|e| match e {
            WafError::BodyFormat { media_type, message } => WafError::BodyFormat {
                media_type,
                message: format!("part number {part_number}: {message}"),
            },
            other => other,
        })?;

        if let Some(filename) = &disposition.filename {
            counters.set_paused(true);
            file_parts += 1;

            on_field(FieldType::MultipartFormDataContent, &disposition.name, b"")?;
            on_field(FieldType::MultipartFormDataFileNames, &disposition.name, filename.as_bytes())?;
            if file_parts == MAX_FILE_PARTS + 1 {
                on_field(
                    FieldType::MultipartFormDataStrictnessWarning,
                    StrictnessWarning::FileLimitExceeded.as_str(),
                    b"",
                )?;
            }

            scanner.read_part_body(&delimiter, &mut |_| {})?;
        } else {
            counters.reset_field();
            buf.clear();
            scanner.read_part_body(&delimiter, &mut |chunk| buf.extend_from_slice(chunk))?;
            on_field(FieldType::MultipartFormDataContent, &disposition.name, &buf)?;
        }

        let line = scanner
            .read_line()?
            .ok_or_else(|| format_error("unexpected end of input at boundary"))?;
        if line.get(delimiter.len()..).is_some_and(|rest| rest.starts_with(b"--")) {
            break;
        }
    }

    counters.set_paused(false);
    scanner.drain()
}
