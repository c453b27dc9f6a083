//! Byte-count limits enforced while a body is read

use crate::WafError;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::io::{self, Read};

/// Byte budgets for one request body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LengthLimits {
    /// Per field, reset by the parser between fields; paused bytes do not count
    pub max_length_field: usize,
    /// Whole body, except bytes read while counting is paused
    pub max_length_pausable: usize,
    /// Whole body, every byte
    pub max_length_total: usize,
    /// Buffered raw body, when raw capture was requested
    pub max_length_total_full_raw_request_body: usize,
}

impl Default for LengthLimits {
    fn default() -> Self {
        Self {
            max_length_field: 20 * 1024,
            max_length_pausable: 128 * 1024,
            max_length_total: 700 * 1024 * 1024,
            max_length_total_full_raw_request_body: 128 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LimitKind {
    Field,
    Pausable,
    Total,
    FullRawBody,
}

impl LimitKind {
    pub(crate) fn error(self) -> WafError {
        match self {
            LimitKind::Field => WafError::FieldBytesLimitExceeded,
            LimitKind::Pausable => WafError::PausableBytesLimitExceeded,
            LimitKind::Total => WafError::TotalBytesLimitExceeded,
            LimitKind::FullRawBody => WafError::TotalFullRawRequestBodyExceeded,
        }
    }
}

/// Counters shared between a [`LimitedReader`] and the parser driving it.
///
/// Decoders such as serde_json and quick-xml own the reader while they run;
/// the parser keeps a shared borrow of these counters to reset the field
/// count and to recover limit errors the decoder wrapped.
#[derive(Debug)]
pub(crate) struct ReadCounters {
    limits: LengthLimits,
    field: Cell<usize>,
    pausable: Cell<usize>,
    total: Cell<usize>,
    paused: Cell<bool>,
    last_limit: Cell<Option<LimitKind>>,
}

impl ReadCounters {
    pub(crate) fn new(limits: LengthLimits) -> Self {
        Self {
            limits,
            field: Cell::new(0),
            pausable: Cell::new(0),
            total: Cell::new(0),
            paused: Cell::new(false),
            last_limit: Cell::new(None),
        }
    }

    /// Call before starting to read a field
    pub(crate) fn reset_field(&self) {
        self.field.set(0);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.set(paused);
    }

    pub(crate) fn total(&self) -> usize {
        self.total.get()
    }

    /// The limit that stopped reading, if any
    pub(crate) fn limit_exceeded(&self) -> Option<LimitKind> {
        self.last_limit.get()
    }

    fn check(&self) -> Option<LimitKind> {
        if self.total.get() >= self.limits.max_length_total {
            Some(LimitKind::Total)
        } else if self.pausable.get() >= self.limits.max_length_pausable {
            Some(LimitKind::Pausable)
        } else if self.field.get() >= self.limits.max_length_field {
            Some(LimitKind::Field)
        } else {
            None
        }
    }

    fn count(&self, n: usize) {
        if !self.paused.get() {
            self.pausable.set(self.pausable.get() + n);
            self.field.set(self.field.get() + n);
        }
        self.total.set(self.total.get() + n);
    }
}

fn limit_io_error(kind: LimitKind) -> io::Error {
    io::Error::new(io::ErrorKind::Other, kind.error())
}

/// Reader that fails on the call after a limit was crossed.
///
/// Reads are never truncated: the call that crosses a limit returns all of
/// its bytes, and the next call errors. With raw capture enabled, every byte
/// read is also appended to a buffer with its own cap.
pub(crate) struct LimitedReader<'c, R> {
    inner: R,
    counters: &'c ReadCounters,
    raw: Option<Vec<u8>>,
}

impl<'c, R: Read> LimitedReader<'c, R> {
    pub(crate) fn new(inner: R, counters: &'c ReadCounters, raw: Option<Vec<u8>>) -> Self {
        Self { inner, counters, raw }
    }

    /// Captured raw body, if capture was enabled
    pub(crate) fn into_raw(self) -> Option<Vec<u8>> {
        self.raw
    }

    fn fail(&self, kind: LimitKind) -> io::Error {
        self.counters.last_limit.set(Some(kind));
        limit_io_error(kind)
    }
}

impl<R: Read> Read for LimitedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(kind) = self.counters.check() {
            return Err(self.fail(kind));
        }

        let raw_limit = self.counters.limits.max_length_total_full_raw_request_body;
        if self.raw.as_ref().is_some_and(|raw| raw.len() >= raw_limit) {
            return Err(self.fail(LimitKind::FullRawBody));
        }

        let n = self.inner.read(buf)?;
        self.counters.count(n);
        if let Some(raw) = self.raw.as_mut() {
            raw.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(field: usize, pausable: usize, total: usize) -> LengthLimits {
        LengthLimits {
            max_length_field: field,
            max_length_pausable: pausable,
            max_length_total: total,
            max_length_total_full_raw_request_body: 1024,
        }
    }

    fn read_all<R: Read>(r: &mut R, chunk: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0; chunk];
        loop {
            let n = r.read(&mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn test_error_on_call_after_crossing() {
        let counters = ReadCounters::new(limits(100, 100, 10));
        let mut r = LimitedReader::new(&b"0123456789abcdef"[..], &counters, None);
        let mut buf = [0u8; 12];
        assert_eq!(r.read(&mut buf).unwrap(), 12);
        let err = r.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(counters.limit_exceeded(), Some(LimitKind::Total));
    }

    #[test]
    fn test_within_limits() {
        let counters = ReadCounters::new(limits(100, 100, 100));
        let mut r = LimitedReader::new(&b"hello"[..], &counters, None);
        assert_eq!(read_all(&mut r, 2).unwrap(), b"hello");
        assert_eq!(counters.limit_exceeded(), None);
        assert_eq!(counters.total(), 5);
    }

    #[test]
    fn test_field_reset() {
        let counters = ReadCounters::new(limits(4, 100, 100));
        let mut r = LimitedReader::new(&b"abcdefgh"[..], &counters, None);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        counters.reset_field();
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert!(r.read(&mut buf).is_err());
        assert_eq!(counters.limit_exceeded(), Some(LimitKind::Field));
    }

    #[test]
    fn test_paused_bytes_only_count_toward_total() {
        let counters = ReadCounters::new(limits(4, 4, 100));
        counters.set_paused(true);
        let mut r = LimitedReader::new(&[7u8; 50][..], &counters, None);
        assert_eq!(read_all(&mut r, 8).unwrap().len(), 50);
        assert_eq!(counters.total(), 50);
        assert_eq!(counters.limit_exceeded(), None);
    }

    #[test]
    fn test_raw_capture_cap() {
        let mut l = limits(10_000, 10_000, 10_000);
        l.max_length_total_full_raw_request_body = 8;
        let counters = ReadCounters::new(l);
        let mut r = LimitedReader::new(&[1u8; 20][..], &counters, Some(Vec::new()));
        assert!(read_all(&mut r, 4).is_err());
        assert_eq!(counters.limit_exceeded(), Some(LimitKind::FullRawBody));

        let counters = ReadCounters::new(l);
        let mut r = LimitedReader::new(&b"abc"[..], &counters, Some(Vec::new()));
        read_all(&mut r, 4).unwrap();
        assert_eq!(r.into_raw().unwrap(), b"abc");
    }
}
