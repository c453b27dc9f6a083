//! Byte-level multipart conformance checks
//!
//! Runs over the raw stream in front of the multipart parser and records
//! RFC 2046 deviations without interrupting parsing.

use super::StrictnessWarning;
use std::io::{self, Read};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    BeforeBoundary,
    AfterBoundaryDash1,
    AfterBoundaryDash2,
    AfterBoundaryCr,
    BeforeHeaderStarted,
    AfterHeaderCr,
    AfterEmptyHeaderCr,
    AfterHeaderStarted,
    AfterFinalBoundaryDash1,
    AfterFinalBoundaryDash2,
    AfterFinalBoundaryCr,
    AfterFinalBoundaryLf,
}

/// Anomalies found so far
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StrictnessFlags {
    pub data_after: bool,
    pub data_before: bool,
    pub header_folding: bool,
    pub invalid_header_folding: bool,
    pub lf_line: bool,
    pub unmatched_boundary: bool,
}

pub(crate) struct StrictReader<'b, R> {
    inner: R,
    boundary: &'b [u8],
    boundary_pos: usize,
    boundaries_seen: usize,
    at_line_start: bool,
    state: State,
    flags: StrictnessFlags,
}

impl<'b, R: Read> StrictReader<'b, R> {
    pub(crate) fn new(inner: R, boundary: &'b str) -> Self {
        Self {
            inner,
            boundary: boundary.as_bytes(),
            boundary_pos: 0,
            boundaries_seen: 0,
            at_line_start: true,
            state: State::BeforeBoundary,
            flags: StrictnessFlags::default(),
        }
    }

    pub(crate) fn flags(&self) -> StrictnessFlags {
        self.flags
    }

    /// True only if the stream ended right after the final boundary line
    pub(crate) fn completed(&self) -> bool {
        self.state == State::AfterFinalBoundaryLf
    }

    /// Warnings in emission order; `Incomplete` when not [`completed`](Self::completed)
    pub(crate) fn warnings(&self) -> Vec<StrictnessWarning> {
        let f = self.flags;
        [
            (f.data_after, StrictnessWarning::DataAfter),
            (f.data_before, StrictnessWarning::DataBefore),
            (f.header_folding, StrictnessWarning::HeaderFolding),
            (f.invalid_header_folding, StrictnessWarning::InvalidHeaderFolding),
            (f.lf_line, StrictnessWarning::LfLine),
            (f.unmatched_boundary, StrictnessWarning::UnmatchedBoundary),
            (!self.completed(), StrictnessWarning::Incomplete),
        ]
        .into_iter()
        .filter_map(|(set, w)| set.then_some(w))
        .collect()
    }

    /// Leave the boundary line and go back to content
    fn reject_boundary(&mut self, c: u8) {
        if self.boundaries_seen == 0 {
            self.flags.data_before = true;
        }
        self.at_line_start = c == b'\n';
        self.state = State::BeforeBoundary;
    }

    fn unmatched_boundary(&mut self, c: u8) {
        self.flags.unmatched_boundary = true;
        self.reject_boundary(c);
    }

    fn feed(&mut self, c: u8) {
        match self.state {
            State::BeforeBoundary => {
                if c == b'-' && self.at_line_start {
                    self.state = State::AfterBoundaryDash1;
                } else {
                    if self.boundaries_seen == 0 {
                        self.flags.data_before = true;
                    }
                    self.at_line_start = c == b'\n';
                }
            }
            State::AfterBoundaryDash1 => {
                if c == b'-' {
                    self.state = State::AfterBoundaryDash2;
                    self.boundary_pos = 0;
                } else {
                    self.reject_boundary(c);
                }
            }
            State::AfterBoundaryDash2 => {
                if self.boundary_pos == self.boundary.len() {
                    match c {
                        b'\r' => self.state = State::AfterBoundaryCr,
                        b'\n' => {
                            self.boundaries_seen += 1;
                            self.flags.lf_line = true;
                            self.state = State::BeforeHeaderStarted;
                        }
                        b'-' => self.state = State::AfterFinalBoundaryDash1,
                        _ => self.unmatched_boundary(c),
                    }
                } else if c == self.boundary[self.boundary_pos] {
                    self.boundary_pos += 1;
                } else {
                    self.unmatched_boundary(c);
                }
            }
            State::AfterBoundaryCr => {
                if c == b'\n' {
                    self.boundaries_seen += 1;
                    self.state = State::BeforeHeaderStarted;
                } else {
                    self.unmatched_boundary(c);
                }
            }
            State::BeforeHeaderStarted => match c {
                b'\r' => self.state = State::AfterEmptyHeaderCr,
                b'\n' => {
                    self.flags.lf_line = true;
                    self.at_line_start = true;
                    self.state = State::BeforeBoundary;
                }
                b' ' | b'\t' | b'\x0b' | b'\x0c' => {
                    self.flags.header_folding = true;
                    if c != b' ' && c != b'\t' {
                        self.flags.invalid_header_folding = true;
                    }
                    self.state = State::AfterHeaderStarted;
                }
                _ => self.state = State::AfterHeaderStarted,
            },
            State::AfterHeaderStarted => match c {
                b'\r' => self.state = State::AfterHeaderCr,
                b'\n' => {
                    self.flags.lf_line = true;
                    self.state = State::BeforeHeaderStarted;
                }
                _ => {}
            },
            State::AfterHeaderCr => {
                if c == b'\n' {
                    self.state = State::BeforeHeaderStarted;
                } else {
                    self.flags.lf_line = true;
                    self.state = State::AfterHeaderStarted;
                }
            }
            State::AfterEmptyHeaderCr => {
                if c == b'\n' {
                    self.at_line_start = true;
                    self.state = State::BeforeBoundary;
                } else {
                    self.flags.lf_line = true;
                    self.state = State::AfterHeaderStarted;
                }
            }
            State::AfterFinalBoundaryDash1 => {
                if c == b'-' {
                    self.state = State::AfterFinalBoundaryDash2;
                } else {
                    self.unmatched_boundary(c);
                }
            }
            State::AfterFinalBoundaryDash2 => match c {
                b'\r' => self.state = State::AfterFinalBoundaryCr,
                b'\n' => {
                    self.flags.lf_line = true;
                    self.state = State::AfterFinalBoundaryLf;
                }
                _ => self.unmatched_boundary(c),
            },
            State::AfterFinalBoundaryCr => {
                if c == b'\n' {
                    self.state = State::AfterFinalBoundaryLf;
                } else {
                    self.unmatched_boundary(c);
                }
            }
            State::AfterFinalBoundaryLf => self.flags.data_after = true,
        }
    }
}

impl<R: Read> Read for StrictReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        for &c in &buf[..n] {
            self.feed(c);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "------------------------1aa6ce6559102";

    struct Checked {
        flags: StrictnessFlags,
        completed: bool,
        warnings: Vec<StrictnessWarning>,
    }

    fn check(body: &str) -> Checked {
        let mut r = StrictReader::new(body.as_bytes(), BOUNDARY);
        std::io::copy(&mut r, &mut std::io::sink()).unwrap();
        Checked {
            flags: r.flags(),
            completed: r.completed(),
            warnings: r.warnings(),
        }
    }

    fn valid_body() -> String {
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nhello world 1\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\naaaaaaabccc\r\n--{b}--\r\n",
            b = BOUNDARY
        )
    }

    #[test]
    fn test_valid_body() {
        let r = check(&valid_body());
        assert!(r.completed);
        assert_eq!(r.flags, StrictnessFlags::default());
        assert!(r.warnings.is_empty());
    }

    #[test]
    fn test_dashes_in_content_are_not_boundaries() {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\na-b--c - d\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let r = check(&body);
        assert!(r.completed);
        assert!(!r.flags.unmatched_boundary);
    }

    #[test]
    fn test_data_before() {
        let r = check(&format!("junk\r\n{}", valid_body()));
        assert!(r.flags.data_before);
        assert!(r.completed);
    }

    #[test]
    fn test_data_after() {
        let r = check(&format!("{}trailing", valid_body()));
        assert!(r.flags.data_after);
        assert!(r.completed);
    }

    #[test]
    fn test_lf_line() {
        let body = format!(
            "--{b}\nContent-Disposition: form-data; name=\"a\"\n\nx\n--{b}--\n",
            b = BOUNDARY
        );
        let r = check(&body);
        assert!(r.flags.lf_line);
        assert!(r.completed);
    }

    #[test]
    fn test_unmatched_boundary() {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx\r\n--not-the-boundary\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let r = check(&body);
        assert!(r.flags.unmatched_boundary);
        assert!(!r.flags.data_before);
    }

    #[test]
    fn test_header_folding() {
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data;\r\n name=\"a\"\r\n\r\nx\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let r = check(&body);
        assert!(r.flags.header_folding);
        assert!(!r.flags.invalid_header_folding);

        let body = format!(
            "--{b}\r\nContent-Disposition: form-data;\r\n\x0bname=\"a\"\r\n\r\nx\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        assert!(check(&body).flags.invalid_header_folding);
    }

    #[test]
    fn test_incomplete() {
        let body = format!("--{b}\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nx", b = BOUNDARY);
        let r = check(&body);
        assert!(!r.completed);
        assert_eq!(r.warnings, vec![StrictnessWarning::Incomplete]);
    }
}
