// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Incremental `multipart/mixed` decoder.
//!
//! [`PatchResolver`] is fed a response body in arbitrarily sized chunks and
//! yields every JSON part whose full delimiter-to-delimiter span has arrived.
//! Chunk boundaries never need to line up with part boundaries.
//!
//! # Framing
//!
//! * delimiter: `CRLF--boundary`; a body may also open with a bare
//!   `--boundary` (the stream is treated as if preceded by CRLF)
//! * everything before the first delimiter is preamble and is discarded
//! * each part is `headers CRLF CRLF body`; the body is parsed as JSON
//! * `CRLF--boundary--` closes the stream; later bytes are ignored
//!
//! Partial spans are never parsed. A malformed JSON body inside a complete
//! span is an error, not a skipped part. The error closes the decoder but
//! never costs the parts completed before it: they are returned first and
//! the error surfaces on the next call.
#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const CLOSE_MARK: &[u8] = b"--";

/// Boundary used when the `Content-Type` header names none.
pub const DEFAULT_BOUNDARY: &str = "-";

/// Errors raised while decoding a complete part.
#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    /// The body of a complete part was not valid JSON.
    #[error("invalid json in multipart part: {0}")]
    Json(#[from] serde_json::Error),
    /// A complete part had no blank line separating headers from body.
    #[error("multipart part is missing its header terminator")]
    MalformedPart,
}

/// True when a `Content-Type` header announces `multipart/mixed`.
pub fn is_multipart(content_type: &str) -> bool {
    content_type
        .to_ascii_lowercase()
        .contains("multipart/mixed")
}

/// Extract the `boundary=` parameter, stripping surrounding quotes.
///
/// Falls back to [`DEFAULT_BOUNDARY`].
pub fn boundary_from_content_type(content_type: &str) -> String {
    for param in content_type.split(';') {
        let mut kv = param.trim().splitn(2, '=');
        let key = kv.next().unwrap_or_default();
        let value = kv.next().unwrap_or_default();
        if key == "boundary" && !value.is_empty() {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            return unquoted.to_string();
        }
    }
    DEFAULT_BOUNDARY.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    Parts,
    Closed,
}

/// Chunk-fed multipart decoder yielding parts of type `T` (JSON [`Value`] by default).
#[derive(Debug)]
pub struct PatchResolver<T = Value> {
    boundary: String,
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
    scan_from: usize,
    state: State,
    failed: Option<MultipartError>,
    _part: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PatchResolver<T> {
    /// Decoder for `boundary` (without the leading dashes).
    pub fn new(boundary: impl Into<String>) -> Self {
        let boundary = boundary.into();
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(CRLF);
        delimiter.extend_from_slice(CLOSE_MARK);
        delimiter.extend_from_slice(boundary.as_bytes());
        Self {
            boundary,
            delimiter,
            // A body may open with `--boundary` directly.
            buffer: CRLF.to_vec(),
            scan_from: 0,
            state: State::Preamble,
            failed: None,
            _part: PhantomData,
        }
    }

    /// Decoder for the boundary named by a `Content-Type` header.
    pub fn from_content_type(content_type: &str) -> Self {
        Self::new(boundary_from_content_type(content_type))
    }

    /// The boundary this decoder splits on.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Bytes held while waiting for the next delimiter.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// True once the closing delimiter has been seen.
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Feed the next chunk; returns the parts it completed, in order.
    ///
    /// Zero parts is normal (a part may span many chunks); one chunk may also
    /// complete several parts.
    ///
    /// A malformed part closes the decoder. Parts completed earlier in the
    /// same chunk are still returned, and the error is reported by the next
    /// `handle_chunk` or [`finish`](Self::finish) call.
    pub fn handle_chunk(&mut self, chunk: impl AsRef<[u8]>) -> Result<Vec<T>, MultipartError> {
        let mut parts = Vec::new();
        if self.state == State::Closed {
            return self.failed.take().map_or(Ok(parts), Err);
        }
        self.buffer.extend_from_slice(chunk.as_ref());

        loop {
            match self.state {
                State::Closed => break,
                State::Preamble => {
                    let Some(idx) = self.find_delimiter() else {
                        break;
                    };
                    self.buffer.drain(..idx + self.delimiter.len());
                    self.scan_from = 0;
                    self.state = State::Parts;
                }
                State::Parts => {
                    // The buffer starts right after a delimiter here.
                    if self.buffer.len() < CLOSE_MARK.len() {
                        break;
                    }
                    if self.buffer.starts_with(CLOSE_MARK) {
                        self.close();
                        break;
                    }
                    let Some(idx) = self.find_delimiter() else {
                        break;
                    };
                    let region: Vec<u8> = self.buffer.drain(..idx).collect();
                    self.buffer.drain(..self.delimiter.len());
                    self.scan_from = 0;
                    match parse_region(&region) {
                        Ok(Some(part)) => parts.push(part),
                        Ok(None) => {}
                        Err(err) => {
                            self.close();
                            if parts.is_empty() {
                                return Err(err);
                            }
                            self.failed = Some(err);
                        }
                    }
                }
            }
        }
        Ok(parts)
    }

    /// Signal end of body. Returns how many unterminated bytes were dropped,
    /// or the error of a malformed part not yet reported.
    ///
    /// Residue after the last delimiter is never parsed: without the next
    /// delimiter there is no proof the part is complete.
    pub fn finish(&mut self) -> Result<usize, MultipartError> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        let dropped = match self.state {
            State::Parts => self
                .buffer
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .count(),
            State::Preamble | State::Closed => 0,
        };
        self.close();
        Ok(dropped)
    }

    fn close(&mut self) {
        self.state = State::Closed;
        self.buffer.clear();
        self.scan_from = 0;
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        let found = find(&self.buffer, &self.delimiter, self.scan_from);
        if found.is_none() {
            // A delimiter may straddle the next chunk; rescan only the tail.
            self.scan_from = self
                .buffer
                .len()
                .saturating_sub(self.delimiter.len().saturating_sub(1));
        }
        found
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

// Region layout: rest-of-delimiter-line CRLF headers CRLF CRLF body
fn parse_region<T: DeserializeOwned>(region: &[u8]) -> Result<Option<T>, MultipartError> {
    let Some(line_end) = find(region, CRLF, 0) else {
        return Ok(None);
    };
    let rest = &region[line_end..];
    let body = if rest.starts_with(HEADER_END) {
        &rest[HEADER_END.len()..]
    } else if rest.trim_ascii().is_empty() {
        return Ok(None);
    } else {
        let sep = find(rest, HEADER_END, 0).ok_or(MultipartError::MalformedPart)?;
        &rest[sep + HEADER_END.len()..]
    };
    let body = body.trim_ascii();
    if body.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(body)?))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn boundary_parsing_handles_quotes_and_defaults() {
        assert_eq!(
            boundary_from_content_type(r#"multipart/mixed; boundary="graphql"; deferSpec=20220824"#),
            "graphql"
        );
        assert_eq!(
            boundary_from_content_type("multipart/mixed;boundary=abc"),
            "abc"
        );
        assert_eq!(boundary_from_content_type("multipart/mixed"), "-");
        assert_eq!(boundary_from_content_type(""), "-");
        assert_eq!(boundary_from_content_type("multipart/mixed; boundary="), "-");
    }

    #[test]
    fn detects_multipart_content_type() {
        assert!(is_multipart("Multipart/Mixed; boundary=\"-\""));
        assert!(!is_multipart("application/json"));
    }

    #[test]
    fn preamble_is_discarded() {
        let mut r: PatchResolver = PatchResolver::new("-");
        let body = "this is preamble\r\n---\r\nContent-Type: application/json\r\n\r\n{\"a\":1}\r\n-----\r\n";
        let parts = r.handle_chunk(body).unwrap();
        assert_eq!(parts, vec![json!({"a": 1})]);
        assert!(r.is_closed());
    }

    #[test]
    fn part_without_headers_is_accepted() {
        let mut r: PatchResolver = PatchResolver::new("b");
        let parts = r.handle_chunk("--b\r\n\r\n{\"x\":true}\r\n--b--").unwrap();
        assert_eq!(parts, vec![json!({"x": true})]);
    }

    #[test]
    fn part_is_held_until_next_delimiter() {
        let mut r: PatchResolver = PatchResolver::new("-");
        assert!(r
            .handle_chunk("\r\n---\r\nContent-Type: application/json\r\n\r\n{\"a\":1}")
            .unwrap()
            .is_empty());
        assert_eq!(r.handle_chunk("\r\n---").unwrap(), vec![json!({"a": 1})]);
    }

    #[test]
    fn malformed_json_is_fatal() {
        let mut r: PatchResolver = PatchResolver::new("-");
        let err = r
            .handle_chunk("\r\n---\r\nContent-Type: application/json\r\n\r\n{\"a\":\r\n---")
            .unwrap_err();
        assert!(matches!(err, MultipartError::Json(_)));
    }

    #[test]
    fn missing_header_terminator_is_fatal() {
        let mut r: PatchResolver = PatchResolver::new("-");
        let err = r
            .handle_chunk("\r\n---\r\nContent-Type: application/json\r\n{}\r\n---")
            .unwrap_err();
        assert!(matches!(err, MultipartError::MalformedPart));
    }

    #[test]
    fn parts_before_a_bad_part_survive_any_chunking() {
        let body = "\r\n---\r\n\r\n{\"a\":1}\r\n---\r\n\r\n{\"b\":\r\n-----\r\n";

        let mut whole: PatchResolver = PatchResolver::new("-");
        let parts = whole.handle_chunk(body).unwrap();
        assert_eq!(parts, vec![json!({"a": 1})]);
        assert!(whole.is_closed());
        assert!(matches!(whole.finish(), Err(MultipartError::Json(_))));
        assert_eq!(whole.finish().unwrap(), 0);

        let mut bytewise: PatchResolver = PatchResolver::new("-");
        let mut seen = Vec::new();
        let mut failure = None;
        for byte in body.as_bytes() {
            match bytewise.handle_chunk([*byte]) {
                Ok(parts) => seen.extend(parts),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        assert_eq!(seen, vec![json!({"a": 1})]);
        assert!(matches!(failure, Some(MultipartError::Json(_))));
    }

    #[test]
    fn deferred_error_is_reported_by_the_next_chunk() {
        let mut r: PatchResolver = PatchResolver::new("-");
        let parts = r
            .handle_chunk("\r\n---\r\n\r\n{\"a\":1}\r\n---\r\nno header end\r\n---")
            .unwrap();
        assert_eq!(parts, vec![json!({"a": 1})]);
        assert!(matches!(r.handle_chunk(""), Err(MultipartError::MalformedPart)));
        assert!(r.handle_chunk("").unwrap().is_empty());
    }

    #[test]
    fn nothing_after_close_is_parsed() {
        let mut r: PatchResolver = PatchResolver::new("-");
        r.handle_chunk("\r\n-----\r\n").unwrap();
        assert!(r.is_closed());
        assert!(r
            .handle_chunk("\r\n---\r\n\r\n{\"late\":1}\r\n---")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn finish_reports_dropped_residue() {
        let mut r: PatchResolver = PatchResolver::new("-");
        r.handle_chunk("\r\n---\r\nContent-Type: application/json\r\n\r\n{\"a\"")
            .unwrap();
        assert_eq!(r.finish().unwrap(), "Content-Type:application/json{\"a\"".len());
        assert!(r.is_closed());
    }
}
