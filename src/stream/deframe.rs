/// HTTP response de-framing.
///
/// The transport hands us the raw response: status line, headers, blank line,
/// then the NDJSON body. The header block is removed exactly once per
/// connection; after that every byte goes straight to the line decoder, so a
/// blank line inside the body is never mistaken for the end of the headers.
use super::{Event, LineDecoder, ProtocolError};

#[derive(Debug, Default)]
pub struct Deframer {
    head: Vec<u8>,
    /// Bytes of `head` already searched for the terminator.
    scanned: usize,
    headers_stripped: bool,
    status: Option<u16>,
    decoder: LineDecoder,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        if self.headers_stripped {
            return self.decoder.feed(chunk);
        }
        if chunk.is_empty() {
            return Vec::new();
        }
        self.head.extend_from_slice(chunk);

        // A terminator may straddle the previous chunk boundary
        let from = self.scanned.saturating_sub(3);
        let Some((head_end, body_start)) = find_header_end(&self.head, from) else {
            self.scanned = self.head.len();
            return Vec::new();
        };

        self.status = parse_status_line(&self.head[..head_end]);
        self.headers_stripped = true;
        match self.status {
            Some(code) if !(200..300).contains(&code) => {
                tracing::warn!(status = code, "generate endpoint returned an error status");
            }
            Some(code) => tracing::debug!(status = code, "response headers received"),
            None => tracing::warn!("unparseable HTTP status line"),
        }

        let body = self.head.split_off(body_start);
        self.head = Vec::new();
        self.scanned = 0;
        self.decoder.feed(&body)
    }

    /// Called once the connection has closed.
    pub fn finish(&mut self) -> Result<Option<Event>, ProtocolError> {
        if !self.headers_stripped {
            return Err(ProtocolError::MissingHeaderTerminator);
        }
        Ok(self.decoder.finish())
    }

    /// Status code from the response line, once headers have arrived.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }

    pub fn dropped_lines(&self) -> usize {
        self.decoder.dropped()
    }
}

/// Returns `(end_of_headers, start_of_body)` for the first blank line at or
/// after `from`. Both `\r\n\r\n` and bare `\n\n` are accepted.
fn find_header_end(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Some((i, i + 2));
            }
            if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                return Some((i, i + 3));
            }
        }
        i += 1;
    }
    None
}

fn parse_status_line(head: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(head).ok()?;
    let line = text.lines().next()?;
    let mut parts = line.split_whitespace();
    let proto = parts.next()?;
    if !proto.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_to_end_example() {
        let mut d = Deframer::new();
        let first = d.feed(b"HTTP/1.1 200 OK\r\n\r\n{\"response\":\"Hel");
        assert!(first.is_empty());
        assert!(d.headers_stripped);
        let events = d.feed(b"lo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].token.as_deref(), Some("Hello"));
        assert!(!events[0].done);
        assert_eq!(events[1].token.as_deref(), Some(""));
        assert!(events[1].done);
        assert_eq!(d.status(), Some(200));
    }

    #[test]
    fn test_headers_deferred_until_terminator() {
        let mut d = Deframer::new();
        assert!(d.feed(b"HTTP/1.0 200 OK\r\nContent-Type: application/x-ndjson\r").is_empty());
        assert!(!d.headers_stripped);
        assert!(d.feed(b"\n\r").is_empty());
        assert!(!d.headers_stripped);
        let events = d.feed(b"\n{\"response\":\"x\",\"done\":false}\n");
        assert!(d.headers_stripped);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token.as_deref(), Some("x"));
    }

    #[test]
    fn test_header_strip_runs_once() {
        let mut d = Deframer::new();
        let mut events = d.feed(b"HTTP/1.1 200 OK\r\nX: y\r\n\r\n{\"response\":\"a\",\"done\":false}\n");
        // A blank-line pattern inside the body must not be taken for headers
        events.extend(d.feed(b"\r\n\r\n{\"response\":\"b\",\"done\":false}\n\n\n"));
        events.extend(d.feed(b"{\"response\":\"\",\"done\":true}\n"));
        let tokens: Vec<_> = events.iter().filter_map(|e| e.token.clone()).collect();
        assert_eq!(tokens, vec!["a", "b", ""]);
        assert!(events[2].done);
    }

    #[test]
    fn test_missing_terminator_is_protocol_error() {
        let mut d = Deframer::new();
        d.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n");
        assert_eq!(d.finish(), Err(ProtocolError::MissingHeaderTerminator));
    }

    #[test]
    fn test_error_status_recorded() {
        let mut d = Deframer::new();
        let events = d.feed(b"HTTP/1.1 404 Not Found\r\n\r\n{\"error\":\"model 'x' not found\"}\n");
        assert!(events.is_empty());
        assert_eq!(d.status(), Some(404));
        assert!(!d.is_success());
        assert_eq!(d.dropped_lines(), 1);
    }

    #[test]
    fn test_bare_lf_headers() {
        let mut d = Deframer::new();
        let events = d.feed(b"HTTP/1.1 200 OK\nServer: test\n\n{\"response\":\"ok\",\"done\":true}\n");
        assert_eq!(events.len(), 1);
        assert!(d.is_success());
    }
}
