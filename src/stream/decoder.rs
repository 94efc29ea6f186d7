/// Newline-delimited JSON decoding.
///
/// The server writes one JSON object per line, but socket reads split lines at
/// arbitrary byte offsets. `LineDecoder` buffers bytes until a `\n` arrives and
/// only then attempts to parse. Lines that fail to parse are dropped and logged,
/// never surfaced, so a single bad line cannot abort a stream.
use serde::Deserialize;
use thiserror::Error;

// ── Decoded event ─────────────────────────────────────────────────────────────

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Text produced since the previous event. Empty on the final event.
    pub token: Option<String>,
    /// True on the final event of a generation.
    pub done: bool,
    /// Generation counters the server attaches to the final event.
    pub stats: Option<GenerationStats>,
}

impl Event {
    /// The token, if it carries any text.
    pub fn text(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationStats {
    /// Number of tokens the model generated.
    pub eval_count: Option<u64>,
    /// Wall time of the whole request, in nanoseconds.
    pub total_duration: Option<u64>,
}

// ── Wire shape ────────────────────────────────────────────────────────────────

/// `done` is required: an object without it is not a generate event.
#[derive(Debug, Deserialize)]
struct WireEvent {
    response: Option<String>,
    done: bool,
    eval_count: Option<u64>,
    total_duration: Option<u64>,
}

impl From<WireEvent> for Event {
    fn from(w: WireEvent) -> Self {
        let stats = if w.eval_count.is_some() || w.total_duration.is_some() {
            Some(GenerationStats {
                eval_count: w.eval_count,
                total_duration: w.total_duration,
            })
        } else {
            None
        };
        Event {
            token: w.response,
            done: w.done,
            stats,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event line: {0}")]
    Malformed(#[from] serde_json::Error),
}

// ── Decoder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for a terminator.
    scanned: usize,
    dropped: usize,
}

impl LineDecoder {
    /// Append `chunk` and return every event completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut line_start = 0;
        let mut search_from = self.scanned;
        while let Some(rel) = self.buf[search_from..].iter().position(|&b| b == b'\n') {
            let end = search_from + rel;
            match decode_line(&self.buf[line_start..end]) {
                Ok(Some(ev)) => events.push(ev),
                Ok(None) => {}
                Err(e) => {
                    self.dropped += 1;
                    tracing::debug!(error = %e, "dropping undecodable stream line");
                }
            }
            line_start = end + 1;
            search_from = line_start;
        }

        self.buf.drain(..line_start);
        self.scanned = self.buf.len();
        events
    }

    /// Flush an unterminated trailing line once the connection has closed.
    pub fn finish(&mut self) -> Option<Event> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        match decode_line(&rest) {
            Ok(ev) => ev,
            Err(e) => {
                self.dropped += 1;
                tracing::debug!(error = %e, bytes = rest.len(), "dropping partial line at close");
                None
            }
        }
    }

    /// Lines discarded because they were not valid events.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// `Ok(None)` for blank or control-only lines.
fn decode_line(line: &[u8]) -> Result<Option<Event>, DecodeError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Ok(None);
    }
    let wire: WireEvent = serde_json::from_slice(line)?;
    Ok(Some(wire.into()))
}
