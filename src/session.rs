/// One request/response exchange with the model.
///
/// States: `Idle → Connecting → Streaming → Completed`, with `Failed`
/// reachable from `Connecting` or `Streaming`. The session owns the
/// de-framer for its connection and a marker into the transcript where its
/// output goes. A buffered session renders nothing until the whole reply is in,
/// then appends it as one turn. Network events arrive through [`Session::handle`]; once the
/// session is terminal every further event is ignored, which is what makes
/// finalisation fire exactly once.
use std::time::Instant;
use thiserror::Error;

use crate::client::{NetEvent, SessionId};
use crate::stream::{Deframer, Event, GenerationStats, ProtocolError};
use crate::transcript::{Marker, Role, Transcript};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed(SessionError),
}

impl SessionState {
    /// Connecting or Streaming: the session holds the insertion point.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Streaming)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Streaming => "streaming",
            SessionState::Completed => "done",
            SessionState::Failed(SessionError::Cancelled) => "cancelled",
            SessionState::Failed(_) => "failed",
        }
    }
}

/// What a terminal transition produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed {
        text: String,
        stats: Option<GenerationStats>,
    },
    Failed(SessionError),
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    model: String,
    prompt: String,
    state: SessionState,
    deframer: Deframer,
    insertion: Option<Marker>,
    buffered: bool,
    tokens: usize,
    text: String,
    started: Option<Instant>,
}

impl Session {
    pub fn new(id: SessionId, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id,
            model: model.into(),
            prompt: prompt.into(),
            state: SessionState::Idle,
            deframer: Deframer::new(),
            insertion: None,
            buffered: false,
            tokens: 0,
            text: String::new(),
            started: None,
        }
    }

    /// A session whose reply arrives as one `Response` event.
    pub fn buffered(id: SessionId, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            buffered: true,
            ..Self::new(id, model, prompt)
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Non-empty tokens received so far.
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// All text this session has inserted into the transcript.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Idle → Connecting. Opens the assistant header and takes the insertion
    /// point, unless the session is buffered.
    pub fn start(&mut self, transcript: &mut Transcript) {
        if self.state != SessionState::Idle {
            return;
        }
        if !self.buffered {
            self.insertion = Some(transcript.open_response());
        }
        self.state = SessionState::Connecting;
        self.started = Some(Instant::now());
        tracing::info!(
            session = self.id,
            model = %self.model,
            prompt_bytes = self.prompt.len(),
            buffered = self.buffered,
            "session started"
        );
    }

    pub fn handle(&mut self, event: NetEvent, transcript: &mut Transcript) -> Option<SessionOutcome> {
        if !self.state.is_active() {
            tracing::debug!(session = self.id, state = self.state.label(), "ignoring event for inactive session");
            return None;
        }
        match event {
            NetEvent::Connected => {
                tracing::debug!(session = self.id, "connected");
                None
            }
            NetEvent::Chunk(bytes) => {
                let events = self.deframer.feed(&bytes);
                self.apply_events(events, transcript)
            }
            NetEvent::Response(text) => {
                let event = Event {
                    token: Some(text),
                    done: true,
                    stats: None,
                };
                self.apply_events(vec![event], transcript)
            }
            NetEvent::Closed => Some(self.on_closed(transcript)),
            NetEvent::Error(msg) => Some(self.fail(SessionError::Connection(msg), transcript)),
        }
    }

    /// User-initiated stop. No notice is rendered.
    pub fn cancel(&mut self, transcript: &mut Transcript) -> Option<SessionOutcome> {
        if !self.state.is_active() {
            return None;
        }
        Some(self.fail(SessionError::Cancelled, transcript))
    }

    fn apply_events(&mut self, events: Vec<Event>, transcript: &mut Transcript) -> Option<SessionOutcome> {
        for event in events {
            if self.state == SessionState::Connecting {
                self.state = SessionState::Streaming;
            }
            if let Some(token) = event.text() {
                self.insert(token, transcript);
                self.text.push_str(token);
                self.tokens += 1;
            }
            if event.done {
                return Some(self.finalize(event.stats, transcript));
            }
        }
        None
    }

    fn on_closed(&mut self, transcript: &mut Transcript) -> SessionOutcome {
        match self.deframer.finish() {
            Ok(Some(last)) => {
                if let Some(outcome) = self.apply_events(vec![last], transcript) {
                    return outcome;
                }
            }
            Ok(None) => {}
            Err(e) => return self.fail(e.into(), transcript),
        }
        let err = match self.deframer.status() {
            Some(code) if !self.deframer.is_success() => ProtocolError::HttpStatus(code),
            _ => ProtocolError::PrematureClose,
        };
        self.fail(err.into(), transcript)
    }

    fn insert(&self, text: &str, transcript: &mut Transcript) {
        let Some(marker) = self.insertion else { return };
        if let Err(e) = transcript.insert_at(marker, text) {
            tracing::warn!(session = self.id, error = %e, "lost insertion point");
        }
    }

    fn finalize(&mut self, stats: Option<GenerationStats>, transcript: &mut Transcript) -> SessionOutcome {
        self.state = SessionState::Completed;
        if self.buffered {
            transcript.append_turn(Role::Assistant, &self.text);
        } else {
            transcript.record_turn(Role::Assistant, self.text.clone());
        }
        self.close(transcript);
        tracing::info!(
            session = self.id,
            tokens = self.tokens,
            eval_count = stats.and_then(|s| s.eval_count),
            elapsed_ms = self.elapsed_ms(),
            dropped_lines = self.deframer.dropped_lines(),
            "session completed"
        );
        SessionOutcome::Completed {
            text: self.text.clone(),
            stats,
        }
    }

    fn fail(&mut self, error: SessionError, transcript: &mut Transcript) -> SessionOutcome {
        if error != SessionError::Cancelled {
            let notice = format!("\n[error: {error}]");
            if self.buffered {
                transcript.append_notice(&notice);
            } else {
                self.insert(&notice, transcript);
            }
            tracing::warn!(session = self.id, %error, tokens = self.tokens, "session failed");
        } else {
            tracing::info!(session = self.id, tokens = self.tokens, "session cancelled");
        }
        self.state = SessionState::Failed(error.clone());
        self.close(transcript);
        SessionOutcome::Failed(error)
    }

    /// Give back the insertion point and reopen the composition region.
    fn close(&mut self, transcript: &mut Transcript) {
        if let Some(marker) = self.insertion.take() {
            transcript.release_marker(marker);
        }
        transcript.begin_new_turn();
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.map(|t| t.elapsed().as_millis() as u64).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(transcript: &mut Transcript) -> Session {
        transcript.set_input("hi");
        transcript.submit_input();
        let mut s = Session::new(1, "llama3", "hi");
        s.start(transcript);
        s
    }

    fn chunk(b: &[u8]) -> NetEvent {
        NetEvent::Chunk(b.to_vec())
    }

    #[test]
    fn test_streams_and_finalizes() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        assert_eq!(s.state(), &SessionState::Connecting);

        assert_eq!(s.handle(NetEvent::Connected, &mut t), None);
        assert_eq!(s.handle(chunk(b"HTTP/1.1 200 OK\r\n\r\n{\"response\":\"Hel"), &mut t), None);
        assert_eq!(s.state(), &SessionState::Connecting);

        let out = s.handle(chunk(b"lo\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n"), &mut t);
        assert_eq!(
            out,
            Some(SessionOutcome::Completed {
                text: "Hello".to_string(),
                stats: None
            })
        );
        assert_eq!(s.state(), &SessionState::Completed);
        assert_eq!(s.tokens(), 1);
        assert_eq!(t.view(), "You: hi\n\nAssistant: Hello\n\nYou: ");
        assert_eq!(t.turns().last().map(|turn| turn.content.as_str()), Some("Hello"));
    }

    #[test]
    fn test_first_event_moves_to_streaming() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(chunk(b"HTTP/1.1 200 OK\r\n\r\n{\"response\":\"a\",\"done\":false}\n"), &mut t);
        assert_eq!(s.state(), &SessionState::Streaming);
        assert_eq!(s.text(), "a");
    }

    #[test]
    fn test_duplicate_done_finalizes_once() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        let first = s.handle(
            chunk(b"HTTP/1.1 200 OK\r\n\r\n{\"response\":\"ok\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n{\"response\":\"!\",\"done\":true}\n"),
            &mut t,
        );
        assert!(matches!(first, Some(SessionOutcome::Completed { .. })));
        let second = s.handle(chunk(b"{\"response\":\"again\",\"done\":true}\n"), &mut t);
        assert_eq!(second, None);
        assert_eq!(s.handle(NetEvent::Closed, &mut t), None);

        assert_eq!(t.view(), "You: hi\n\nAssistant: ok\n\nYou: ");
        assert_eq!(t.view().matches("You: ").count(), 2);
    }

    #[test]
    fn test_close_without_done_fails_with_notice() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(chunk(b"HTTP/1.1 200 OK\r\n\r\n{\"response\":\"part\",\"done\":false}\n"), &mut t);
        let out = s.handle(NetEvent::Closed, &mut t);
        assert_eq!(out, Some(SessionOutcome::Failed(ProtocolError::PrematureClose.into())));
        assert_eq!(t.view().matches("[error:").count(), 1);
        assert!(t.view().ends_with("[error: stream closed before the model finished]\n\nYou: "));
        assert_eq!(t.current_input(), "");
        // partial output is not recorded as an assistant turn
        assert_eq!(t.turns().len(), 1);
    }

    #[test]
    fn test_close_before_headers_is_protocol_error() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(chunk(b"HTTP/1.1 200 OK\r\nContent-Type: x"), &mut t);
        let out = s.handle(NetEvent::Closed, &mut t);
        assert_eq!(
            out,
            Some(SessionOutcome::Failed(ProtocolError::MissingHeaderTerminator.into()))
        );
    }

    #[test]
    fn test_error_status_is_reported() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(chunk(b"HTTP/1.1 404 Not Found\r\n\r\n{\"error\":\"model not found\"}\n"), &mut t);
        let out = s.handle(NetEvent::Closed, &mut t);
        assert_eq!(out, Some(SessionOutcome::Failed(ProtocolError::HttpStatus(404).into())));
        assert!(t.view().contains("[error: server answered with HTTP 404]"));
    }

    #[test]
    fn test_connection_error() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        let out = s.handle(NetEvent::Error("connection refused".into()), &mut t);
        assert!(matches!(out, Some(SessionOutcome::Failed(SessionError::Connection(_)))));
        assert!(t.view().contains("[error: connection failed: connection refused]"));
        assert!(matches!(s.state(), SessionState::Failed(_)));
    }

    #[test]
    fn test_cancel_inserts_no_notice() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(chunk(b"HTTP/1.1 200 OK\r\n\r\n{\"response\":\"par\",\"done\":false}\n"), &mut t);
        assert_eq!(s.cancel(&mut t), Some(SessionOutcome::Failed(SessionError::Cancelled)));
        assert!(!t.view().contains("[error"));
        assert_eq!(s.state().label(), "cancelled");
        // queued chunks that arrive afterwards are ignored
        assert_eq!(s.handle(chunk(b"{\"response\":\"x\",\"done\":true}\n"), &mut t), None);
        assert_eq!(s.cancel(&mut t), None);
        assert_eq!(t.view(), "You: hi\n\nAssistant: par\n\nYou: ");
    }

    #[test]
    fn test_non_streaming_response() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(NetEvent::Connected, &mut t);
        let out = s.handle(NetEvent::Response("four".into()), &mut t);
        assert!(matches!(out, Some(SessionOutcome::Completed { .. })));
        assert_eq!(s.handle(NetEvent::Closed, &mut t), None);
        assert_eq!(t.view(), "You: hi\n\nAssistant: four\n\nYou: ");
    }

    #[test]
    fn test_buffered_reply_is_appended_whole() {
        let mut t = Transcript::new();
        t.set_input("hi");
        t.submit_input();
        let mut s = Session::buffered(2, "llama3", "hi");
        s.start(&mut t);
        assert_eq!(s.state(), &SessionState::Connecting);
        // nothing rendered while the request is in flight
        assert_eq!(t.view(), "You: hi");

        t.set_input("next");
        let out = s.handle(NetEvent::Response("four".into()), &mut t);
        assert!(matches!(out, Some(SessionOutcome::Completed { .. })));
        assert_eq!(t.view(), "You: hi\n\nAssistant: four\n\nYou: next");
        assert_eq!(t.turns().len(), 2);
        assert_eq!(t.turns()[1].content, "four");
    }

    #[test]
    fn test_buffered_failure_renders_one_notice() {
        let mut t = Transcript::new();
        t.set_input("hi");
        t.submit_input();
        let mut s = Session::buffered(3, "llama3", "hi");
        s.start(&mut t);
        s.handle(NetEvent::Error("refused".into()), &mut t);
        assert_eq!(t.view(), "You: hi\n[error: connection failed: refused]\n\nYou: ");
        assert_eq!(t.turns().len(), 1);
    }

    #[test]
    fn test_unterminated_final_line_completes_on_close() {
        let mut t = Transcript::new();
        let mut s = started(&mut t);
        s.handle(chunk(b"HTTP/1.0 200 OK\r\n\r\n{\"response\":\"x\",\"done\":false}\n{\"response\":\"\",\"done\":true}"), &mut t);
        assert!(matches!(s.handle(NetEvent::Closed, &mut t), Some(SessionOutcome::Completed { .. })));
    }
}
