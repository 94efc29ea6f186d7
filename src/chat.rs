/// Per-transcript chat context.
///
/// Everything a conversation needs travels in one `ChatContext`: the current
/// model, the context bundle, the transcript, the active session and its
/// connection, and the pending suggestion. There is no process-wide state;
/// the UI (or the single-shot runner) owns the context and feeds it network
/// messages from the channel it was created with.
use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::{self, ConnectionHandle, Endpoint, NetMessage, SessionId};
use crate::config::ResolvedConfig;
use crate::context::{ContextBundle, build_prompt};
use crate::session::{Session, SessionOutcome, SessionState};
use crate::suggestion::{self, Applied, ApplyError, Extractor, Suggestion, Workspace};
use crate::transcript::Transcript;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("a reply is still streaming; wait for it or cancel it first")]
    SessionBusy,
    #[error("nothing to send")]
    EmptyInput,
    #[error("no suggestion is pending")]
    NoSuggestion,
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("cannot build request: {0}")]
    Request(String),
}

/// One user-visible status message. Notices go to the status line, never
/// into the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Error(String),
}

impl Notice {
    pub fn text(&self) -> &str {
        match self {
            Notice::Info(s) | Notice::Error(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Notice::Error(_))
    }
}

pub struct ChatContext {
    model: String,
    endpoint: Endpoint,
    stream: bool,
    http: reqwest::Client,
    bundle: ContextBundle,
    transcript: Transcript,
    extractor: Extractor,
    workspace: Workspace,
    session: Option<Session>,
    connection: Option<ConnectionHandle>,
    pending: Option<Suggestion>,
    next_id: SessionId,
    tx: mpsc::UnboundedSender<NetMessage>,
}

impl ChatContext {
    pub fn new(config: &ResolvedConfig, tx: mpsc::UnboundedSender<NetMessage>) -> Result<Self> {
        let endpoint = Endpoint::parse(&config.endpoint, config.api_key.clone())?;
        Ok(Self {
            model: config.model.clone(),
            endpoint,
            stream: config.stream,
            http: reqwest::Client::new(),
            bundle: ContextBundle::new(),
            transcript: Transcript::new(),
            extractor: Extractor::new(config.delimiters.clone()),
            workspace: Workspace::new(&config.project_root),
            session: None,
            connection: None,
            pending: None,
            next_id: 1,
            tx,
        })
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn bundle(&self) -> &ContextBundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut ContextBundle {
        &mut self.bundle
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Takes effect from the next send.
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    pub fn pending(&self) -> Option<&Suggestion> {
        self.pending.as_ref()
    }

    /// The most recent session, active or finished.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_state(&self) -> Option<&SessionState> {
        self.session.as_ref().map(Session::state)
    }

    pub fn is_busy(&self) -> bool {
        self.session_state().is_some_and(SessionState::is_active)
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Submit the composition text and start a session for it.
    pub fn send(&mut self) -> Result<SessionId, ChatError> {
        if self.is_busy() {
            return Err(ChatError::SessionBusy);
        }
        let message = self.transcript.current_input().to_string();
        if message.trim().is_empty() {
            return Err(ChatError::EmptyInput);
        }

        let prompt = build_prompt(&self.bundle, self.extractor.delimiters(), &message);
        let body = client::request_body(&self.model, &prompt, self.stream)
            .map_err(|e| ChatError::Request(format!("{e:#}")))?;

        self.transcript.submit_input();
        // a suggestion only stands until the next turn
        if let Some(old) = self.pending.take() {
            tracing::debug!(file = %old.target, "dropping unapplied suggestion");
        }
        let id = self.next_id;
        self.next_id += 1;

        let mut session = if self.stream {
            Session::new(id, self.model.clone(), prompt)
        } else {
            Session::buffered(id, self.model.clone(), prompt)
        };
        session.start(&mut self.transcript);
        let handle = if self.stream {
            client::spawn_stream(&self.endpoint, self.endpoint.raw_request(&body), id, self.tx.clone())
        } else {
            client::spawn_generate(
                self.http.clone(),
                &self.endpoint,
                self.model.clone(),
                session.prompt().to_string(),
                id,
                self.tx.clone(),
            )
        };

        self.session = Some(session);
        self.connection = Some(handle);
        Ok(id)
    }

    /// Route one network message to the session it belongs to.
    ///
    /// A failed session has already rendered its `[error: …]` line, so
    /// failures produce no notice; the session state carries the error.
    pub fn handle_net(&mut self, msg: NetMessage) -> Option<Notice> {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(session = msg.session, "network message with no session");
            return None;
        };
        if session.id() != msg.session {
            tracing::debug!(session = msg.session, current = session.id(), "discarding message for stale session");
            return None;
        }

        let outcome = session.handle(msg.event, &mut self.transcript)?;
        // terminal: the connection is no longer needed
        self.connection = None;

        match outcome {
            SessionOutcome::Completed { text, .. } => {
                let found = self.extractor.extract(&text)?;
                let notice = Notice::Info(format!(
                    "suggested change to {} · Ctrl+Y apply · Ctrl+N reject",
                    found.target
                ));
                self.pending = Some(found);
                Some(notice)
            }
            SessionOutcome::Failed(_) => None,
        }
    }

    /// Stop the active session. Returns false when nothing was running.
    pub fn cancel(&mut self) -> bool {
        let cancelled = match self.session.as_mut() {
            Some(session) => session.cancel(&mut self.transcript).is_some(),
            None => false,
        };
        if let Some(mut connection) = self.connection.take() {
            connection.cancel();
        }
        cancelled
    }

    // ── Suggestions ───────────────────────────────────────────────────────────

    /// Apply the pending suggestion. The suggestion is consumed either way.
    pub fn accept_suggestion(&mut self) -> Result<Applied, ChatError> {
        let suggestion = self.pending.take().ok_or(ChatError::NoSuggestion)?;
        suggestion::apply(&mut self.workspace, &suggestion).map_err(|e| {
            tracing::warn!(file = %suggestion.target, error = %e, "suggestion not applied");
            ChatError::from(e)
        })
    }

    pub fn reject_suggestion(&mut self) -> Result<Suggestion, ChatError> {
        let suggestion = self.pending.take().ok_or(ChatError::NoSuggestion)?;
        tracing::info!(file = %suggestion.target, "suggestion rejected");
        Ok(suggestion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NetEvent;
    use crate::client::tests::serve_once;
    use crate::suggestion::Delimiters;
    use std::path::Path;

    const REPLY: &str = "{\"response\":\"Change it:\\n<<<SUGGESTION\\nFILE: app.py\\n\",\"done\":false}\n\
        {\"response\":\"BEFORE:\\n```\\nx = 1\\n```\\nAFTER:\\n```\\nx = 2\\n```\\nSUGGESTION>>>\\n\",\"done\":false}\n\
        {\"response\":\"\",\"done\":true}\n";

    fn config(base: &str, root: &Path) -> ResolvedConfig {
        ResolvedConfig {
            endpoint: base.to_string(),
            model: "llama3".to_string(),
            api_key: None,
            profile_name: "test".to_string(),
            stream: true,
            project_root: root.to_path_buf(),
            delimiters: Some(Delimiters::new("<<<SUGGESTION", "SUGGESTION>>>")),
            log_file: None,
        }
    }

    async fn drain(chat: &mut ChatContext, rx: &mut mpsc::UnboundedReceiver<NetMessage>) -> Vec<Notice> {
        let mut notices = Vec::new();
        while chat.is_busy() {
            let msg = rx.recv().await.expect("channel open");
            notices.extend(chat.handle_net(msg));
        }
        notices
    }

    #[tokio::test]
    async fn test_stream_extract_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "y = 0\nx = 1\n").unwrap();
        let (base, server) = serve_once(vec!["HTTP/1.0 200 OK\r\nContent-Type: application/x-ndjson\r\n\r\n", REPLY]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut chat = ChatContext::new(&config(&base, dir.path()), tx).unwrap();
        chat.bundle_mut().add_file(dir.path(), "app.py").unwrap();
        chat.transcript_mut().set_input("bump x");
        chat.send().unwrap();

        let notices = drain(&mut chat, &mut rx).await;
        assert_eq!(notices.len(), 1);
        assert!(notices[0].text().contains("app.py"));
        assert_eq!(chat.session_state(), Some(&SessionState::Completed));
        assert!(chat.transcript().view().contains("Assistant: Change it:"));
        assert_eq!(chat.transcript().current_input(), "");

        let request = server.await.unwrap();
        assert!(request.contains("### FILE: app.py"));
        assert!(request.contains("Question: bump x"));

        let before = chat.transcript().view().to_string();
        let applied = chat.accept_suggestion().unwrap();
        assert_eq!(applied.line, 2);
        let on_disk = std::fs::read_to_string(dir.path().join("app.py")).unwrap();
        assert_eq!(on_disk, "y = 0\nx = 2\n");
        assert_eq!(chat.transcript().view(), before);
        assert!(chat.pending().is_none());
        assert!(matches!(chat.accept_suggestion(), Err(ChatError::NoSuggestion)));
    }

    #[tokio::test]
    async fn test_send_while_streaming_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _server) = serve_once(vec!["HTTP/1.0 200 OK\r\n\r\n", "{\"response\":\"a\",\"done\":false}\n"]).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut chat = ChatContext::new(&config(&base, dir.path()), tx).unwrap();

        assert!(matches!(chat.send(), Err(ChatError::EmptyInput)));
        chat.transcript_mut().set_input("one");
        let first = chat.send().unwrap();
        chat.transcript_mut().set_input("two");
        assert!(matches!(chat.send(), Err(ChatError::SessionBusy)));
        assert_eq!(chat.session().map(Session::id), Some(first));
        // the rejected input stays in the composition region
        assert_eq!(chat.transcript().current_input(), "two");

        let notices = drain(&mut chat, &mut rx).await;
        assert!(matches!(chat.session_state(), Some(SessionState::Failed(_))));
        assert_eq!(chat.transcript().current_input(), "two");
        // the failure is reported once, in the transcript
        assert!(notices.is_empty());
        assert_eq!(chat.transcript().view().matches("[error:").count(), 1);
    }

    #[tokio::test]
    async fn test_conversational_turn_clears_pending_suggestion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\n").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (base, _server) = serve_once(vec!["HTTP/1.0 200 OK\r\n\r\n", REPLY]).await;
        let mut chat = ChatContext::new(&config(&base, dir.path()), tx).unwrap();
        chat.transcript_mut().set_input("bump x");
        chat.send().unwrap();
        drain(&mut chat, &mut rx).await;
        assert!(chat.pending().is_some());

        let (base, _server) = serve_once(vec![
            "HTTP/1.0 200 OK\r\n\r\n",
            "{\"response\":\"Sure, anything else?\",\"done\":false}\n{\"response\":\"\",\"done\":true}\n",
        ])
        .await;
        chat.endpoint = Endpoint::parse(&base, None).unwrap();
        chat.transcript_mut().set_input("thanks");
        chat.send().unwrap();
        let notices = drain(&mut chat, &mut rx).await;

        assert!(notices.is_empty());
        assert_eq!(chat.session_state(), Some(&SessionState::Completed));
        assert!(chat.pending().is_none());
        assert!(matches!(chat.accept_suggestion(), Err(ChatError::NoSuggestion)));
        assert_eq!(std::fs::read_to_string(dir.path().join("app.py")).unwrap(), "x = 1\n");
    }

    #[tokio::test]
    async fn test_cancel_discards_queued_messages() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        // nothing listens here; the connection attempt is cancelled straight away
        let mut chat = ChatContext::new(&config("http://127.0.0.1:9", dir.path()), tx).unwrap();
        chat.transcript_mut().set_input("hello");
        let id = chat.send().unwrap();
        assert!(chat.cancel());
        assert!(!chat.cancel());
        let view = chat.transcript().view().to_string();
        assert!(!view.contains("[error"));

        let late = NetMessage {
            session: id,
            event: NetEvent::Chunk(b"HTTP/1.0 200 OK\r\n\r\n{\"response\":\"late\",\"done\":true}\n".to_vec()),
        };
        assert_eq!(chat.handle_net(late), None);
        let stale = NetMessage {
            session: id + 100,
            event: NetEvent::Closed,
        };
        assert_eq!(chat.handle_net(stale), None);
        assert_eq!(chat.transcript().view(), view);
    }

    #[test]
    fn test_reject_and_changed_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut chat = ChatContext::new(&config("http://127.0.0.1:11434", dir.path()), tx).unwrap();

        let suggestion = Suggestion {
            target: "a.txt".into(),
            before: "beta".into(),
            after: "gamma".into(),
        };
        chat.pending = Some(suggestion.clone());
        assert_eq!(chat.reject_suggestion().unwrap(), suggestion);
        assert!(matches!(chat.reject_suggestion(), Err(ChatError::NoSuggestion)));

        chat.pending = Some(suggestion);
        assert!(matches!(
            chat.accept_suggestion(),
            Err(ChatError::Apply(ApplyError::TextNotFound(_)))
        ));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "alpha\n");
        assert!(chat.pending().is_none());
    }

    #[test]
    fn test_model_switch_applies_to_next_send() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut chat = ChatContext::new(&config("http://127.0.0.1:11434", dir.path()), tx).unwrap();
        chat.set_model("qwen3:8b");
        assert_eq!(chat.model(), "qwen3:8b");
        assert!(ChatContext::new(&config("ftp://x", dir.path()), mpsc::unbounded_channel().0).is_err());
    }
}
