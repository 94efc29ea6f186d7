/// Ratatui-based TUI for oxchat.
///
/// Architecture:
///   main task:        event loop over crossterm keyboard events and the NetMessage channel
///   connection tasks: one tokio::spawn per session, sending NetMessages via UnboundedSender
///
/// Layout:
///   ┌────────────────────────────────────────────────┐
///   │  transcript, composition region at the tail    │
///   ├────────────────────────────────────────────────┤
///   │  suggestion preview (only while one is pending)│
///   ├────────────────────────────────────────────────┤
///   │  status bar (1 line)                           │
///   └────────────────────────────────────────────────┘
pub mod render;

use std::io;

use anyhow::Result;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures_util::StreamExt;
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio::sync::mpsc;

use crate::chat::{ChatContext, ChatError, Notice};
use crate::client::NetMessage;
use crate::config::ResolvedConfig;
use crate::transcript::{Role, Transcript};

pub const SPINNER_GLYPHS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

const HELP: &str = "/add <path>  /drop [path]  /context  /model [name]  /accept  /reject  /cancel  /quit  ·  \
    Enter send · Alt+Enter newline · Esc cancel · Ctrl+Y apply · Ctrl+N reject · PgUp/PgDn scroll";

// ── AppState ──────────────────────────────────────────────────────────────────

pub struct AppState {
    pub chat: ChatContext,
    /// Byte offset within the composition region
    pub cursor: usize,
    /// Lines scrolled up from the bottom of the transcript
    pub scroll: usize,
    pub notice: Option<Notice>,
    /// Incremented every 120ms while a session is active
    pub spinner_tick: u32,
    pub profile: String,
}

impl AppState {
    pub fn new(chat: ChatContext, resolved: &ResolvedConfig) -> Self {
        Self {
            chat,
            cursor: 0,
            scroll: 0,
            notice: Some(Notice::Info(format!("oxchat · {} · /help for commands", resolved.endpoint))),
            spinner_tick: 0,
            profile: resolved.profile_name.clone(),
        }
    }

    fn info(&mut self, msg: impl Into<String>) {
        self.notice = Some(Notice::Info(msg.into()));
    }

    fn error(&mut self, msg: impl Into<String>) {
        self.notice = Some(Notice::Error(msg.into()));
    }

    fn apply_net(&mut self, msg: NetMessage) {
        if let Some(notice) = self.chat.handle_net(msg) {
            self.notice = Some(notice);
        }
    }

    fn clear_input(&mut self) {
        self.chat.transcript_mut().set_input("");
        self.cursor = 0;
    }
}

// ── Slash commands ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Add(String),
    /// None clears the whole bundle
    Drop(Option<String>),
    Context,
    Model(Option<String>),
    Accept,
    Reject,
    Cancel,
    Help,
    Quit,
}

fn parse_command(input: &str) -> Result<Command, String> {
    let mut parts = input.trim().splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty()).map(str::to_string);
    match (name, arg) {
        ("/add", Some(path)) => Ok(Command::Add(path)),
        ("/add", None) => Err("usage: /add <path>".to_string()),
        ("/drop", arg) => Ok(Command::Drop(arg)),
        ("/context" | "/ctx", _) => Ok(Command::Context),
        ("/model", arg) => Ok(Command::Model(arg)),
        ("/accept" | "/apply", _) => Ok(Command::Accept),
        ("/reject", _) => Ok(Command::Reject),
        ("/cancel", _) => Ok(Command::Cancel),
        ("/help" | "/h", _) => Ok(Command::Help),
        ("/quit" | "/exit" | "/q", _) => Ok(Command::Quit),
        (other, _) => Err(format!("unknown command {other} · /help")),
    }
}

/// Returns false when the user asked to quit.
fn execute_command(command: Command, state: &mut AppState) -> bool {
    match command {
        Command::Quit => return false,
        Command::Help => state.info(HELP),
        Command::Add(path) => {
            let root = state.chat.workspace().root().to_path_buf();
            match state.chat.bundle_mut().add_file(&root, &path) {
                Ok(()) => {
                    let n = state.chat.bundle().len();
                    state.info(format!("+ {path}  ({n} file{} in context)", if n == 1 { "" } else { "s" }));
                }
                Err(e) => state.error(format!("{e:#}")),
            }
        }
        Command::Drop(Some(path)) => {
            if state.chat.bundle_mut().remove(&path) {
                state.info(format!("- {path}"));
            } else {
                state.error(format!("{path} is not in the context"));
            }
        }
        Command::Drop(None) => {
            state.chat.bundle_mut().clear();
            state.info("context cleared");
        }
        Command::Context => {
            let names: Vec<&str> = state
                .chat
                .bundle()
                .entries()
                .iter()
                .map(|e| e.identifier.as_str())
                .collect();
            if names.is_empty() {
                state.info("context is empty · /add <path>");
            } else {
                state.info(format!("context: {}", names.join(", ")));
            }
        }
        Command::Model(None) => {
            let model = state.chat.model().to_string();
            state.info(format!("model {model}"));
        }
        Command::Model(Some(name)) => {
            state.chat.set_model(name.clone());
            tracing::info!(model = %name, "model switched");
            state.info(format!("model → {name}"));
        }
        Command::Accept => accept(state),
        Command::Reject => reject(state),
        Command::Cancel => cancel(state),
    }
    true
}

fn accept(state: &mut AppState) {
    match state.chat.accept_suggestion() {
        Ok(applied) => state.info(format!("✓ applied to {}:{}", applied.target, applied.line)),
        Err(e) => state.error(format!("✗ {e}")),
    }
}

fn reject(state: &mut AppState) {
    match state.chat.reject_suggestion() {
        Ok(s) => state.info(format!("discarded suggestion for {}", s.target)),
        Err(e) => state.error(e.to_string()),
    }
}

fn cancel(state: &mut AppState) {
    if state.chat.cancel() {
        state.info("cancelled");
    } else {
        state.info("nothing to cancel");
    }
}

// ── Terminal setup / teardown ─────────────────────────────────────────────────

fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>) {
    let _ = disable_raw_mode();
    let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen);
    let _ = terminal.show_cursor();
}

// ── Main TUI run loop ─────────────────────────────────────────────────────────

pub async fn run(resolved: ResolvedConfig, context_files: Vec<String>) -> Result<()> {
    let (net_tx, net_rx) = mpsc::unbounded_channel::<NetMessage>();
    let chat = ChatContext::new(&resolved, net_tx)?;
    let mut state = AppState::new(chat, &resolved);
    for path in context_files {
        execute_command(Command::Add(path), &mut state);
    }

    let mut terminal = setup_terminal()?;

    // Restore the terminal before the panic message is printed
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        orig_hook(info);
    }));

    let result = event_loop(&mut terminal, &mut state, net_rx).await;

    state.chat.cancel();
    restore_terminal(&mut terminal);
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    state: &mut AppState,
    mut net_rx: mpsc::UnboundedReceiver<NetMessage>,
) -> Result<()> {
    let mut crossterm_events = EventStream::new();
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(120));

    terminal.draw(|f| render::draw(f, state))?;

    loop {
        tokio::select! {
            // ── Animation tick ────────────────────────────────────────────────
            _ = ticker.tick() => {
                if state.chat.is_busy() {
                    state.spinner_tick = state.spinner_tick.wrapping_add(1);
                    terminal.draw(|f| render::draw(f, state))?;
                }
            }

            // ── Network events from connection tasks ──────────────────────────
            Some(msg) = net_rx.recv() => {
                state.apply_net(msg);
                terminal.draw(|f| render::draw(f, state))?;
            }

            // ── Keyboard/resize events ────────────────────────────────────────
            Some(Ok(ev)) = crossterm_events.next() => {
                match ev {
                    Event::Key(key) if key.kind != KeyEventKind::Release => {
                        if !handle_key(key, state) {
                            break;
                        }
                    }
                    _ => {}
                }
                terminal.draw(|f| render::draw(f, state))?;
            }
        }
    }

    Ok(())
}

// ── Key handler ───────────────────────────────────────────────────────────────

/// Returns false when the app should exit.
fn handle_key(key: KeyEvent, state: &mut AppState) -> bool {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    let alt = key.modifiers.contains(KeyModifiers::ALT);

    match key.code {
        KeyCode::Char('c') if ctrl => return false,
        KeyCode::Char('y') if ctrl => accept(state),
        KeyCode::Char('n') if ctrl => reject(state),
        KeyCode::Esc => {
            if state.chat.is_busy() {
                cancel(state);
            } else {
                state.notice = None;
            }
        }
        KeyCode::Enter if alt => insert_text(state, "\n"),
        KeyCode::Enter => return submit(state),
        KeyCode::PageUp => state.scroll = state.scroll.saturating_add(10),
        KeyCode::PageDown => state.scroll = state.scroll.saturating_sub(10),
        KeyCode::Up if state.chat.transcript().current_input().is_empty() => recall_last_prompt(state),

        // ── Input editing ─────────────────────────────────────────────────────
        KeyCode::Char('w') if ctrl => input_delete_word(state.chat.transcript_mut(), &mut state.cursor),
        KeyCode::Char('u') if ctrl => state.clear_input(),
        KeyCode::Char('a') if ctrl => state.cursor = 0,
        KeyCode::Char('e') if ctrl => state.cursor = state.chat.transcript().current_input().len(),
        KeyCode::Backspace => input_backspace(state.chat.transcript_mut(), &mut state.cursor),
        KeyCode::Delete => input_delete_forward(state.chat.transcript_mut(), &mut state.cursor),
        KeyCode::Left if ctrl => state.cursor = word_left(state.chat.transcript().current_input(), state.cursor),
        KeyCode::Right if ctrl => state.cursor = word_right(state.chat.transcript().current_input(), state.cursor),
        KeyCode::Left => state.cursor = prev_char_boundary(state.chat.transcript().current_input(), state.cursor),
        KeyCode::Right => state.cursor = next_char_boundary(state.chat.transcript().current_input(), state.cursor),
        KeyCode::Home => state.cursor = 0,
        KeyCode::End => state.cursor = state.chat.transcript().current_input().len(),
        KeyCode::Char(c) if !ctrl => {
            let mut buf = [0u8; 4];
            insert_text(state, c.encode_utf8(&mut buf));
        }
        _ => {}
    }
    true
}

fn insert_text(state: &mut AppState, s: &str) {
    let transcript = state.chat.transcript_mut();
    let cursor = state.cursor.min(transcript.current_input().len());
    let pos = transcript.composition_start() + cursor;
    match transcript.edit_at(pos, s) {
        Ok(()) => state.cursor = cursor + s.len(),
        Err(e) => tracing::debug!(error = %e, "input edit refused"),
    }
}

/// Up on an empty input: bring back the last message sent.
fn recall_last_prompt(state: &mut AppState) {
    let last = state
        .chat
        .transcript()
        .turns()
        .iter()
        .rev()
        .find(|t| t.role == Role::User)
        .map(|t| t.content.clone());
    if let Some(text) = last {
        state.chat.transcript_mut().set_input(&text);
        state.cursor = text.len();
    }
}

/// Enter: run a slash command or send the composition text.
fn submit(state: &mut AppState) -> bool {
    let input = state.chat.transcript().current_input().trim().to_string();
    if input.starts_with('/') {
        state.clear_input();
        return match parse_command(&input) {
            Ok(command) => execute_command(command, state),
            Err(msg) => {
                state.error(msg);
                true
            }
        };
    }

    match state.chat.send() {
        Ok(_) => {
            state.cursor = 0;
            state.scroll = 0;
            state.notice = None;
        }
        Err(ChatError::EmptyInput) => {}
        Err(e) => state.error(e.to_string()),
    }
    true
}

// ── Input editing helpers ─────────────────────────────────────────────────────

/// Remove the character immediately before the cursor (UTF-8 safe).
fn input_backspace(transcript: &mut Transcript, cursor: &mut usize) {
    if *cursor == 0 {
        return;
    }
    let prev = prev_char_boundary(transcript.current_input(), *cursor);
    if transcript.delete_input(prev..*cursor).is_ok() {
        *cursor = prev;
    }
}

/// Delete the character at the cursor position.
fn input_delete_forward(transcript: &mut Transcript, cursor: &mut usize) {
    let input = transcript.current_input();
    if *cursor >= input.len() {
        return;
    }
    let next = next_char_boundary(input, *cursor);
    let _ = transcript.delete_input(*cursor..next);
}

/// Delete the word immediately before the cursor.
fn input_delete_word(transcript: &mut Transcript, cursor: &mut usize) {
    if *cursor == 0 {
        return;
    }
    let start = word_left(transcript.current_input(), *cursor);
    if transcript.delete_input(start..*cursor).is_ok() {
        *cursor = start;
    }
}

/// Previous UTF-8 char boundary before `pos`.
fn prev_char_boundary(s: &str, pos: usize) -> usize {
    let mut p = pos.min(s.len());
    if p == 0 {
        return 0;
    }
    p -= 1;
    while !s.is_char_boundary(p) {
        p -= 1;
    }
    p
}

/// Next UTF-8 char boundary after `pos`.
fn next_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut p = pos + 1;
    while p < s.len() && !s.is_char_boundary(p) {
        p += 1;
    }
    p
}

fn word_left(s: &str, pos: usize) -> usize {
    let bytes = s.as_bytes();
    let mut pos = pos.min(s.len());
    while pos > 0 && bytes[pos - 1].is_ascii_whitespace() {
        pos -= 1;
    }
    while pos > 0 && !bytes[pos - 1].is_ascii_whitespace() {
        pos -= 1;
    }
    pos
}

fn word_right(s: &str, mut pos: usize) -> usize {
    let bytes = s.as_bytes();
    let len = s.len();
    while pos < len && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    while pos < len && !bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}
