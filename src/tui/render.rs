/// Ratatui draw entry-point for oxchat.
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
};
use unicode_width::UnicodeWidthChar;

use super::{AppState, SPINNER_GLYPHS};
use crate::session::SessionState;
use crate::transcript::Role;

/// Preview panel never grows past this many rows (borders included).
const MAX_PREVIEW_ROWS: u16 = 12;

// ── Main draw entry point ─────────────────────────────────────────────────────

pub fn draw(f: &mut Frame, state: &AppState) {
    let area = f.area();

    let preview = state.chat.pending().map(|s| s.preview()).unwrap_or_default();
    let preview_rows = if preview.is_empty() {
        0
    } else {
        (preview.len() as u16 + 2).min(MAX_PREVIEW_ROWS)
    };

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(0),               // transcript
            Constraint::Length(preview_rows), // suggestion preview
            Constraint::Length(1),            // status bar
        ])
        .split(area);

    draw_transcript(f, state, chunks[0]);
    if preview_rows > 0 {
        draw_preview(f, &preview, chunks[1]);
    }
    draw_status_bar(f, state, chunks[2]);
}

// ── Transcript ────────────────────────────────────────────────────────────────

fn draw_transcript(f: &mut Frame, state: &AppState, area: Rect) {
    if area.height == 0 || area.width < 2 {
        return;
    }
    let transcript = state.chat.transcript();
    let input_len = transcript.current_input().len();
    let cursor = transcript.composition_start() + state.cursor.min(input_len);
    let wrapped = wrap_view(transcript.view(), area.width as usize - 1, cursor);

    let height = area.height as usize;
    let bottom = wrapped.lines.len().saturating_sub(height);
    let top = bottom.saturating_sub(state.scroll);

    let lines: Vec<Line> = wrapped.lines[top..]
        .iter()
        .take(height)
        .map(|l| styled_line(l))
        .collect();
    f.render_widget(Paragraph::new(lines), area);

    let (row, col) = wrapped.cursor;
    if row >= top && row < top + height {
        let cursor_x = area.x + col as u16;
        let cursor_y = area.y + (row - top) as u16;
        f.set_cursor_position((cursor_x, cursor_y));
    }
}

fn styled_line(line: &str) -> Line<'static> {
    for (role, color) in [(Role::User, Color::Cyan), (Role::Assistant, Color::Green)] {
        if let Some(rest) = line.strip_prefix(role.label()) {
            return Line::from(vec![
                Span::styled(
                    role.label().to_string(),
                    Style::default().fg(color).add_modifier(Modifier::BOLD),
                ),
                Span::raw(rest.to_string()),
            ]);
        }
    }
    if line.starts_with("[error: ") {
        return Line::from(Span::styled(line.to_string(), Style::default().fg(Color::Red)));
    }
    Line::from(line.to_string())
}

pub(crate) struct Wrapped {
    pub lines: Vec<String>,
    /// (row, column) of the byte offset passed as the cursor
    pub cursor: (usize, usize),
}

/// Hard-wrap `text` at `width` display columns and locate `cursor`.
pub(crate) fn wrap_view(text: &str, width: usize, cursor: usize) -> Wrapped {
    let width = width.max(1);
    let mut lines = vec![String::new()];
    let mut col = 0usize;
    let mut at = None;

    for (i, ch) in text.char_indices() {
        if i == cursor {
            at = Some((lines.len() - 1, col));
        }
        if ch == '\n' {
            lines.push(String::new());
            col = 0;
            continue;
        }
        let w = ch.width().unwrap_or(0);
        if col + w > width && col > 0 {
            lines.push(String::new());
            col = 0;
            if i == cursor {
                at = Some((lines.len() - 1, 0));
            }
        }
        if let Some(last) = lines.last_mut() {
            last.push(ch);
        }
        col += w;
    }

    let cursor = match at {
        Some(pos) => pos,
        None if col >= width => {
            lines.push(String::new());
            (lines.len() - 1, 0)
        }
        None => (lines.len() - 1, col),
    };
    Wrapped { lines, cursor }
}

// ── Suggestion preview ────────────────────────────────────────────────────────

fn draw_preview(f: &mut Frame, preview: &[String], area: Rect) {
    let lines: Vec<Line> = preview
        .iter()
        .map(|l| {
            let color = match l.chars().next() {
                Some('-') if l.starts_with("---") => Color::White,
                Some('-') => Color::Red,
                Some('+') => Color::Green,
                _ => Color::Gray,
            };
            Line::from(Span::styled(l.clone(), Style::default().fg(color)))
        })
        .collect();

    let block = Block::default()
        .borders(Borders::TOP | Borders::BOTTOM)
        .border_style(Style::default().fg(Color::Rgb(200, 140, 0)))
        .title(Span::styled(
            " suggestion · Ctrl+Y apply · Ctrl+N reject ",
            Style::default().fg(Color::Rgb(220, 160, 0)),
        ));
    f.render_widget(Paragraph::new(lines).block(block), area);
}

// ── Status bar ────────────────────────────────────────────────────────────────

fn draw_status_bar(f: &mut Frame, state: &AppState, area: Rect) {
    let session = state.chat.session();
    let (glyph, color) = match session.map(|s| s.state()) {
        Some(s) if s.is_active() => (
            SPINNER_GLYPHS[(state.spinner_tick as usize) % SPINNER_GLYPHS.len()],
            Color::Cyan,
        ),
        Some(SessionState::Failed(_)) => ("✗", Color::Red),
        _ => ("▲", Color::White),
    };

    let mut spans = vec![
        Span::raw(" "),
        Span::styled(glyph, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::styled(" oxchat", Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
        Span::styled(
            format!("  {} · {}", state.profile, state.chat.model()),
            Style::default().fg(Color::DarkGray),
        ),
    ];

    if let Some(s) = session {
        spans.push(Span::styled(
            format!("  {} · {} tok", s.state().label(), s.tokens()),
            Style::default().fg(Color::DarkGray),
        ));
        // model was switched after this reply started
        if s.model() != state.chat.model() {
            spans.push(Span::styled(
                format!(" ({})", s.model()),
                Style::default().fg(Color::DarkGray),
            ));
        }
    }
    if let Some(reply) = state.chat.transcript().turns().last().filter(|t| t.role == Role::Assistant) {
        spans.push(Span::styled(
            format!("  {}", reply.timestamp.format("%H:%M")),
            Style::default().fg(Color::DarkGray),
        ));
    }
    let files = state.chat.bundle().len();
    if files > 0 {
        spans.push(Span::styled(
            format!("  ctx {files}"),
            Style::default().fg(Color::DarkGray),
        ));
    }
    if state.scroll > 0 {
        spans.push(Span::styled(
            format!("  ↑{}", state.scroll),
            Style::default().fg(Color::DarkGray),
        ));
    }
    if let Some(notice) = &state.notice {
        let color = if notice.is_error() { Color::Red } else { Color::Rgb(140, 140, 170) };
        spans.push(Span::raw("  "));
        spans.push(Span::styled(notice.text().to_string(), Style::default().fg(color)));
    }

    f.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(Color::Rgb(20, 20, 30))),
        area,
    );
}
