/// Chat transcript: rendered history plus the single editable composition region.
///
/// The view is one `String`. Everything before `composition_start` is rendered
/// history and is read-only; everything from `composition_start` to the end is
/// the composition region where the next user message is typed.
///
/// Structural edits only ever *insert* rendered text at or before the
/// composition start. Positions that must survive those edits (a streaming
/// insertion point, for example) are held as [`Marker`]s, which the transcript
/// shifts on every insertion instead of handing out raw offsets.
use chrono::{DateTime, Local};
use std::ops::Range;
use thiserror::Error;

// ── Turns ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::User => "You: ",
            Role::Assistant => "Assistant: ",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Local>,
}

// ── Markers ───────────────────────────────────────────────────────────────────

/// Handle to a position in the rendered history.
///
/// Text inserted exactly at a marker lands before it, so the marker always
/// points just past what was last written there. A handle outlives its slot
/// only as a stale value: the slot's generation moves on when it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Marker {
    slot: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy)]
struct MarkerSlot {
    pos: Option<usize>,
    generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranscriptError {
    #[error("position {0} is inside read-only history")]
    ReadOnly(usize),
    #[error("position {0} is not a valid input position")]
    OutOfRange(usize),
    #[error("marker was released")]
    StaleMarker,
}

// ── Transcript ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Transcript {
    text: String,
    composition_start: usize,
    markers: Vec<MarkerSlot>,
    turns: Vec<Turn>,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    /// An empty transcript with its first composition region open.
    pub fn new() -> Self {
        let mut t = Self {
            text: String::new(),
            composition_start: 0,
            markers: Vec::new(),
            turns: Vec::new(),
        };
        t.begin_new_turn();
        t
    }

    /// The whole view: rendered history followed by the composition region.
    pub fn view(&self) -> &str {
        &self.text
    }

    pub fn composition_start(&self) -> usize {
        self.composition_start
    }

    pub fn current_input(&self) -> &str {
        &self.text[self.composition_start..]
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn is_read_only(&self, pos: usize) -> bool {
        pos < self.composition_start
    }

    // ── Composition region edits ─────────────────────────────────────────────

    /// Insert `s` at byte `offset` within the composition region.
    /// Returns the offset just past the inserted text.
    pub fn insert_input(&mut self, offset: usize, s: &str) -> Result<usize, TranscriptError> {
        let pos = self.input_pos(offset)?;
        self.text.insert_str(pos, s);
        Ok(offset + s.len())
    }

    /// Delete `range` (offsets relative to the composition start).
    pub fn delete_input(&mut self, range: Range<usize>) -> Result<(), TranscriptError> {
        let start = self.input_pos(range.start)?;
        let end = self.input_pos(range.end)?;
        if start > end {
            return Err(TranscriptError::OutOfRange(range.start));
        }
        self.text.drain(start..end);
        Ok(())
    }

    pub fn set_input(&mut self, s: &str) {
        self.text.truncate(self.composition_start);
        self.text.push_str(s);
    }

    /// Edit at an absolute view position. Rendered history rejects the edit.
    pub fn edit_at(&mut self, pos: usize, s: &str) -> Result<(), TranscriptError> {
        if self.is_read_only(pos) {
            return Err(TranscriptError::ReadOnly(pos));
        }
        self.insert_input(pos - self.composition_start, s).map(|_| ())
    }

    fn input_pos(&self, offset: usize) -> Result<usize, TranscriptError> {
        let pos = self.composition_start + offset;
        if pos > self.text.len() || !self.text.is_char_boundary(pos) {
            return Err(TranscriptError::OutOfRange(offset));
        }
        Ok(pos)
    }

    // ── Structural edits ──────────────────────────────────────────────────────

    /// Freeze the typed input into history as a user turn.
    /// Returns `None` (and changes nothing) when the input is blank.
    pub fn submit_input(&mut self) -> Option<String> {
        let input = self.current_input().to_string();
        if input.trim().is_empty() {
            return None;
        }
        self.composition_start = self.text.len();
        self.record_turn(Role::User, input.clone());
        Some(input)
    }

    /// Render a complete turn just before the composition region.
    /// The composition text sits after the anchor and is left as typed.
    /// Used for replies that arrive whole rather than token by token.
    pub fn append_turn(&mut self, role: Role, content: &str) {
        let block = format!("{}{}{}", self.separator(), role.label(), content);
        self.insert_rendered(self.composition_start, &block);
        self.record_turn(role, content.to_string());
    }

    /// Render the next user label; the composition region starts right after it.
    pub fn begin_new_turn(&mut self) {
        let label = format!("{}{}", self.separator(), Role::User.label());
        self.insert_rendered(self.composition_start, &label);
    }

    /// Render an assistant header and return the insertion point for its body.
    pub fn open_response(&mut self) -> Marker {
        let header = format!("{}{}", self.separator(), Role::Assistant.label());
        self.insert_rendered(self.composition_start, &header);
        self.create_marker(self.composition_start)
    }

    /// Render a line of history that is not part of any turn.
    pub fn append_notice(&mut self, s: &str) {
        self.insert_rendered(self.composition_start, s);
    }

    /// Insert rendered text at `marker`.
    pub fn insert_at(&mut self, marker: Marker, s: &str) -> Result<(), TranscriptError> {
        let pos = self.marker_position(marker).ok_or(TranscriptError::StaleMarker)?;
        self.insert_rendered(pos, s);
        Ok(())
    }

    /// Add a turn whose text is already in the rendered view.
    pub fn record_turn(&mut self, role: Role, content: String) {
        self.turns.push(Turn {
            role,
            content,
            timestamp: Local::now(),
        });
    }

    fn separator(&self) -> &'static str {
        if self.composition_start == 0 { "" } else { "\n\n" }
    }

    fn insert_rendered(&mut self, pos: usize, s: &str) {
        debug_assert!(pos <= self.composition_start);
        if s.is_empty() {
            return;
        }
        self.text.insert_str(pos, s);
        let len = s.len();
        for slot_pos in self.markers.iter_mut().filter_map(|m| m.pos.as_mut()) {
            if *slot_pos >= pos {
                *slot_pos += len;
            }
        }
        self.composition_start += len;
    }

    // ── Markers ───────────────────────────────────────────────────────────────

    /// Positions at the composition start or beyond are clamped to it.
    pub fn create_marker(&mut self, pos: usize) -> Marker {
        let pos = Some(pos.min(self.composition_start));
        if let Some(i) = self.markers.iter().position(|m| m.pos.is_none()) {
            self.markers[i].pos = pos;
            return Marker {
                slot: i,
                generation: self.markers[i].generation,
            };
        }
        self.markers.push(MarkerSlot { pos, generation: 0 });
        Marker {
            slot: self.markers.len() - 1,
            generation: 0,
        }
    }

    /// `None` once the marker has been released, even if its slot was reused.
    pub fn marker_position(&self, marker: Marker) -> Option<usize> {
        self.markers
            .get(marker.slot)
            .filter(|m| m.generation == marker.generation)
            .and_then(|m| m.pos)
    }

    /// Releasing a stale handle is a no-op.
    pub fn release_marker(&mut self, marker: Marker) {
        let Some(slot) = self.markers.get_mut(marker.slot) else { return };
        if slot.generation == marker.generation && slot.pos.is_some() {
            slot.pos = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
    }
}
