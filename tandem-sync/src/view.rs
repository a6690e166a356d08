//! Writes authoritative text into an interactive buffer without losing the
//! caret, the selection, or the scroll position.
//!
//! The new text is applied as one minimal patch between the common prefix and
//! the (non-overlapping) common suffix of the old and new strings. Caret and
//! selection are remapped through that patch. All offsets are in chars.

/// One replace: chars `[start, end)` of the old text become `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPatch {
    pub start: usize,
    pub end: usize,
    pub replacement: String,
}

impl TextPatch {
    pub fn replacement_len(&self) -> usize {
        self.replacement.chars().count()
    }

    /// Map an old-text offset into the patched text.
    pub fn map_position(&self, pos: usize) -> usize {
        let inserted = self.replacement_len();
        if pos < self.start {
            pos
        } else if pos >= self.end {
            pos - self.end + self.start + inserted
        } else {
            self.start + (pos - self.start).min(inserted)
        }
    }
}

/// Minimal patch turning `old` into `new`; `None` when they are equal.
pub fn diff(old: &str, new: &str) -> Option<TextPatch> {
    if old == new {
        return None;
    }
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    Some(TextPatch {
        start: prefix,
        end: old.len() - suffix,
        replacement: new[prefix..new.len() - suffix].iter().collect(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    pub anchor: usize,
    pub head: usize,
}

impl Selection {
    pub fn caret(pos: usize) -> Self {
        Self { anchor: pos, head: pos }
    }

    fn map(self, patch: &TextPatch) -> Self {
        Self {
            anchor: patch.map_position(self.anchor),
            head: patch.map_position(self.head),
        }
    }
}

/// The host's editable buffer.
pub trait EditBuffer {
    fn text(&self) -> String;
    /// Replace chars `[start, end)`; must not touch selection or scroll.
    fn replace_range(&mut self, start: usize, end: usize, replacement: &str);
    fn selection(&self) -> Selection;
    fn set_selection(&mut self, selection: Selection);
    fn scroll_offset(&self) -> f64;
    fn set_scroll_offset(&mut self, offset: f64);
}

/// In-memory [`EditBuffer`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextBuffer {
    text: String,
    selection: Selection,
    scroll: f64,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

impl EditBuffer for TextBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn replace_range(&mut self, start: usize, end: usize, replacement: &str) {
        let from = byte_offset(&self.text, start);
        let to = byte_offset(&self.text, end);
        self.text.replace_range(from..to, replacement);
    }

    fn selection(&self) -> Selection {
        self.selection
    }

    fn set_selection(&mut self, selection: Selection) {
        let len = self.text.chars().count();
        self.selection = Selection {
            anchor: selection.anchor.min(len),
            head: selection.head.min(len),
        };
    }

    fn scroll_offset(&self) -> f64 {
        self.scroll
    }

    fn set_scroll_offset(&mut self, offset: f64) {
        self.scroll = offset;
    }
}

/// Applies authoritative text into a buffer.
#[derive(Debug)]
pub struct ReconcilingView<B: EditBuffer> {
    buffer: B,
    pending_scroll: Option<f64>,
}

impl<B: EditBuffer> ReconcilingView<B> {
    pub fn new(buffer: B) -> Self {
        Self {
            buffer,
            pending_scroll: None,
        }
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn into_inner(self) -> B {
        self.buffer
    }

    /// Bring the buffer to `authoritative`. Returns the applied patch, or
    /// `None` if the buffer already matched.
    ///
    /// The scroll offset is captured here and reapplied by
    /// [`layout_settled`](Self::layout_settled).
    pub fn reconcile(&mut self, authoritative: &str) -> Option<TextPatch> {
        let patch = diff(&self.buffer.text(), authoritative)?;
        let selection = self.buffer.selection();
        self.pending_scroll = Some(self.buffer.scroll_offset());

        self.buffer.replace_range(patch.start, patch.end, &patch.replacement);
        self.buffer.set_selection(selection.map(&patch));
        Some(patch)
    }

    /// The host finished laying out the patched text.
    pub fn layout_settled(&mut self) {
        if let Some(offset) = self.pending_scroll.take() {
            self.buffer.set_scroll_offset(offset);
        }
    }
}
