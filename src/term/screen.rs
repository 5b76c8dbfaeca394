//! Terminal screen: cell grid, cursor, styled text, and ring scrollback.
//!
//! The screen consumes the ANSI parser's events and maintains an
//! xterm-style viewport. Lines that scroll off the top land in a bounded
//! scrollback ring; clearing the screen (CSI 2J) never empties scrollback.
//!
//! Scrolling at the bottom row is deferred: a line feed on the last row
//! sets a pending-scroll flag that is committed by the next printable or
//! line feed. Writing exactly `rows` newline-terminated lines therefore
//! fills the viewport without pushing anything into scrollback.

use super::ansi::{AnsiEvent, AnsiParser};
use unicode_width::UnicodeWidthChar;

/// Default scrollback bound, in lines.
pub const DEFAULT_SCROLLBACK: usize = 10_000;

/// Cell foreground/background color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TermColor {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// Style attributes carried by every cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Style {
    pub fg: TermColor,
    pub bg: TermColor,
    pub bold: bool,
    pub underline: bool,
    pub inverse: bool,
}

/// One grid cell: a code point plus its style.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub ch: char,
    pub style: Style,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            style: Style::default(),
        }
    }
}

impl Cell {
    fn styled(ch: char, style: Style) -> Self {
        Self { ch, style }
    }
}

/// Cursor position and visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub row: usize,
    pub col: usize,
    pub visible: bool,
}

/// The terminal screen for one plugin tab.
#[derive(Debug)]
pub struct TerminalScreen {
    cols: usize,
    rows: usize,
    grid: Vec<Vec<Cell>>,
    cursor: Cursor,
    saved_cursor: Option<(usize, usize)>,
    style: Style,
    scrollback: std::collections::VecDeque<Vec<Cell>>,
    max_scrollback: usize,
    parser: AnsiParser,
    /// Set when printing past the last column; the next printable wraps.
    wrap_pending: bool,
    /// Set by LF on the bottom row; committed by the next print or LF.
    scroll_pending: bool,
    /// Scratch buffer reused across feeds.
    events: Vec<AnsiEvent>,
}

impl TerminalScreen {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self::with_scrollback(cols, rows, DEFAULT_SCROLLBACK)
    }

    pub fn with_scrollback(cols: usize, rows: usize, max_scrollback: usize) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            grid: vec![vec![Cell::default(); cols]; rows],
            cursor: Cursor {
                row: 0,
                col: 0,
                visible: true,
            },
            saved_cursor: None,
            style: Style::default(),
            scrollback: std::collections::VecDeque::new(),
            max_scrollback,
            parser: AnsiParser::new(),
            wrap_pending: false,
            scroll_pending: false,
            events: Vec::new(),
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn scrollback_len(&self) -> usize {
        self.scrollback.len()
    }

    /// Feed raw PTY bytes through the ANSI machine into the grid.
    pub fn feed(&mut self, bytes: &[u8]) {
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        self.parser.feed(bytes, &mut events);
        for event in &events {
            match event {
                AnsiEvent::Print(ch) => self.print(*ch),
                AnsiEvent::Control(byte) => self.control(*byte),
                AnsiEvent::Csi {
                    params,
                    private,
                    final_byte,
                } => self.csi(params, *private, *final_byte),
                AnsiEvent::SaveCursor => {
                    self.saved_cursor = Some((self.cursor.row, self.cursor.col));
                }
                AnsiEvent::RestoreCursor => {
                    if let Some((row, col)) = self.saved_cursor {
                        self.cursor.row = row.min(self.rows - 1);
                        self.cursor.col = col.min(self.cols - 1);
                        self.wrap_pending = false;
                        self.scroll_pending = false;
                    }
                }
                AnsiEvent::Discarded(what) => {
                    tracing::debug!(sequence = %what, "discarding unrecognized escape sequence");
                }
            }
        }
        self.events = events;
    }

    /// Rows visible at a scroll offset. Offset 0 is the live viewport;
    /// larger offsets surface scrollback: the top `min(offset, len)` rows
    /// come from scrollback, the rest from the viewport top.
    pub fn visible_lines(&self, scroll_offset: usize) -> Vec<Vec<Cell>> {
        let back = scroll_offset.min(self.scrollback.len());
        let mut lines: Vec<Vec<Cell>> = Vec::with_capacity(self.rows);
        let start = self.scrollback.len() - back;
        for i in start..self.scrollback.len() {
            if lines.len() == self.rows {
                break;
            }
            lines.push(self.pad_line(self.scrollback[i].clone()));
        }
        for row in &self.grid {
            if lines.len() == self.rows {
                break;
            }
            lines.push(row.clone());
        }
        lines
    }

    /// Viewport plus the whole scrollback as plain text, styling stripped.
    /// Used by save-logs.
    pub fn text_dump(&self) -> Vec<String> {
        self.scrollback
            .iter()
            .chain(self.grid.iter())
            .map(|line| {
                let text: String = line.iter().map(|c| c.ch).collect();
                text.trim_end().to_string()
            })
            .collect()
    }

    /// Resize the viewport, re-wrapping lines to the new width.
    ///
    /// Content is flattened (scrollback then viewport), each stored line is
    /// re-wrapped to the new width, and the tail fills the new viewport
    /// with the overflow returned to scrollback. The cursor keeps its
    /// column where possible and stays inside the new bounds.
    pub fn resize(&mut self, cols: usize, rows: usize) {
        let cols = cols.max(1);
        let rows = rows.max(1);
        if cols == self.cols && rows == self.rows {
            return;
        }

        let mut logical: Vec<Vec<Cell>> = Vec::new();
        for line in self.scrollback.drain(..) {
            logical.push(line);
        }
        let last_used = self
            .grid
            .iter()
            .rposition(|row| row.iter().any(|c| c.ch != ' '))
            .map(|i| i + 1)
            .unwrap_or(0);
        let keep = last_used.max((self.cursor.row + 1).min(self.rows));
        for row in self.grid.drain(..).take(keep) {
            logical.push(row);
        }

        // Re-wrap to the new width.
        let mut wrapped: Vec<Vec<Cell>> = Vec::new();
        for line in logical {
            let trimmed_len = line
                .iter()
                .rposition(|c| c.ch != ' ')
                .map(|i| i + 1)
                .unwrap_or(0);
            if trimmed_len == 0 {
                wrapped.push(Vec::new());
                continue;
            }
            let mut chunk = Vec::with_capacity(cols);
            for cell in line.into_iter().take(trimmed_len) {
                chunk.push(cell);
                if chunk.len() == cols {
                    wrapped.push(std::mem::take(&mut chunk));
                }
            }
            if !chunk.is_empty() {
                wrapped.push(chunk);
            }
        }

        self.cols = cols;
        self.rows = rows;

        let viewport_lines = wrapped.len().min(rows);
        let overflow = wrapped.len() - viewport_lines;
        for line in wrapped.drain(..overflow) {
            self.push_scrollback(line);
        }
        self.grid = wrapped.into_iter().map(|l| self.pad_line(l)).collect();
        while self.grid.len() < rows {
            self.grid.push(vec![Cell::default(); cols]);
        }

        self.cursor.row = self.cursor.row.min(rows - 1);
        self.cursor.col = self.cursor.col.min(cols - 1);
        self.saved_cursor = None;
        self.wrap_pending = false;
        self.scroll_pending = false;
    }

    fn pad_line(&self, mut line: Vec<Cell>) -> Vec<Cell> {
        line.truncate(self.cols);
        line.resize(self.cols, Cell::default());
        line
    }

    fn push_scrollback(&mut self, line: Vec<Cell>) {
        if self.max_scrollback == 0 {
            return;
        }
        if self.scrollback.len() == self.max_scrollback {
            self.scrollback.pop_front();
        }
        self.scrollback.push_back(line);
    }

    fn scroll_up_one(&mut self) {
        let evicted = self.grid.remove(0);
        self.push_scrollback(evicted);
        self.grid.push(vec![Cell::default(); self.cols]);
    }

    fn commit_pending_scroll(&mut self) {
        if self.scroll_pending {
            self.scroll_up_one();
            self.scroll_pending = false;
        }
    }

    fn print(&mut self, ch: char) {
        let width = ch.width().unwrap_or(0);
        if width == 0 {
            return; // combining marks and other zero-width input
        }
        self.commit_pending_scroll();
        if self.wrap_pending {
            self.wrap_pending = false;
            self.cursor.col = 0;
            if self.cursor.row + 1 == self.rows {
                self.scroll_up_one();
            } else {
                self.cursor.row += 1;
            }
        }
        self.grid[self.cursor.row][self.cursor.col] = Cell::styled(ch, self.style);
        // A double-width character consumes the following cell too.
        if width == 2 && self.cursor.col + 1 < self.cols {
            self.grid[self.cursor.row][self.cursor.col + 1] =
                Cell::styled(' ', self.style);
            self.cursor.col += 1;
        }
        if self.cursor.col + 1 == self.cols {
            self.wrap_pending = true;
        } else {
            self.cursor.col += 1;
        }
    }

    fn control(&mut self, byte: u8) {
        match byte {
            b'\n' => {
                self.commit_pending_scroll();
                self.wrap_pending = false;
                if self.cursor.row + 1 == self.rows {
                    self.scroll_pending = true;
                } else {
                    self.cursor.row += 1;
                }
            }
            b'\r' => {
                self.cursor.col = 0;
                self.wrap_pending = false;
            }
            0x08 => {
                self.cursor.col = self.cursor.col.saturating_sub(1);
                self.wrap_pending = false;
            }
            b'\t' => {
                self.commit_pending_scroll();
                let next = (self.cursor.col / 8 + 1) * 8;
                self.cursor.col = next.min(self.cols - 1);
                self.wrap_pending = false;
            }
            _ => {}
        }
    }

    fn csi(&mut self, params: &[u16], private: Option<char>, final_byte: char) {
        let p = |i: usize, default: u16| params.get(i).copied().filter(|v| *v != 0).unwrap_or(default);

        if private == Some('?') {
            match (p(0, 0), final_byte) {
                (25, 'h') => self.cursor.visible = true,
                (25, 'l') => self.cursor.visible = false,
                _ => tracing::debug!(?params, ?final_byte, "discarding private CSI"),
            }
            return;
        }

        match final_byte {
            'A' => self.cursor.row = self.cursor.row.saturating_sub(p(0, 1) as usize),
            'B' => {
                self.cursor.row = (self.cursor.row + p(0, 1) as usize).min(self.rows - 1);
            }
            'C' => {
                self.cursor.col = (self.cursor.col + p(0, 1) as usize).min(self.cols - 1);
                self.wrap_pending = false;
            }
            'D' => {
                self.cursor.col = self.cursor.col.saturating_sub(p(0, 1) as usize);
                self.wrap_pending = false;
            }
            'E' => {
                self.cursor.row = (self.cursor.row + p(0, 1) as usize).min(self.rows - 1);
                self.cursor.col = 0;
            }
            'F' => {
                self.cursor.row = self.cursor.row.saturating_sub(p(0, 1) as usize);
                self.cursor.col = 0;
            }
            'G' => {
                self.cursor.col = (p(0, 1) as usize - 1).min(self.cols - 1);
                self.wrap_pending = false;
            }
            'H' | 'f' => {
                self.cursor.row = (p(0, 1) as usize - 1).min(self.rows - 1);
                self.cursor.col = (p(1, 1) as usize - 1).min(self.cols - 1);
                self.wrap_pending = false;
                self.scroll_pending = false;
            }
            'd' => {
                self.cursor.row = (p(0, 1) as usize - 1).min(self.rows - 1);
            }
            'J' => self.erase_display(params.first().copied().unwrap_or(0)),
            'K' => self.erase_line(params.first().copied().unwrap_or(0)),
            'S' => {
                for _ in 0..p(0, 1) {
                    self.scroll_up_one();
                }
            }
            'm' => self.sgr(params),
            's' => self.saved_cursor = Some((self.cursor.row, self.cursor.col)),
            'u' => {
                if let Some((row, col)) = self.saved_cursor {
                    self.cursor.row = row.min(self.rows - 1);
                    self.cursor.col = col.min(self.cols - 1);
                }
            }
            _ => tracing::debug!(?params, ?final_byte, "discarding unsupported CSI"),
        }
    }

    /// CSI J. Mode 2 clears the viewport but never touches scrollback.
    fn erase_display(&mut self, mode: u16) {
        match mode {
            0 => {
                self.erase_line(0);
                for row in self.cursor.row + 1..self.rows {
                    self.grid[row] = vec![Cell::default(); self.cols];
                }
            }
            1 => {
                self.erase_line(1);
                for row in 0..self.cursor.row {
                    self.grid[row] = vec![Cell::default(); self.cols];
                }
            }
            2 | 3 => {
                for row in &mut self.grid {
                    *row = vec![Cell::default(); self.cols];
                }
            }
            _ => {}
        }
    }

    fn erase_line(&mut self, mode: u16) {
        let row = &mut self.grid[self.cursor.row];
        match mode {
            0 => {
                for cell in row.iter_mut().skip(self.cursor.col) {
                    *cell = Cell::default();
                }
            }
            1 => {
                for cell in row.iter_mut().take(self.cursor.col + 1) {
                    *cell = Cell::default();
                }
            }
            2 => *row = vec![Cell::default(); self.cols],
            _ => {}
        }
    }

    fn sgr(&mut self, params: &[u16]) {
        if params.is_empty() {
            self.style = Style::default();
            return;
        }
        let mut i = 0;
        while i < params.len() {
            match params[i] {
                0 => self.style = Style::default(),
                1 => self.style.bold = true,
                4 => self.style.underline = true,
                7 => self.style.inverse = true,
                22 => self.style.bold = false,
                24 => self.style.underline = false,
                27 => self.style.inverse = false,
                30..=37 => self.style.fg = TermColor::Indexed(params[i] as u8 - 30),
                39 => self.style.fg = TermColor::Default,
                40..=47 => self.style.bg = TermColor::Indexed(params[i] as u8 - 40),
                49 => self.style.bg = TermColor::Default,
                90..=97 => self.style.fg = TermColor::Indexed(params[i] as u8 - 90 + 8),
                100..=107 => self.style.bg = TermColor::Indexed(params[i] as u8 - 100 + 8),
                38 | 48 => {
                    let is_fg = params[i] == 38;
                    let color = match params.get(i + 1) {
                        Some(5) => {
                            let c = params.get(i + 2).copied().unwrap_or(0);
                            i += 2;
                            Some(TermColor::Indexed(c as u8))
                        }
                        Some(2) => {
                            let r = params.get(i + 2).copied().unwrap_or(0) as u8;
                            let g = params.get(i + 3).copied().unwrap_or(0) as u8;
                            let b = params.get(i + 4).copied().unwrap_or(0) as u8;
                            i += 4;
                            Some(TermColor::Rgb(r, g, b))
                        }
                        _ => None,
                    };
                    if let Some(color) = color {
                        if is_fg {
                            self.style.fg = color;
                        } else {
                            self.style.bg = color;
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
}
