//! Terminal emulation: ANSI parsing and the per-tab screen buffer.

mod ansi;
mod screen;

pub use ansi::{AnsiEvent, AnsiParser};
pub use screen::{Cell, Cursor, Style, TermColor, TerminalScreen, DEFAULT_SCROLLBACK};
