//! ANSI escape-sequence parser.
//!
//! A byte-driven state machine (ground, escape, CSI, OSC, DCS) that turns a
//! raw PTY stream into printable code points and dispatched control
//! sequences. Parser state survives across `feed` calls, so splitting a
//! byte stream at any code-point boundary yields identical output.
//!
//! Unrecognized or malformed sequences are discarded without touching the
//! screen; the caller logs them.

/// Upper bound on CSI parameters; further parameters are ignored.
const MAX_PARAMS: usize = 16;

/// Upper bound on buffered OSC/DCS payload before the sequence is dropped.
const MAX_STRING_LEN: usize = 1024;

/// One decoded unit of terminal input.
#[derive(Debug, Clone, PartialEq)]
pub enum AnsiEvent {
    /// A printable code point.
    Print(char),
    /// A C0 control byte the screen handles (BS, TAB, LF, CR).
    Control(u8),
    /// A complete CSI sequence.
    Csi {
        params: Vec<u16>,
        /// Private-mode prefix, e.g. `?` in `CSI ?25l`.
        private: Option<char>,
        final_byte: char,
    },
    /// ESC 7 - save cursor.
    SaveCursor,
    /// ESC 8 - restore cursor.
    RestoreCursor,
    /// A sequence the parser does not recognize; carried for logging only.
    Discarded(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ground,
    Escape,
    Csi,
    Osc,
    /// Inside an OSC/DCS, after ESC, expecting `\` (ST).
    StringEsc,
    Dcs,
}

/// Streaming parser; create one per screen and keep it for the screen's
/// lifetime.
#[derive(Debug)]
pub struct AnsiParser {
    state: State,
    /// Carry-over for a UTF-8 code point split across feeds.
    utf8_pending: Vec<u8>,
    params: Vec<u16>,
    current_param: Option<u16>,
    private: Option<char>,
    string_kind: State,
    string_len: usize,
}

impl Default for AnsiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsiParser {
    pub fn new() -> Self {
        Self {
            state: State::Ground,
            utf8_pending: Vec::new(),
            params: Vec::new(),
            current_param: None,
            private: None,
            string_kind: State::Osc,
            string_len: 0,
        }
    }

    /// Decode a chunk of bytes into events. Incomplete trailing UTF-8 is
    /// buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8], events: &mut Vec<AnsiEvent>) {
        let mut buf;
        let input: &[u8] = if self.utf8_pending.is_empty() {
            bytes
        } else {
            buf = std::mem::take(&mut self.utf8_pending);
            buf.extend_from_slice(bytes);
            &buf
        };

        let mut rest = input;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    for ch in text.chars() {
                        self.step(ch, events);
                    }
                    break;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    // Safety of from_utf8_unchecked is not worth it here;
                    // re-validate the known-good prefix.
                    if let Ok(text) = std::str::from_utf8(&rest[..valid]) {
                        for ch in text.chars() {
                            self.step(ch, events);
                        }
                    }
                    match err.error_len() {
                        Some(len) => {
                            // Malformed byte(s): substitute and continue.
                            self.step(char::REPLACEMENT_CHARACTER, events);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            // Incomplete code point at the end of the chunk.
                            self.utf8_pending = rest[valid..].to_vec();
                            break;
                        }
                    }
                }
            }
        }
    }

    fn step(&mut self, ch: char, events: &mut Vec<AnsiEvent>) {
        match self.state {
            State::Ground => self.step_ground(ch, events),
            State::Escape => self.step_escape(ch, events),
            State::Csi => self.step_csi(ch, events),
            State::Osc | State::Dcs => self.step_string(ch, events),
            State::StringEsc => {
                // ESC \ terminates the string; anything else re-enters it.
                if ch == '\\' {
                    self.state = State::Ground;
                } else {
                    self.state = self.string_kind;
                    self.step(ch, events);
                }
            }
        }
    }

    fn step_ground(&mut self, ch: char, events: &mut Vec<AnsiEvent>) {
        match ch {
            '\u{1b}' => self.state = State::Escape,
            '\u{08}' | '\t' | '\n' | '\r' => events.push(AnsiEvent::Control(ch as u8)),
            '\u{07}' => {} // BEL in ground is noise
            c if (c as u32) < 0x20 || c == '\u{7f}' => {
                events.push(AnsiEvent::Discarded(format!("C0 {:#04x}", c as u32)));
            }
            c => events.push(AnsiEvent::Print(c)),
        }
    }

    fn step_escape(&mut self, ch: char, events: &mut Vec<AnsiEvent>) {
        match ch {
            '[' => {
                self.params.clear();
                self.current_param = None;
                self.private = None;
                self.state = State::Csi;
            }
            ']' => {
                self.string_kind = State::Osc;
                self.string_len = 0;
                self.state = State::Osc;
            }
            'P' => {
                self.string_kind = State::Dcs;
                self.string_len = 0;
                self.state = State::Dcs;
            }
            '7' => {
                events.push(AnsiEvent::SaveCursor);
                self.state = State::Ground;
            }
            '8' => {
                events.push(AnsiEvent::RestoreCursor);
                self.state = State::Ground;
            }
            '\u{1b}' => {} // stay in escape
            c => {
                events.push(AnsiEvent::Discarded(format!("ESC {c}")));
                self.state = State::Ground;
            }
        }
    }

    fn step_csi(&mut self, ch: char, events: &mut Vec<AnsiEvent>) {
        match ch {
            '0'..='9' => {
                let digit = ch as u16 - '0' as u16;
                let v = self.current_param.unwrap_or(0);
                self.current_param = Some(v.saturating_mul(10).saturating_add(digit));
            }
            ';' => {
                if self.params.len() < MAX_PARAMS {
                    self.params.push(self.current_param.unwrap_or(0));
                }
                self.current_param = None;
            }
            '?' | '>' | '<' | '=' if self.params.is_empty() && self.current_param.is_none() => {
                self.private = Some(ch);
            }
            '\u{40}'..='\u{7e}' => {
                if let Some(p) = self.current_param.take() {
                    if self.params.len() < MAX_PARAMS {
                        self.params.push(p);
                    }
                }
                events.push(AnsiEvent::Csi {
                    params: std::mem::take(&mut self.params),
                    private: self.private.take(),
                    final_byte: ch,
                });
                self.state = State::Ground;
            }
            ' '..='/' => {
                // Intermediate bytes: none of the sequences we honor carry
                // them, so the whole sequence will be discarded at dispatch.
                events.push(AnsiEvent::Discarded(format!("CSI intermediate {ch}")));
                self.state = State::Ground;
            }
            c => {
                events.push(AnsiEvent::Discarded(format!("CSI {:#04x}", c as u32)));
                self.state = State::Ground;
            }
        }
    }

    fn step_string(&mut self, ch: char, events: &mut Vec<AnsiEvent>) {
        match ch {
            '\u{07}' => self.state = State::Ground, // BEL terminator (OSC)
            '\u{1b}' => self.state = State::StringEsc,
            _ => {
                self.string_len += ch.len_utf8();
                if self.string_len > MAX_STRING_LEN {
                    events.push(AnsiEvent::Discarded("oversized OSC/DCS".to_string()));
                    self.state = State::Ground;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Vec<AnsiEvent> {
        let mut parser = AnsiParser::new();
        let mut events = Vec::new();
        parser.feed(bytes, &mut events);
        events
    }

    #[test]
    fn test_plain_text() {
        let events = parse(b"hi\n");
        assert_eq!(
            events,
            vec![
                AnsiEvent::Print('h'),
                AnsiEvent::Print('i'),
                AnsiEvent::Control(b'\n'),
            ]
        );
    }

    #[test]
    fn test_csi_with_params() {
        let events = parse(b"\x1b[2;5H");
        assert_eq!(
            events,
            vec![AnsiEvent::Csi {
                params: vec![2, 5],
                private: None,
                final_byte: 'H',
            }]
        );
    }

    #[test]
    fn test_csi_private_mode() {
        let events = parse(b"\x1b[?25l");
        assert_eq!(
            events,
            vec![AnsiEvent::Csi {
                params: vec![25],
                private: Some('?'),
                final_byte: 'l',
            }]
        );
    }

    #[test]
    fn test_sgr_empty_param() {
        let events = parse(b"\x1b[m");
        assert_eq!(
            events,
            vec![AnsiEvent::Csi {
                params: vec![],
                private: None,
                final_byte: 'm',
            }]
        );
    }

    #[test]
    fn test_osc_swallowed_until_bel() {
        let events = parse(b"\x1b]0;window title\x07after");
        assert_eq!(events.first(), Some(&AnsiEvent::Print('a')));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn test_osc_st_terminator() {
        let events = parse(b"\x1b]0;title\x1b\\x");
        assert_eq!(events, vec![AnsiEvent::Print('x')]);
    }

    #[test]
    fn test_split_feed_equals_single_feed() {
        let input = "abc\x1b[31;1mred\x1b[0m\u{00e9}\u{4e16}\n".as_bytes();
        let whole = parse(input);

        for split in 1..input.len() {
            let mut parser = AnsiParser::new();
            let mut events = Vec::new();
            parser.feed(&input[..split], &mut events);
            parser.feed(&input[split..], &mut events);
            assert_eq!(events, whole, "split at byte {split}");
        }
    }

    #[test]
    fn test_utf8_split_across_feeds() {
        let bytes = "\u{4e16}".as_bytes(); // 3-byte code point
        let mut parser = AnsiParser::new();
        let mut events = Vec::new();
        parser.feed(&bytes[..1], &mut events);
        assert!(events.is_empty());
        parser.feed(&bytes[1..], &mut events);
        assert_eq!(events, vec![AnsiEvent::Print('\u{4e16}')]);
    }

    #[test]
    fn test_malformed_utf8_replaced() {
        let events = parse(&[0xff, b'a']);
        assert_eq!(
            events,
            vec![
                AnsiEvent::Print(char::REPLACEMENT_CHARACTER),
                AnsiEvent::Print('a'),
            ]
        );
    }

    #[test]
    fn test_unknown_escape_discarded() {
        let events = parse(b"\x1b(Bok");
        assert!(matches!(events[0], AnsiEvent::Discarded(_)));
        assert_eq!(events[1], AnsiEvent::Print('B'));
    }

    #[test]
    fn test_save_restore_cursor() {
        let events = parse(b"\x1b7x\x1b8");
        assert_eq!(
            events,
            vec![
                AnsiEvent::SaveCursor,
                AnsiEvent::Print('x'),
                AnsiEvent::RestoreCursor,
            ]
        );
    }
}
