//! Input router: one classifier between the keyboard and everything else.
//!
//! A keypress either matches a binding and becomes a UI command, or it is
//! encoded to the byte sequence a terminal would send and forwarded to the
//! focused tab's PTY stdin. Never both, never more than one destination.

use super::keys::{KeyBindings, UiAction};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

/// Where one keypress went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Consumed by the app.
    Action(UiAction),
    /// Raw bytes for the focused tab's PTY stdin.
    Input(Vec<u8>),
    /// Not representable as terminal input; dropped.
    Ignored,
}

pub struct InputRouter {
    bindings: KeyBindings,
}

impl InputRouter {
    pub fn new(bindings: KeyBindings) -> Self {
        Self { bindings }
    }

    pub fn bindings(&self) -> &KeyBindings {
        &self.bindings
    }

    /// Classify one keypress.
    pub fn route(&self, event: &KeyEvent) -> Routed {
        if let Some(action) = self.bindings.lookup(event) {
            return Routed::Action(action);
        }
        match encode_key(event) {
            Some(bytes) => Routed::Input(bytes),
            None => Routed::Ignored,
        }
    }
}

/// Encode a key event as the bytes a terminal would put on the wire.
pub fn encode_key(event: &KeyEvent) -> Option<Vec<u8>> {
    let ctrl = event.modifiers.contains(KeyModifiers::CONTROL);
    let alt = event.modifiers.contains(KeyModifiers::ALT);

    let mut bytes: Vec<u8> = match event.code {
        KeyCode::Char(c) => {
            if ctrl {
                // ^A..^Z plus the usual control punctuation.
                let c = c.to_ascii_lowercase();
                match c {
                    'a'..='z' => vec![(c as u8) - b'a' + 1],
                    '[' => vec![0x1b],
                    '\\' => vec![0x1c],
                    ']' => vec![0x1d],
                    ' ' => vec![0x00],
                    _ => return None,
                }
            } else {
                let mut buf = [0u8; 4];
                c.encode_utf8(&mut buf).as_bytes().to_vec()
            }
        }
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::F(n @ 1..=4) => {
            vec![0x1b, b'O', b'P' + (n - 1)]
        }
        KeyCode::F(5) => b"\x1b[15~".to_vec(),
        KeyCode::F(n @ 6..=8) => format!("\x1b[{}~", 11 + n).into_bytes(),
        KeyCode::F(n @ 9..=10) => format!("\x1b[{}~", 11 + n).into_bytes(),
        KeyCode::F(n @ 11..=12) => format!("\x1b[{}~", 12 + n).into_bytes(),
        _ => return None,
    };

    // Alt prefixes ESC, xterm-style.
    if alt {
        bytes.insert(0, 0x1b);
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    fn router() -> InputRouter {
        InputRouter::new(KeyBindings::default())
    }

    #[test]
    fn test_bound_key_becomes_action_not_input() {
        let routed = router().route(&key(KeyCode::Char('q'), KeyModifiers::CONTROL));
        assert_eq!(routed, Routed::Action(UiAction::Quit));
    }

    #[test]
    fn test_plain_chars_forward_to_pty() {
        match router().route(&key(KeyCode::Char('h'), KeyModifiers::NONE)) {
            Routed::Input(bytes) => assert_eq!(bytes, b"h"),
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn test_control_chars_forward_to_pty() {
        // ^C is deliberately not a binding: it must reach the child.
        match router().route(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)) {
            Routed::Input(bytes) => assert_eq!(bytes, vec![0x03]),
            other => panic!("expected Input, got {other:?}"),
        }
        match router().route(&key(KeyCode::Char('d'), KeyModifiers::CONTROL)) {
            Routed::Input(bytes) => assert_eq!(bytes, vec![0x04]),
            other => panic!("expected Input, got {other:?}"),
        }
        match router().route(&key(KeyCode::Char('z'), KeyModifiers::CONTROL)) {
            Routed::Input(bytes) => assert_eq!(bytes, vec![0x1a]),
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn test_arrow_keys_encode_as_csi() {
        match router().route(&key(KeyCode::Up, KeyModifiers::NONE)) {
            Routed::Input(bytes) => assert_eq!(bytes, b"\x1b[A"),
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn test_enter_is_carriage_return() {
        match router().route(&key(KeyCode::Enter, KeyModifiers::NONE)) {
            Routed::Input(bytes) => assert_eq!(bytes, b"\r"),
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn test_alt_prefixes_escape() {
        // Alt+x is unbound (only alt+1..9 are), so it forwards with ESC.
        match router().route(&key(KeyCode::Char('x'), KeyModifiers::ALT)) {
            Routed::Input(bytes) => assert_eq!(bytes, b"\x1bx"),
            other => panic!("expected Input, got {other:?}"),
        }
    }

    #[test]
    fn test_no_key_goes_to_both_destinations() {
        let router = router();
        for (code, mods) in [
            (KeyCode::Tab, KeyModifiers::CONTROL),
            (KeyCode::Char('a'), KeyModifiers::NONE),
            (KeyCode::F(8), KeyModifiers::NONE),
            (KeyCode::Char('c'), KeyModifiers::CONTROL),
        ] {
            let event = key(code, mods);
            let routed = router.route(&event);
            let is_action = matches!(routed, Routed::Action(_));
            let is_input = matches!(routed, Routed::Input(_));
            assert!(is_action != is_input || routed == Routed::Ignored);
            // Reserved keys never encode as input.
            if router.bindings().is_reserved(&event) {
                assert!(is_action && !is_input);
            }
        }
    }

    #[test]
    fn test_utf8_char_forwarding() {
        match router().route(&key(KeyCode::Char('é'), KeyModifiers::NONE)) {
            Routed::Input(bytes) => assert_eq!(bytes, "é".as_bytes()),
            other => panic!("expected Input, got {other:?}"),
        }
    }
}
