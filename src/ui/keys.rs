//! Key-binding table.
//!
//! All bindings are configurable; defaults follow the shipped table. A
//! combo string is `modifier+...+key`, e.g. `ctrl+shift+tab`, `alt+3`,
//! `f8`, `shift+pageup`. Several combos may map to the same action.

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use std::collections::BTreeMap;

/// UI commands reachable through bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiAction {
    NextTab,
    PrevTab,
    /// Switch to tab k, 1-based.
    Tab(u8),
    ScrollUp,
    ScrollDown,
    ScrollTop,
    ScrollBottom,
    PauseToggle,
    Retry,
    SaveLogs,
    Help,
    Quit,
}

impl UiAction {
    /// Configuration key for this action.
    pub fn config_name(&self) -> &'static str {
        match self {
            Self::NextTab => "next_tab",
            Self::PrevTab => "prev_tab",
            Self::Tab(_) => "tab_k",
            Self::ScrollUp => "scroll_up",
            Self::ScrollDown => "scroll_down",
            Self::ScrollTop => "scroll_top",
            Self::ScrollBottom => "scroll_bottom",
            Self::PauseToggle => "pause_toggle",
            Self::Retry => "retry",
            Self::SaveLogs => "save_logs",
            Self::Help => "help",
            Self::Quit => "quit",
        }
    }
}

/// A single key chord.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyCombo {
    pub code: KeyCode,
    pub mods: KeyModifiers,
}

impl KeyCombo {
    pub fn matches(&self, event: &KeyEvent) -> bool {
        self.code == event.code && self.mods == event.modifiers
    }

    /// Parse a combo string like `ctrl+shift+tab` or `f8`.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut mods = KeyModifiers::NONE;
        let mut code = None;
        for part in spec.split('+') {
            let part = part.trim().to_ascii_lowercase();
            match part.as_str() {
                "ctrl" | "control" => mods |= KeyModifiers::CONTROL,
                "shift" => mods |= KeyModifiers::SHIFT,
                "alt" => mods |= KeyModifiers::ALT,
                "tab" => code = Some(KeyCode::Tab),
                "backtab" => code = Some(KeyCode::BackTab),
                "enter" => code = Some(KeyCode::Enter),
                "esc" | "escape" => code = Some(KeyCode::Esc),
                "home" => code = Some(KeyCode::Home),
                "end" => code = Some(KeyCode::End),
                "pageup" | "pgup" => code = Some(KeyCode::PageUp),
                "pagedown" | "pgdn" => code = Some(KeyCode::PageDown),
                "up" => code = Some(KeyCode::Up),
                "down" => code = Some(KeyCode::Down),
                "left" => code = Some(KeyCode::Left),
                "right" => code = Some(KeyCode::Right),
                "space" => code = Some(KeyCode::Char(' ')),
                f if f.len() >= 2 && f.starts_with('f') => {
                    let n: u8 = f[1..].parse().ok()?;
                    code = Some(KeyCode::F(n));
                }
                c if c.chars().count() == 1 => {
                    code = Some(KeyCode::Char(c.chars().next().unwrap()));
                }
                _ => return None,
            }
        }
        code.map(|code| Self { code, mods })
    }

    pub fn display(&self) -> String {
        let mut parts = Vec::new();
        if self.mods.contains(KeyModifiers::CONTROL) {
            parts.push("Ctrl".to_string());
        }
        if self.mods.contains(KeyModifiers::SHIFT) {
            parts.push("Shift".to_string());
        }
        if self.mods.contains(KeyModifiers::ALT) {
            parts.push("Alt".to_string());
        }
        let key = match self.code {
            KeyCode::Tab => "Tab".to_string(),
            KeyCode::BackTab => "Tab".to_string(),
            KeyCode::Home => "Home".to_string(),
            KeyCode::End => "End".to_string(),
            KeyCode::PageUp => "PageUp".to_string(),
            KeyCode::PageDown => "PageDown".to_string(),
            KeyCode::F(n) => format!("F{n}"),
            KeyCode::Char(c) => c.to_uppercase().to_string(),
            other => format!("{other:?}"),
        };
        parts.push(key);
        parts.join("+")
    }
}

/// The full binding table.
#[derive(Debug, Clone)]
pub struct KeyBindings {
    bindings: Vec<(KeyCombo, UiAction)>,
}

impl Default for KeyBindings {
    fn default() -> Self {
        let mut bindings = Vec::new();
        let mut bind = |spec: &str, action: UiAction| {
            bindings.push((KeyCombo::parse(spec).expect("default binding"), action));
        };
        bind("ctrl+tab", UiAction::NextTab);
        bind("ctrl+shift+tab", UiAction::PrevTab);
        // Terminals report Shift+Tab as BackTab.
        bind("ctrl+shift+backtab", UiAction::PrevTab);
        for k in 1..=9u8 {
            bind(&format!("alt+{k}"), UiAction::Tab(k));
        }
        bind("shift+pageup", UiAction::ScrollUp);
        bind("shift+pagedown", UiAction::ScrollDown);
        bind("shift+home", UiAction::ScrollTop);
        bind("shift+end", UiAction::ScrollBottom);
        bind("ctrl+p", UiAction::PauseToggle);
        bind("f8", UiAction::PauseToggle);
        bind("ctrl+r", UiAction::Retry);
        bind("f9", UiAction::Retry);
        bind("ctrl+s", UiAction::SaveLogs);
        bind("f10", UiAction::SaveLogs);
        bind("ctrl+h", UiAction::Help);
        bind("f1", UiAction::Help);
        bind("ctrl+q", UiAction::Quit);
        Self { bindings }
    }
}

impl KeyBindings {
    /// Apply configuration overrides. A configured action replaces all of
    /// its default combos; unknown action names and bad combos are logged
    /// and skipped.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        for (action_name, specs) in overrides {
            let template = match action_name.as_str() {
                "next_tab" => UiAction::NextTab,
                "prev_tab" => UiAction::PrevTab,
                "scroll_up" => UiAction::ScrollUp,
                "scroll_down" => UiAction::ScrollDown,
                "scroll_top" => UiAction::ScrollTop,
                "scroll_bottom" => UiAction::ScrollBottom,
                "pause_toggle" => UiAction::PauseToggle,
                "retry" => UiAction::Retry,
                "save_logs" => UiAction::SaveLogs,
                "help" => UiAction::Help,
                "quit" => UiAction::Quit,
                other => {
                    tracing::warn!(action = other, "unknown key-binding action, ignoring");
                    continue;
                }
            };
            self.bindings.retain(|(_, a)| *a != template);
            for spec in specs {
                match KeyCombo::parse(spec) {
                    Some(combo) => self.bindings.push((combo, template)),
                    None => {
                        tracing::warn!(combo = %spec, "unparseable key combo, ignoring");
                    }
                }
            }
        }
        self
    }

    /// First action bound to this key, if any.
    pub fn lookup(&self, event: &KeyEvent) -> Option<UiAction> {
        self.bindings
            .iter()
            .find(|(combo, _)| combo.matches(event))
            .map(|(_, action)| *action)
    }

    /// The reserved set that must never reach a PTY.
    pub fn is_reserved(&self, event: &KeyEvent) -> bool {
        self.lookup(event).is_some()
    }

    /// (combo, action) pairs for the help overlay.
    pub fn entries(&self) -> &[(KeyCombo, UiAction)] {
        &self.bindings
    }
}
