//! Terminal UI: tabs, status bars, input routing, log export.

mod app;
mod input;
mod keys;
mod logsave;
mod status;
mod tab;

pub use app::App;
pub use input::{encode_key, InputRouter, Routed};
pub use keys::{KeyBindings, KeyCombo, UiAction};
pub use logsave::save_tab_log;
pub use tab::{PaneState, Tab, VisualStatus};
