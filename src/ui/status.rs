//! Rendering helpers: terminal cells to ratatui text, tab titles, status
//! bar content, aggregate progress.

use super::tab::{Tab, VisualStatus};
use crate::metrics::PluginMetrics;
use crate::term::{Cell, TermColor};
use crate::util::{format_bytes, format_duration};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};

pub fn term_color(color: TermColor) -> Color {
    match color {
        TermColor::Default => Color::Reset,
        TermColor::Indexed(i) => Color::Indexed(i),
        TermColor::Rgb(r, g, b) => Color::Rgb(r, g, b),
    }
}

pub fn cell_style(cell: &Cell) -> Style {
    let mut style = Style::default()
        .fg(term_color(cell.style.fg))
        .bg(term_color(cell.style.bg));
    if cell.style.bold {
        style = style.add_modifier(Modifier::BOLD);
    }
    if cell.style.underline {
        style = style.add_modifier(Modifier::UNDERLINED);
    }
    if cell.style.inverse {
        style = style.add_modifier(Modifier::REVERSED);
    }
    style
}

/// Convert one screen row to a ratatui line, coalescing runs of equal
/// style into single spans.
pub fn row_to_line(row: &[Cell]) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut run = String::new();
    let mut run_style: Option<Style> = None;
    for cell in row {
        let style = cell_style(cell);
        match run_style {
            Some(current) if current == style => run.push(cell.ch),
            Some(current) => {
                spans.push(Span::styled(std::mem::take(&mut run), current));
                run.push(cell.ch);
                run_style = Some(style);
            }
            None => {
                run.push(cell.ch);
                run_style = Some(style);
            }
        }
    }
    if let (false, Some(style)) = (run.is_empty(), run_style) {
        spans.push(Span::styled(run, style));
    }
    Line::from(spans)
}

pub fn status_color(status: VisualStatus) -> Color {
    match status {
        VisualStatus::Completed => Color::Green,
        VisualStatus::Running => Color::Yellow,
        VisualStatus::Error => Color::Red,
        VisualStatus::Pending => Color::Gray,
        VisualStatus::Locked => Color::DarkGray,
    }
}

pub fn status_symbol(status: VisualStatus) -> &'static str {
    match status {
        VisualStatus::Completed => "✔",
        VisualStatus::Running => "●",
        VisualStatus::Error => "✖",
        VisualStatus::Pending => "○",
        VisualStatus::Locked => "◌",
    }
}

/// Tab header title with its 1-based index and state color.
pub fn tab_title(tab: &Tab, index: usize) -> Line<'static> {
    let status = tab.visual_status();
    Line::from(vec![
        Span::styled(
            format!("{} ", index + 1),
            Style::default().fg(Color::DarkGray),
        ),
        Span::styled(
            format!("{} {}", status_symbol(status), tab.plugin),
            Style::default().fg(status_color(status)),
        ),
    ])
}

/// The per-tab status bar: state, phase, ETA, CPU, memory, network, disk,
/// items.
pub fn status_bar_line(tab: &Tab, metrics: Option<&PluginMetrics>, phase_label: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let status = tab.visual_status();
    spans.push(Span::styled(
        format!(" {} ", status_symbol(status)),
        Style::default().fg(status_color(status)),
    ));
    spans.push(Span::raw(format!("{phase_label} ")));

    if let Some(phase) = tab.current_phase {
        spans.push(Span::styled(
            format!("[{}] ", phase.display_label()),
            Style::default().fg(Color::Cyan),
        ));
    }

    if let Some(eta) = tab.eta() {
        spans.push(Span::raw(format!("eta {} ", format_duration(eta))));
    }

    spans.push(Span::raw(format!("cpu {:>5.1}% ", tab.cpu.percent)));

    let record = tab
        .current_phase
        .and_then(|phase| metrics.and_then(|m| m.record_for(phase)));
    if let Some(record) = record {
        spans.push(Span::raw(format!(
            "mem {}/{} ",
            format_bytes(record.current_rss_mb * 1024 * 1024),
            format_bytes(record.peak_rss_mb * 1024 * 1024),
        )));
        spans.push(Span::raw(format!(
            "net {} ",
            format_bytes(record.net_rx_bytes + record.net_tx_bytes)
        )));
        spans.push(Span::raw(format!(
            "io {} ",
            format_bytes(record.read_bytes + record.write_bytes)
        )));
    }

    if let (Some(done), Some(total)) = (tab.progress.items_done, tab.progress.items_total) {
        spans.push(Span::raw(format!("items {done}/{total} ")));
    }

    if let Some(message) = &tab.progress.message {
        spans.push(Span::styled(
            crate::util::truncate(message, 40),
            Style::default().fg(Color::DarkGray),
        ));
    }

    if let Some(error) = &tab.error {
        spans.push(Span::styled(
            format!(" {}", crate::util::truncate(error, 40)),
            Style::default().fg(Color::Red),
        ));
    }

    Line::from(spans)
}

/// Aggregate progress across plugins: completed fraction plus the mean of
/// running-phase percentages.
pub fn aggregate_progress(tabs: &[Tab]) -> (f64, String) {
    if tabs.is_empty() {
        return (0.0, "no plugins".to_string());
    }
    let total = tabs.len() as f64;
    let mut score = 0.0;
    let mut completed = 0usize;
    let mut failed = 0usize;
    for tab in tabs {
        match tab.visual_status() {
            VisualStatus::Completed => {
                score += 1.0;
                completed += 1;
            }
            VisualStatus::Error => {
                score += 1.0;
                failed += 1;
            }
            VisualStatus::Running => {
                score += tab.progress.percent.unwrap_or(0.0) / 100.0;
            }
            VisualStatus::Pending | VisualStatus::Locked => {}
        }
    }
    let ratio = (score / total).clamp(0.0, 1.0);
    let label = if failed > 0 {
        format!("{completed}/{} done, {failed} failed", tabs.len())
    } else {
        format!("{completed}/{} done", tabs.len())
    };
    (ratio, label)
}
