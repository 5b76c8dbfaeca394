//! Save-logs: serialize a tab's terminal history and metrics to a file.
//!
//! Plain text: a header block, the ANSI-stripped scrollback plus viewport,
//! then a metrics summary table.

use super::tab::Tab;
use crate::metrics::PluginMetrics;
use crate::util::{format_bytes, format_duration};
use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn save_tab_log(
    tab: &Tab,
    metrics: Option<&PluginMetrics>,
    phase_label: &str,
    dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).context("Failed to create log directory")?;
    let timestamp = Utc::now().format("%Y%m%d-%H%M%S");
    let path = dir.join(format!("{}-{timestamp}.log", tab.plugin));
    let mut file = std::fs::File::create(&path).context("Failed to create log file")?;

    writeln!(file, "plugin: {}", tab.plugin)?;
    writeln!(file, "saved_at: {}", Utc::now().to_rfc3339())?;
    writeln!(file, "phase: {phase_label}")?;
    writeln!(file, "status: {:?}", tab.visual_status())?;
    if let Some(error) = &tab.error {
        writeln!(file, "error: {error}")?;
    }
    writeln!(file)?;
    writeln!(file, "---- terminal ----")?;
    for line in tab.screen.lock().expect("screen poisoned").text_dump() {
        writeln!(file, "{line}")?;
    }

    writeln!(file)?;
    writeln!(file, "---- metrics ----")?;
    writeln!(
        file,
        "{:<10} {:>9} {:>10} {:>10} {:>10} {:>10} {:>8}",
        "phase", "duration", "peak mem", "cpu", "disk", "net", "packages"
    )?;
    if let Some(metrics) = metrics {
        for record in &metrics.phases {
            writeln!(
                file,
                "{:<10} {:>9} {:>10} {:>9.1}s {:>10} {:>10} {:>8}",
                record.phase.display_label(),
                record
                    .duration
                    .map(format_duration)
                    .unwrap_or_else(|| "-".to_string()),
                format_bytes(record.peak_rss_mb * 1024 * 1024),
                record.cpu_total_secs(),
                format_bytes(record.read_bytes + record.write_bytes),
                format_bytes(record.net_rx_bytes + record.net_tx_bytes),
                record.packages,
            )?;
        }
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricsStore, PhaseOutcome, ResourceSample};
    use crate::plugin::Phase;

    #[test]
    fn test_saved_log_contains_history_and_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let tab = Tab::new("apt", 40, 3, 100);
        tab.screen
            .lock()
            .unwrap()
            .feed(b"\x1b[32mfetching updates\x1b[0m\r\ndone\r\n");

        let store = MetricsStore::new();
        store.begin_phase("apt", Phase::Check);
        store.record_sample(
            "apt",
            Phase::Check,
            &ResourceSample {
                rss_mb: 30,
                hwm_mb: 40,
                cpu_user_secs: 1.5,
                ..Default::default()
            },
        );
        store.end_phase(
            "apt",
            Phase::Check,
            PhaseOutcome {
                success: true,
                packages: 3,
                ..Default::default()
            },
        );
        let metrics = store.snapshot("apt");

        let path = save_tab_log(&tab, metrics.as_ref(), "Update", dir.path()).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();

        assert!(content.contains("plugin: apt"));
        assert!(content.contains("phase: Update"));
        // ANSI styling is stripped.
        assert!(content.contains("fetching updates"));
        assert!(!content.contains("\x1b["));
        // Metrics table row for the CHECK phase ("Update" display label).
        assert!(content.contains("40.0 MiB"));
        assert!(content.contains('3'));
    }

    #[test]
    fn test_filename_carries_plugin_name() {
        let dir = tempfile::tempdir().unwrap();
        let tab = Tab::new("flatpak", 10, 2, 10);
        let path = save_tab_log(&tab, None, "Update", dir.path()).unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("flatpak-"));
    }
}
