//! Resource probe for a child pid, read from procfs.
//!
//! Reads `/proc/<pid>/stat` for CPU times, `/proc/<pid>/status` for
//! resident-set sizes, and `/proc/<pid>/io` for block I/O counters.
//! `/proc/<pid>/io` needs matching ownership; when unreadable (elevated
//! children), I/O counters stay at zero rather than failing the sample.

use super::ResourceSample;
use std::path::PathBuf;

pub struct ProcSampler {
    pid: u32,
    clk_tck: f64,
    proc_root: PathBuf,
}

impl ProcSampler {
    pub fn new(pid: u32) -> Self {
        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        Self {
            pid,
            clk_tck: if clk_tck > 0 { clk_tck as f64 } else { 100.0 },
            proc_root: PathBuf::from("/proc"),
        }
    }

    #[cfg(test)]
    fn with_proc_root(pid: u32, proc_root: PathBuf) -> Self {
        Self {
            pid,
            clk_tck: 100.0,
            proc_root,
        }
    }

    /// Take one reading. `None` once the process is gone.
    pub fn sample(&self) -> Option<ResourceSample> {
        let dir = self.proc_root.join(self.pid.to_string());
        let stat = std::fs::read_to_string(dir.join("stat")).ok()?;
        let (cpu_user_secs, cpu_sys_secs) = self.parse_stat(&stat)?;

        let status = std::fs::read_to_string(dir.join("status")).ok()?;
        let rss_mb = Self::status_field_kb(&status, "VmRSS:").unwrap_or(0) / 1024;
        let hwm_mb = Self::status_field_kb(&status, "VmHWM:").unwrap_or(0) / 1024;

        let (read_bytes, write_bytes) = std::fs::read_to_string(dir.join("io"))
            .ok()
            .map(|io| {
                (
                    Self::io_field(&io, "read_bytes:").unwrap_or(0),
                    Self::io_field(&io, "write_bytes:").unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));

        Some(ResourceSample {
            rss_mb,
            hwm_mb,
            cpu_user_secs,
            cpu_sys_secs,
            read_bytes,
            write_bytes,
        })
    }

    /// Fields 14 (utime) and 15 (stime) of `/proc/<pid>/stat`, in clock
    /// ticks. The comm field may contain spaces, so parsing starts after
    /// the closing paren.
    fn parse_stat(&self, stat: &str) -> Option<(f64, f64)> {
        let rest = &stat[stat.rfind(')')? + 1..];
        let fields: Vec<&str> = rest.split_whitespace().collect();
        // After comm, utime is field index 11 and stime 12 (state is 0).
        let utime: u64 = fields.get(11)?.parse().ok()?;
        let stime: u64 = fields.get(12)?.parse().ok()?;
        Some((utime as f64 / self.clk_tck, stime as f64 / self.clk_tck))
    }

    fn status_field_kb(status: &str, key: &str) -> Option<u64> {
        status
            .lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    fn io_field(io: &str, key: &str) -> Option<u64> {
        io.lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }
}
