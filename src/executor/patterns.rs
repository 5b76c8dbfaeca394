//! Output classification: error/success patterns, exit-code policy, and
//! package counting.
//!
//! Precedence on child exit, per step:
//! 1. any error pattern matched → failed
//! 2. any success pattern matched → success
//! 3. exit status in the declared non-error set → success
//! 4. otherwise success iff exit status == 0

use crate::errors::ExecutorError;
use crate::plugin::UpdateCommand;
use regex::Regex;

/// Per-command matcher state, fed one logical output line at a time.
pub struct OutputClassifier {
    error_patterns: Vec<Regex>,
    success_patterns: Vec<Regex>,
    ignore_exit_codes: Vec<i32>,
    package_pattern: Option<Regex>,
    first_error: Option<String>,
    success_seen: bool,
    package_count: u64,
    package_value: Option<u64>,
}

impl OutputClassifier {
    /// Compile the command's patterns plus the plugin-level package
    /// counting rule. Invalid regexes are logged and skipped.
    pub fn compile(command: &UpdateCommand, package_pattern: Option<&str>) -> Self {
        let compile_all = |patterns: &[String], what: &str| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(err) => {
                        tracing::warn!(pattern = %p, %err, "skipping invalid {what} pattern");
                        None
                    }
                })
                .collect()
        };
        let package_pattern = package_pattern.and_then(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::warn!(pattern = %p, %err, "skipping invalid package-count pattern");
                None
            }
        });
        Self {
            error_patterns: compile_all(&command.error_patterns, "error"),
            success_patterns: compile_all(&command.success_patterns, "success"),
            ignore_exit_codes: command.ignore_exit_codes.clone(),
            package_pattern,
            first_error: None,
            success_seen: false,
            package_count: 0,
            package_value: None,
        }
    }

    /// Observe one logical output line.
    pub fn observe(&mut self, line: &str) {
        if self.first_error.is_none() {
            for re in &self.error_patterns {
                if re.is_match(line) {
                    self.first_error = Some(re.as_str().to_string());
                    break;
                }
            }
        }
        if !self.success_seen && self.success_patterns.iter().any(|re| re.is_match(line)) {
            self.success_seen = true;
        }
        if let Some(re) = &self.package_pattern {
            if let Some(caps) = re.captures(line) {
                match caps.get(1).and_then(|m| m.as_str().parse::<u64>().ok()) {
                    // A capture group names the count directly; keep the
                    // latest value (summary lines may repeat).
                    Some(value) => self.package_value = Some(value),
                    // No capture: each matching line is one package.
                    None => self.package_count += 1,
                }
            }
        }
    }

    /// Packages updated, per the counting rule.
    pub fn packages(&self) -> u64 {
        self.package_value.unwrap_or(self.package_count)
    }

    /// First error pattern that matched, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.first_error.as_deref()
    }

    /// Apply the exit policy.
    pub fn classify(&self, exit_code: i32) -> Result<(), ExecutorError> {
        if let Some(pattern) = &self.first_error {
            return Err(ExecutorError::PatternMatched {
                pattern: pattern.clone(),
            });
        }
        if self.success_seen {
            return Ok(());
        }
        if exit_code == 0 || self.ignore_exit_codes.contains(&exit_code) {
            return Ok(());
        }
        Err(ExecutorError::NonZeroExit { code: exit_code })
    }
}
