//! Byte pump between a PTY stream and the terminal/event layers.
//!
//! The pump assembles the raw chunk stream into logical lines. Completed
//! lines carrying a protocol frame are routed to the decoder and withheld
//! from the screen; everything else is forwarded byte-exact. Partial lines
//! are flushed to the screen as soon as they can no longer become a frame,
//! so interactive prompts without a trailing newline render immediately.

use super::progress;

/// What one chunk produced.
#[derive(Debug, Default, PartialEq)]
pub struct PumpOutput {
    /// Bytes to feed into the terminal screen.
    pub screen_bytes: Vec<u8>,
    /// Completed logical lines (without terminators), for Output events.
    pub lines: Vec<Vec<u8>>,
    /// Completed protocol frame lines (with their prefix).
    pub frames: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct OutputPump {
    /// Current partial logical line.
    line: Vec<u8>,
    /// How much of `line` has already been flushed to the screen.
    flushed: usize,
}

impl OutputPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> PumpOutput {
        let mut out = PumpOutput::default();
        for &byte in chunk {
            if byte == b'\n' {
                self.complete_line(&mut out);
            } else {
                self.line.push(byte);
            }
        }
        // Flush the partial tail unless it may still become a frame. A line
        // that was partially flushed earlier can never be a frame.
        if self.flushed > 0 || !progress::could_be_frame(trim_cr(&self.line)) {
            out.screen_bytes
                .extend_from_slice(&self.line[self.flushed..]);
            self.flushed = self.line.len();
        }
        out
    }

    /// Flush whatever is buffered; used when the stream closes.
    pub fn finish(&mut self) -> PumpOutput {
        let mut out = PumpOutput::default();
        if !self.line.is_empty() {
            self.complete_trailing(&mut out);
        }
        out
    }

    fn complete_line(&mut self, out: &mut PumpOutput) {
        let logical = trim_cr(&self.line).to_vec();
        if self.flushed == 0 && progress::is_frame(&logical) {
            out.frames.push(logical);
        } else {
            out.screen_bytes
                .extend_from_slice(&self.line[self.flushed..]);
            out.screen_bytes.push(b'\n');
            out.lines.push(logical);
        }
        self.line.clear();
        self.flushed = 0;
    }

    fn complete_trailing(&mut self, out: &mut PumpOutput) {
        let logical = trim_cr(&self.line).to_vec();
        if self.flushed == 0 && progress::is_frame(&logical) {
            out.frames.push(logical);
        } else {
            out.screen_bytes
                .extend_from_slice(&self.line[self.flushed..]);
            out.lines.push(logical);
        }
        self.line.clear();
        self.flushed = 0;
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}
