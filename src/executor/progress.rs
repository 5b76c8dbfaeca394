//! Structured-event protocol spoken by plugin subprocesses.
//!
//! A line starting with the literal prefix `PROGRESS:` followed by a JSON
//! object is a structured frame; everything else is opaque output. Frame
//! decode errors are logged and the line is treated as opaque.

use crate::events::ProgressUpdate;
use crate::plugin::Phase;
use serde::Deserialize;

/// The literal line prefix marking a structured frame.
pub const FRAME_PREFIX: &[u8] = b"PROGRESS:";

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Progress {
        phase: Option<Phase>,
        update: ProgressUpdate,
    },
    PhaseStart {
        phase: Option<Phase>,
    },
    PhaseEnd {
        phase: Option<Phase>,
        success: bool,
        error: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    percent: Option<f64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    bytes_downloaded: Option<u64>,
    #[serde(default)]
    bytes_total: Option<u64>,
    #[serde(default)]
    items_completed: Option<u64>,
    #[serde(default)]
    items_total: Option<u64>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<String>,
}

/// Whether a completed line carries a protocol frame.
pub fn is_frame(line: &[u8]) -> bool {
    line.starts_with(FRAME_PREFIX)
}

/// Whether a partial line could still grow into a protocol frame. Used by
/// the output pump to decide how long to hold bytes back from the screen.
pub fn could_be_frame(partial: &[u8]) -> bool {
    if partial.len() < FRAME_PREFIX.len() {
        FRAME_PREFIX.starts_with(partial)
    } else {
        partial.starts_with(FRAME_PREFIX)
    }
}

/// Decode a frame line (including its prefix). Returns `None` and logs on
/// malformed JSON or missing required fields.
pub fn decode(line: &[u8]) -> Option<ProtocolEvent> {
    let payload = line.strip_prefix(FRAME_PREFIX)?;
    let frame: Frame = match serde_json::from_slice(payload) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(%err, "malformed progress frame, treating as opaque output");
            return None;
        }
    };

    let phase = frame.phase.as_deref().and_then(Phase::parse);
    if frame.phase.is_some() && phase.is_none() {
        tracing::warn!(phase = ?frame.phase, "progress frame names an unknown phase");
    }

    match frame.kind.as_deref().unwrap_or("progress") {
        "progress" => Some(ProtocolEvent::Progress {
            phase,
            update: ProgressUpdate {
                percent: frame.percent.map(|p| p.clamp(0.0, 100.0)),
                message: frame.message,
                bytes_done: frame.bytes_downloaded,
                bytes_total: frame.bytes_total,
                items_done: frame.items_completed,
                items_total: frame.items_total,
            },
        }),
        "phase_start" => Some(ProtocolEvent::PhaseStart { phase }),
        "phase_end" => {
            let Some(success) = frame.success else {
                tracing::warn!("phase_end frame missing required 'success' field");
                return None;
            };
            Some(ProtocolEvent::PhaseEnd {
                phase,
                success,
                error: frame.error,
            })
        }
        other => {
            tracing::warn!(kind = other, "progress frame has unknown type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_download_progress() {
        let line = br#"PROGRESS:{"phase":"download","percent":50,"bytes_downloaded":5000,"bytes_total":10000,"message":"half"}"#;
        let event = decode(line).unwrap();
        match event {
            ProtocolEvent::Progress { phase, update } => {
                assert_eq!(phase, Some(Phase::Download));
                assert_eq!(update.percent, Some(50.0));
                assert_eq!(update.bytes_done, Some(5000));
                assert_eq!(update.bytes_total, Some(10000));
                assert_eq!(update.message.as_deref(), Some("half"));
            }
            other => panic!("expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_defaults_to_progress_type() {
        let event = decode(br#"PROGRESS:{"percent":10}"#).unwrap();
        assert!(matches!(event, ProtocolEvent::Progress { phase: None, .. }));
    }

    #[test]
    fn test_decode_phase_end_requires_success() {
        let ok = decode(br#"PROGRESS:{"type":"phase_end","phase":"execute","success":true}"#);
        assert_eq!(
            ok,
            Some(ProtocolEvent::PhaseEnd {
                phase: Some(Phase::Execute),
                success: true,
                error: None,
            })
        );
        assert_eq!(
            decode(br#"PROGRESS:{"type":"phase_end","phase":"execute"}"#),
            None
        );
    }

    #[test]
    fn test_decode_clamps_percent() {
        let event = decode(br#"PROGRESS:{"percent":150}"#).unwrap();
        match event {
            ProtocolEvent::Progress { update, .. } => assert_eq!(update.percent, Some(100.0)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_json_is_opaque() {
        assert_eq!(decode(b"PROGRESS:{not json"), None);
        assert_eq!(decode(b"PROGRESS:"), None);
    }

    #[test]
    fn test_items_fields() {
        let event = decode(br#"PROGRESS:{"items_completed":3,"items_total":9}"#).unwrap();
        match event {
            ProtocolEvent::Progress { update, .. } => {
                assert_eq!(update.items_done, Some(3));
                assert_eq!(update.items_total, Some(9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_could_be_frame_prefix_tracking() {
        assert!(could_be_frame(b""));
        assert!(could_be_frame(b"PROG"));
        assert!(could_be_frame(b"PROGRESS:"));
        assert!(could_be_frame(b"PROGRESS:{\"p"));
        assert!(!could_be_frame(b"PRX"));
        assert!(!could_be_frame(b"Fetching..."));
    }

    #[test]
    fn test_is_frame_exact_prefix_only() {
        assert!(is_frame(b"PROGRESS:{}"));
        assert!(!is_frame(b" PROGRESS:{}"));
        assert!(!is_frame(b"progress:{}"));
    }
}
