//! Decoder for the text-framed progress stream.
//!
//! Each line is either `event: <kind>` naming the kind of the following data,
//! `data: <json>` carrying one payload, a `:` comment, or blank (end of a
//! frame, which clears the current kind). Bytes may arrive split at any
//! point, including inside a line.

use crate::ProgressEvent;
use thiserror::Error;
use tracing::warn;

/// Reasons a frame could not become an event. Never fatal to the stream.
#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    /// `data:` line is not valid JSON.
    #[error("invalid json in data line: {0}")]
    InvalidJson(String),
    /// JSON payload is neither an object nor a string.
    #[error("payload must be a json object or string")]
    UnsupportedPayload,
}

/// Incremental line decoder. Malformed frames are skipped, not fatal.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    kind: Option<String>,
    skipped: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of malformed frames dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Feed raw bytes; returns the events completed by this chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ProgressEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            if let Some(event) = self.line(text.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<ProgressEvent> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&line).into_owned();
        self.line(text.trim_end_matches('\r'))
    }

    fn line(&mut self, line: &str) -> Option<ProgressEvent> {
        if line.is_empty() {
            self.kind = None;
            return None;
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                let kind = value.trim();
                self.kind = (!kind.is_empty()).then(|| kind.to_string());
                None
            }
            "data" => match decode_data(self.kind.as_deref(), value) {
                Ok(event) => Some(event),
                Err(err) => {
                    self.skipped += 1;
                    warn!(error = %err, kind = ?self.kind, "skipping malformed progress frame");
                    None
                }
            },
            _ => None,
        }
    }
}

/// Decode one `data:` value under the given event kind.
pub fn decode_data(kind: Option<&str>, raw: &str) -> Result<ProgressEvent, FrameError> {
    let payload: serde_json::Value =
        serde_json::from_str(raw.trim()).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    ProgressEvent::from_payload(kind, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamStatus;

    #[test]
    fn decodes_event_and_data_pairs() {
        let mut dec = FrameDecoder::new();
        let events = dec.push(
            b"event: status\ndata: {\"status\":\"started\",\"run_id\":\"r-1\"}\n\n\
              data: {\"message\":\"simulation running\"}\n\n",
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind.as_deref(), Some("status"));
        assert_eq!(events[0].status, Some(StreamStatus::Started));
        assert_eq!(events[1].kind, None);
        assert_eq!(events[1].message, "simulation running");
    }

    #[test]
    fn survives_arbitrary_chunk_boundaries() {
        let wire = "event: ranking\r\ndata: {\"message\":\"Évaluation\"}\r\n\r\n";
        let bytes = wire.as_bytes();
        for split in 0..bytes.len() {
            let mut dec = FrameDecoder::new();
            let mut events = dec.push(&bytes[..split]);
            events.extend(dec.push(&bytes[split..]));
            assert_eq!(events.len(), 1, "split at {split}");
            assert!(events[0].ranking);
            assert_eq!(events[0].message, "Évaluation");
        }
    }

    #[test]
    fn malformed_frames_are_skipped() {
        let mut dec = FrameDecoder::new();
        let events = dec.push(
            b": keep-alive\ndata: {not json\ndata: 17\nretry: 500\ndata: {\"message\":\"planning\"}\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "planning");
        assert_eq!(dec.skipped(), 2);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut dec = FrameDecoder::new();
        assert!(dec.push(b"data: {\"status\":\"completed\"}").is_empty());
        let last = dec.finish().unwrap();
        assert_eq!(last.status, Some(StreamStatus::Completed));
        assert!(dec.finish().is_none());
    }

    #[test]
    fn decode_data_reports_errors() {
        assert!(matches!(
            decode_data(None, "{"),
            Err(FrameError::InvalidJson(_))
        ));
        assert_eq!(
            decode_data(None, "[1,2]"),
            Err(FrameError::UnsupportedPayload)
        );
    }
}
