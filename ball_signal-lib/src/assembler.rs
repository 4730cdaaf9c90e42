use std::collections::HashMap;

use log::{debug, error, warn};

use crate::message::InboundMessage;
use crate::transport::StreamId;

/// Reassembles chunked stream deliveries into complete messages.
///
/// Each inbound stream carries exactly one JSON document; bytes accumulate
/// per stream id until the transport reports end-of-stream.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    label: String,
    buffers: HashMap<StreamId, Vec<u8>>,
}

impl StreamAssembler {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), buffers: HashMap::new() }
    }

    /// Append `chunk` to `stream_id`'s buffer and, on `is_final`, parse and
    /// discard it. Malformed payloads are logged and yield `None`.
    pub fn feed(&mut self, stream_id: StreamId, chunk: &[u8], is_final: bool) -> Option<InboundMessage> {
        let buffer = self.buffers.entry(stream_id).or_default();
        buffer.extend_from_slice(chunk);

        if !is_final {
            return None;
        }

        let data = self.buffers.remove(&stream_id).unwrap_or_default();
        debug!("[{}] stream {} ended, {} bytes buffered", self.label, stream_id, data.len());

        match InboundMessage::parse(&data) {
            Ok(message) => Some(message),
            Err(e) => {
                error!("[{}] failed to parse stream {} as JSON: {}", self.label, stream_id, e);
                None
            }
        }
    }

    /// Drop whatever was buffered for a stream the transport reset.
    pub fn reset(&mut self, stream_id: StreamId) {
        if let Some(partial) = self.buffers.remove(&stream_id) {
            warn!(
                "[{}] stream {} reset, discarding {} buffered bytes",
                self.label,
                stream_id,
                partial.len()
            );
        }
    }

    pub fn open_streams(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CoordinatesPayload;

    #[test]
    fn reassembles_split_document() {
        let mut asm = StreamAssembler::new("test");
        assert!(asm.feed(2, br#"{"type":"coo"#, false).is_none());
        assert!(asm.feed(2, br#"rds","x":3,"#, false).is_none());
        assert_eq!(asm.open_streams(), 1);

        let msg = asm.feed(2, br#""y":4}"#, true);
        assert_eq!(
            msg,
            Some(InboundMessage::Coordinates(CoordinatesPayload { x: Some(3.0), y: Some(4.0) }))
        );
        assert_eq!(asm.open_streams(), 0);
    }

    #[test]
    fn interleaved_streams_stay_separate() {
        let mut asm = StreamAssembler::new("test");
        asm.feed(2, br#"{"type":"coords","#, false);
        asm.feed(6, br#"{"type":"off"#, false);
        asm.feed(2, br#""x":1,"y":2}"#, false);
        asm.feed(6, br#"er","sdp":"v=0"}"#, false);

        let first = asm.feed(6, b"", true).unwrap();
        let second = asm.feed(2, b"", true).unwrap();
        assert_eq!(first.kind(), "offer");
        assert_eq!(second.kind(), "coords");
    }

    #[test]
    fn malformed_payload_is_dropped_with_its_buffer() {
        let mut asm = StreamAssembler::new("test");
        assert!(asm.feed(10, b"{broken", true).is_none());
        assert_eq!(asm.open_streams(), 0);
    }

    #[test]
    fn reset_discards_partial_stream() {
        let mut asm = StreamAssembler::new("test");
        asm.feed(14, br#"{"type":"#, false);
        asm.reset(14);
        assert_eq!(asm.open_streams(), 0);
        // A reset of an unknown id is harmless.
        asm.reset(99);
        // The id starts clean if it is reused.
        assert!(asm.feed(14, br#""offer"}"#, true).is_none());
    }
}
