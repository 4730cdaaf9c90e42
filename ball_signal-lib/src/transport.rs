//! Stream transport seam and the chunk framing used by the bundled
//! WebSocket adapter.

use thiserror::Error;

/// Transport-assigned identifier of a unidirectional stream.
pub type StreamId = u64;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_RESET: u8 = 0x02;

/// Bytes in a frame header: stream id (u64 LE) + flags.
pub const HEADER_LEN: usize = 9;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport session closed")]
    Closed,

    #[error("unknown outbound stream {0}")]
    UnknownStream(StreamId),

    #[error("stream {0} already finished")]
    StreamFinished(StreamId),

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Outbound half of a multiplexed transport session.
///
/// Both calls are synchronous: implementations queue bytes and flush them
/// from their own writer task.
pub trait StreamTransport: Send + Sync {
    /// Open a fresh server-initiated unidirectional stream.
    fn open_uni_stream(&self) -> Result<StreamId, TransportError>;

    /// Write `data` to `stream`, closing it when `fin` is set.
    fn send(&self, stream: StreamId, data: &[u8], fin: bool) -> Result<(), TransportError>;
}

/// One chunk of one stream, as carried by a single binary WebSocket message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub fin: bool,
    pub reset: bool,
    pub payload: Vec<u8>,
}

impl StreamFrame {
    pub fn data(stream_id: StreamId, payload: Vec<u8>, fin: bool) -> Self {
        Self { stream_id, fin, reset: false, payload }
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self { stream_id, fin: false, reset: true, payload: Vec::new() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.stream_id.to_le_bytes());
        let mut flags = 0u8;
        if self.fin {
            flags |= FLAG_FIN;
        }
        if self.reset {
            flags |= FLAG_RESET;
        }
        buf.push(flags);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < HEADER_LEN {
            return Err(TransportError::Malformed(format!(
                "frame of {} bytes is shorter than the {}-byte header",
                buf.len(),
                HEADER_LEN
            )));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[0..8]);
        let flags = buf[8];
        if flags & !(FLAG_FIN | FLAG_RESET) != 0 {
            return Err(TransportError::Malformed(format!("unknown flags {:#04x}", flags)));
        }
        Ok(Self {
            stream_id: u64::from_le_bytes(id),
            fin: flags & FLAG_FIN != 0,
            reset: flags & FLAG_RESET != 0,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Allocates ids the way QUIC numbers server-initiated unidirectional
/// streams: 3, 7, 11, ...
#[derive(Debug)]
pub struct StreamIdAllocator {
    next: StreamId,
}

impl Default for StreamIdAllocator {
    fn default() -> Self {
        Self { next: 3 }
    }
}

impl StreamIdAllocator {
    pub fn next_id(&mut self) -> StreamId {
        let id = self.next;
        self.next += 4;
        id
    }
}
